mod common;

#[path = "postgres/test_helpers.rs"]
mod test_helpers;

#[path = "postgres/store_tests.rs"]
mod store_tests;
