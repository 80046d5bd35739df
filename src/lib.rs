#[macro_use]
extern crate lazy_static;

pub mod config;
pub mod error;
pub mod ingestion;
pub mod insights;
pub mod jobs;
pub mod normalize;
pub mod params;
pub mod rating;
pub mod replay;
pub mod store;

pub use error::DomainError;
pub use params::RatingParameters;
