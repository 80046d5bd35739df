use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize test environment with RUST_LOG=warn.
pub fn init_test_env() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
    });
}
