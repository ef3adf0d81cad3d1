//! Logger installation.
//!
//! Every crate logs through the `log` macros; this installs `env_logger` as
//! the backend. `RUST_LOG` selects levels and defaults to `info`.

use {env_logger::Env, std::sync::Once};

static TEST_LOGGER: Once = Once::new();

/// Installs the process logger. Does nothing if a logger is already set.
pub fn setup() {
    setup_with_default("info");
}

/// Like [`setup`], with `filter` used when `RUST_LOG` is not set.
pub fn setup_with_default(filter: &str) {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or(filter))
        .format_timestamp_millis()
        .try_init();
}

/// Logger for tests: output is captured per test, and repeat calls are
/// harmless.
pub fn setup_for_tests() {
    TEST_LOGGER.call_once(|| {
        let _ = env_logger::Builder::from_env(Env::default().default_filter_or("warn"))
            .is_test(true)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_is_idempotent() {
        setup_for_tests();
        setup_for_tests();
        setup();
        log::info!("logger installed");
    }
}
