//! Tracing setup
//!
//! The relay is a library, so installing a subscriber is left to the host.
//! [`init`] is provided for hosts that have no subscriber of their own.

use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Install a compact fmt subscriber
///
/// `RUST_LOG` wins over the configured level. Returns false if a global
/// subscriber was already installed.
pub fn init(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(config.ansi)
        .compact()
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        let config = LogConfig {
            level: "debug".to_string(),
            ansi: false,
        };
        let first = init(&config);
        let second = init(&config);
        // Another test may have installed a subscriber first
        assert!(!second || !first);
    }

    #[test]
    fn test_bad_level_falls_back() {
        let config = LogConfig {
            level: "not a level [".to_string(),
            ansi: false,
        };
        init(&config);
    }
}
