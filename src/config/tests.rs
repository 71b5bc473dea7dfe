//! Config module tests

use super::*;
use pretty_assertions::assert_eq;
use test_case::test_case;

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("CHATRELAY_TEST_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${CHATRELAY_TEST_SIMPLE}\"").unwrap();
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("CHATRELAY_TEST_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    // Unset var should use default
    std::env::remove_var("CHATRELAY_TEST_UNSET");
    let result = substitute_env_vars("value = \"${CHATRELAY_TEST_UNSET:-fallback}\"").unwrap();
    assert_eq!(result, "value = \"fallback\"");

    // Set var should use env value
    std::env::set_var("CHATRELAY_TEST_SET", "env_value");
    let result = substitute_env_vars("value = \"${CHATRELAY_TEST_SET:-fallback}\"").unwrap();
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("CHATRELAY_TEST_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("CHATRELAY_TEST_MISSING");
    let result = substitute_env_vars("value = \"${CHATRELAY_TEST_MISSING}\"").unwrap();
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_default_config() {
    let config = RelayConfig::default();
    assert_eq!(config.log.level, "info");
    assert_eq!(config.broker.address, "localhost:1883");
    assert_eq!(config.reconnect.base_delay, Duration::from_secs(10));
    assert_eq!(config.reconnect.max_delay, Duration::from_secs(300));
    assert_eq!(config.limits.min_publish_interval, Duration::from_millis(100));
    assert_eq!(config.limits.error_cooldown, Duration::from_secs(1800));
    assert_eq!(config.limits.idle_reclaim, Duration::from_secs(300));
    assert_eq!(config.limits.max_display_name_len, 12);
    assert_eq!(config.limits.overhead_text_ticks, 5);
    assert_eq!(config.display.min_combat_level, 4);
    assert!(config.display.hide_spam);
    assert!(!config.display.read_only);
    assert_eq!(config.keys.shared_secret, "pub");
    assert!(config.validate().is_ok());
}

#[test]
fn test_parse_minimal_config() {
    let config = RelayConfig::parse("").unwrap();
    assert_eq!(config.broker.keepalive, 60);
    assert_eq!(config.limits.dedup_retention, Duration::from_secs(3600));
}

#[test]
fn test_parse_full_config() {
    let config = RelayConfig::parse(
        r#"
[log]
level = "debug"
ansi = false

[broker]
address = "chat.example.net:1883"
keepalive = 30
connect_timeout = "5s"
ack_timeout = "2s"

[reconnect]
base_delay = "1s"
max_delay = "1m"
max_exponent = 4
supervisor_interval = "500ms"

[limits]
min_publish_interval = "250ms"
error_cooldown = "10m"
idle_reclaim = "90s"
sweep_interval = "30s"
dedup_retention = "2h"
combat_cache_retention = "15m"
max_display_name_len = 16
overhead_text_ticks = 8

[display]
read_only = true
hide_spam = false
min_combat_level = 30

[keys]
shared_secret = "s3cret"
"#,
    )
    .unwrap();

    assert_eq!(config.log.level, "debug");
    assert!(!config.log.ansi);
    assert_eq!(config.broker.address, "chat.example.net:1883");
    assert_eq!(config.broker.connect_timeout, Duration::from_secs(5));
    assert_eq!(config.reconnect.max_exponent, 4);
    assert_eq!(
        config.reconnect.supervisor_interval,
        Duration::from_millis(500)
    );
    assert_eq!(config.limits.min_publish_interval, Duration::from_millis(250));
    assert_eq!(config.limits.idle_reclaim, Duration::from_secs(90));
    assert_eq!(config.limits.dedup_retention, Duration::from_secs(7200));
    assert_eq!(config.limits.max_display_name_len, 16);
    assert!(config.display.read_only);
    assert!(!config.display.hide_spam);
    assert_eq!(config.display.min_combat_level, 30);
    assert_eq!(config.keys.shared_secret, "s3cret");

    let options = config.broker.mqtt_options();
    assert_eq!(options.keepalive, 30);
    assert_eq!(options.ack_timeout, Duration::from_secs(2));
}

#[test_case("[display]\nmin_combat_level = 2", "min_combat_level" ; "combat level too low")]
#[test_case("[display]\nmin_combat_level = 127", "min_combat_level" ; "combat level too high")]
#[test_case("[limits]\nmin_publish_interval = \"0s\"", "min_publish_interval" ; "zero publish interval")]
#[test_case("[reconnect]\nbase_delay = \"10m\"\nmax_delay = \"1m\"", "exceeds" ; "base above cap")]
#[test_case("[keys]\nshared_secret = \"\"", "shared_secret" ; "empty secret")]
#[test_case("[broker]\naddress = \" \"", "broker.address" ; "blank address")]
#[test_case("[broker]\nkeepalive = 0", "keepalive" ; "zero keepalive")]
#[test_case("[reconnect]\nsupervisor_interval = \"0s\"", "supervisor_interval" ; "zero supervisor interval")]
fn test_validation_errors(content: &str, needle: &str) {
    match RelayConfig::parse(content) {
        Err(ConfigError::Validation(msg)) => {
            assert!(msg.contains(needle), "{:?} should mention {:?}", msg, needle)
        }
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[test_case(3 ; "lowest")]
#[test_case(126 ; "highest")]
fn test_combat_level_bounds_are_inclusive(level: u16) {
    let config = RelayConfig::parse(&format!("[display]\nmin_combat_level = {}", level)).unwrap();
    assert_eq!(config.display.min_combat_level, level);
}

#[test]
fn test_parse_rejects_bad_duration() {
    assert!(matches!(
        RelayConfig::parse("[limits]\nerror_cooldown = \"soon\""),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn test_load_config_with_env_substitution() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("relay.toml");

    std::env::set_var("CHATRELAY_TEST_BROKER_HOST", "10.0.0.7");

    std::fs::write(
        &config_path,
        r#"
[broker]
address = "${CHATRELAY_TEST_BROKER_HOST}:${CHATRELAY_TEST_BROKER_PORT:-1884}"

[limits]
error_cooldown = "${CHATRELAY_TEST_COOLDOWN:-45m}"
"#,
    )
    .unwrap();

    let config = RelayConfig::load(&config_path).unwrap();
    assert_eq!(config.broker.address, "10.0.0.7:1884");
    assert_eq!(config.limits.error_cooldown, Duration::from_secs(45 * 60));
    // Untouched sections keep their defaults
    assert_eq!(config.limits.min_publish_interval, Duration::from_millis(100));

    std::env::remove_var("CHATRELAY_TEST_BROKER_HOST");
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = RelayConfig::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.keys.shared_secret, "pub");
    assert_eq!(config.reconnect.max_delay, Duration::from_secs(300));
}

#[test]
fn test_env_override() {
    std::env::set_var("CHATRELAY__BROKER__KEEPALIVE", "15");

    let dir = tempfile::tempdir().unwrap();
    let config = RelayConfig::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.broker.keepalive, 15);

    std::env::remove_var("CHATRELAY__BROKER__KEEPALIVE");
}

#[test]
fn test_load_invalid_file_fails_validation() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut file, b"[display]\nmin_combat_level = 200\n").unwrap();

    assert!(matches!(
        RelayConfig::load(file.path()),
        Err(ConfigError::Validation(_))
    ));
}
