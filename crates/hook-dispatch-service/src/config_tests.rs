//! Tests for [`ServiceConfig`] defaults, validation and layered loading.

use super::*;
use hook_dispatch_core::DispatchFailurePolicy;
use serial_test::serial;
use std::io::Write;

fn valid_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.github.webhook_secret = "secret".to_string();
    config
}

// ============================================================================
// Defaults
// ============================================================================

#[test]
fn test_defaults_match_documented_values() {
    let config = ServiceConfig::default();

    assert_eq!(config.server.port, 8080);
    assert_eq!(config.idempotency.ttl_seconds, 24 * 60 * 60);
    assert_eq!(config.tokens.refresh_margin_seconds, 60);
    assert_eq!(config.dispatch.failure_policy, DispatchFailurePolicy::AnyHandlerFailed);
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.store, RetryStoreKind::Memory);
    assert!(!config.logging.json_format);
}

#[test]
fn test_retry_policy_conversion() {
    let mut config = valid_config();
    config.retry.base_delay_ms = 250;
    config.retry.max_delay_ms = 4_000;
    config.retry.multiplier = 3.0;

    let policy = config.retry.policy();

    assert_eq!(policy.base_delay, Duration::from_millis(250));
    assert_eq!(policy.backoff(2), Duration::from_millis(2_250));
    assert_eq!(policy.backoff(3), Duration::from_millis(4_000));
}

#[test]
fn test_debug_redacts_webhook_secret() {
    let config = valid_config();

    let debug = format!("{:?}", config);

    assert!(debug.contains("<REDACTED>"));
    assert!(!debug.contains("\"secret\""));
}

#[test]
fn test_serialization_omits_webhook_secret() {
    let config = valid_config();

    let yaml = serde_yaml::to_string(&config).unwrap();

    assert!(!yaml.contains("webhook_secret"));
}

// ============================================================================
// Validation
// ============================================================================

#[test]
fn test_valid_config_passes() {
    assert!(valid_config().validate().is_ok());
}

#[test]
fn test_empty_webhook_secret_is_rejected() {
    let err = ServiceConfig::default().validate().unwrap_err();

    assert!(
        matches!(err, ConfigError::Missing { ref key } if key == "github.webhook_secret"),
        "unexpected error: {:?}",
        err
    );
}

#[test]
fn test_zero_port_is_rejected() {
    let mut config = valid_config();
    config.server.port = 0;

    assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
}

#[test]
fn test_zero_max_attempts_is_rejected() {
    let mut config = valid_config();
    config.retry.max_attempts = 0;

    assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
}

#[test]
fn test_base_delay_above_max_delay_is_rejected() {
    let mut config = valid_config();
    config.retry.base_delay_ms = 10_000;
    config.retry.max_delay_ms = 1_000;

    assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
}

#[test]
fn test_multiplier_below_one_is_rejected() {
    let mut config = valid_config();
    config.retry.multiplier = 0.5;
    assert!(config.validate().is_err());

    config.retry.multiplier = f64::NAN;
    assert!(config.validate().is_err());
}

#[test]
fn test_partial_app_credentials_are_rejected() {
    let mut config = valid_config();
    config.github.app_id = Some(42);

    assert!(matches!(
        config.validate(),
        Err(ConfigError::Missing { ref key }) if key == "github.private_key_path"
    ));
}

#[test]
fn test_filesystem_store_requires_path() {
    let mut config = valid_config();
    config.retry.store = RetryStoreKind::Filesystem;

    assert!(matches!(config.validate(), Err(ConfigError::Missing { .. })));
}

#[test]
fn test_dispatch_timeout_must_fit_request_timeout() {
    let mut config = valid_config();
    config.server.request_timeout_seconds = 5;
    config.dispatch.timeout_seconds = 8;

    assert!(config.validate().is_err());
}

#[test]
fn test_invalid_api_url_is_rejected() {
    let mut config = valid_config();
    config.github.api_url = "not a url".to_string();

    assert!(config.validate().is_err());
}

// ============================================================================
// Loading
// ============================================================================

#[test]
fn test_example_file_deserializes() {
    let yaml = include_str!("../config/service.example.yaml");

    let config: ServiceConfig = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(config.github.app_id, Some(123456));
    assert_eq!(config.retry.store, RetryStoreKind::Filesystem);
    assert!(config.logging.json_format);
    assert!(config.validate().is_ok());
}

#[test]
fn test_partial_section_keeps_other_defaults() {
    let config: ServiceConfig =
        serde_yaml::from_str("retry:\n  max_attempts: 2\ndispatch:\n  failure_policy: all_failed\n")
            .unwrap();

    assert_eq!(config.retry.max_attempts, 2);
    assert_eq!(config.retry.batch_size, RetryConfig::default().batch_size);
    assert_eq!(
        config.dispatch.failure_policy,
        DispatchFailurePolicy::AllHandlersFailed
    );
}

#[test]
#[serial]
fn test_load_layers_explicit_file_and_environment() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(
        file,
        "server:\n  port: 9000\ngithub:\n  webhook_secret: from-file\nretry:\n  max_attempts: 7"
    )
    .unwrap();

    std::env::set_var(CONFIG_FILE_ENV, file.path());
    std::env::set_var("HD__SERVER__PORT", "9090");
    let loaded = ServiceConfig::load();
    std::env::remove_var(CONFIG_FILE_ENV);
    std::env::remove_var("HD__SERVER__PORT");

    let config = loaded.unwrap();
    assert_eq!(config.server.port, 9090);
    assert_eq!(config.github.webhook_secret, "from-file");
    assert_eq!(config.retry.max_attempts, 7);
}

#[test]
#[serial]
fn test_missing_explicit_file_is_an_error() {
    std::env::set_var(CONFIG_FILE_ENV, "/nonexistent/hook-dispatch.yaml");
    let loaded = ServiceConfig::load();
    std::env::remove_var(CONFIG_FILE_ENV);

    assert!(matches!(loaded, Err(ConfigError::Load(_))));
}
