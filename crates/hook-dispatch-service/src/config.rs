//! Configuration types for the HTTP service
//!
//! Every field carries a serde default, so an empty configuration source
//! produces a usable config apart from the webhook secret, which
//! [`ServiceConfig::validate`] insists on.

use std::path::PathBuf;
use std::time::Duration;

use hook_dispatch_core::auth::exchange::DEFAULT_GITHUB_API_URL;
use hook_dispatch_core::auth::tokens::DEFAULT_REFRESH_MARGIN_SECONDS;
use hook_dispatch_core::dispatch::DEFAULT_DISPATCH_TIMEOUT;
use hook_dispatch_core::idempotency::DEFAULT_IDEMPOTENCY_TTL_SECONDS;
use hook_dispatch_core::{DispatchFailurePolicy, RetryPolicy};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::ConfigError;

/// System-wide configuration file, without extension.
pub const SYSTEM_CONFIG_FILE: &str = "/etc/hook-dispatch/service";

/// Deployment-local configuration file, relative to the working directory.
pub const LOCAL_CONFIG_FILE: &str = "config/service";

/// Environment variable naming an extra configuration file.
pub const CONFIG_FILE_ENV: &str = "HD_CONFIG_FILE";

/// Prefix of configuration environment variables (`HD__SECTION__KEY`).
pub const ENV_PREFIX: &str = "HD";

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub github: GitHubConfig,
    pub idempotency: IdempotencyConfig,
    pub tokens: TokenConfig,
    pub dispatch: DispatchConfig,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
}

impl ServiceConfig {
    /// Load configuration from the layered sources, later sources winning:
    ///
    /// 1. `/etc/hook-dispatch/service.yaml`
    /// 2. `./config/service.yaml`
    /// 3. the file named by `HD_CONFIG_FILE` (must exist when set)
    /// 4. `HD__SECTION__KEY` environment variables
    ///
    /// The result is not validated.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(
                config::File::with_name(SYSTEM_CONFIG_FILE)
                    .required(false)
                    .format(config::FileFormat::Yaml),
            )
            .add_source(
                config::File::with_name(LOCAL_CONFIG_FILE)
                    .required(false)
                    .format(config::FileFormat::Yaml),
            );

        if let Ok(explicit_path) = std::env::var(CONFIG_FILE_ENV) {
            if !explicit_path.is_empty() {
                info!(path = %explicit_path, "Loading configuration from explicit path");
                builder = builder.add_source(
                    config::File::with_name(&explicit_path)
                        .required(true)
                        .format(config::FileFormat::Yaml),
                );
            }
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
            .map_err(ConfigError::from)
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(invalid("server.port must not be 0"));
        }

        if self.server.max_body_size == 0 {
            return Err(invalid("server.max_body_size must be greater than 0"));
        }

        if self.github.webhook_secret.is_empty() {
            return Err(ConfigError::Missing {
                key: "github.webhook_secret".to_string(),
            });
        }

        match (&self.github.app_id, &self.github.private_key_path) {
            (Some(_), None) => {
                return Err(ConfigError::Missing {
                    key: "github.private_key_path".to_string(),
                })
            }
            (None, Some(_)) => {
                return Err(ConfigError::Missing {
                    key: "github.app_id".to_string(),
                })
            }
            _ => {}
        }

        url::Url::parse(&self.github.api_url)
            .map_err(|e| invalid(format!("github.api_url is not a valid URL: {}", e)))?;

        if self.idempotency.ttl_seconds == 0 {
            return Err(invalid("idempotency.ttl_seconds must be greater than 0"));
        }

        if self.dispatch.timeout_seconds == 0 {
            return Err(invalid("dispatch.timeout_seconds must be greater than 0"));
        }

        if self.dispatch.timeout_seconds > self.server.request_timeout_seconds {
            return Err(invalid(
                "dispatch.timeout_seconds must not exceed server.request_timeout_seconds",
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be greater than 0"));
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(invalid("retry.base_delay_ms must not exceed retry.max_delay_ms"));
        }

        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(invalid("retry.multiplier must be at least 1.0"));
        }

        if self.retry.batch_size == 0 {
            return Err(invalid("retry.batch_size must be greater than 0"));
        }

        if self.retry.store == RetryStoreKind::Filesystem && self.retry.store_path.is_none() {
            return Err(ConfigError::Missing {
                key: "retry.store_path".to_string(),
            });
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        message: message.into(),
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Upper bound on the time a webhook request is held open
    pub request_timeout_seconds: u64,

    /// Maximum request body size in bytes
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_seconds: 10,
            max_body_size: 25 * 1024 * 1024, // GitHub caps payloads at 25MB
        }
    }
}

/// GitHub App credentials and API settings.
///
/// The App credentials are optional; without them handlers receive no
/// installation token.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    pub app_id: Option<u64>,
    pub private_key_path: Option<PathBuf>,
    #[serde(skip_serializing)]
    pub webhook_secret: String,
    pub api_url: String,
    pub user_agent: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            app_id: None,
            private_key_path: None,
            webhook_secret: String::new(),
            api_url: DEFAULT_GITHUB_API_URL.to_string(),
            user_agent: concat!("hook-dispatch/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl std::fmt::Debug for GitHubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubConfig")
            .field("app_id", &self.app_id)
            .field("private_key_path", &self.private_key_path)
            .field("webhook_secret", &"<REDACTED>")
            .field("api_url", &self.api_url)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub ttl_seconds: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: DEFAULT_IDEMPOTENCY_TTL_SECONDS as u64,
        }
    }
}

impl IdempotencyConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX / 1000))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// A cached token expiring within this margin is refreshed
    pub refresh_margin_seconds: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_margin_seconds: DEFAULT_REFRESH_MARGIN_SECONDS as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub failure_policy: DispatchFailurePolicy,
    pub timeout_seconds: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            failure_policy: DispatchFailurePolicy::default(),
            timeout_seconds: DEFAULT_DISPATCH_TIMEOUT.as_secs(),
        }
    }
}

impl DispatchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Backing store of the retry queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStoreKind {
    #[default]
    Memory,
    Filesystem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub store: RetryStoreKind,
    pub store_path: Option<PathBuf>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            poll_interval_ms: 5_000,
            batch_size: 32,
            store: RetryStoreKind::Memory,
            store_path: None,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.multiplier,
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "hook_dispatch_service=info,hook_dispatch_core=info,tower_http=info".to_string(),
            json_format: false,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
