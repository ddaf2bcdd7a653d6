//! Installation token exchange over the GitHub REST API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{AuthError, InstallationAccessToken, InstallationId, JsonWebToken, TokenExchanger};

/// Default GitHub REST API base URL.
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";

/// Settings for talking to the GitHub API.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Base URL of the REST API, without trailing slash.
    pub api_url: String,
    /// User agent sent with every request. GitHub rejects requests without one.
    pub user_agent: String,
    /// Request timeout.
    pub timeout: Duration,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_GITHUB_API_URL.to_string(),
            user_agent: concat!("hook-dispatch/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl ExchangeConfig {
    /// Override the API base URL (GitHub Enterprise or a test server).
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

/// [`TokenExchanger`] calling `POST /app/installations/{id}/access_tokens`.
#[derive(Debug, Clone)]
pub struct GitHubTokenExchanger {
    http_client: reqwest::Client,
    config: ExchangeConfig,
}

impl GitHubTokenExchanger {
    pub fn new(config: ExchangeConfig) -> Result<Self, AuthError> {
        let http_client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .build()
            .map_err(|e| AuthError::NetworkError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            config,
        })
    }

    fn access_tokens_url(&self, installation_id: InstallationId) -> String {
        format!(
            "{}/app/installations/{}/access_tokens",
            self.config.api_url, installation_id
        )
    }
}

#[async_trait]
impl TokenExchanger for GitHubTokenExchanger {
    async fn exchange(
        &self,
        installation_id: InstallationId,
        jwt: &JsonWebToken,
    ) -> Result<InstallationAccessToken, AuthError> {
        let url = self.access_tokens_url(installation_id);
        debug!(installation_id = %installation_id, "Requesting installation access token");

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", jwt.token()))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await
            .map_err(|e| AuthError::NetworkError(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(
                installation_id = %installation_id,
                status = status.as_u16(),
                "GitHub rejected installation token request"
            );
            return Err(match status {
                StatusCode::UNAUTHORIZED => AuthError::InvalidCredentials,
                StatusCode::NOT_FOUND => AuthError::InstallationNotFound { installation_id },
                _ => AuthError::GitHubApiError {
                    status: status.as_u16(),
                    message,
                },
            });
        }

        let body: AccessTokenResponse =
            response
                .json()
                .await
                .map_err(|e| AuthError::InvalidResponse {
                    message: format!("Failed to parse access token response: {}", e),
                })?;

        Ok(InstallationAccessToken::new(
            body.token,
            installation_id,
            body.expires_at,
        ))
    }
}

#[cfg(test)]
#[path = "exchange_tests.rs"]
mod tests;
