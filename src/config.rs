use secrecy::{ExposeSecret, SecretBox};
use std::env;
use std::time::Duration;
use thiserror::Error;

use crate::auth::AuthHeaders;

pub const DEFAULT_ENDPOINT: &str = "avs-alexa-eu.amazon.com";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },
}

/// Where and how to reach the service
#[derive(Debug, Clone, PartialEq)]
pub struct AvsConfig {
    pub endpoint: String,
    pub secure: bool,
    pub request_timeout: Duration,
    pub ping_interval: Duration,
}

impl Default for AvsConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            secure: true,
            request_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl AvsConfig {
    /// Defaults overridden by `AVS_ENDPOINT`, `AVS_INSECURE` and `AVS_REQUEST_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(endpoint) = lookup("AVS_ENDPOINT") {
            if endpoint.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    var: "AVS_ENDPOINT".to_string(),
                    reason: "endpoint cannot be empty".to_string(),
                });
            }
            config.endpoint = endpoint.trim().to_string();
        }

        if let Some(insecure) = lookup("AVS_INSECURE") {
            config.secure = !matches!(insecure.trim(), "1" | "true" | "yes");
        }

        if let Some(timeout) = lookup("AVS_REQUEST_TIMEOUT_SECS") {
            let secs = timeout
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or_else(|| ConfigError::InvalidValue {
                    var: "AVS_REQUEST_TIMEOUT_SECS".to_string(),
                    reason: format!("expected a positive number of seconds, got '{}'", timeout),
                })?;
            config.request_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

/// Bearer token obtained by an external authorization flow
#[derive(Debug)]
pub struct AccessToken(SecretBox<String>);

impl AccessToken {
    pub fn new(token: String) -> Self {
        Self(SecretBox::new(Box::new(token)))
    }

    /// Expose the token only while building request headers
    pub fn auth_headers(&self) -> AuthHeaders {
        AuthHeaders::bearer(self.0.expose_secret())
    }
}

/// Load the access token from `AVS_ACCESS_TOKEN`
pub fn load_access_token() -> Result<AccessToken, ConfigError> {
    dotenvy::dotenv().ok();

    let token = env::var("AVS_ACCESS_TOKEN").map_err(|_| {
        log::error!("Missing required environment variable: AVS_ACCESS_TOKEN");
        log::error!("Create a .env file in the project root with:");
        log::error!("AVS_ACCESS_TOKEN=your_access_token_here");
        ConfigError::MissingEnvVar("AVS_ACCESS_TOKEN".to_string())
    })?;

    if token.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            var: "AVS_ACCESS_TOKEN".to_string(),
            reason: "token cannot be empty".to_string(),
        });
    }

    Ok(AccessToken::new(token.trim().to_string()))
}
