//! Session configuration.
//!
//! Configuration for the session client, including:
//! - Endpoint settings used to derive the per-identity URL
//! - Reconnection backoff policy
//! - Logging level and format

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::SessionError;
use crate::reconnect::ReconnectConfig;
use crate::state::Identity;

/// Where sessions connect to.
///
/// The session URL is `{ws|wss}://{host}{path_prefix}/{identity}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EndpointConfig {
    /// Use `wss://` instead of `ws://`.
    pub secure: bool,
    /// Host and optional port, e.g. `localhost:8080`.
    pub host: String,
    /// Path in front of the identity segment.
    pub path_prefix: String,
    /// Bound on a WebSocket close handshake, in milliseconds.
    pub close_timeout_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            secure: false,
            host: "localhost:8080".to_string(),
            path_prefix: "/ws/chat".to_string(),
            close_timeout_ms: 5_000,
        }
    }
}

impl EndpointConfig {
    /// URL scheme for this endpoint.
    #[must_use]
    pub const fn scheme(&self) -> &'static str {
        if self.secure { "wss" } else { "ws" }
    }

    /// Close handshake bound as a [`Duration`].
    #[must_use]
    pub const fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Build the session URL for `identity`.
    ///
    /// The identity is appended as a single, percent-encoded path segment.
    pub fn url_for(&self, identity: &Identity) -> Result<Url, SessionError> {
        let mut url = Url::parse(&format!("{}://{}", self.scheme(), self.host))?;
        {
            let mut segments = url.path_segments_mut().map_err(|()| {
                SessionError::Config(format!("host '{}' cannot carry a path", self.host))
            })?;
            segments.clear();
            for segment in self.path_prefix.split('/').filter(|s| !s.is_empty()) {
                segments.push(segment);
            }
            segments.push(identity.as_str());
        }
        Ok(url)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Main session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SessionConfig {
    /// Endpoint configuration.
    pub endpoint: EndpointConfig,
    /// Reconnection policy.
    pub reconnect: ReconnectConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl SessionConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SessionError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, SessionError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| SessionError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML.
    pub fn to_toml(&self) -> Result<String, SessionError> {
        toml::to_string_pretty(self)
            .map_err(|e| SessionError::Config(format!("failed to serialize config: {e}")))
    }

    /// Write the configuration to `path` as TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.endpoint.host.trim().is_empty() {
            return Err(SessionError::Config(
                "endpoint.host cannot be empty".to_string(),
            ));
        }

        if self.endpoint.host.contains('/') {
            return Err(SessionError::Config(
                "endpoint.host must not contain a path".to_string(),
            ));
        }

        if !self.endpoint.path_prefix.starts_with('/') {
            return Err(SessionError::Config(
                "endpoint.path_prefix must start with '/'".to_string(),
            ));
        }

        if self.endpoint.close_timeout_ms == 0 {
            return Err(SessionError::Config(
                "endpoint.close_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.reconnect.base_delay_ms == 0 {
            return Err(SessionError::Config(
                "reconnect.base_delay_ms must be greater than 0".to_string(),
            ));
        }

        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(SessionError::Config(
                "reconnect.max_delay_ms must not be below reconnect.base_delay_ms".to_string(),
            ));
        }

        Ok(())
    }
}
