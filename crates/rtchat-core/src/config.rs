//! Runtime settings.
//!
//! Values are layered: built-in defaults, then the TOML file, then the
//! command line and environment (see [`crate::args::CommonArgs`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::ReconnectPolicy;

pub const DEFAULT_BASE_URL: &str = "api.openai.com/v1/realtime";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini-realtime-preview";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_CHANNEL_BUFFER: usize = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("missing the following required flags or environment variables: {}", .0.join(", "))]
    MissingRequired(Vec<&'static str>),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bearer credential sent on the upgrade request.
    pub api_key: String,
    /// Host and path of the realtime endpoint; `ws://` or `wss://` may be
    /// given explicitly, otherwise `wss://` is assumed.
    pub base_url: String,
    pub model: String,
    pub debug: bool,
    /// Seconds. Drives the reconnect backoff and the readiness poll.
    pub timeout: u64,
    pub retries: u32,
    pub channel_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            debug: false,
            timeout: DEFAULT_TIMEOUT_SECS,
            retries: DEFAULT_RETRIES,
            channel_buffer: DEFAULT_CHANNEL_BUFFER,
        }
    }
}

impl Config {
    /// `<config dir>/rtchat/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("rtchat").join("config.toml"))
    }

    /// Load from `path`, or from [`Config::default_path`] when `None`.
    ///
    /// A missing default file is not an error; an explicitly named one is.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let missing: Vec<&'static str> = [
            ("api-key", &self.api_key),
            ("base-url", &self.base_url),
            ("model", &self.model),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingRequired(missing));
        }
        if self.timeout == 0 {
            return Err(ConfigError::Invalid {
                field: "timeout",
                reason: "must be at least 1 second".into(),
            });
        }
        if self.channel_buffer == 0 {
            return Err(ConfigError::Invalid {
                field: "channel-buffer",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Pretty JSON dump with the credential masked.
    pub fn info(&self) -> Result<String, serde_json::Error> {
        let masked = Self {
            api_key: mask_secret(&self.api_key),
            ..self.clone()
        };
        serde_json::to_string_pretty(&masked)
    }

    /// Full WebSocket URL including the model query parameter.
    pub fn endpoint_url(&self) -> String {
        let base = self.base_url.trim();
        if base.starts_with("ws://") || base.starts_with("wss://") {
            format!("{}?model={}", base, self.model)
        } else {
            format!("wss://{}?model={}", base, self.model)
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::from_timeout(self.timeout, self.retries)
    }

    /// Interval for polling session readiness (timeout read as milliseconds).
    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.timeout.max(1))
    }
}

/// Keep only the last four characters of a secret.
pub fn mask_secret(secret: &str) -> String {
    let count = secret.chars().count();
    if count == 0 {
        return String::new();
    }
    if count <= 4 {
        return "*".repeat(count);
    }
    let tail: String = secret.chars().skip(count - 4).collect();
    format!("****{tail}")
}
