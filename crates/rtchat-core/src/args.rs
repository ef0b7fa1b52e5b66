use crate::config::Config;
use clap::{ArgAction, Args};
use std::path::PathBuf;

// Flags shared by the rtchat binary.
//
// Each setting can also come from the environment:
//   API_KEY, BASE_URL, MODEL, TIMEOUT, RETRIES, CHANNEL_BUFFER, DEBUG
// Flags and environment win over the config file.
#[derive(Debug, Clone, Default, Args)]
pub struct CommonArgs {
    /// Path to a config.toml file
    #[arg(short = 'c', long, value_name = "PATH", env = "RTCHAT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Credential for the realtime service
    #[arg(long = "api-key", value_name = "KEY", env = "API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Realtime endpoint host and path (scheme optional)
    #[arg(long = "base-url", value_name = "URL", env = "BASE_URL")]
    pub base_url: Option<String>,

    /// Model to request
    #[arg(long, value_name = "MODEL", env = "MODEL")]
    pub model: Option<String>,

    /// Reconnect timeout in seconds
    #[arg(long, value_name = "SECS", env = "TIMEOUT")]
    pub timeout: Option<u64>,

    /// Reconnect attempts before giving up
    #[arg(long, value_name = "N", env = "RETRIES")]
    pub retries: Option<u32>,

    /// Capacity of the internal frame and event channels
    #[arg(long = "channel-buffer", value_name = "N", env = "CHANNEL_BUFFER")]
    pub channel_buffer: Option<usize>,

    /// Verbose diagnostics
    #[arg(long, action = ArgAction::SetTrue, env = "DEBUG")]
    pub debug: bool,

    /// Disable coloured terminal output
    #[arg(long = "no-color", action = ArgAction::SetTrue, env = "NO_COLOR")]
    pub no_color: bool,
}

impl CommonArgs {
    pub fn config_path(&self) -> Option<PathBuf> {
        self.config.clone()
    }

    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(api_key) = &self.api_key {
            config.api_key = api_key.clone();
        }

        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.clone();
        }

        if let Some(model) = &self.model {
            config.model = model.clone();
        }

        // Non-positive numbers keep the previous value.
        if let Some(timeout) = self.timeout.filter(|t| *t > 0) {
            config.timeout = timeout;
        }

        if let Some(retries) = self.retries.filter(|r| *r > 0) {
            config.retries = retries;
        }

        if let Some(buffer) = self.channel_buffer.filter(|b| *b > 0) {
            config.channel_buffer = buffer;
        }

        if self.debug {
            config.debug = true;
        }
    }
}
