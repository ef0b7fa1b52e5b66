//! Structured logging setup for rtchat.
//!
//! Uses `tracing` with `tracing-subscriber`. Output always goes to stderr so
//! it never interleaves with the streamed reply on stdout.
//!
//! ## Environment Variables
//!
//! - `RTCHAT_LOG` or `RUST_LOG`: filter directive (e.g. `rtchat=debug,warn`)
//! - `RTCHAT_LOG_FORMAT`: output format (`pretty`, `compact`, `json`)
//!
//! ```bash
//! RTCHAT_LOG=rtchat=debug RTCHAT_LOG_FORMAT=json rtchat
//! ```

use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

pub const DEFAULT_FILTER: &str = "rtchat=info,warn";
pub const DEBUG_FILTER: &str = "rtchat=debug,info";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, multi-line
    Pretty,
    /// Single line per event
    #[default]
    Compact,
    /// JSON object per event
    Json,
}

impl LogFormat {
    /// Case-insensitive; anything unrecognised falls back to compact.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            "pretty" => Self::Pretty,
            _ => Self::Compact,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub filter: String,
    pub format: LogFormat,
    /// Emit span open/close events
    pub with_spans: bool,
    /// Include file and line
    pub with_file: bool,
    /// Include the module path
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            format: LogFormat::Compact,
            with_spans: false,
            with_file: false,
            with_target: false,
        }
    }
}

impl LogConfig {
    /// Build from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var("RTCHAT_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .ok(),
            std::env::var("RTCHAT_LOG_FORMAT").ok(),
        )
    }

    /// Build from already-read variable values.
    pub fn from_vars(filter: Option<String>, format: Option<String>) -> Self {
        Self {
            filter: filter
                .filter(|f| !f.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FILTER.to_string()),
            format: format.as_deref().map(LogFormat::parse).unwrap_or_default(),
            ..Default::default()
        }
    }

    pub fn debug() -> Self {
        Self {
            filter: DEBUG_FILTER.to_string(),
            with_file: true,
            with_target: true,
            ..Default::default()
        }
    }

    /// Environment configuration, raised to debug verbosity when the settings
    /// ask for it and no explicit filter was given.
    pub fn for_settings(debug: bool) -> Self {
        let mut config = Self::from_env();
        if debug && config.filter == DEFAULT_FILTER {
            let format = config.format;
            config = Self::debug();
            config.format = format;
        }
        config
    }
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(config: LogConfig) {
    let env_filter =
        EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let span_events = if config.with_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_span_events(span_events)
        .with_file(config.with_file)
        .with_line_number(config.with_file)
        .with_target(config.with_target);

    match config.format {
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(layer.json());
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        LogFormat::Compact => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(layer.compact());
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        LogFormat::Pretty => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(layer.pretty());
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
    }
}
