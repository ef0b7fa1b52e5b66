//! Error taxonomy shared by the transport, the protocol engine and the CLI.
//!
//! Every reportable condition travels as an [`AppError`] carrying a
//! [`Severity`]. Only [`Severity::Error`] is fatal; the rest are reported and
//! the session carries on. [`ErrorPolicy`] is the single sink that logs a
//! report and tells the caller whether to keep going.

use std::error::Error as StdError;

use strum::{Display, EnumString};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// How serious a reported condition is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Severity {
    Info,
    Debug,
    Warning,
    Error,
}

/// A reportable condition: severity, human-readable message and an optional
/// underlying cause.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct AppError {
    pub severity: Severity,
    pub message: String,
    #[source]
    pub cause: Option<BoxError>,
}

impl AppError {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            cause: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    pub fn debug(message: impl Into<String>) -> Self {
        Self::new(Severity::Debug, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    /// Attach the underlying cause.
    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Warning raised when an inbound payload does not decode.
    pub fn unmarshal(err: serde_json::Error) -> Self {
        Self::warning("failed to unmarshal JSON").with_cause(err)
    }

    /// Warning raised when an outbound event cannot be encoded.
    pub fn marshal(err: serde_json::Error) -> Self {
        Self::warning("failed to marshal JSON").with_cause(err)
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Error
    }

    /// Message followed by the cause on its own line, if there is one.
    pub fn render(&self) -> String {
        match &self.cause {
            Some(cause) => format!("{}\n{}", self.message, cause),
            None => self.message.clone(),
        }
    }
}

/// Failures of the WebSocket link.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to connect to websocket: {0}")]
    Dial(String),

    #[error("websocket connection is closed")]
    ConnectionClosed,

    #[error("websocket write error: {0}")]
    Write(String),

    #[error("websocket close error: {0}")]
    Close(String),

    #[error("invalid websocket endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("websocket connection is already established")]
    AlreadyConnected,
}

impl From<TransportError> for AppError {
    /// Transport failures surface as warnings unless a caller escalates them.
    fn from(err: TransportError) -> Self {
        AppError::warning(err.to_string())
    }
}

/// What the caller should do after a report was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Terminate,
}

/// Routes reports to the log and decides whether the run may continue.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorPolicy {
    debug: bool,
}

impl ErrorPolicy {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }

    /// Diagnostic reports are dropped outside debug mode.
    pub fn should_report(&self, severity: Severity) -> bool {
        severity != Severity::Debug || self.debug
    }

    pub fn handle(&self, err: &AppError) -> Disposition {
        if !self.should_report(err.severity) {
            return Disposition::Continue;
        }
        let line = err.render();
        match err.severity {
            Severity::Info => info!("{line}"),
            Severity::Debug => debug!("{line}"),
            Severity::Warning => warn!("{line}"),
            Severity::Error => {
                error!("{line}");
                return Disposition::Terminate;
            }
        }
        Disposition::Continue
    }
}
