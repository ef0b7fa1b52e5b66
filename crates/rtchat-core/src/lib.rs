//! Core library for rtchat.
//!
//! The crate is split along the same seams the client runs on:
//!
//! - [`transport`] owns the WebSocket link, its reader/writer loops and the
//!   reconnect state machine.
//! - [`realtime`] is the protocol engine that turns inbound frames into
//!   message events and drives the function-call round trip.
//! - [`functions`] holds the callable registry advertised to the service.
//! - [`config`], [`args`] and [`logging`] are the ambient settings layers
//!   shared with the `rtchat` binary.

pub mod args;
pub mod config;
pub mod error;
pub mod functions;
pub mod logging;
pub mod realtime;
pub mod retry;
pub mod sync;
pub mod transport;

pub use config::Config;
pub use error::{AppError, Disposition, ErrorPolicy, Severity, TransportError};
