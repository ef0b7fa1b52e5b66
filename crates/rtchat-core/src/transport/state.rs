use std::sync::Mutex;

use strum::Display;

use crate::sync::lock;

/// Whether the link is currently usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Progress of automatic reconnection.
///
/// ```text
/// Idle ──try_begin──▶ Reconnecting ──success──▶ Idle
///                          │
///                          └──exhausted──▶ Failed
/// any ──close──▶ Closed (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ReconnectState {
    #[default]
    Idle,
    Reconnecting,
    Failed,
    Closed,
}

#[derive(Debug, Default)]
struct Status {
    connection: ConnectionState,
    reconnect: ReconnectState,
}

/// Connection and reconnect state behind one lock, so every transition is
/// observed atomically by the reader, the writer and the reconnect task.
#[derive(Debug, Default)]
pub(crate) struct Link {
    status: Mutex<Status>,
}

impl Link {
    pub(crate) fn connection(&self) -> ConnectionState {
        lock(&self.status).connection
    }

    pub(crate) fn reconnect(&self) -> ReconnectState {
        lock(&self.status).reconnect
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connection() == ConnectionState::Connected
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.reconnect() == ReconnectState::Closed
    }

    /// Ignored once closed.
    pub(crate) fn set_connection(&self, state: ConnectionState) {
        let mut status = lock(&self.status);
        if status.reconnect != ReconnectState::Closed {
            status.connection = state;
        }
    }

    /// Mark the link usable and settle any reconnect in flight.
    pub(crate) fn mark_connected(&self) -> bool {
        let mut status = lock(&self.status);
        if status.reconnect == ReconnectState::Closed {
            return false;
        }
        status.connection = ConnectionState::Connected;
        status.reconnect = ReconnectState::Idle;
        true
    }

    /// Claim the right to reconnect. Only one caller wins until the attempt
    /// settles.
    pub(crate) fn try_begin_reconnect(&self) -> bool {
        let mut status = lock(&self.status);
        if status.reconnect != ReconnectState::Idle {
            return false;
        }
        status.reconnect = ReconnectState::Reconnecting;
        status.connection = ConnectionState::Disconnected;
        true
    }

    /// Settle an unsuccessful reconnect.
    pub(crate) fn fail_reconnect(&self) {
        let mut status = lock(&self.status);
        if status.reconnect == ReconnectState::Reconnecting {
            status.reconnect = ReconnectState::Failed;
        }
    }

    /// Enter the terminal state; returns false if already closed.
    pub(crate) fn close(&self) -> bool {
        let mut status = lock(&self.status);
        let first = status.reconnect != ReconnectState::Closed;
        status.reconnect = ReconnectState::Closed;
        status.connection = ConnectionState::Disconnected;
        first
    }
}
