//! Pure session state machine
//!
//! Holds the status enum, the per-connection [`Session`] value and the
//! transition table. Nothing here performs I/O; the manager applies the
//! decisions made here under its coordination lock.

use super::dispatcher::CommandQueue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Session connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Triggers that move the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// `connect()` requested
    ConnectRequested,
    /// Transport connect and resubscription succeeded
    ConnectSucceeded,
    /// Transport connect or resubscription failed
    ConnectFailed,
    /// `disconnect()` requested
    DisconnectRequested,
    /// Transport disconnect returned, successfully or not
    DisconnectFinished,
    /// Unsolicited connection loss reported by the transport
    ConnectionLost,
}

/// Pure transition table. `None` means the trigger is not valid in `from`.
pub fn next_status(from: SessionStatus, trigger: Trigger) -> Option<SessionStatus> {
    use SessionStatus::*;

    match (from, trigger) {
        (Disconnected, Trigger::ConnectRequested) => Some(Connecting),
        (Connecting, Trigger::ConnectSucceeded) => Some(Connected),
        (Connecting, Trigger::ConnectFailed) => Some(Disconnected),
        (Connecting | Connected, Trigger::DisconnectRequested) => Some(Disconnecting),
        (Disconnecting, Trigger::DisconnectFinished) => Some(Disconnected),
        (Connected, Trigger::ConnectionLost) => Some(Disconnected),
        _ => None,
    }
}

/// Log a completed transition
pub fn log_transition(from: SessionStatus, to: SessionStatus, generation: u64) {
    match (from, to) {
        (SessionStatus::Connecting, SessionStatus::Connected) => {
            info!(generation, "MQTT session established");
        }
        (SessionStatus::Connected, SessionStatus::Disconnected) => {
            warn!(generation, "MQTT session lost");
        }
        _ => {
            info!(generation, %from, %to, "MQTT session status changed");
        }
    }
}

/// Notifications broadcast to status observers
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    StatusChanged {
        from: SessionStatus,
        to: SessionStatus,
    },
    /// Unsolicited loss; not a caller error
    ConnectionLost { cause: String },
    /// Broker acknowledged a publish. Not correlated with any submit call.
    DeliveryComplete { token: u16 },
    /// A fire-and-forget command failed after it was accepted
    DispatchFailed {
        kind: super::CommandKind,
        topic: String,
        cause: String,
    },
}

/// State of one connection attempt/lifetime
///
/// A new value is created for every connect attempt and dropped on
/// teardown; it is never reinitialised in place.
#[derive(Debug)]
pub struct Session<C> {
    generation: u64,
    started_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
    connection: Option<Arc<C>>,
    queue: Option<CommandQueue>,
    lost_while_connecting: Option<String>,
}

impl<C> Session<C> {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            started_at: Utc::now(),
            connected_at: None,
            connection: None,
            queue: None,
            lost_while_connecting: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    pub fn connection(&self) -> Option<Arc<C>> {
        self.connection.clone()
    }

    pub(crate) fn attach(&mut self, connection: Arc<C>) {
        self.connection = Some(connection);
    }

    pub(crate) fn take_connection(&mut self) -> Option<Arc<C>> {
        self.connection.take()
    }

    /// Record the connect time and start routing commands through `queue`
    pub(crate) fn mark_connected(&mut self, queue: CommandQueue) {
        self.connected_at = Some(Utc::now());
        self.queue = Some(queue);
    }

    pub(crate) fn queue(&self) -> Option<&CommandQueue> {
        self.queue.as_ref()
    }

    pub(crate) fn record_loss(&mut self, cause: String) {
        self.lost_while_connecting.get_or_insert(cause);
    }

    pub(crate) fn take_loss(&mut self) -> Option<String> {
        self.lost_while_connecting.take()
    }
}
