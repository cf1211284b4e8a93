//! Client-side MQTT session management
//!
//! - `state`: status enum, transition table and the per-connection [`Session`]
//! - `manager`: connect/disconnect orchestration and transport event handling
//! - `dispatcher`: publish/subscribe/unsubscribe submission
//! - `router`: delivery of inbound messages to the active sink

pub mod dispatcher;
pub mod manager;
pub mod router;
pub mod state;

pub use dispatcher::{CommandKind, DispatchHandle, OutboundCommand};
pub use manager::{SessionManager, SessionSnapshot};
pub use router::{Delivery, InboundMessage, MessageRouter, MessageSink, SinkId};
pub use state::{next_status, Session, SessionNotice, SessionStatus, Trigger};
