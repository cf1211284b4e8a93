//! MQTT session manager
//!
//! A client-side session layer for a single MQTT broker connection:
//! - Session state machine (`Disconnected → Connecting → Connected → Disconnecting`)
//! - Command dispatch for publish/subscribe/unsubscribe with fail-fast acceptance
//! - Routing of inbound messages to a swappable consumer sink
//! - A transport capability seam with a rumqttc implementation (TCP or TLS)
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqtt_session::config::ConnectionConfig;
//! use mqtt_session::session::{MessageSink, SessionManager};
//! use mqtt_session::transport::MqttTransport;
//!
//! # tokio_test::block_on(async {
//! let config = ConnectionConfig::new("mqtt://localhost:1883", "device-1")?;
//! let manager =
//!     SessionManager::with_subscriptions(MqttTransport::new(), config, ["sensors/#"])?;
//!
//! let (sink, mut inbox) = MessageSink::channel();
//! manager.set_active_sink(Some(sink));
//! manager.connect().await?;
//!
//! manager.submit_publish("sensors/temp", "21.5")?;
//! if let Some(message) = inbox.recv().await {
//!     println!("{}: {}", message.topic, message.payload_lossy());
//! }
//! manager.shutdown().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod config;
pub mod console;
pub mod error;
pub mod observability;
pub mod session;
pub mod testing;
pub mod topic;
pub mod transport;

pub use config::{ConfigError, ConnectionConfig, SessionConfig};
pub use error::{SessionError, SessionResult};
pub use session::{
    CommandKind, DispatchHandle, InboundMessage, MessageSink, SessionManager, SessionNotice,
    SessionStatus,
};
pub use transport::{MqttTransport, QualityOfService, Transport, TransportError, TransportEvent};
