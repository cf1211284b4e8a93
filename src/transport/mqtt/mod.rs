//! rumqttc-backed MQTT transport
//!
//! Pure functions are kept apart from I/O:
//!
//! - [`connection`] - option mapping and link state
//! - [`message_handler`] - routing of event-loop events
//! - [`reconnect`] - reconnection decisions
//! - [`client`] - the connection and its event-loop supervisor
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_session::config::ConnectionConfig;
//! use mqtt_session::session::SessionManager;
//! use mqtt_session::transport::MqttTransport;
//!
//! # tokio_test::block_on(async {
//! let config = ConnectionConfig::new("mqtts://broker.example.com", "device-1")?;
//! let manager = SessionManager::new(MqttTransport::new(), config)?;
//! manager.connect().await?;
//! manager.submit_publish("sensors/temp", "21.5")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;
pub mod reconnect;

pub use client::{MqttConnection, MqttTransport};
pub use connection::{configure_mqtt_options, LinkState};
pub use message_handler::{route_mqtt_event, EventRoute};
pub use reconnect::ReconnectionDecision;
