//! Transport capability for the session layer
//!
//! The session manager never speaks MQTT itself. It drives an opaque
//! [`Transport`] that opens [`Connection`]s and reports asynchronous
//! [`TransportEvent`]s through an [`EventSender`].

use crate::config::ConnectionConfig;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

/// Delivery guarantee requested for publish and subscribe operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QualityOfService {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl QualityOfService {
    /// Map the numeric MQTT QoS level (0, 1, 2)
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }
}

/// Events raised by a transport off the caller's thread of control
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection dropped and the transport gave up on it
    ConnectionLost { cause: String },
    /// A message arrived on one of the subscribed filters
    MessageArrived { topic: String, payload: Bytes },
    /// The broker acknowledged an outbound publish (packet identifier)
    DeliveryComplete { token: u16 },
}

/// Generation-tagged event envelope consumed by the session manager
pub(crate) type TaggedEvent = (u64, TransportEvent);

/// Handle through which a transport reports events for one session
///
/// Every connect attempt receives its own sender tagged with the session
/// generation, so events from a superseded connection are recognisable.
#[derive(Debug, Clone)]
pub struct EventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl EventSender {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self { generation, tx }
    }

    /// Build a sender with its own receiving end (used by transport tests)
    pub fn detached(generation: u64) -> (Self, mpsc::UnboundedReceiver<(u64, TransportEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(generation, tx), rx)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report an event. Returns false once the session layer is gone.
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection refused by broker: {0}")]
    ConnectionRefused(String),
    #[error("ConnAck timeout - no connection confirmation within {0:?}")]
    ConnAckTimeout(std::time::Duration),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Unsubscribe failed")]
    UnsubscribeFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Disconnect failed")]
    DisconnectFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection closed: {0}")]
    Closed(String),
}

/// Factory for broker connections
///
/// Implementations may block or take arbitrary time; the session layer
/// always calls them from its worker context.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    /// Open a connection. Events for its lifetime go through `events`.
    async fn connect(
        &self,
        config: &ConnectionConfig,
        events: EventSender,
    ) -> Result<Self::Connection, TransportError>;
}

/// One live broker connection, owned by a single session
#[async_trait::async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Best-effort disconnect; always eventually returns
    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QualityOfService,
    ) -> Result<(), TransportError>;

    async fn subscribe(&self, filter: &str, qos: QualityOfService) -> Result<(), TransportError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;
}

/// Type alias for the production transport
pub type MqttTransport = mqtt::MqttTransport;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_levels() {
        assert_eq!(
            QualityOfService::from_level(0),
            Some(QualityOfService::AtMostOnce)
        );
        assert_eq!(
            QualityOfService::from_level(2),
            Some(QualityOfService::ExactlyOnce)
        );
        assert_eq!(QualityOfService::from_level(3), None);
        assert_eq!(QualityOfService::default().level(), 1);
    }

    #[tokio::test]
    async fn test_event_sender_tags_generation() {
        let (sender, mut rx) = EventSender::detached(7);
        assert!(sender.send(TransportEvent::DeliveryComplete { token: 3 }));

        let (generation, event) = rx.recv().await.unwrap();
        assert_eq!(generation, 7);
        assert_eq!(event, TransportEvent::DeliveryComplete { token: 3 });
    }

    #[test]
    fn test_event_sender_reports_closed_receiver() {
        let (sender, rx) = EventSender::detached(1);
        drop(rx);
        assert!(sender.is_closed());
        assert!(!sender.send(TransportEvent::ConnectionLost {
            cause: "gone".to_string()
        }));
    }
}
