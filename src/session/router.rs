//! Inbound message routing to the active sink
//!
//! The router keeps a "most recent message" slot and forwards every
//! inbound message to whichever sink is registered at arrival time. Sinks
//! are channel handles: the consumer drains the receiving end on whatever
//! execution context it owns, so the router never calls into consumer code
//! from the transport's delivery context.

use crate::topic::topic_matches;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{PoisonError, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

/// Message received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    /// Payload decoded as UTF-8, with invalid sequences replaced
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Whether the message topic falls under the given filter
    pub fn matches(&self, filter: &str) -> bool {
        topic_matches(filter, &self.topic)
    }
}

/// Identity of a registered sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(Uuid);

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Non-owning handle to a message consumer
///
/// The consumer owns the receiver returned by [`MessageSink::channel`].
/// Once that receiver is dropped the sink is dead and deliveries to it are
/// silently discarded.
#[derive(Debug, Clone)]
pub struct MessageSink {
    id: SinkId,
    tx: mpsc::UnboundedSender<InboundMessage>,
}

impl MessageSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<InboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            id: SinkId(Uuid::new_v4()),
            tx,
        };
        (sink, rx)
    }

    pub fn id(&self) -> SinkId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn deliver(&self, message: InboundMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// Outcome of routing one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered(SinkId),
    /// Registered sink's consumer is gone; registration was cleared
    SinkGone(SinkId),
    NoSink,
}

/// Fan-out from the transport's event stream to the active sink
#[derive(Debug)]
pub struct MessageRouter {
    active: RwLock<Option<MessageSink>>,
    latest: watch::Sender<Option<InboundMessage>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            active: RwLock::new(None),
            latest,
        }
    }

    /// Swap the active sink. Returns the previously registered sink id.
    pub fn set_active_sink(&self, sink: Option<MessageSink>) -> Option<SinkId> {
        let new_id = sink.as_ref().map(MessageSink::id);
        let previous = {
            let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *active, sink)
        };
        debug!(
            previous = ?previous.as_ref().map(MessageSink::id),
            active = ?new_id,
            "Message sink swapped"
        );
        previous.map(|s| s.id())
    }

    pub fn active_sink(&self) -> Option<SinkId> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(MessageSink::id)
    }

    /// Most recently received message, regardless of sink registration
    pub fn latest_message(&self) -> Option<InboundMessage> {
        self.latest.borrow().clone()
    }

    pub fn watch_latest(&self) -> watch::Receiver<Option<InboundMessage>> {
        self.latest.subscribe()
    }

    /// Record the message and forward it to the sink registered right now
    pub fn on_message_arrived(&self, topic: String, payload: Bytes) -> Delivery {
        let message = InboundMessage::new(topic, payload);
        self.latest.send_replace(Some(message.clone()));

        let sink = self
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let Some(sink) = sink else {
            debug!(topic = %message.topic, "No active sink, message kept as latest only");
            return Delivery::NoSink;
        };

        let id = sink.id();
        let topic = message.topic.clone();
        if sink.deliver(message) {
            debug!(%topic, sink = %id, "Message routed to sink");
            Delivery::Delivered(id)
        } else {
            self.clear_if_current(id);
            debug!(%topic, sink = %id, "Sink consumer gone, message dropped");
            Delivery::SinkGone(id)
        }
    }

    fn clear_if_current(&self, id: SinkId) {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        if active.as_ref().map(MessageSink::id) == Some(id) {
            *active = None;
        }
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    #[test]
    fn test_swapped_sink_receives_message_previous_does_not() {
        let router = MessageRouter::new();
        let (sink_a, mut rx_a) = MessageSink::channel();
        let (sink_b, mut rx_b) = MessageSink::channel();
        let id_a = sink_a.id();
        let id_b = sink_b.id();

        router.set_active_sink(Some(sink_a));
        assert_eq!(router.set_active_sink(Some(sink_b)), Some(id_a));

        let delivery = router.on_message_arrived("t1".to_string(), Bytes::from_static(b"hello"));
        assert_eq!(delivery, Delivery::Delivered(id_b));

        let received = rx_b.try_recv().unwrap();
        assert_eq!(received.topic, "t1");
        assert_eq!(received.payload_lossy(), "hello");
        // Nothing buffered for A and the router no longer holds its sender
        assert_eq!(rx_a.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn test_no_sink_keeps_latest_only() {
        let router = MessageRouter::new();
        assert!(router.latest_message().is_none());

        let delivery = router.on_message_arrived("t1".to_string(), Bytes::from_static(b"a"));
        assert_eq!(delivery, Delivery::NoSink);
        assert_eq!(router.latest_message().unwrap().payload_lossy(), "a");

        // No replay of missed messages to a newly registered sink
        let (sink, mut rx) = MessageSink::channel();
        router.set_active_sink(Some(sink));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_latest_updated_even_with_sink() {
        let router = MessageRouter::new();
        let (sink, _rx) = MessageSink::channel();
        router.set_active_sink(Some(sink));

        router.on_message_arrived("a".to_string(), Bytes::from_static(b"1"));
        router.on_message_arrived("b".to_string(), Bytes::from_static(b"2"));

        let latest = router.latest_message().unwrap();
        assert_eq!(latest.topic, "b");
        assert_eq!(latest.payload_lossy(), "2");
    }

    #[test]
    fn test_dead_sink_is_cleared() {
        let router = MessageRouter::new();
        let (sink, rx) = MessageSink::channel();
        let id = sink.id();
        router.set_active_sink(Some(sink));
        drop(rx);

        let delivery = router.on_message_arrived("t".to_string(), Bytes::new());
        assert_eq!(delivery, Delivery::SinkGone(id));
        assert_eq!(router.active_sink(), None);
    }

    #[test]
    fn test_deregister_sink() {
        let router = MessageRouter::new();
        let (sink, mut rx) = MessageSink::channel();
        router.set_active_sink(Some(sink));
        router.set_active_sink(None);

        assert_eq!(
            router.on_message_arrived("t".to_string(), Bytes::new()),
            Delivery::NoSink
        );
        assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn test_delivery_preserves_arrival_order() {
        let router = MessageRouter::new();
        let (sink, mut rx) = MessageSink::channel();
        router.set_active_sink(Some(sink));

        for i in 0..5u8 {
            router.on_message_arrived("t".to_string(), Bytes::from(vec![i]));
        }
        for i in 0..5u8 {
            assert_eq!(rx.try_recv().unwrap().payload[0], i);
        }
    }

    #[tokio::test]
    async fn test_watch_latest_notifies() {
        let router = MessageRouter::new();
        let mut latest = router.watch_latest();

        router.on_message_arrived("sensor/1".to_string(), Bytes::from_static(b"21.5"));
        latest.changed().await.unwrap();
        assert_eq!(latest.borrow().as_ref().unwrap().topic, "sensor/1");
    }

    #[test]
    fn test_inbound_message_matches_filter() {
        let message = InboundMessage::new("channels/1/subscribe/fields/field2", "x");
        assert!(message.matches("channels/1/subscribe/#"));
        assert!(!message.matches("channels/2/#"));
    }
}
