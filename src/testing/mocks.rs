//! Mock transport for testing
//!
//! [`MockTransport`] records every call, can be told to fail or stall, and
//! keeps the last [`EventSender`] it was handed so tests can inject
//! transport events. Clones share state: keep one handle in the test and
//! give another to the session manager.

use crate::config::ConnectionConfig;
use crate::transport::{
    Connection, EventSender, QualityOfService, Transport, TransportError, TransportEvent,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// One recorded transport call
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    Connect { client_id: String, generation: u64 },
    Disconnect { generation: u64 },
    Publish {
        topic: String,
        payload: Bytes,
        qos: QualityOfService,
    },
    Subscribe {
        filter: String,
        qos: QualityOfService,
    },
    Unsubscribe { filter: String },
}

#[derive(Debug)]
struct MockState {
    calls: Mutex<Vec<TransportCall>>,
    fail_connect: AtomicBool,
    fail_disconnect: AtomicBool,
    fail_dispatch: AtomicBool,
    connect_delay_ms: AtomicU64,
    publish_delay_ms: AtomicU64,
    subscribe_delay_ms: AtomicU64,
    connect_gate: watch::Sender<bool>,
    last_events: Mutex<Option<EventSender>>,
}

impl Default for MockState {
    fn default() -> Self {
        let (connect_gate, _) = watch::channel(true);
        Self {
            calls: Mutex::default(),
            fail_connect: AtomicBool::new(false),
            fail_disconnect: AtomicBool::new(false),
            fail_dispatch: AtomicBool::new(false),
            connect_delay_ms: AtomicU64::new(0),
            publish_delay_ms: AtomicU64::new(0),
            subscribe_delay_ms: AtomicU64::new(0),
            connect_gate,
            last_events: Mutex::default(),
        }
    }
}

fn store_millis(slot: &AtomicU64, delay: Duration) {
    let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    slot.store(millis, Ordering::SeqCst);
}

async fn stall(slot: &AtomicU64) {
    let millis = slot.load(Ordering::SeqCst);
    if millis > 0 {
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

impl MockState {
    fn record(&self, call: TransportCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

/// Mock transport for testing
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        let transport = Self::new();
        transport.set_fail_connect(true);
        transport
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_disconnect(&self, fail: bool) {
        self.state.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    /// Make publish, subscribe and unsubscribe fail
    pub fn set_fail_dispatch(&self, fail: bool) {
        self.state.fail_dispatch.store(fail, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        store_millis(&self.state.connect_delay_ms, delay);
    }

    /// Delay every publish; the call is recorded once the delay has elapsed
    pub fn set_publish_delay(&self, delay: Duration) {
        store_millis(&self.state.publish_delay_ms, delay);
    }

    /// Delay every subscribe; the call is recorded once the delay has elapsed
    pub fn set_subscribe_delay(&self, delay: Duration) {
        store_millis(&self.state.subscribe_delay_ms, delay);
    }

    /// Stall every connect until [`MockTransport::release_connect`]
    pub fn hold_connect(&self) {
        self.state.connect_gate.send_replace(false);
    }

    pub fn release_connect(&self) {
        self.state.connect_gate.send_replace(true);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.state
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear_history(&self) {
        self.state
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn connect_count(&self) -> usize {
        self.count(|call| matches!(call, TransportCall::Connect { .. }))
    }

    pub fn disconnect_count(&self) -> usize {
        self.count(|call| matches!(call, TransportCall::Disconnect { .. }))
    }

    /// Topics published to, in call order
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Publish { topic, payload, .. } => Some((topic, payload)),
                _ => None,
            })
            .collect()
    }

    /// Filters subscribed to, in call order
    pub fn subscribed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Subscribe { filter, .. } => Some(filter),
                _ => None,
            })
            .collect()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Unsubscribe { filter } => Some(filter),
                _ => None,
            })
            .collect()
    }

    fn count(&self, predicate: impl Fn(&TransportCall) -> bool) -> usize {
        self.state
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|call| predicate(call))
            .count()
    }

    /// Event sender handed to the most recent connect
    pub fn event_sender(&self) -> Option<EventSender> {
        self.state
            .last_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Inject an event as the most recent connection. False if none exists.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.event_sender().is_some_and(|events| events.send(event))
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Connection = MockConnection;

    async fn connect(
        &self,
        config: &ConnectionConfig,
        events: EventSender,
    ) -> Result<MockConnection, TransportError> {
        let generation = events.generation();
        self.state.record(TransportCall::Connect {
            client_id: config.client_id.clone(),
            generation,
        });
        *self
            .state
            .last_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(events);

        stall(&self.state.connect_delay_ms).await;

        let mut gate = self.state.connect_gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(TransportError::Closed("mock connect gate dropped".to_string()));
        }

        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(
                "Mock connection failure".into(),
            ));
        }

        Ok(MockConnection {
            state: Arc::clone(&self.state),
            generation,
        })
    }
}

/// Connection produced by [`MockTransport`]
#[derive(Debug)]
pub struct MockConnection {
    state: Arc<MockState>,
    generation: u64,
}

impl MockConnection {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn dispatch_result(&self, make: fn(BoxError) -> TransportError) -> Result<(), TransportError> {
        if self.state.fail_dispatch.load(Ordering::SeqCst) {
            Err(make("Mock dispatch failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn disconnect(&self) -> Result<(), TransportError> {
        self.state.record(TransportCall::Disconnect {
            generation: self.generation,
        });
        if self.state.fail_disconnect.load(Ordering::SeqCst) {
            return Err(TransportError::DisconnectFailed(
                "Mock disconnect failure".into(),
            ));
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QualityOfService,
    ) -> Result<(), TransportError> {
        stall(&self.state.publish_delay_ms).await;
        self.state.record(TransportCall::Publish {
            topic: topic.to_string(),
            payload,
            qos,
        });
        self.dispatch_result(TransportError::PublishFailed)
    }

    async fn subscribe(&self, filter: &str, qos: QualityOfService) -> Result<(), TransportError> {
        stall(&self.state.subscribe_delay_ms).await;
        self.state.record(TransportCall::Subscribe {
            filter: filter.to_string(),
            qos,
        });
        self.dispatch_result(TransportError::SubscriptionFailed)
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.state.record(TransportCall::Unsubscribe {
            filter: filter.to_string(),
        });
        self.dispatch_result(TransportError::UnsubscribeFailed)
    }
}
