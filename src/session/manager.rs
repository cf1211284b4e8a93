//! Session state machine driver
//!
//! [`SessionManager`] owns the coordination context: the status, the live
//! [`Session`] and the subscription set all sit behind one short-lived
//! lock that is never held across transport I/O. Transport calls run on the
//! Tokio worker runtime, and transport events are drained by a single pump
//! task so lost-connection handling is strictly serialised.

use super::dispatcher::CommandQueue;
use super::router::{InboundMessage, MessageRouter, MessageSink, SinkId};
use super::state::{log_transition, next_status, Session, SessionNotice, SessionStatus, Trigger};
use crate::config::ConnectionConfig;
use crate::error::{describe_error, sanitize_cause, SessionError, SessionResult};
use crate::topic::validate_topic_filter;
use crate::transport::{Connection, EventSender, TaggedEvent, Transport, TransportError, TransportEvent};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

const NOTICE_CAPACITY: usize = 64;

/// Mutable state owned by the coordination context
pub(crate) struct Coordination<C> {
    pub(crate) status: SessionStatus,
    pub(crate) session: Option<Session<C>>,
    pub(crate) subscriptions: BTreeSet<String>,
    last_generation: u64,
}

impl<C> Coordination<C> {
    fn generation(&self) -> u64 {
        self.session.as_ref().map_or(0, Session::generation)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session.as_ref().map(Session::generation) == Some(generation)
    }

    fn is_current_in(&self, generation: u64, status: SessionStatus) -> bool {
        self.is_current(generation) && self.status == status
    }
}

/// Point-in-time view of the session for status displays
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub generation: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub subscriptions: BTreeSet<String>,
    pub active_sink: Option<SinkId>,
}

pub(crate) struct Shared<T: Transport> {
    transport: T,
    pub(crate) config: ConnectionConfig,
    coordination: Mutex<Coordination<T::Connection>>,
    status_tx: watch::Sender<SessionStatus>,
    pub(crate) notices: broadcast::Sender<SessionNotice>,
    pub(crate) router: MessageRouter,
    events_tx: mpsc::UnboundedSender<TaggedEvent>,
    pub(crate) runtime: Handle,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Client-side session manager for a single broker connection
///
/// Cloning is cheap; every clone drives the same session.
pub struct SessionManager<T: Transport> {
    pub(crate) shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for SessionManager<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport> SessionManager<T> {
    /// Create a manager on the current Tokio runtime with no subscriptions
    pub fn new(transport: T, config: ConnectionConfig) -> SessionResult<Self> {
        Self::with_subscriptions(transport, config, std::iter::empty::<String>())
    }

    /// Create a manager whose subscription set is seeded with `filters`;
    /// they are subscribed on every successful connect.
    pub fn with_subscriptions<I, S>(
        transport: T,
        config: ConnectionConfig,
        filters: I,
    ) -> SessionResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let runtime = Handle::try_current()
            .map_err(|e| SessionError::internal(format!("no Tokio runtime available: {e}")))?;

        let mut subscriptions = BTreeSet::new();
        for filter in filters {
            let filter = filter.into();
            validate_topic_filter(&filter)?;
            subscriptions.insert(filter);
        }

        let (status_tx, _) = watch::channel(SessionStatus::Disconnected);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            transport,
            config,
            coordination: Mutex::new(Coordination {
                status: SessionStatus::Disconnected,
                session: None,
                subscriptions,
                last_generation: 0,
            }),
            status_tx,
            notices,
            router: MessageRouter::new(),
            events_tx,
            runtime: runtime.clone(),
            pump: Mutex::new(None),
        });

        let pump = Shared::spawn_event_pump(Arc::downgrade(&shared), events_rx, &runtime);
        *shared.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(pump);

        Ok(Self { shared })
    }

    /// Connect to the broker and resubscribe the subscription set
    ///
    /// Valid only from `Disconnected`; any other status yields
    /// [`SessionError::InvalidState`] without touching the in-flight attempt.
    pub async fn connect(&self) -> SessionResult<()> {
        let shared = Arc::clone(&self.shared);
        let span = crate::session_span!(
            operation = "connect",
            broker = %self.shared.config.broker,
            client_id = %self.shared.config.client_id
        );
        self.shared
            .runtime
            .spawn(shared.run_connect().instrument(span))
            .await
            .map_err(|e| SessionError::internal(format!("connect task failed: {e}")))?
    }

    /// Disconnect from the broker. Always ends in `Disconnected`.
    pub async fn disconnect(&self) -> SessionResult<()> {
        let shared = Arc::clone(&self.shared);
        let span = crate::session_span!(operation = "disconnect");
        self.shared
            .runtime
            .spawn(shared.run_disconnect().instrument(span))
            .await
            .map_err(|e| SessionError::internal(format!("disconnect task failed: {e}")))?
    }

    /// Tear the session down, disconnecting first unless already disconnected
    pub async fn shutdown(&self) -> SessionResult<()> {
        loop {
            match self.disconnect().await {
                Ok(()) => return Ok(()),
                Err(SessionError::InvalidState {
                    status: SessionStatus::Disconnected,
                    ..
                }) => return Ok(()),
                Err(SessionError::InvalidState {
                    status: SessionStatus::Disconnecting,
                    ..
                }) => {
                    let mut status = self.watch_status();
                    status
                        .wait_for(|s| *s != SessionStatus::Disconnecting)
                        .await
                        .map_err(|e| SessionError::internal(format!("status channel closed: {e}")))?;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Status as of the last completed transition. Never blocks.
    pub fn current_status(&self) -> SessionStatus {
        *self.shared.status_tx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.shared.notices.subscribe()
    }

    pub fn active_subscriptions(&self) -> BTreeSet<String> {
        self.shared.lock().subscriptions.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let coord = self.shared.lock();
        let session = coord.session.as_ref();
        SessionSnapshot {
            status: coord.status,
            generation: session.map(Session::generation),
            started_at: session.map(Session::started_at),
            connected_at: session.and_then(Session::connected_at),
            subscriptions: coord.subscriptions.clone(),
            active_sink: self.shared.router.active_sink(),
        }
    }

    pub fn connection_config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Register (or clear) the sink that receives inbound messages
    pub fn set_active_sink(&self, sink: Option<MessageSink>) -> Option<SinkId> {
        self.shared.router.set_active_sink(sink)
    }

    pub fn latest_message(&self) -> Option<InboundMessage> {
        self.shared.router.latest_message()
    }

    pub fn watch_latest_message(&self) -> watch::Receiver<Option<InboundMessage>> {
        self.shared.router.watch_latest()
    }
}

/// What the connect task must do after inspecting the coordination state
enum ConnectStep<C> {
    Resubscribe(Vec<String>),
    Cancelled(Arc<C>),
}

impl<T: Transport> Shared<T> {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Coordination<T::Connection>> {
        self.coordination
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a trigger, publishing the new status. Caller holds the lock.
    fn transition(
        &self,
        coord: &mut Coordination<T::Connection>,
        trigger: Trigger,
    ) -> Option<SessionStatus> {
        let from = coord.status;
        let to = next_status(from, trigger)?;
        coord.status = to;
        self.status_tx.send_replace(to);
        let _ = self.notices.send(SessionNotice::StatusChanged { from, to });
        log_transition(from, to, coord.generation());
        Some(to)
    }

    async fn run_connect(self: Arc<Self>) -> SessionResult<()> {
        let (generation, events) = {
            let mut coord = self.lock();
            if next_status(coord.status, Trigger::ConnectRequested).is_none() {
                return Err(SessionError::invalid_state("connect", coord.status));
            }
            coord.last_generation += 1;
            let generation = coord.last_generation;
            coord.session = Some(Session::new(generation));
            self.transition(&mut coord, Trigger::ConnectRequested);
            (generation, EventSender::new(generation, self.events_tx.clone()))
        };

        info!(generation, qos = self.config.qos.level(), "Connecting to MQTT broker");
        let connection = match self.transport.connect(&self.config, events).await {
            Ok(connection) => Arc::new(connection),
            Err(e) => return self.fail_connect(generation, e, None).await,
        };

        let step = {
            let mut coord = self.lock();
            if coord.is_current_in(generation, SessionStatus::Connecting) {
                if let Some(session) = coord.session.as_mut() {
                    session.attach(Arc::clone(&connection));
                }
                ConnectStep::Resubscribe(coord.subscriptions.iter().cloned().collect())
            } else {
                ConnectStep::Cancelled(Arc::clone(&connection))
            }
        };

        let filters = match step {
            ConnectStep::Resubscribe(filters) => filters,
            ConnectStep::Cancelled(connection) => {
                info!(generation, "Connect completed after disconnect request, dropping it");
                Self::abandon(connection).await;
                return Err(SessionError::ConnectCancelled);
            }
        };

        for filter in &filters {
            if let Err(e) = connection.subscribe(filter, self.config.qos).await {
                error!(generation, %filter, error = %describe_error(&e), "Resubscription failed");
                return self.fail_connect(generation, e, Some(connection)).await;
            }
            debug!(generation, %filter, "Subscribed");
        }

        let outcome = {
            let mut coord = self.lock();
            if !coord.is_current_in(generation, SessionStatus::Connecting) {
                Err(SessionError::ConnectCancelled)
            } else if let Some(cause) = coord.session.as_mut().and_then(Session::take_loss) {
                self.transition(&mut coord, Trigger::ConnectFailed);
                coord.session = None;
                Err(SessionError::ConnectFailed(TransportError::Closed(cause)))
            } else {
                let queue = CommandQueue::spawn(
                    Arc::clone(&connection),
                    self.config.qos,
                    self.notices.clone(),
                    &self.runtime,
                    generation,
                );
                if let Some(session) = coord.session.as_mut() {
                    session.mark_connected(queue);
                }
                self.transition(&mut coord, Trigger::ConnectSucceeded);
                Ok(())
            }
        };

        if outcome.is_err() {
            Self::abandon(connection).await;
        } else {
            info!(generation, subscriptions = filters.len(), "Session connected");
        }
        outcome
    }

    async fn fail_connect(
        &self,
        generation: u64,
        cause: TransportError,
        connection: Option<Arc<T::Connection>>,
    ) -> SessionResult<()> {
        let current = {
            let mut coord = self.lock();
            if coord.is_current_in(generation, SessionStatus::Connecting) {
                self.transition(&mut coord, Trigger::ConnectFailed);
                coord.session = None;
                true
            } else {
                false
            }
        };

        if let Some(connection) = connection {
            Self::abandon(connection).await;
        }

        if current {
            warn!(generation, error = %describe_error(&cause), "Connect failed");
            Err(SessionError::ConnectFailed(cause))
        } else {
            debug!(generation, "Connect failure ignored, attempt was cancelled");
            Err(SessionError::ConnectCancelled)
        }
    }

    /// Best-effort disconnect of a connection nobody owns any more
    async fn abandon(connection: Arc<T::Connection>) {
        if let Err(e) = connection.disconnect().await {
            debug!(error = %describe_error(&e), "Disconnect of abandoned connection failed");
        }
    }

    async fn run_disconnect(self: Arc<Self>) -> SessionResult<()> {
        let (generation, connection) = {
            let mut coord = self.lock();
            if self.transition(&mut coord, Trigger::DisconnectRequested).is_none() {
                return Err(SessionError::invalid_state("disconnect", coord.status));
            }
            let generation = coord.generation();
            let connection = coord.session.as_mut().and_then(Session::take_connection);
            (generation, connection)
        };

        match connection {
            Some(connection) => {
                if let Err(e) = connection.disconnect().await {
                    warn!(
                        generation,
                        error = %describe_error(&e),
                        "Transport disconnect failed, session closed anyway"
                    );
                }
            }
            None => debug!(generation, "No live connection yet, cancelling connect attempt"),
        }

        let mut coord = self.lock();
        if coord.is_current_in(generation, SessionStatus::Disconnecting) {
            self.transition(&mut coord, Trigger::DisconnectFinished);
            coord.session = None;
        }
        info!(generation, "Session disconnected");
        Ok(())
    }

    fn spawn_event_pump(
        shared: Weak<Self>,
        mut events: mpsc::UnboundedReceiver<TaggedEvent>,
        runtime: &Handle,
    ) -> JoinHandle<()> {
        runtime.spawn(async move {
            while let Some((generation, event)) = events.recv().await {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.handle_transport_event(generation, event);
            }
            debug!("Transport event pump stopped");
        })
    }

    /// React to one transport event. Events from superseded sessions are dropped.
    pub(crate) fn handle_transport_event(&self, generation: u64, event: TransportEvent) {
        match event {
            TransportEvent::MessageArrived { topic, payload } => {
                if !self.lock().is_current(generation) {
                    debug!(generation, %topic, "Dropping message from stale session");
                    return;
                }
                self.router.on_message_arrived(topic, payload);
            }
            TransportEvent::ConnectionLost { cause } => self.on_connection_lost(generation, cause),
            TransportEvent::DeliveryComplete { token } => {
                if self.lock().is_current(generation) {
                    debug!(generation, token, "Delivery complete");
                    let _ = self.notices.send(SessionNotice::DeliveryComplete { token });
                }
            }
        }
    }

    fn on_connection_lost(&self, generation: u64, cause: String) {
        let cause = sanitize_cause(&cause);
        let mut coord = self.lock();
        if !coord.is_current(generation) {
            debug!(generation, "Ignoring connection loss from stale session");
            return;
        }

        let status = coord.status;
        match status {
            SessionStatus::Connected => {
                if let Some(queue) = coord.session.as_ref().and_then(Session::queue) {
                    queue.close(&cause);
                }
                self.transition(&mut coord, Trigger::ConnectionLost);
                coord.session = None;
                drop(coord);
                warn!(generation, %cause, "Connection lost");
                let _ = self.notices.send(SessionNotice::ConnectionLost { cause });
            }
            SessionStatus::Connecting => {
                if let Some(session) = coord.session.as_mut() {
                    session.record_loss(cause);
                }
            }
            _ => debug!(generation, %status, "Connection loss ignored"),
        }
    }
}

impl<T: Transport> Drop for Shared<T> {
    fn drop(&mut self) {
        if let Some(pump) = self
            .pump
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }

        let coord = self
            .coordination
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        let status = coord.status;
        if let Some(connection) = coord.session.take().and_then(|mut s| s.take_connection()) {
            warn!(%status, "Session manager dropped while live, disconnecting in background");
            self.runtime.spawn(async move {
                let _ = connection.disconnect().await;
            });
        }
    }
}
