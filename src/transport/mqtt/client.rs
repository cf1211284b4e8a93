//! Impure I/O for the rumqttc transport
//!
//! Each connect spawns a supervisor task that owns the rumqttc event loop.
//! The supervisor confirms the CONNACK, forwards messages and delivery acks
//! as [`TransportEvent`]s, retries dropped links according to the reconnect
//! policy and resubscribes tracked filters after each reconnect. Only when
//! the policy gives up does it report `ConnectionLost`.

use super::connection::{configure_mqtt_options, to_mqtt_qos, LinkState};
use super::message_handler::{route_mqtt_event, EventRoute};
use super::reconnect::{decide, give_up_reason, ReconnectionDecision};
use crate::config::{ConnectionConfig, ReconnectConfig};
use crate::transport::{
    Connection, EventSender, QualityOfService, Transport, TransportError, TransportEvent,
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectionError, EventLoop};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the request channel between client handle and event loop
const REQUEST_CAPACITY: usize = 10;

/// Time allowed to flush DISCONNECT before the socket is dropped
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Time allowed for the supervisor to stop after a disconnect
const SUPERVISOR_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

type TrackedFilters = Arc<Mutex<BTreeSet<String>>>;

/// Production transport backed by rumqttc (MQTT 3.1.1)
#[derive(Debug, Clone, Default)]
pub struct MqttTransport;

impl MqttTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for MqttTransport {
    type Connection = MqttConnection;

    /// Connect and wait for the CONNACK, bounded by the connection timeout
    async fn connect(
        &self,
        config: &ConnectionConfig,
        events: EventSender,
    ) -> Result<MqttConnection, TransportError> {
        let options = configure_mqtt_options(config);
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tracked: TrackedFilters = Arc::default();

        info!(
            broker = %config.broker,
            client_id = %config.client_id,
            generation = events.generation(),
            "Opening MQTT connection"
        );

        let supervisor = Supervisor {
            client: client.clone(),
            events,
            state_tx,
            shutdown_rx,
            tracked: Arc::clone(&tracked),
            automatic_reconnect: config.automatic_reconnect,
            reconnect: config.reconnect.clone(),
            qos: config.qos,
        };
        let handle = tokio::spawn(supervisor.run(event_loop));

        if let Err(e) =
            wait_for_connection_confirmation(state_rx.clone(), config.connection_timeout).await
        {
            shutdown_tx.send_replace(true);
            handle.abort();
            return Err(e);
        }

        Ok(MqttConnection {
            client,
            state_rx,
            shutdown_tx,
            supervisor: Mutex::new(Some(handle)),
            tracked,
        })
    }
}

/// Wait for the supervisor to report the CONNACK
async fn wait_for_connection_confirmation(
    mut state_rx: watch::Receiver<LinkState>,
    timeout: Duration,
) -> Result<(), TransportError> {
    let confirmation = tokio::time::timeout(timeout, async {
        loop {
            let state = state_rx.borrow_and_update().clone();
            match state {
                LinkState::Connected => return Ok(()),
                LinkState::Refused(reason) => {
                    return Err(TransportError::ConnectionRefused(reason));
                }
                LinkState::Failed(reason) => {
                    return Err(TransportError::ConnectionFailed(reason.into()));
                }
                LinkState::Closed(reason) => return Err(TransportError::Closed(reason)),
                LinkState::Connecting | LinkState::Reconnecting(_) => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(TransportError::Closed(
                    "event loop stopped before CONNACK".to_string(),
                ));
            }
        }
    })
    .await;

    confirmation.unwrap_or(Err(TransportError::ConnAckTimeout(timeout)))
}

/// Live rumqttc connection
pub struct MqttConnection {
    client: AsyncClient,
    state_rx: watch::Receiver<LinkState>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    tracked: TrackedFilters,
}

impl MqttConnection {
    /// Link state as last reported by the supervisor
    pub fn link_state(&self) -> LinkState {
        self.state_rx.borrow().clone()
    }

    /// Filters resubscribed after an automatic reconnect
    pub fn tracked_subscriptions(&self) -> BTreeSet<String> {
        self.tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn tracked(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_supervisor(&self) -> Option<JoinHandle<()>> {
        self.supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl std::fmt::Debug for MqttConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConnection")
            .field("link_state", &self.link_state())
            .field("tracked", &self.tracked_subscriptions())
            .finish()
    }
}

#[async_trait]
impl Connection for MqttConnection {
    async fn disconnect(&self) -> Result<(), TransportError> {
        // Stop retrying first so a pending backoff cannot reconnect
        self.shutdown_tx.send_replace(true);

        let result = match self.link_state() {
            LinkState::Closed(_) => Ok(()),
            _ => self
                .client
                .try_disconnect()
                .map_err(|e| TransportError::DisconnectFailed(Box::new(e))),
        };

        if let Some(mut handle) = self.take_supervisor() {
            match tokio::time::timeout(SUPERVISOR_JOIN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => debug!("MQTT supervisor stopped"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("MQTT supervisor ended with error: {e}"),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("MQTT supervisor did not stop in time, aborting it");
                    handle.abort();
                }
            }
        }

        info!("MQTT client disconnected");
        result
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QualityOfService,
    ) -> Result<(), TransportError> {
        self.client
            .publish_bytes(topic, to_mqtt_qos(qos), false, payload)
            .await
            .map_err(|e| TransportError::PublishFailed(Box::new(e)))?;
        debug!(%topic, "Publish queued");
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QualityOfService) -> Result<(), TransportError> {
        self.client
            .subscribe(filter, to_mqtt_qos(qos))
            .await
            .map_err(|e| TransportError::SubscriptionFailed(Box::new(e)))?;
        self.tracked().insert(filter.to_string());
        debug!(%filter, "Subscribe queued");
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.client
            .unsubscribe(filter)
            .await
            .map_err(|e| TransportError::UnsubscribeFailed(Box::new(e)))?;
        self.tracked().remove(filter);
        debug!(%filter, "Unsubscribe queued");
        Ok(())
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(handle) = self.take_supervisor() {
            handle.abort();
        }
    }
}

/// Owner of the rumqttc event loop for one connection
struct Supervisor {
    client: AsyncClient,
    events: EventSender,
    state_tx: watch::Sender<LinkState>,
    shutdown_rx: watch::Receiver<bool>,
    tracked: TrackedFilters,
    automatic_reconnect: bool,
    reconnect: ReconnectConfig,
    qos: QualityOfService,
}

/// Mutable bookkeeping of the supervisor loop
#[derive(Debug, Default)]
struct LinkProgress {
    /// A CONNACK was seen at least once
    acknowledged: bool,
    /// The socket is currently up
    link_up: bool,
    /// Reconnect attempts since the last CONNACK
    attempts: u32,
}

impl Supervisor {
    async fn run(mut self, mut event_loop: EventLoop) {
        let generation = self.events.generation();
        debug!(generation, "Starting MQTT event loop supervisor");
        let mut progress = LinkProgress::default();

        loop {
            let polled = tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        if progress.link_up {
                            flush_disconnect(&mut event_loop).await;
                        }
                        break;
                    }
                    continue;
                }

                polled = event_loop.poll() => polled,
            };

            let keep_running = match polled {
                Ok(event) => self.process_event_route(route_mqtt_event(&event), &mut progress).await,
                Err(e) => self.handle_event_loop_error(e, &mut progress).await,
            };
            if !keep_running {
                break;
            }
        }

        debug!(generation, "MQTT event loop supervisor stopped");
    }

    /// Returns false when the loop should stop
    async fn process_event_route(&self, route: EventRoute, progress: &mut LinkProgress) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged { session_present } => {
                if progress.acknowledged {
                    info!(
                        attempts = progress.attempts,
                        session_present, "MQTT connection re-established"
                    );
                    self.resubscribe_tracked();
                } else {
                    debug!(session_present, "CONNACK received");
                }
                progress.acknowledged = true;
                progress.link_up = true;
                progress.attempts = 0;
                self.state_tx.send_replace(LinkState::Connected);
                true
            }
            EventRoute::MessageReceived { topic, payload } => {
                debug!(%topic, bytes = payload.len(), "MQTT message received");
                if !self
                    .events
                    .send(TransportEvent::MessageArrived { topic, payload })
                {
                    debug!("Session layer gone, message dropped");
                }
                true
            }
            EventRoute::DeliveryComplete { packet_id } => {
                self.events
                    .send(TransportEvent::DeliveryComplete { token: packet_id });
                true
            }
            EventRoute::Disconnected => {
                progress.link_up = false;
                self.on_link_down("broker closed the connection".to_string(), progress)
                    .await
            }
            EventRoute::SubscriptionRejected { packet_id } => {
                warn!(packet_id, "Broker rejected a subscription");
                true
            }
            EventRoute::DisconnectSent => false,
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    async fn handle_event_loop_error(
        &self,
        error: ConnectionError,
        progress: &mut LinkProgress,
    ) -> bool {
        progress.link_up = false;

        if !progress.acknowledged {
            if *self.shutdown_rx.borrow() {
                return false;
            }
            let state = match &error {
                ConnectionError::ConnectionRefused(code) => {
                    LinkState::Refused(format!("{code:?}"))
                }
                other => LinkState::Failed(other.to_string()),
            };
            warn!(error = %error, "MQTT connect failed");
            self.state_tx.send_replace(state);
            return false;
        }

        self.on_link_down(error.to_string(), progress).await
    }

    /// Decide between another reconnect attempt and giving up
    async fn on_link_down(&self, cause: String, progress: &mut LinkProgress) -> bool {
        let decision = decide(
            progress.attempts,
            self.automatic_reconnect,
            &self.reconnect,
            *self.shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay } => {
                progress.attempts = attempt;
                self.state_tx.send_replace(LinkState::Reconnecting(attempt));

                let max_display = self
                    .reconnect
                    .max_attempts
                    .map_or("∞".to_string(), |max| max.to_string());
                warn!(
                    %cause,
                    "MQTT link down, reconnection {}/{} in {}ms",
                    attempt,
                    max_display,
                    delay.as_millis()
                );

                interruptible_sleep(self.shutdown_rx.clone(), delay).await
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown requested, not reconnecting");
                false
            }
            other => {
                let reason = give_up_reason(&other, &cause).unwrap_or(cause);
                error!(%reason, "MQTT connection lost");
                self.state_tx.send_replace(LinkState::Closed(reason.clone()));
                self.events
                    .send(TransportEvent::ConnectionLost { cause: reason });
                false
            }
        }
    }

    /// Resubscribe off the event-loop task so the request channel keeps draining
    fn resubscribe_tracked(&self) {
        let filters: Vec<String> = self
            .tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        if filters.is_empty() {
            return;
        }

        let client = self.client.clone();
        let qos = to_mqtt_qos(self.qos);
        tokio::spawn(async move {
            for filter in filters {
                match client.subscribe(filter.as_str(), qos).await {
                    Ok(()) => debug!(target: "mqtt_transport", "Re-subscribed to: {}", filter),
                    Err(e) => error!("Failed to re-subscribe to {}: {}", filter, e),
                }
            }
        });
    }
}

/// Poll until our DISCONNECT is written or the link fails
async fn flush_disconnect(event_loop: &mut EventLoop) {
    let flushed = tokio::time::timeout(FLUSH_TIMEOUT, async {
        loop {
            match event_loop.poll().await {
                Ok(event) if route_mqtt_event(&event) == EventRoute::DisconnectSent => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    })
    .await;

    if flushed.is_err() {
        debug!("Timed out flushing DISCONNECT");
    }
}

/// Sleep unless shutdown is requested. Returns false on shutdown.
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                info!("Shutdown signal received during reconnection delay, stopping");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_confirmation_connected() {
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let waiter = tokio::spawn(wait_for_connection_confirmation(
            state_rx,
            Duration::from_secs(5),
        ));
        state_tx.send_replace(LinkState::Connected);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_confirmation_refused() {
        let (_state_tx, state_rx) =
            watch::channel(LinkState::Refused("BadUserNamePassword".to_string()));
        let result = wait_for_connection_confirmation(state_rx, Duration::from_secs(5)).await;
        assert!(matches!(
            result,
            Err(TransportError::ConnectionRefused(reason)) if reason == "BadUserNamePassword"
        ));
    }

    #[tokio::test]
    async fn test_wait_for_confirmation_failed() {
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        state_tx.send_replace(LinkState::Failed("connection refused".to_string()));
        let result = wait_for_connection_confirmation(state_rx, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_wait_for_confirmation_times_out() {
        let (_state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let result = wait_for_connection_confirmation(state_rx, Duration::from_millis(50)).await;
        assert!(matches!(
            result,
            Err(TransportError::ConnAckTimeout(timeout)) if timeout == Duration::from_millis(50)
        ));
    }

    #[tokio::test]
    async fn test_wait_for_confirmation_supervisor_gone() {
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        drop(state_tx);
        let result = wait_for_connection_confirmation(state_rx, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(TransportError::Closed(_))));
    }

    #[tokio::test]
    async fn test_interruptible_sleep_stops_on_shutdown() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sleeper = tokio::spawn(interruptible_sleep(shutdown_rx, Duration::from_secs(3600)));
        shutdown_tx.send_replace(true);
        assert!(!sleeper.await.unwrap());
    }

    #[tokio::test]
    async fn test_interruptible_sleep_completes() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        assert!(interruptible_sleep(shutdown_rx, Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_broker_fails() {
        // Port 1 on localhost is reserved and refuses connections
        let mut config = ConnectionConfig::new("mqtt://127.0.0.1:1", "unreachable-test").unwrap();
        config.connection_timeout = Duration::from_secs(5);
        let (events, _rx) = EventSender::detached(1);

        let result = MqttTransport::new().connect(&config, events).await;
        assert!(matches!(
            result,
            Err(TransportError::ConnectionFailed(_)) | Err(TransportError::ConnAckTimeout(_))
        ));
    }
}
