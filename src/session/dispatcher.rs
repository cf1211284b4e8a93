//! Command dispatch for publish/subscribe/unsubscribe
//!
//! Acceptance is a single atomic step under the coordination lock: status
//! check, topic validation, the optimistic subscription-set update and the
//! hand-off to the session's command queue. One worker per session drains
//! that queue, so transport calls happen in acceptance order. Callers get a
//! [`DispatchHandle`] they may await for the I/O outcome or simply drop.

use super::manager::{SessionManager, Shared};
use super::state::{Session, SessionNotice, SessionStatus};
use crate::error::{describe_error, sanitize_cause, SessionError, SessionResult};
use crate::topic::{validate_topic_filter, validate_topic_name};
use crate::transport::{Connection, QualityOfService, Transport};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, warn, Instrument};

/// Kind of outbound command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Publish => "publish",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        };
        f.write_str(name)
    }
}

/// Command submitted by a consumer
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundCommand {
    pub kind: CommandKind,
    pub topic: String,
    /// Present for publish only
    pub payload: Option<Bytes>,
}

impl OutboundCommand {
    pub fn publish(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: CommandKind::Publish,
            topic: topic.into(),
            payload: Some(payload.into()),
        }
    }

    pub fn subscribe(filter: impl Into<String>) -> Self {
        Self {
            kind: CommandKind::Subscribe,
            topic: filter.into(),
            payload: None,
        }
    }

    pub fn unsubscribe(filter: impl Into<String>) -> Self {
        Self {
            kind: CommandKind::Unsubscribe,
            topic: filter.into(),
            payload: None,
        }
    }

    pub fn validate(&self) -> SessionResult<()> {
        match self.kind {
            CommandKind::Publish => validate_topic_name(&self.topic)?,
            CommandKind::Subscribe | CommandKind::Unsubscribe => {
                validate_topic_filter(&self.topic)?
            }
        }
        Ok(())
    }
}

/// Outcome of an accepted command's transport I/O
///
/// Resolves to `Err(SessionError::DispatchFailed)` when the transport call
/// failed, or `Err(SessionError::ConnectionLost)` when the connection went
/// away before the command reached the transport. Dropping the handle does
/// not cancel the I/O.
#[derive(Debug)]
pub struct DispatchHandle {
    kind: CommandKind,
    topic: String,
    reply: oneshot::Receiver<SessionResult<()>>,
}

impl DispatchHandle {
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Future for DispatchHandle {
    type Output = SessionResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.reply).poll(cx).map(|replied| {
            replied.unwrap_or_else(|_| {
                Err(SessionError::internal("dispatch worker stopped before replying"))
            })
        })
    }
}

struct QueuedCommand {
    command: OutboundCommand,
    reply: oneshot::Sender<SessionResult<()>>,
}

impl fmt::Debug for QueuedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedCommand")
            .field("kind", &self.command.kind)
            .field("topic", &self.command.topic)
            .finish()
    }
}

/// FIFO of accepted commands for one connected session
///
/// Dropping the queue lets the worker finish what was already accepted and
/// exit. [`CommandQueue::close`] additionally fails everything still queued.
#[derive(Debug)]
pub(crate) struct CommandQueue {
    commands: mpsc::UnboundedSender<QueuedCommand>,
    closed: watch::Sender<Option<String>>,
}

impl CommandQueue {
    /// Start the worker that owns `connection` for the session's lifetime
    pub(crate) fn spawn<C: Connection>(
        connection: Arc<C>,
        qos: QualityOfService,
        notices: broadcast::Sender<SessionNotice>,
        runtime: &Handle,
        generation: u64,
    ) -> Self {
        let (commands, queue) = mpsc::unbounded_channel();
        let (closed, closed_rx) = watch::channel(None);
        let span = crate::session_span!(operation = "dispatch", generation);
        runtime.spawn(
            run_worker(connection, qos, notices, queue, closed_rx).instrument(span),
        );
        Self { commands, closed }
    }

    fn enqueue(&self, command: OutboundCommand) -> SessionResult<DispatchHandle> {
        let (reply, reply_rx) = oneshot::channel();
        let kind = command.kind;
        let topic = command.topic.clone();
        self.commands
            .send(QueuedCommand { command, reply })
            .map_err(|_| SessionError::internal("dispatch worker is not running"))?;
        Ok(DispatchHandle {
            kind,
            topic,
            reply: reply_rx,
        })
    }

    /// Fail every command not yet handed to the transport
    pub(crate) fn close(&self, cause: &str) {
        self.closed.send_replace(Some(cause.to_string()));
    }
}

async fn run_worker<C: Connection>(
    connection: Arc<C>,
    qos: QualityOfService,
    notices: broadcast::Sender<SessionNotice>,
    mut queue: mpsc::UnboundedReceiver<QueuedCommand>,
    closed: watch::Receiver<Option<String>>,
) {
    while let Some(QueuedCommand { command, reply }) = queue.recv().await {
        let lost = closed.borrow().clone();
        let result = match lost {
            Some(cause) => {
                debug!(kind = %command.kind, topic = %command.topic, "Dropping command queued before connection loss");
                Err(SessionError::ConnectionLost { cause })
            }
            None => execute(connection.as_ref(), command, qos, &notices).await,
        };
        let _ = reply.send(result);
    }
    debug!("Dispatch worker stopped");
}

async fn execute<C: Connection>(
    connection: &C,
    command: OutboundCommand,
    qos: QualityOfService,
    notices: &broadcast::Sender<SessionNotice>,
) -> SessionResult<()> {
    let OutboundCommand {
        kind,
        topic,
        payload,
    } = command;

    let result = match kind {
        CommandKind::Publish => {
            connection
                .publish(&topic, payload.unwrap_or_default(), qos)
                .await
        }
        CommandKind::Subscribe => connection.subscribe(&topic, qos).await,
        CommandKind::Unsubscribe => connection.unsubscribe(&topic).await,
    };

    match result {
        Ok(()) => {
            debug!(%kind, %topic, "Command dispatched");
            Ok(())
        }
        Err(source) => {
            let cause = sanitize_cause(&describe_error(&source));
            warn!(%kind, %topic, %cause, "Command dispatch failed");
            let _ = notices.send(SessionNotice::DispatchFailed {
                kind,
                topic: topic.clone(),
                cause,
            });
            Err(SessionError::DispatchFailed {
                kind,
                topic,
                source,
            })
        }
    }
}

impl<T: Transport> SessionManager<T> {
    /// Publish `payload` to `topic`. Fails fast with `NotConnected`.
    pub fn submit_publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
    ) -> SessionResult<DispatchHandle> {
        self.submit(OutboundCommand::publish(topic, payload))
    }

    /// Subscribe to `filter`, adding it to the resubscribe set immediately
    pub fn submit_subscribe(&self, filter: &str) -> SessionResult<DispatchHandle> {
        self.submit(OutboundCommand::subscribe(filter))
    }

    /// Unsubscribe from `filter`, removing it from the resubscribe set immediately
    pub fn submit_unsubscribe(&self, filter: &str) -> SessionResult<DispatchHandle> {
        self.submit(OutboundCommand::unsubscribe(filter))
    }

    /// Accept a command for dispatch
    pub fn submit(&self, command: OutboundCommand) -> SessionResult<DispatchHandle> {
        self.shared.accept(command)
    }
}

impl<T: Transport> Shared<T> {
    /// Status check, validation, subscription update and enqueue as one atomic step
    fn accept(&self, command: OutboundCommand) -> SessionResult<DispatchHandle> {
        let mut coord = self.lock();
        if coord.status != SessionStatus::Connected {
            debug!(kind = %command.kind, topic = %command.topic, status = %coord.status, "Command rejected");
            return Err(SessionError::NotConnected {
                status: coord.status,
            });
        }
        command.validate()?;

        let kind = command.kind;
        let topic = command.topic.clone();
        let handle = coord
            .session
            .as_ref()
            .and_then(Session::queue)
            .ok_or_else(|| SessionError::internal("connected session has no dispatch queue"))?
            .enqueue(command)?;

        match kind {
            CommandKind::Subscribe => {
                coord.subscriptions.insert(topic);
            }
            CommandKind::Unsubscribe => {
                coord.subscriptions.remove(&topic);
            }
            CommandKind::Publish => {}
        }

        Ok(handle)
    }
}
