//! Error types for the session layer
//!
//! Every session operation returns a recoverable [`SessionError`]; none of
//! them ever takes down the coordination context.

use crate::session::{CommandKind, SessionStatus};
use crate::topic::TopicError;
use crate::transport::TransportError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Cannot {operation} while session is {status}")]
    InvalidState {
        operation: &'static str,
        status: SessionStatus,
    },

    #[error("Not connected - current status: {status}")]
    NotConnected { status: SessionStatus },

    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),

    #[error("Connect failed: {0}")]
    ConnectFailed(#[source] TransportError),

    #[error("Connect attempt cancelled by disconnect")]
    ConnectCancelled,

    #[error("{kind} on '{topic}' failed: {source}")]
    DispatchFailed {
        kind: CommandKind,
        topic: String,
        #[source]
        source: TransportError,
    },

    /// An accepted command was still queued when the connection dropped
    #[error("Connection lost: {cause}")]
    ConnectionLost { cause: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SessionError {
    /// Create invalid state error
    pub fn invalid_state(operation: &'static str, status: SessionStatus) -> Self {
        Self::InvalidState { operation, status }
    }

    /// Create internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True when the failure was caused by the caller's timing rather than I/O
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidState { .. } | Self::NotConnected { .. } | Self::ConnectCancelled
        )
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|token|key|secret)[=:]\s*\S+").expect("static regex")
});

static CREDENTIAL_URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"://[^/\s:@]+:[^/\s@]+@").expect("static regex"));

const MAX_CAUSE_LEN: usize = 500;

/// Render an error with its full source chain on one line
pub fn describe_error(error: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

/// Sanitize failure causes before they are broadcast to observers
pub fn sanitize_cause(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();
    sanitized = CREDENTIAL_URL_PATTERN
        .replace_all(&sanitized, "://***@")
        .to_string();

    if sanitized.len() > MAX_CAUSE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_CAUSE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}
