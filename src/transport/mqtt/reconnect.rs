//! Pure reconnection decision logic
//!
//! The supervisor consults [`decide`] after every network error seen once
//! the connection was acknowledged. Failures before the first CONNACK are
//! never retried here; they fail the connect call instead.

use crate::config::ReconnectConfig;
use std::time::Duration;

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt after `delay`
    Proceed { attempt: u32, delay: Duration },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - automatic reconnect is turned off
    AbortDisabled,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded { max_attempts: u32 },
}

/// Decide whether another reconnection attempt should be made
pub fn decide(
    current_attempts: u32,
    enabled: bool,
    config: &ReconnectConfig,
    shutdown_requested: bool,
) -> ReconnectionDecision {
    if shutdown_requested {
        return ReconnectionDecision::AbortShutdownRequested;
    }
    if !enabled {
        return ReconnectionDecision::AbortDisabled;
    }
    if let Some(max_attempts) = config.max_attempts {
        if current_attempts >= max_attempts {
            return ReconnectionDecision::AbortMaxAttemptsExceeded { max_attempts };
        }
    }

    let attempt = current_attempts + 1;
    ReconnectionDecision::Proceed {
        attempt,
        delay: config.backoff_delay(attempt),
    }
}

/// Human-readable reason attached to the final `ConnectionLost`
pub fn give_up_reason(decision: &ReconnectionDecision, last_error: &str) -> Option<String> {
    match decision {
        ReconnectionDecision::AbortDisabled => Some(last_error.to_string()),
        ReconnectionDecision::AbortMaxAttemptsExceeded { max_attempts } => Some(format!(
            "{last_error} (gave up after {max_attempts} reconnection attempts)"
        )),
        _ => None,
    }
}
