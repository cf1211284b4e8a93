//! Line-oriented console bridge
//!
//! Parses what the user types into [`ConsoleCommand`]s and applies them to
//! a [`SessionManager`]. Rendering of inbound messages and notices lives
//! here too, so the binary only wires stdin/stdout to these functions.

use crate::session::{InboundMessage, SessionManager, SessionNotice, SessionSnapshot};
use crate::transport::Transport;
use std::collections::BTreeSet;
use thiserror::Error;

/// One console input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// `/pub <topic> <text>`, or plain text when `topic` is `None`
    Publish { topic: Option<String>, text: String },
    /// `/sub <filter>`
    Subscribe(String),
    /// `/unsub <filter>`
    Unsubscribe(String),
    /// `/status`
    Status,
    /// `/help`
    Help,
    /// `/quit`
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsoleParseError {
    #[error("Message cannot be empty")]
    Empty,
    #[error("Usage: {0}")]
    MissingArgument(&'static str),
    #[error("Unknown command '{0}', type /help")]
    UnknownCommand(String),
}

pub const HELP: &str = "\
Commands:
  /pub <topic> <text>   publish text to a topic
  /sub <filter>         subscribe to a topic filter
  /unsub <filter>       unsubscribe from a topic filter
  /status               show session status
  /quit                 disconnect and exit
Any other line is published to the default topic.";

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Self, ConsoleParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(ConsoleParseError::Empty);
        }

        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Self::Publish {
                topic: None,
                text: line.to_string(),
            });
        };

        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };

        match name {
            "pub" | "publish" => {
                let (topic, text) = args
                    .split_once(char::is_whitespace)
                    .map(|(topic, text)| (topic, text.trim_start()))
                    .filter(|(_, text)| !text.is_empty())
                    .ok_or(ConsoleParseError::MissingArgument("/pub <topic> <text>"))?;
                Ok(Self::Publish {
                    topic: Some(topic.to_string()),
                    text: text.to_string(),
                })
            }
            "sub" | "subscribe" => single_argument(args, "/sub <filter>").map(Self::Subscribe),
            "unsub" | "unsubscribe" => {
                single_argument(args, "/unsub <filter>").map(Self::Unsubscribe)
            }
            "status" => Ok(Self::Status),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(ConsoleParseError::UnknownCommand(other.to_string())),
        }
    }
}

fn single_argument(args: &str, usage: &'static str) -> Result<String, ConsoleParseError> {
    match args.split_whitespace().collect::<Vec<_>>().as_slice() {
        [single] => Ok((*single).to_string()),
        _ => Err(ConsoleParseError::MissingArgument(usage)),
    }
}

/// What the console loop should do after a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleOutcome {
    Reply(String),
    Quit,
}

/// Apply a command to the session
///
/// Publish and (un)subscribe are fire-and-forget: acceptance is reported
/// here, I/O failures arrive later as [`SessionNotice::DispatchFailed`].
pub fn execute<T: Transport>(
    manager: &SessionManager<T>,
    command: ConsoleCommand,
    default_topic: Option<&str>,
) -> ConsoleOutcome {
    let reply = match command {
        ConsoleCommand::Publish { topic, text } => {
            match topic.as_deref().or(default_topic) {
                Some(topic) => match manager.submit_publish(topic, text) {
                    Ok(_) => format!("Publishing to {topic}"),
                    Err(e) => format!("Error: {e}"),
                },
                None => "No default publish topic configured, use /pub <topic> <text>".to_string(),
            }
        }
        ConsoleCommand::Subscribe(filter) => match manager.submit_subscribe(&filter) {
            Ok(_) => format!("Subscribing to {filter}"),
            Err(e) => format!("Error: {e}"),
        },
        ConsoleCommand::Unsubscribe(filter) => match manager.submit_unsubscribe(&filter) {
            Ok(_) => format!("Unsubscribing from {filter}"),
            Err(e) => format!("Error: {e}"),
        },
        ConsoleCommand::Status => format_snapshot(&manager.snapshot()),
        ConsoleCommand::Help => HELP.to_string(),
        ConsoleCommand::Quit => return ConsoleOutcome::Quit,
    };
    ConsoleOutcome::Reply(reply)
}

/// Render an inbound message with the first subscription filter it matched
pub fn format_inbound(message: &InboundMessage, filters: &BTreeSet<String>) -> String {
    let matched = filters.iter().find(|filter| message.matches(filter));
    let time = message.received_at.format("%H:%M:%S");
    match matched {
        Some(filter) => format!(
            "[{time}] {} <{}> {}",
            message.topic,
            filter,
            message.payload_lossy()
        ),
        None => format!("[{time}] {} {}", message.topic, message.payload_lossy()),
    }
}

/// Render a notice for the console. Delivery acks are not shown.
pub fn format_notice(notice: &SessionNotice) -> Option<String> {
    match notice {
        SessionNotice::StatusChanged { to, .. } => Some(format!("* status: {to}")),
        SessionNotice::ConnectionLost { cause } => Some(format!("* connection lost: {cause}")),
        SessionNotice::DispatchFailed { kind, topic, cause } => {
            Some(format!("* {kind} on {topic} failed: {cause}"))
        }
        SessionNotice::DeliveryComplete { .. } => None,
    }
}

pub fn format_snapshot(snapshot: &SessionSnapshot) -> String {
    let mut lines = vec![format!("status: {}", snapshot.status)];
    if let Some(generation) = snapshot.generation {
        lines.push(format!("session: #{generation}"));
    }
    if let Some(connected_at) = snapshot.connected_at {
        lines.push(format!("connected since: {}", connected_at.to_rfc3339()));
    }
    if snapshot.subscriptions.is_empty() {
        lines.push("subscriptions: none".to_string());
    } else {
        let filters: Vec<&str> = snapshot.subscriptions.iter().map(String::as_str).collect();
        lines.push(format!("subscriptions: {}", filters.join(", ")));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::session::{CommandKind, SessionStatus};
    use crate::testing::MockTransport;

    #[test]
    fn test_parse_plain_text_publishes_to_default() {
        assert_eq!(
            ConsoleCommand::parse("hello world\n"),
            Ok(ConsoleCommand::Publish {
                topic: None,
                text: "hello world".to_string()
            })
        );
    }

    #[test]
    fn test_parse_empty_line_rejected() {
        assert_eq!(ConsoleCommand::parse(""), Err(ConsoleParseError::Empty));
        assert_eq!(ConsoleCommand::parse("   \n"), Err(ConsoleParseError::Empty));
    }

    #[test]
    fn test_parse_pub() {
        assert_eq!(
            ConsoleCommand::parse("/pub sensors/temp 21.5 C"),
            Ok(ConsoleCommand::Publish {
                topic: Some("sensors/temp".to_string()),
                text: "21.5 C".to_string()
            })
        );
        assert!(matches!(
            ConsoleCommand::parse("/pub sensors/temp"),
            Err(ConsoleParseError::MissingArgument(_))
        ));
    }

    #[test]
    fn test_parse_sub_unsub() {
        assert_eq!(
            ConsoleCommand::parse("/sub a/+/c"),
            Ok(ConsoleCommand::Subscribe("a/+/c".to_string()))
        );
        assert_eq!(
            ConsoleCommand::parse("/unsub a/#"),
            Ok(ConsoleCommand::Unsubscribe("a/#".to_string()))
        );
        assert!(matches!(
            ConsoleCommand::parse("/sub"),
            Err(ConsoleParseError::MissingArgument(_))
        ));
        assert!(matches!(
            ConsoleCommand::parse("/sub a b"),
            Err(ConsoleParseError::MissingArgument(_))
        ));
    }

    #[test]
    fn test_parse_control_commands() {
        assert_eq!(ConsoleCommand::parse("/status"), Ok(ConsoleCommand::Status));
        assert_eq!(ConsoleCommand::parse("/quit"), Ok(ConsoleCommand::Quit));
        assert_eq!(ConsoleCommand::parse("/help"), Ok(ConsoleCommand::Help));
        assert_eq!(
            ConsoleCommand::parse("/frobnicate"),
            Err(ConsoleParseError::UnknownCommand("frobnicate".to_string()))
        );
    }

    #[test]
    fn test_format_inbound_shows_matched_filter() {
        let message = InboundMessage::new("channels/1/subscribe/fields/field2", "42");
        let filters: BTreeSet<String> = ["channels/1/subscribe/#".to_string()].into();
        let rendered = format_inbound(&message, &filters);
        assert!(rendered.contains("channels/1/subscribe/fields/field2 <channels/1/subscribe/#> 42"));

        let unmatched = format_inbound(&message, &BTreeSet::new());
        assert!(unmatched.ends_with("channels/1/subscribe/fields/field2 42"));
    }

    #[test]
    fn test_format_notice() {
        assert_eq!(
            format_notice(&SessionNotice::StatusChanged {
                from: SessionStatus::Connecting,
                to: SessionStatus::Connected
            }),
            Some("* status: connected".to_string())
        );
        assert_eq!(
            format_notice(&SessionNotice::DispatchFailed {
                kind: CommandKind::Subscribe,
                topic: "t".to_string(),
                cause: "boom".to_string()
            }),
            Some("* subscribe on t failed: boom".to_string())
        );
        assert_eq!(
            format_notice(&SessionNotice::DeliveryComplete { token: 1 }),
            None
        );
    }

    #[tokio::test]
    async fn test_execute_while_disconnected_reports_error() {
        let config = ConnectionConfig::new("mqtt://localhost:1883", "console-test").unwrap();
        let manager = SessionManager::new(MockTransport::new(), config).unwrap();

        let outcome = execute(
            &manager,
            ConsoleCommand::Publish {
                topic: None,
                text: "hi".to_string(),
            },
            Some("t1"),
        );
        match outcome {
            ConsoleOutcome::Reply(reply) => assert!(reply.starts_with("Error: Not connected")),
            ConsoleOutcome::Quit => panic!("unexpected quit"),
        }
        assert_eq!(execute(&manager, ConsoleCommand::Quit, None), ConsoleOutcome::Quit);
    }

    #[tokio::test]
    async fn test_execute_publish_uses_default_topic() {
        let transport = MockTransport::new();
        let config = ConnectionConfig::new("mqtt://localhost:1883", "console-test").unwrap();
        let manager = SessionManager::new(transport.clone(), config).unwrap();
        manager.connect().await.unwrap();

        let outcome = execute(
            &manager,
            ConsoleCommand::parse("hello").unwrap(),
            Some("channels/1/publish"),
        );
        assert_eq!(
            outcome,
            ConsoleOutcome::Reply("Publishing to channels/1/publish".to_string())
        );

        let no_default = execute(&manager, ConsoleCommand::parse("hello").unwrap(), None);
        assert!(matches!(no_default, ConsoleOutcome::Reply(r) if r.starts_with("No default")));
    }
}
