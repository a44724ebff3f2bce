//! The `error` module defines the error taxonomy shared by every layer of
//! `litemqtt`.
//!
//! Command-path operations (control/publish table inserts, deletes and
//! selects) return `BridgeError` synchronously to their caller. The ingestion
//! path never returns errors to anyone: failures there are logged and the
//! message is dropped.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Coarse classification of a `BridgeError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Connection,
    Timeout,
    State,
    Persistence,
    Config,
    Teardown,
}

/// Broker operation an error or timeout refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    Ack,
    Publish,
    Subscribe,
    Unsubscribe,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Connect => "connect",
            Operation::Ack => "ack",
            Operation::Publish => "publish",
            Operation::Subscribe => "subscribe",
            Operation::Unsubscribe => "unsubscribe",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Malformed topic, QoS, table name, option or row shape.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// The broker rejected the operation or the connection failed.
    #[error("{operation} {topic:?} failed: {reason}")]
    Connection {
        operation: Operation,
        topic: String,
        reason: String,
    },

    /// A bounded wait elapsed before the broker acknowledged the request.
    #[error("{operation} {topic:?} timed out after {}", format_duration(.after))]
    Timeout {
        operation: Operation,
        topic: String,
        after: Duration,
    },

    #[error("already subscribed to the {0:?} topic")]
    AlreadySubscribed(String),

    #[error("not subscribed to the {0:?} topic")]
    NotSubscribed(String),

    #[error("{operation} operations on {table:?} are not supported")]
    Unsupported {
        operation: &'static str,
        table: String,
    },

    #[error("SQLite error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("teardown failed: {}", join_errors(.0))]
    Teardown(Vec<BridgeError>),
}

impl BridgeError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn connection(
        operation: Operation,
        topic: impl Into<String>,
        reason: impl fmt::Display,
    ) -> Self {
        Self::Connection {
            operation,
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }

    pub fn unsupported(operation: &'static str, table: impl Into<String>) -> Self {
        Self::Unsupported {
            operation,
            table: table.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Validation { .. } => ErrorKind::Validation,
            BridgeError::Connection { .. } => ErrorKind::Connection,
            BridgeError::Timeout { .. } => ErrorKind::Timeout,
            BridgeError::AlreadySubscribed(_)
            | BridgeError::NotSubscribed(_)
            | BridgeError::Unsupported { .. } => ErrorKind::State,
            BridgeError::Persistence(_) | BridgeError::Io(_) => ErrorKind::Persistence,
            BridgeError::Config(_) => ErrorKind::Config,
            BridgeError::Teardown(_) => ErrorKind::Teardown,
        }
    }

    /// Folds a list of step failures into a single result. An empty list is
    /// success.
    pub fn combine(errors: Vec<BridgeError>) -> Result<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(BridgeError::Teardown(errors))
        }
    }
}

fn format_duration(after: &Duration) -> String {
    humantime::format_duration(*after).to_string()
}

fn join_errors(errors: &[BridgeError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
