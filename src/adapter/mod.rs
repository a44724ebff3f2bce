//! The `adapter` module exposes the broker as two write-oriented tables.
//!
//! - `SubscriptionTable` (`mqtt_sub` by default): inserting `(topic, qos)`
//!   subscribes, deleting by topic unsubscribes, selecting lists the active
//!   subscriptions. Inbound messages are written to the data table.
//! - `PublishTable` (`mqtt_pub` by default): inserting `(topic, payload, qos)`
//!   publishes once and waits for the broker.
//!
//! Both implement `TableAdapter`, the row-level contract the host drives.

pub mod control;
pub mod publish;
pub mod reconnect;


use std::sync::Arc;
use std::time::Duration;

use rusqlite::types::Value;

use crate::session::{BrokerSession, QoS, SessionHandlers, qos_from_int};
use crate::utils::error::{BridgeError, Result};

pub use control::SubscriptionTable;
pub use publish::PublishTable;

/// One table row as handed over by the host.
pub type Row = Vec<Value>;

/// Grace period granted to the network task on teardown.
pub const DISCONNECT_GRACE: Duration = Duration::from_millis(200);

/// Builds the broker session for an adapter once its handlers exist.
pub type SessionFactory<'a> =
    Box<dyn FnOnce(SessionHandlers) -> Result<Arc<dyn BrokerSession>> + 'a>;

/// Row-level operations a host can run against a broker-backed table.
///
/// Update and replace are rejected unless an adapter overrides them.
pub trait TableAdapter: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// `CREATE TABLE` style column declaration, e.g. `topic TEXT, qos INTEGER`.
    fn schema(&self) -> &'static str;

    /// Returns the rowid of the inserted row.
    fn insert(&self, values: &[Value]) -> Result<i64>;

    fn delete(&self, key: &Value) -> Result<()>;

    fn update(&self, _key: &Value, _values: &[Value]) -> Result<()> {
        Err(BridgeError::unsupported("UPDATE", self.name()))
    }

    fn replace(&self, _old: &Value, _new: &Value, _values: &[Value]) -> Result<()> {
        Err(BridgeError::unsupported("UPDATE", self.name()))
    }

    /// Rows in rowid order; the first row has rowid 1.
    fn select(&self) -> Result<Vec<Row>>;

    /// Releases the broker connection and every resource the table holds.
    fn disconnect(&self) -> Result<()>;
}

pub(crate) fn require_values(values: &[Value], min: usize, names: &str) -> Result<()> {
    if values.len() < min {
        return Err(BridgeError::validation(
            "values",
            format!("inform at least {min} values: {names}"),
        ));
    }
    Ok(())
}

/// A text value, e.g. a topic.
pub(crate) fn text_value<'v>(value: &'v Value, field: &'static str) -> Result<&'v str> {
    match value {
        Value::Text(text) => Ok(text),
        other => Err(BridgeError::validation(
            field,
            format!("expected text, got {}", type_name(other)),
        )),
    }
}

pub(crate) fn qos_value(value: &Value) -> Result<QoS> {
    match value {
        Value::Integer(qos) => qos_from_int(*qos),
        Value::Text(text) => match text.trim().parse::<i64>() {
            Ok(qos) => qos_from_int(qos),
            Err(_) => Err(BridgeError::validation(
                "qos",
                "QoS must be the number 0, 1 or 2",
            )),
        },
        _ => Err(BridgeError::validation(
            "qos",
            "QoS must be the number 0, 1 or 2",
        )),
    }
}

/// Payload bytes; numbers are published in their text form.
pub(crate) fn payload_value(value: &Value) -> Vec<u8> {
    match value {
        Value::Null => Vec::new(),
        Value::Integer(n) => n.to_string().into_bytes(),
        Value::Real(n) => n.to_string().into_bytes(),
        Value::Text(text) => text.clone().into_bytes(),
        Value::Blob(blob) => blob.clone(),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Integer(_) => "integer",
        Value::Real(_) => "real",
        Value::Text(_) => "text",
        Value::Blob(_) => "blob",
    }
}
