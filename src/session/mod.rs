//! The `session` module owns the connection to the MQTT broker.
//!
//! `BrokerSession` is the contract the table adapters program against:
//! blocking publish/subscribe/unsubscribe calls that return once the broker
//! acknowledged them, plus disconnect. `MqttSession` implements it on top of
//! `rumqttc`. Inbound messages and connection state changes are reported
//! through the closures in `SessionHandlers`, captured when the session is
//! built.

mod acks;
pub mod mqtt;
mod tls;

#[cfg(test)]
pub(crate) mod mock;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use mqtt::MqttSession;
pub use rumqttc::QoS;

use crate::utils::error::{BridgeError, Result};

/// Blocking view of one broker connection.
///
/// Implementations must be safe to call from several threads at once.
pub trait BrokerSession: Send + Sync {
    /// Publishes and waits for the broker acknowledgement required by the
    /// request's QoS. A positive `timeout` bounds the wait.
    fn publish(&self, request: &PublishRequest) -> Result<()>;

    /// Subscribes and waits for the SUBACK. Matching messages are handed to
    /// the session's message handler.
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;

    /// Unsubscribes every topic, attempting all of them even when one fails.
    fn unsubscribe(&self, topics: &[String]) -> Result<()>;

    /// Closes the connection, waiting at most `grace` for it to wind down.
    fn disconnect(&self, grace: Duration);

    fn is_connected(&self) -> bool;
}

pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;
pub type ConnectHandler = Arc<dyn Fn(&dyn BrokerSession) + Send + Sync>;
pub type ConnectionLostHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Callbacks invoked by a session for the rest of its life.
#[derive(Clone)]
pub struct SessionHandlers {
    /// Called once per inbound message, possibly from many threads at once.
    pub on_message: MessageHandler,
    /// Called after the session re-established a lost connection.
    pub on_connect: ConnectHandler,
    /// Called once each time an established connection drops.
    pub on_connection_lost: ConnectionLostHandler,
}

impl Default for SessionHandlers {
    fn default() -> Self {
        Self {
            on_message: Arc::new(|_: InboundMessage| {}),
            on_connect: Arc::new(|_: &dyn BrokerSession| {}),
            on_connection_lost: Arc::new(|_: &str| {}),
        }
    }
}

impl fmt::Debug for SessionHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandlers").finish_non_exhaustive()
    }
}

type Acker = Box<dyn FnOnce() -> Result<()> + Send>;

/// One message delivered by the broker.
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retained: bool,
    pub message_id: u16,
    acker: Option<Acker>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retained: false,
            message_id: 0,
            acker: None,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }

    pub fn with_message_id(mut self, message_id: u16) -> Self {
        self.message_id = message_id;
        self
    }

    /// Attaches the action that acknowledges this delivery to the broker.
    pub fn with_acker(mut self, acker: impl FnOnce() -> Result<()> + Send + 'static) -> Self {
        self.acker = Some(Box::new(acker));
        self
    }

    /// Acknowledges the delivery. Only the first call reaches the broker.
    pub fn ack(&mut self) -> Result<()> {
        match self.acker.take() {
            Some(acker) => acker(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("topic", &self.topic)
            .field("payload_len", &self.payload.len())
            .field("qos", &self.qos)
            .field("retained", &self.retained)
            .field("message_id", &self.message_id)
            .finish()
    }
}

/// A single publish issued through the publish table.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retained: bool,
    /// Bound on the acknowledgement wait. `None` or zero waits forever.
    pub timeout: Option<Duration>,
}

impl PublishRequest {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retained: false,
            timeout: None,
        }
    }

    /// The bounded wait, if one applies.
    pub fn deadline(&self) -> Option<Duration> {
        self.timeout.filter(|timeout| !timeout.is_zero())
    }
}

/// Converts an integer column value into a QoS level.
pub fn qos_from_int(value: i64) -> Result<QoS> {
    match value {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(BridgeError::validation(
            "qos",
            format!("QoS must be the number 0, 1 or 2, got {other}"),
        )),
    }
}

/// Integer column value of a QoS level.
pub fn qos_to_int(qos: QoS) -> i64 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(BridgeError::validation("topic", "topic must not be empty"));
    }
    Ok(())
}

/// The part of a subscription filter that topics are matched against.
/// Shared (`$share/<group>/`) and queue (`$queue/`) prefixes are removed.
pub fn routing_filter(filter: &str) -> &str {
    if let Some(rest) = filter.strip_prefix("$share/") {
        return rest.split_once('/').map_or(rest, |(_, filter)| filter);
    }
    filter.strip_prefix("$queue/").unwrap_or(filter)
}

/// Reports whether `topic` is matched by the subscription `filter`,
/// honoring the `+` (one level) and `#` (remaining levels) wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let filter = routing_filter(filter);
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
