//! Publish table
//!
//! Inserting `(topic, payload, qos[, retained][, timeout])` publishes one
//! message and returns once the broker acknowledged it. Nothing is stored,
//! so every other operation is rejected.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::types::Value;
use tracing::{debug, error};

use super::{
    DISCONNECT_GRACE, Row, SessionFactory, TableAdapter, payload_value, qos_value,
    require_values, text_value, type_name,
};
use crate::adapter::reconnect;
use crate::config::Settings;
use crate::session::{
    BrokerSession, MqttSession, PublishRequest, SessionHandlers, qos_to_int, validate_topic,
};
use crate::utils::error::{BridgeError, Result};
use crate::utils::logging::Logger;

pub const SCHEMA: &str = "topic TEXT, payload BLOB, qos INTEGER, retained INTEGER, timeout TEXT";

pub struct PublishTable {
    name: String,
    session: Arc<dyn BrokerSession>,
    logger: Logger,
}

impl PublishTable {
    pub fn connect(name: impl Into<String>, settings: &Settings) -> Result<Self> {
        Self::with_session(
            name,
            settings,
            Box::new(|handlers: SessionHandlers| -> Result<Arc<dyn BrokerSession>> {
                let session = MqttSession::connect(settings, handlers)?;
                Ok(Arc::new(session) as Arc<dyn BrokerSession>)
            }),
        )
    }

    pub fn with_session(
        name: impl Into<String>,
        settings: &Settings,
        factory: SessionFactory<'_>,
    ) -> Result<Self> {
        let name = name.into();
        let logger = Logger::from_definition(&settings.logger)?;
        let handlers = SessionHandlers {
            on_connect: reconnect::connected_handler(name.clone(), logger.clone()),
            on_connection_lost: reconnect::connection_lost_handler(name.clone(), logger.clone()),
            ..SessionHandlers::default()
        };
        let session = factory(handlers)?;

        Ok(Self {
            name,
            session,
            logger,
        })
    }

    /// Publishes and waits for the acknowledgement the QoS calls for.
    pub fn publish(&self, request: &PublishRequest) -> Result<()> {
        let _log = self.logger.enter();
        validate_topic(&request.topic)?;

        match self.session.publish(request) {
            Ok(()) => {
                debug!(
                    virtual_table = %self.name,
                    topic = %request.topic,
                    qos = qos_to_int(request.qos),
                    retained = request.retained,
                    "published"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    virtual_table = %self.name,
                    topic = %request.topic,
                    error = %err,
                    "publish failed"
                );
                Err(err)
            }
        }
    }

    /// Releases the log destination and closes the connection.
    pub fn teardown(&self) -> Result<()> {
        let mut errors = Vec::new();
        if let Err(err) = self.logger.close() {
            errors.push(err);
        }
        self.session.disconnect(DISCONNECT_GRACE);
        BridgeError::combine(errors)
    }
}

/// Reads an insert row into a publish request.
///
/// A text fourth value is the timeout; an integer one is the retained flag,
/// followed by an optional timeout. Timeouts are humantime durations such as
/// `500ms` or `2s`; integers are taken as milliseconds.
pub fn parse_request(values: &[Value]) -> Result<PublishRequest> {
    require_values(values, 3, "Topic, Payload and QoS")?;

    let topic = text_value(&values[0], "topic")?;
    validate_topic(topic)?;
    let qos = qos_value(&values[2])?;
    let mut request = PublishRequest::new(topic, payload_value(&values[1]), qos);

    let mut rest = values[3..].iter();
    match rest.next() {
        Some(Value::Integer(retained)) => {
            request.retained = *retained != 0;
            if let Some(timeout) = rest.next() {
                request.timeout = timeout_value(timeout)?;
            }
        }
        Some(Value::Null) => {
            if let Some(timeout) = rest.next() {
                request.timeout = timeout_value(timeout)?;
            }
        }
        Some(timeout) => request.timeout = timeout_value(timeout)?,
        None => {}
    }

    Ok(request)
}

fn timeout_value(value: &Value) -> Result<Option<Duration>> {
    match value {
        Value::Null => Ok(None),
        Value::Integer(ms) if *ms >= 0 => Ok(Some(Duration::from_millis(*ms as u64))),
        Value::Text(text) if text.trim().is_empty() => Ok(None),
        Value::Text(text) => humantime::parse_duration(text.trim())
            .map(Some)
            .map_err(|err| BridgeError::validation("timeout", format!("timeout is invalid: {err}"))),
        other => Err(BridgeError::validation(
            "timeout",
            format!("timeout is invalid: unexpected {}", type_name(other)),
        )),
    }
}

impl TableAdapter for PublishTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &'static str {
        SCHEMA
    }

    fn insert(&self, values: &[Value]) -> Result<i64> {
        let request = parse_request(values)?;
        self.publish(&request)?;
        Ok(1)
    }

    fn delete(&self, _key: &Value) -> Result<()> {
        Err(BridgeError::unsupported("DELETE", &self.name))
    }

    fn select(&self) -> Result<Vec<Row>> {
        Err(BridgeError::unsupported("SELECT", &self.name))
    }

    fn disconnect(&self) -> Result<()> {
        self.teardown()
    }
}

impl std::fmt::Debug for PublishTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishTable")
            .field("name", &self.name)
            .field("connected", &self.session.is_connected())
            .finish()
    }
}
