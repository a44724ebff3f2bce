//! Subscription control table
//!
//! Rows of the control table are the active subscriptions. Inserting a row
//! subscribes, deleting it by topic unsubscribes, and every message the
//! broker delivers for a subscription lands in the data table through the
//! ingestion sink.

use std::sync::Arc;

use rusqlite::types::Value;
use tracing::{error, info};

use super::{
    DISCONNECT_GRACE, Row, SessionFactory, TableAdapter, qos_value, require_values, text_value,
    type_name,
};
use crate::adapter::reconnect;
use crate::config::Settings;
use crate::ingest::{IngestionSink, MessageStore};
use crate::registry::{Subscription, SubscriptionRegistry};
use crate::session::{
    BrokerSession, MqttSession, QoS, SessionHandlers, qos_to_int, validate_topic,
};
use crate::utils::error::{BridgeError, Result};
use crate::utils::logging::Logger;

pub const SCHEMA: &str = "topic TEXT PRIMARY KEY, qos INTEGER";

pub struct SubscriptionTable {
    name: String,
    registry: Arc<SubscriptionRegistry>,
    session: Arc<dyn BrokerSession>,
    sink: Arc<IngestionSink>,
    logger: Logger,
}

impl SubscriptionTable {
    /// Connects to the configured brokers. Inbound messages go to `store`.
    pub fn connect(
        name: impl Into<String>,
        settings: &Settings,
        store: Box<dyn MessageStore>,
    ) -> Result<Self> {
        Self::with_session(
            name,
            settings,
            store,
            Box::new(|handlers: SessionHandlers| -> Result<Arc<dyn BrokerSession>> {
                let session = MqttSession::connect(settings, handlers)?;
                Ok(Arc::new(session) as Arc<dyn BrokerSession>)
            }),
        )
    }

    /// Builds the table around a session produced by `factory`.
    pub fn with_session(
        name: impl Into<String>,
        settings: &Settings,
        store: Box<dyn MessageStore>,
        factory: SessionFactory<'_>,
    ) -> Result<Self> {
        let name = name.into();
        let logger = Logger::from_definition(&settings.logger)?;
        let registry = Arc::new(SubscriptionRegistry::new());
        let sink = Arc::new(IngestionSink::new(
            settings.table.clone(),
            store,
            logger.clone(),
        ));

        let handlers = SessionHandlers {
            on_message: sink.handler(),
            on_connect: reconnect::resubscribe_handler(
                name.clone(),
                Arc::clone(&registry),
                logger.clone(),
            ),
            on_connection_lost: reconnect::connection_lost_handler(name.clone(), logger.clone()),
        };
        let session = factory(handlers)?;

        {
            let _log = logger.enter();
            info!(
                virtual_table = %name,
                table = %settings.table,
                connected = session.is_connected(),
                "subscription table ready"
            );
        }

        Ok(Self {
            name,
            registry,
            session,
            sink,
            logger,
        })
    }

    /// Subscribes to `topic`. The registry only changes once the broker
    /// acknowledged the subscription.
    pub fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        let _log = self.logger.enter();
        validate_topic(topic)?;

        let pending = self.registry.begin_insert(topic, qos)?;
        if let Err(err) = self.session.subscribe(topic, qos) {
            error!(
                virtual_table = %self.name,
                topic,
                error = %err,
                "subscribe failed"
            );
            return Err(err);
        }
        pending.commit();

        info!(
            virtual_table = %self.name,
            topic,
            qos = qos_to_int(qos),
            "subscribed"
        );
        Ok(())
    }

    /// Unsubscribes from `topic`. A failed unsubscribe keeps the entry.
    pub fn unsubscribe(&self, topic: &str) -> Result<()> {
        let _log = self.logger.enter();

        let pending = self.registry.begin_remove(topic)?;
        if let Err(err) = self.session.unsubscribe(&[topic.to_string()]) {
            error!(
                virtual_table = %self.name,
                topic,
                error = %err,
                "unsubscribe failed"
            );
            return Err(err);
        }
        pending.commit();

        info!(virtual_table = %self.name, topic, "unsubscribed");
        Ok(())
    }

    /// Active subscriptions sorted by topic.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.registry.snapshot()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn sink(&self) -> &IngestionSink {
        &self.sink
    }

    /// Releases everything the table holds. Every step runs even when an
    /// earlier one fails; the failures come back together.
    pub fn teardown(&self) -> Result<()> {
        let mut errors = Vec::new();

        {
            let _log = self.logger.enter();
            for topic in self.registry.topics() {
                match self.session.unsubscribe(std::slice::from_ref(&topic)) {
                    Ok(()) => self.registry.forget(&topic),
                    Err(err) => {
                        error!(
                            virtual_table = %self.name,
                            topic = %topic,
                            error = %err,
                            "unsubscribe on teardown failed"
                        );
                        errors.push(err);
                    }
                }
            }
        }

        if let Err(err) = self.logger.close() {
            errors.push(err);
        }

        self.session.disconnect(DISCONNECT_GRACE);

        if let Err(err) = self.sink.finalize() {
            errors.push(err);
        }

        BridgeError::combine(errors)
    }
}

impl TableAdapter for SubscriptionTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &'static str {
        SCHEMA
    }

    fn insert(&self, values: &[Value]) -> Result<i64> {
        require_values(values, 2, "Topic and QoS")?;
        let topic = text_value(&values[0], "topic")?;
        let qos = qos_value(&values[1])?;
        self.subscribe(topic, qos)?;
        Ok(1)
    }

    /// Rows are addressed by their topic, never by position.
    fn delete(&self, key: &Value) -> Result<()> {
        match key {
            Value::Text(topic) => self.unsubscribe(topic),
            other => Err(BridgeError::validation(
                "topic",
                format!(
                    "rows of {:?} are deleted by topic, got {}",
                    self.name,
                    type_name(other)
                ),
            )),
        }
    }

    fn select(&self) -> Result<Vec<Row>> {
        Ok(self
            .subscriptions()
            .into_iter()
            .map(|subscription| {
                vec![
                    Value::Text(subscription.topic),
                    Value::Integer(qos_to_int(subscription.qos)),
                ]
            })
            .collect())
    }

    fn disconnect(&self) -> Result<()> {
        self.teardown()
    }
}

impl std::fmt::Debug for SubscriptionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionTable")
            .field("name", &self.name)
            .field("subscriptions", &self.registry.len())
            .field("sink", &self.sink)
            .finish()
    }
}
