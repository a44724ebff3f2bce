//! The `ingest` module persists inbound broker messages.
//!
//! `IngestionSink` is the message handler given to the broker session. Every
//! delivery writes one row through the shared `MessageStore` while holding
//! the statement lock, then acknowledges the message to the broker. A failed
//! write is logged and the message dropped unacknowledged; nothing is
//! retried and no caller ever sees the error.

pub mod store;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{error, warn};

use crate::session::{InboundMessage, MessageHandler};
use crate::utils::error::Result;
use crate::utils::logging::Logger;

pub use store::SqliteStore;

/// The values written for one inbound message.
#[derive(Debug, Clone, Copy)]
pub struct IngestedRow<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub timestamp: DateTime<Utc>,
}

/// Write handle for inbound messages.
///
/// The sink serializes all calls, so implementations need not be `Sync`.
pub trait MessageStore: Send {
    fn insert(&mut self, row: &IngestedRow<'_>) -> Result<()>;

    /// Releases the prepared statement and the underlying connection.
    fn finalize(self: Box<Self>) -> Result<()>;
}

pub struct IngestionSink {
    table: String,
    store: Mutex<Option<Box<dyn MessageStore>>>,
    logger: Logger,
    written: AtomicU64,
    dropped: AtomicU64,
}

impl IngestionSink {
    pub fn new(table: impl Into<String>, store: Box<dyn MessageStore>, logger: Logger) -> Self {
        Self {
            table: table.into(),
            store: Mutex::new(Some(store)),
            logger,
            written: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Message handler for a broker session, writing into this sink.
    pub fn handler(self: &Arc<Self>) -> MessageHandler {
        let sink = Arc::clone(self);
        Arc::new(move |message: InboundMessage| sink.deliver(message))
    }

    /// Writes one inbound message and acknowledges it once it is stored.
    pub fn deliver(&self, mut message: InboundMessage) {
        let _log = self.logger.enter();

        let outcome = {
            let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
            match store.as_mut() {
                Some(store) => store.insert(&IngestedRow {
                    topic: &message.topic,
                    payload: &message.payload,
                    timestamp: Utc::now(),
                }),
                None => {
                    warn!(
                        topic = %message.topic,
                        message_id = message.message_id,
                        table = %self.table,
                        "store finalized, dropping message"
                    );
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        };

        match outcome {
            Ok(()) => {
                self.written.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = message.ack() {
                    warn!(
                        topic = %message.topic,
                        message_id = message.message_id,
                        error = %err,
                        "ack failed"
                    );
                }
            }
            Err(err) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                error!(
                    topic = %message.topic,
                    message_id = message.message_id,
                    table = %self.table,
                    error = %err,
                    "insert data"
                );
            }
        }
    }

    /// Finalizes the store. Later deliveries are dropped.
    pub fn finalize(&self) -> Result<()> {
        let store = self
            .store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match store {
            Some(store) => store.finalize(),
            None => Ok(()),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Rows written so far.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Messages dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for IngestionSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionSink")
            .field("table", &self.table)
            .field("written", &self.written())
            .field("dropped", &self.dropped())
            .finish()
    }
}
