//! SQLite host for the broker tables
//!
//! `Host` owns a database file and the broker-backed tables created against
//! it. Subscription tables write inbound messages into a data table of that
//! file; publish tables only talk to the broker.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::Connection;
use tracing::info;

use crate::adapter::{PublishTable, SubscriptionTable, TableAdapter};
use crate::config::{self, DEFAULT_PUBLISHER_TABLE_NAME, DEFAULT_SUBSCRIBER_TABLE_NAME, Settings};
use crate::ingest::SqliteStore;
use crate::ingest::store::ensure_table;
use crate::utils::error::{BridgeError, Result};

/// Module name of the subscription table.
pub const SUBSCRIBER_MODULE: &str = "mqtt_subscriber";
/// Module name of the publish table.
pub const PUBLISHER_MODULE: &str = "mqtt_publisher";

pub struct Host {
    path: PathBuf,
    tables: BTreeMap<String, Arc<dyn TableAdapter>>,
}

impl Host {
    /// Opens (or creates) the database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.close().map_err(|(_, err)| BridgeError::from(err))?;
        Ok(Self {
            path,
            tables: BTreeMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates a table from `key=value` options, as a `CREATE VIRTUAL TABLE
    /// name USING module(options...)` statement would. An empty name picks the
    /// module's default.
    pub fn create_table<S: AsRef<str>>(
        &mut self,
        module: &str,
        name: &str,
        options: &[S],
    ) -> Result<Arc<dyn TableAdapter>> {
        let settings = config::from_options(options)?;
        match module {
            SUBSCRIBER_MODULE => {
                let name = non_empty(name, DEFAULT_SUBSCRIBER_TABLE_NAME);
                let table: Arc<dyn TableAdapter> = self.create_subscription_table(name, &settings)?;
                Ok(table)
            }
            PUBLISHER_MODULE => {
                let name = non_empty(name, DEFAULT_PUBLISHER_TABLE_NAME);
                let table: Arc<dyn TableAdapter> = self.create_publish_table(name, &settings)?;
                Ok(table)
            }
            other => Err(BridgeError::validation(
                "module",
                format!("unknown module {other:?}"),
            )),
        }
    }

    pub fn create_subscription_table(
        &mut self,
        name: &str,
        settings: &Settings,
    ) -> Result<Arc<SubscriptionTable>> {
        self.check_free(name)?;
        let store = SqliteStore::open(&self.path, &settings.table)?;
        let table = Arc::new(SubscriptionTable::connect(name, settings, Box::new(store))?);
        self.register(name, table.clone());
        info!(virtual_table = %name, table = %settings.table, "created subscription table");
        Ok(table)
    }

    pub fn create_publish_table(
        &mut self,
        name: &str,
        settings: &Settings,
    ) -> Result<Arc<PublishTable>> {
        self.check_free(name)?;
        let table = Arc::new(PublishTable::connect(name, settings)?);
        self.register(name, table.clone());
        info!(virtual_table = %name, "created publish table");
        Ok(table)
    }

    pub fn table(&self, name: &str) -> Option<Arc<dyn TableAdapter>> {
        self.tables.get(name).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// Opens a separate connection to the database, e.g. to read the data
    /// table while messages keep arriving.
    pub fn connection(&self) -> Result<Connection> {
        Ok(Connection::open(&self.path)?)
    }

    /// Makes sure the data table `name` exists.
    pub fn ensure_data_table(&self, name: &str) -> Result<()> {
        ensure_table(&self.connection()?, name)
    }

    /// Tears a table down and forgets it.
    pub fn drop_table(&mut self, name: &str) -> Result<()> {
        match self.tables.remove(name) {
            Some(table) => table.disconnect(),
            None => Err(BridgeError::validation(
                "table",
                format!("no such table: {name}"),
            )),
        }
    }

    /// Tears down every table. Failures are collected, not short-circuited.
    pub fn close(mut self) -> Result<()> {
        let mut errors: Vec<BridgeError> = std::mem::take(&mut self.tables)
            .into_values()
            .filter_map(|table| table.disconnect().err())
            .collect();
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => BridgeError::combine(errors),
        }
    }

    fn check_free(&self, name: &str) -> Result<()> {
        if self.tables.contains_key(name) {
            return Err(BridgeError::validation(
                "table",
                format!("table {name:?} already exists"),
            ));
        }
        Ok(())
    }

    fn register(&mut self, name: &str, table: Arc<dyn TableAdapter>) {
        self.tables.insert(name.to_string(), table);
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("path", &self.path)
            .field("tables", &self.tables.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn non_empty<'a>(name: &'a str, default: &'a str) -> &'a str {
    if name.trim().is_empty() { default } else { name }
}
