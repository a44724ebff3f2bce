//! SQLite storage for inbound messages
//!
//! `SqliteStore` owns the connection and the prepared insert used for every
//! inbound message. The statement lives in rusqlite's statement cache, so each
//! write is a reset/bind/step on the same handle.

use std::path::Path;

use chrono::SecondsFormat;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, params};

use super::{IngestedRow, MessageStore};
use crate::utils::error::{BridgeError, Result};

pub struct SqliteStore {
    conn: Connection,
    table: String,
    insert_sql: String,
}

impl SqliteStore {
    /// Open or create a SQLite database at `path` and make sure `table`
    /// exists.
    pub fn open(path: impl AsRef<Path>, table: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, table)
    }

    pub fn with_connection(conn: Connection, table: &str) -> Result<Self> {
        ensure_table(&conn, table)?;
        let insert_sql = format!("INSERT INTO {table}(topic, payload, timestamp) VALUES(?1, ?2, ?3)");
        // Prepare up front so a broken table surfaces here, not per message.
        conn.prepare_cached(&insert_sql)?;
        Ok(Self {
            conn,
            table: table.to_string(),
            insert_sql,
        })
    }
}

impl MessageStore for SqliteStore {
    fn insert(&mut self, row: &IngestedRow<'_>) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(&self.insert_sql)?;
        let payload = match std::str::from_utf8(row.payload) {
            Ok(text) => ToSqlOutput::Borrowed(ValueRef::Text(text.as_bytes())),
            Err(_) => ToSqlOutput::Borrowed(ValueRef::Blob(row.payload)),
        };
        stmt.execute(params![
            row.topic,
            payload,
            row.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        ])?;
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<()> {
        self.conn.flush_prepared_statement_cache();
        self.conn.close().map_err(|(_, err)| BridgeError::from(err))
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("table", &self.table)
            .finish()
    }
}

/// Table names may contain letters, digits, `_` and `.`, and must not start
/// with a digit or `.`.
pub fn validate_table_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');

    if valid {
        Ok(())
    } else {
        Err(BridgeError::validation(
            "table",
            format!("table name {name:?} is invalid"),
        ))
    }
}

/// Creates the message table if it does not exist yet.
pub fn ensure_table(conn: &Connection, table: &str) -> Result<()> {
    validate_table_name(table)?;
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table}(
            client_id TEXT,
            message_id INTEGER,
            topic TEXT,
            payload BLOB,
            qos INTEGER,
            retained INTEGER,
            timestamp DATETIME
        )"
    ))?;
    Ok(())
}
