//! # litemqtt
//!
//! `litemqtt` bridges an MQTT broker and a SQLite database. Messages arriving
//! from the broker are stored as rows, and rows written to the bridge tables
//! turn into subscribe, unsubscribe and publish requests.
//!
//! ## Core Modules
//!
//! - `adapter`: The subscription control table and the publish table, plus the
//!   reconnect handling that replays subscriptions.
//! - `config`: Builds connection settings from `key=value` options, files and
//!   the environment.
//! - `host`: Opens the database file and creates tables against it.
//! - `ingest`: Writes inbound messages through a single prepared insert.
//! - `registry`: The authoritative set of active subscriptions.
//! - `session`: The broker connection, with blocking request/ack semantics.
//! - `utils`: Error types and logging setup.

pub mod adapter;
pub mod config;
pub mod host;
pub mod ingest;
pub mod registry;
pub mod session;
pub mod utils;

pub use adapter::{PublishTable, SubscriptionTable, TableAdapter};
pub use host::Host;
pub use utils::error::{BridgeError, ErrorKind, Result};
