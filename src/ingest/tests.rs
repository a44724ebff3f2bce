use super::store::{ensure_table, validate_table_name};
use super::*;
use crate::utils::error::{BridgeError, ErrorKind};
use rusqlite::Connection;
use std::sync::Mutex;
use std::thread;
use tempfile::tempdir;

fn acked_message(topic: &str, payload: &[u8], id: u16, acks: &Arc<Mutex<Vec<u16>>>) -> InboundMessage {
    let acks = acks.clone();
    InboundMessage::new(topic, payload.to_vec())
        .with_message_id(id)
        .with_acker(move || {
            acks.lock().unwrap().push(id);
            Ok(())
        })
}

struct FailingStore;

impl MessageStore for FailingStore {
    fn insert(&mut self, _row: &IngestedRow<'_>) -> Result<()> {
        Err(BridgeError::from(rusqlite::Error::InvalidQuery))
    }

    fn finalize(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[test]
fn test_validate_table_name() {
    assert!(validate_table_name("mqtt_data").is_ok());
    assert!(validate_table_name("_private").is_ok());
    assert!(validate_table_name("main.mqtt_data").is_ok());
    for bad in ["", "1data", ".data", "data;drop", "my table"] {
        assert_eq!(
            validate_table_name(bad).unwrap_err().kind(),
            ErrorKind::Validation,
            "{bad:?} should be rejected"
        );
    }
}

#[test]
fn test_ensure_table_is_idempotent() {
    let conn = Connection::open_in_memory().unwrap();
    ensure_table(&conn, "mqtt_data").unwrap();
    ensure_table(&conn, "mqtt_data").unwrap();

    let columns: Vec<String> = conn
        .prepare("SELECT name FROM pragma_table_info('mqtt_data')")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<std::result::Result<_, _>>()
        .unwrap();
    assert_eq!(
        columns,
        vec![
            "client_id",
            "message_id",
            "topic",
            "payload",
            "qos",
            "retained",
            "timestamp"
        ]
    );
}

#[test]
fn test_store_writes_topic_payload_and_timestamp() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bridge.db");
    let mut store = SqliteStore::open(&path, "mqtt_data").unwrap();

    let timestamp = Utc::now();
    store
        .insert(&IngestedRow {
            topic: "sensors/temp",
            payload: b"{\"c\":21.5}",
            timestamp,
        })
        .unwrap();
    store
        .insert(&IngestedRow {
            topic: "sensors/raw",
            payload: &[0xff, 0x00, 0xfe],
            timestamp,
        })
        .unwrap();
    Box::new(store).finalize().unwrap();

    let conn = Connection::open(&path).unwrap();
    let (topic, payload, stored_at): (String, String, String) = conn
        .query_row(
            "SELECT topic, payload, timestamp FROM mqtt_data WHERE topic = 'sensors/temp'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .unwrap();
    assert_eq!(topic, "sensors/temp");
    assert_eq!(payload, "{\"c\":21.5}");
    assert_eq!(
        chrono::DateTime::parse_from_rfc3339(&stored_at).unwrap(),
        timestamp
    );

    let (kind, raw): (String, Vec<u8>) = conn
        .query_row(
            "SELECT typeof(payload), payload FROM mqtt_data WHERE topic = 'sensors/raw'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(kind, "blob");
    assert_eq!(raw, vec![0xff, 0x00, 0xfe]);
}

#[test]
fn test_store_rejects_invalid_table() {
    let conn = Connection::open_in_memory().unwrap();
    let err = SqliteStore::with_connection(conn, "bad name").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn test_sink_acks_after_successful_write() {
    let conn = Connection::open_in_memory().unwrap();
    let store = SqliteStore::with_connection(conn, "mqtt_data").unwrap();
    let sink = IngestionSink::new("mqtt_data", Box::new(store), Logger::default());
    let acks = Arc::new(Mutex::new(Vec::new()));

    sink.deliver(acked_message("a/b", b"hello", 42, &acks));

    assert_eq!(sink.written(), 1);
    assert_eq!(sink.dropped(), 0);
    assert_eq!(*acks.lock().unwrap(), vec![42]);
}

#[test]
fn test_sink_drops_failed_write_without_ack() {
    let sink = IngestionSink::new("mqtt_data", Box::new(FailingStore), Logger::default());
    let acks = Arc::new(Mutex::new(Vec::new()));

    sink.deliver(acked_message("a/b", b"lost", 7, &acks));
    // the next delivery is still attempted
    sink.deliver(acked_message("a/c", b"lost too", 8, &acks));

    assert_eq!(sink.written(), 0);
    assert_eq!(sink.dropped(), 2);
    assert!(acks.lock().unwrap().is_empty());
}

#[test]
fn test_sink_drops_after_finalize() {
    let conn = Connection::open_in_memory().unwrap();
    let store = SqliteStore::with_connection(conn, "mqtt_data").unwrap();
    let sink = IngestionSink::new("mqtt_data", Box::new(store), Logger::default());
    let acks = Arc::new(Mutex::new(Vec::new()));

    sink.finalize().unwrap();
    // second finalize is a no-op
    sink.finalize().unwrap();
    sink.deliver(acked_message("a/b", b"late", 1, &acks));

    assert_eq!(sink.dropped(), 1);
    assert!(acks.lock().unwrap().is_empty());
}

#[test]
fn test_concurrent_deliveries_write_every_row() {
    const DELIVERIES: usize = 64;

    let dir = tempdir().unwrap();
    let path = dir.path().join("bridge.db");
    let store = SqliteStore::open(&path, "mqtt_data").unwrap();
    let sink = Arc::new(IngestionSink::new(
        "mqtt_data",
        Box::new(store),
        Logger::default(),
    ));
    let handler = sink.handler();
    let acks = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..DELIVERIES)
        .map(|i| {
            let handler = handler.clone();
            let message = acked_message(
                &format!("devices/{i}"),
                format!("payload-{i}").as_bytes(),
                i as u16,
                &acks,
            );
            thread::spawn(move || handler(message))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(sink.written(), DELIVERIES as u64);
    assert_eq!(acks.lock().unwrap().len(), DELIVERIES);
    sink.finalize().unwrap();

    let conn = Connection::open(&path).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM mqtt_data", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, DELIVERIES as i64);

    // every payload belongs to its own topic: no mixed binds
    let mismatched: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM mqtt_data
             WHERE 'payload-' || substr(topic, length('devices/') + 1) != payload",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(mismatched, 0);
}
