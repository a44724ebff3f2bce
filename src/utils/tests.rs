use super::error::{BridgeError, ErrorKind, Operation};
use super::logging::{self, Logger};
use std::time::Duration;
use tempfile::tempdir;

#[test]
fn logging_init_accepts_levels() {
    // Should not panic
    logging::init("info");
    logging::init("debug");
    logging::init("warn");
}

#[test]
fn test_error_kinds() {
    assert_eq!(
        BridgeError::validation("qos", "out of range").kind(),
        ErrorKind::Validation
    );
    assert_eq!(
        BridgeError::AlreadySubscribed("a".into()).kind(),
        ErrorKind::State
    );
    assert_eq!(BridgeError::NotSubscribed("a".into()).kind(), ErrorKind::State);
    assert_eq!(
        BridgeError::unsupported("UPDATE", "mqtt_sub").kind(),
        ErrorKind::State
    );
    assert_eq!(
        BridgeError::from(std::io::Error::other("disk full")).kind(),
        ErrorKind::Persistence
    );
}

#[test]
fn test_timeout_message_names_operation_and_topic() {
    let err = BridgeError::Timeout {
        operation: Operation::Publish,
        topic: "sensors/a".into(),
        after: Duration::from_millis(250),
    };
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(
        err.to_string(),
        "publish \"sensors/a\" timed out after 250ms"
    );
}

#[test]
fn test_combine_errors() {
    assert!(BridgeError::combine(Vec::new()).is_ok());

    let err = BridgeError::combine(vec![
        BridgeError::connection(Operation::Unsubscribe, "b", "refused"),
        BridgeError::from(rusqlite::Error::InvalidQuery),
    ])
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Teardown);
    let text = err.to_string();
    assert!(text.contains("unsubscribe \"b\" failed: refused"));
    assert!(text.contains("SQLite error"));
}

#[test]
fn test_logger_rejects_unknown_destination() {
    let err = Logger::from_definition("syslog").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn test_logger_writes_to_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bridge.log");
    let logger = Logger::from_definition(&format!("file:{}", path.display())).unwrap();

    {
        let _guard = logger.enter();
        tracing::error!(topic = "a/b", "insert data");
    }
    logger.close().unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("insert data"));
    assert!(contents.contains("a/b"));
}

#[test]
fn test_empty_logger_definition_is_passthrough() {
    let logger = Logger::from_definition("").unwrap();
    assert!(logger.enter().is_none());
    assert!(logger.close().is_ok());
}
