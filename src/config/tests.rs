use super::*;
use crate::utils::error::ErrorKind;
use serial_test::serial;
use std::env;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert!(settings.client_id.starts_with("litemqtt-"));
    assert!(settings.servers.is_empty());
    assert_eq!(settings.timeout_ms, 30_000);
    assert_eq!(settings.keep_alive_secs, 30);
    assert_eq!(settings.table, DEFAULT_TABLE_NAME);
    assert!(settings.logger.is_empty());
    assert!(!settings.tls.insecure);
}

#[test]
fn test_from_options_is_case_insensitive() {
    let settings = from_options(&[
        "CLIENT_ID=bridge-1",
        " Servers = 'tcp://localhost:1883, ssl://broker.example.com'",
        "Timeout=500",
        "keep_alive=10",
        "USERNAME=\"user\"",
        "password=secret",
        "table=messages",
        "logger=stderr",
    ])
    .unwrap();

    assert_eq!(settings.client_id, "bridge-1");
    assert_eq!(
        settings.servers,
        vec![
            BrokerAddress {
                host: "localhost".into(),
                port: 1883,
                tls: false,
            },
            BrokerAddress {
                host: "broker.example.com".into(),
                port: 8883,
                tls: true,
            },
        ]
    );
    assert_eq!(settings.timeout_ms, 500);
    assert_eq!(settings.keep_alive_secs, 10);
    assert_eq!(settings.username.as_deref(), Some("user"));
    assert_eq!(settings.password.as_deref(), Some("secret"));
    assert_eq!(settings.table, "messages");
    assert_eq!(settings.logger, "stderr");
}

#[test]
fn test_from_options_tls_paths() {
    let settings = from_options(&[
        "cert_file=/etc/certs/client.pem",
        "cert_key_file=/etc/certs/client.key",
        "ca_file=/etc/certs/ca.pem",
        "insecure=false",
    ])
    .unwrap();

    assert_eq!(settings.tls.cert_file.as_deref(), Some("/etc/certs/client.pem"));
    assert_eq!(
        settings.tls.cert_key_file.as_deref(),
        Some("/etc/certs/client.key")
    );
    assert_eq!(settings.tls.ca_file.as_deref(), Some("/etc/certs/ca.pem"));
    assert!(!settings.tls.insecure);
}

#[test]
fn test_unknown_options_are_ignored() {
    let settings = from_options(&["flavour=vanilla", "table=kept"]).unwrap();
    assert_eq!(settings.table, "kept");
}

#[test]
fn test_option_without_equals_is_rejected() {
    let err = from_options(&["servers"]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn test_invalid_numeric_option_is_rejected() {
    let err = from_options(&["timeout=soon"]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn test_broker_address_parsing() {
    assert_eq!(
        BrokerAddress::parse("broker:1884").unwrap(),
        BrokerAddress {
            host: "broker".into(),
            port: 1884,
            tls: false,
        }
    );
    assert!(BrokerAddress::parse("mqtts://secure").unwrap().tls);
    assert_eq!(BrokerAddress::parse("mqtts://secure").unwrap().port, 8883);
    assert_eq!(
        BrokerAddress::parse("ws://broker:80").unwrap_err().kind(),
        ErrorKind::Validation
    );
    assert_eq!(
        BrokerAddress::parse("tcp://broker:port").unwrap_err().kind(),
        ErrorKind::Validation
    );
    assert_eq!(
        BrokerAddress::parse("tcp://:1883").unwrap_err().kind(),
        ErrorKind::Validation
    );
}

#[test]
fn test_sanitize_option_value() {
    assert_eq!(sanitize_option_value("  plain "), "plain");
    assert_eq!(sanitize_option_value("'quoted'"), "quoted");
    assert_eq!(sanitize_option_value("\"double\""), "double");
    assert_eq!(sanitize_option_value("'mismatched\""), "'mismatched\"");
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    // Create a temporary directory and set it as current dir so load_config
    // will pick up config/default.toml from there.
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        client_id = "from-file"
        servers = "tcp://10.0.0.1:1883"
        keep_alive = 15
        table = "file_data"
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let cfg = load_config();

    // restore cwd before asserting
    env::set_current_dir(orig).expect("restore cwd");

    let cfg = cfg.expect("load_config failed");
    assert_eq!(cfg.client_id, "from-file");
    assert_eq!(cfg.servers[0].host, "10.0.0.1");
    assert_eq!(cfg.keep_alive_secs, 15);
    assert_eq!(cfg.table, "file_data");
}

#[test]
#[serial]
fn load_config_reads_environment() {
    temp_env::with_vars(
        [
            ("LITEMQTT_TABLE", Some("env_data")),
            ("LITEMQTT_TIMEOUT", Some("1500")),
        ],
        || {
            let cfg = load_config().expect("load_config failed");
            assert_eq!(cfg.table, "env_data");
            assert_eq!(cfg.timeout_ms, 1500);
        },
    );
}
