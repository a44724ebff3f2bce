use serde::Deserialize;

use crate::utils::error::{BridgeError, Result};

pub const DEFAULT_TABLE_NAME: &str = "mqtt_data";
pub const DEFAULT_PUBLISHER_TABLE_NAME: &str = "mqtt_pub";
pub const DEFAULT_SUBSCRIBER_TABLE_NAME: &str = "mqtt_sub";

/// Option keys understood by the adapters. Keys are matched case-insensitively.
pub const KNOWN_KEYS: &[&str] = &[
    "client_id",
    "servers",
    "timeout",
    "keep_alive",
    "username",
    "password",
    "cert_file",
    "cert_key_file",
    "ca_file",
    "insecure",
    "table",
    "logger",
];

/// Connection settings handed to a table adapter.
///
/// Covers the broker connection (client id, servers, credentials, TLS
/// material), the table receiving inbound messages and the log destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub client_id: String,
    pub servers: Vec<BrokerAddress>,
    /// Bound on the wait for each server's first CONNACK, in milliseconds.
    /// Connected sessions rely on keep-alive instead.
    pub timeout_ms: u64,
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: TlsSettings,
    pub table: String,
    pub logger: String,
}

/// Paths to TLS material. Loaded when the session connects to an `ssl://`
/// server. `insecure` accepts any server certificate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TlsSettings {
    pub cert_file: Option<String>,
    pub cert_key_file: Option<String>,
    pub ca_file: Option<String>,
    pub insecure: bool,
}

/// One entry of the `servers` option, e.g. `tcp://localhost:1883`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    /// Parses `scheme://host[:port]`. A missing scheme means plain TCP.
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        let (scheme, rest) = match url.split_once("://") {
            Some((scheme, rest)) => (scheme.to_lowercase(), rest),
            None => ("tcp".to_string(), url),
        };

        let tls = match scheme.as_str() {
            "tcp" | "mqtt" => false,
            "ssl" | "tls" | "mqtts" => true,
            other => {
                return Err(BridgeError::validation(
                    "servers",
                    format!("unsupported scheme {other:?} in {url:?}"),
                ));
            }
        };

        let rest = rest.trim_end_matches('/');
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    BridgeError::validation("servers", format!("invalid port in {url:?}"))
                })?;
                (host, port)
            }
            None => (rest, if tls { 8883 } else { 1883 }),
        };

        if host.is_empty() {
            return Err(BridgeError::validation(
                "servers",
                format!("missing host in {url:?}"),
            ));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

impl std::fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.tls { "ssl" } else { "tcp" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Partial settings as they come out of option strings, files or the
/// environment. Every field is optional; `Settings::default()` fills the gaps.
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub client_id: Option<String>,
    pub servers: Option<String>,
    pub timeout: Option<u64>,
    pub keep_alive: Option<u64>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub cert_file: Option<String>,
    pub cert_key_file: Option<String>,
    pub ca_file: Option<String>,
    pub insecure: Option<bool>,
    pub table: Option<String>,
    pub logger: Option<String>,
}

impl PartialSettings {
    /// Merges with defaults and validates server addresses.
    pub fn into_settings(self) -> Result<Settings> {
        let default = Settings::default();

        let servers = match self.servers.as_deref().map(str::trim) {
            Some(list) if !list.is_empty() => list
                .split(',')
                .map(BrokerAddress::parse)
                .collect::<Result<Vec<_>>>()?,
            _ => default.servers,
        };

        Ok(Settings {
            client_id: self
                .client_id
                .filter(|id| !id.is_empty())
                .unwrap_or(default.client_id),
            servers,
            timeout_ms: self.timeout.unwrap_or(default.timeout_ms),
            keep_alive_secs: self.keep_alive.unwrap_or(default.keep_alive_secs),
            username: self.username.filter(|u| !u.is_empty()),
            password: self.password,
            tls: TlsSettings {
                cert_file: self.cert_file.filter(|p| !p.is_empty()),
                cert_key_file: self.cert_key_file.filter(|p| !p.is_empty()),
                ca_file: self.ca_file.filter(|p| !p.is_empty()),
                insecure: self.insecure.unwrap_or(default.tls.insecure),
            },
            table: self
                .table
                .filter(|t| !t.is_empty())
                .unwrap_or(default.table),
            logger: self.logger.unwrap_or(default.logger),
        })
    }
}

/// Provides default values for `Settings`.
///
/// No servers means the session is built without connecting.
impl Default for Settings {
    fn default() -> Self {
        Self {
            client_id: generate_client_id(),
            servers: Vec::new(),
            timeout_ms: 30_000,
            keep_alive_secs: 30,
            username: None,
            password: None,
            tls: TlsSettings::default(),
            table: DEFAULT_TABLE_NAME.to_string(),
            logger: String::new(),
        }
    }
}

fn generate_client_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("litemqtt-{}", &id[..8])
}
