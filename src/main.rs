//! CLI for litemqtt
//!
//! Subcommands:
//! - `subscribe`: store broker messages in a SQLite database until Ctrl-C
//! - `publish`: publish a single message and wait for the broker

use std::path::{Path, PathBuf};

use clap::Parser;
use litemqtt::config::{
    DEFAULT_PUBLISHER_TABLE_NAME, DEFAULT_SUBSCRIBER_TABLE_NAME, Settings, from_options,
    load_config,
};
use litemqtt::session::{PublishRequest, QoS, qos_from_int, qos_to_int};
use litemqtt::{BridgeError, Host, PublishTable};
use serde_json::json;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "litemqtt")]
enum Command {
    /// Subscribe to topics and store every message until interrupted
    Subscribe {
        /// SQLite database file receiving the messages
        #[arg(long)]
        db: PathBuf,
        /// Connection option as key=value (servers, client_id, table, ...)
        #[arg(short = 'o', long = "option")]
        options: Vec<String>,
        /// Topic filter, optionally suffixed with :qos (default 0)
        #[arg(short = 't', long = "topic", required = true)]
        topics: Vec<String>,
    },
    /// Publish one message
    Publish {
        #[arg(short = 'o', long = "option")]
        options: Vec<String>,
        #[arg(long)]
        topic: String,
        #[arg(long, default_value = "")]
        payload: String,
        #[arg(long, default_value_t = 0)]
        qos: i64,
        #[arg(long)]
        retain: bool,
        /// Bound on the acknowledgement wait, e.g. 500ms or 2s
        #[arg(long)]
        timeout: Option<String>,
    },
}

fn main() {
    let _ = dotenvy::dotenv();
    litemqtt::utils::logging::init("info");

    let cmd = Command::parse();

    let result = match cmd {
        Command::Subscribe {
            db,
            options,
            topics,
        } => run_subscribe(&db, &options, &topics),
        Command::Publish {
            options,
            topic,
            payload,
            qos,
            retain,
            timeout,
        } => run_publish(&options, topic, payload, qos, retain, timeout.as_deref()),
    };

    if let Err(e) = result {
        error!("litemqtt failed: {}", e);
        std::process::exit(1);
    }
}

/// Command-line options win; without any, settings come from the config file
/// and the environment.
fn settings(options: &[String]) -> Result<Settings, BridgeError> {
    if options.is_empty() {
        load_config()
    } else {
        from_options(options)
    }
}

fn run_subscribe(
    db: &Path,
    options: &[String],
    topics: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let settings = settings(options)?;
    let mut host = Host::open(db)?;
    let table = host.create_subscription_table(DEFAULT_SUBSCRIBER_TABLE_NAME, &settings)?;

    for spec in topics {
        let (topic, qos) = parse_topic(spec)?;
        table.subscribe(topic, qos)?;
    }
    info!(
        db = %host.path().display(),
        table = %settings.table,
        topics = topics.len(),
        "ingesting messages, press Ctrl-C to stop"
    );

    wait_for_ctrl_c()?;
    info!("Shutdown signal received. Exiting gracefully.");

    let summary = json!({
        "table": settings.table,
        "written": table.sink().written(),
        "dropped": table.sink().dropped(),
        "subscriptions": table
            .subscriptions()
            .into_iter()
            .map(|s| json!({ "topic": s.topic, "qos": qos_to_int(s.qos) }))
            .collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    host.close()?;
    Ok(())
}

fn run_publish(
    options: &[String],
    topic: String,
    payload: String,
    qos: i64,
    retain: bool,
    timeout: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let settings = settings(options)?;

    let mut request = PublishRequest::new(topic, payload, qos_from_int(qos)?);
    request.retained = retain;
    if let Some(timeout) = timeout {
        request.timeout = Some(humantime::parse_duration(timeout).map_err(|err| {
            BridgeError::validation("timeout", format!("timeout is invalid: {err}"))
        })?);
    }

    let table = PublishTable::connect(DEFAULT_PUBLISHER_TABLE_NAME, &settings)?;
    let published = table.publish(&request);
    let closed = table.teardown();
    published?;
    closed?;

    info!(topic = %request.topic, "published");
    Ok(())
}

/// Splits `topic[:qos]`. A suffix that is not a number stays part of the topic.
fn parse_topic(spec: &str) -> Result<(&str, QoS), BridgeError> {
    match spec.rsplit_once(':') {
        Some((topic, qos)) if !qos.is_empty() && qos.chars().all(|c| c.is_ascii_digit()) => {
            let qos = qos
                .parse::<i64>()
                .map_err(|err| BridgeError::validation("qos", err.to_string()))?;
            Ok((topic, qos_from_int(qos)?))
        }
        _ => Ok((spec, QoS::AtMostOnce)),
    }
}

fn wait_for_ctrl_c() -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(tokio::signal::ctrl_c())
}
