//! `rumqttc`-backed broker session.
//!
//! The session owns a small tokio runtime. One task drives the `rumqttc`
//! event loop: it correlates acknowledgements, reconnects with backoff after a
//! connection error and hands inbound messages to the message handler on the
//! blocking pool. Callers of `publish`/`subscribe`/`unsubscribe` block on
//! their own thread until the acknowledgement arrives, never on the event
//! loop.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish,
    QoS, SubscribeReasonCode, TlsConfiguration, Transport,
};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::acks::{self, AckTracker};
use super::{BrokerSession, InboundMessage, PublishRequest, SessionHandlers, topic_matches};
use super::tls::load_tls;
use crate::config::{BrokerAddress, Settings};
use crate::utils::error::{BridgeError, Operation, Result};

/// Capacity of the client's request channel.
const REQUEST_CAPACITY: usize = 64;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

pub struct MqttSession {
    inner: Arc<SessionInner>,
    driver: Mutex<Option<Driver>>,
}

struct Driver {
    runtime: Runtime,
    task: Option<JoinHandle<()>>,
}

pub(super) struct SessionInner {
    /// `None` when no servers were configured.
    client: Option<AsyncClient>,
    broker: String,
    tracker: Mutex<AckTracker>,
    routes: RwLock<BTreeSet<String>>,
    connected: AtomicBool,
    closing: AtomicBool,
    /// Deliveries no subscription matched.
    unrouted: AtomicU64,
}

impl MqttSession {
    /// Connects to the first configured broker that accepts the connection.
    ///
    /// Without servers the session is created unconnected and every broker
    /// operation fails with a connection error.
    pub fn connect(settings: &Settings, handlers: SessionHandlers) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("litemqtt-session")
            .enable_all()
            .build()?;

        if settings.servers.is_empty() {
            debug!(client_id = %settings.client_id, "no servers configured, deferring connect");
            return Ok(Self {
                inner: Arc::new(SessionInner::new(None, String::new())),
                driver: Mutex::new(Some(Driver {
                    runtime,
                    task: None,
                })),
            });
        }

        let tls = if settings.servers.iter().any(|address| address.tls) {
            load_tls(&settings.tls)?
        } else {
            None
        };
        let timeout = Duration::from_millis(settings.timeout_ms);
        let mut failures = Vec::new();

        for address in &settings.servers {
            let options = mqtt_options(settings, address, tls.clone());
            let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

            match runtime.block_on(await_connack(&mut eventloop, timeout)) {
                Ok(()) => {
                    info!(broker = %address, client_id = %settings.client_id, "connected to broker");
                    let inner = Arc::new(SessionInner::new(Some(client), address.to_string()));
                    let task = runtime.spawn(drive(inner.clone(), eventloop, handlers));
                    return Ok(Self {
                        inner,
                        driver: Mutex::new(Some(Driver {
                            runtime,
                            task: Some(task),
                        })),
                    });
                }
                Err(reason) => {
                    warn!(broker = %address, %reason, "broker connection failed");
                    failures.push(format!("{address}: {reason}"));
                }
            }
        }

        Err(BridgeError::connection(
            Operation::Connect,
            "",
            failures.join("; "),
        ))
    }

    /// Address of the connected broker, empty when deferred.
    pub fn broker(&self) -> &str {
        &self.inner.broker
    }
}

impl BrokerSession for MqttSession {
    fn publish(&self, request: &PublishRequest) -> Result<()> {
        self.inner.publish(request)
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        self.inner.subscribe(topic, qos)
    }

    fn unsubscribe(&self, topics: &[String]) -> Result<()> {
        self.inner.unsubscribe(topics)
    }

    fn disconnect(&self, grace: Duration) {
        self.inner.disconnect(grace);

        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Driver { runtime, task }) = driver {
            if let Some(task) = task {
                // Let the event loop flush DISCONNECT before the runtime goes.
                let _ = runtime.block_on(tokio::time::timeout(grace, task));
            }
            runtime.shutdown_timeout(grace);
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}

impl SessionInner {
    pub(super) fn new(client: Option<AsyncClient>, broker: String) -> Self {
        let connected = client.is_some();
        Self {
            client,
            broker,
            tracker: Mutex::new(AckTracker::default()),
            routes: RwLock::new(BTreeSet::new()),
            connected: AtomicBool::new(connected),
            closing: AtomicBool::new(false),
            unrouted: AtomicU64::new(0),
        }
    }

    pub(super) fn tracker(&self) -> MutexGuard<'_, AckTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn client(&self, operation: Operation, topic: &str) -> Result<&AsyncClient> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(BridgeError::connection(operation, topic, "session closed"));
        }
        self.client
            .as_ref()
            .ok_or_else(|| BridgeError::connection(operation, topic, "not connected"))
    }

    fn is_routed(&self, topic: &str) -> bool {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|filter| topic_matches(filter, topic))
    }

    /// Returns `false` once the event loop should stop.
    pub(super) fn handle_event(self: &Arc<Self>, event: Event, handlers: &SessionHandlers) -> bool {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                if !self.connected.swap(true, Ordering::SeqCst) {
                    info!(broker = %self.broker, "reconnected to broker");
                    let session = Arc::clone(self);
                    let on_connect = handlers.on_connect.clone();
                    tokio::task::spawn_blocking(move || on_connect(&*session));
                }
            }
            Event::Incoming(Packet::Publish(publish)) => self.dispatch(publish, handlers),
            Event::Incoming(Packet::SubAck(ack)) => {
                let rejected = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                let outcome = if rejected {
                    Err("broker rejected the subscription".to_string())
                } else {
                    Ok(())
                };
                self.tracker().on_ack(Operation::Subscribe, ack.pkid, outcome);
            }
            Event::Incoming(Packet::UnsubAck(ack)) => {
                self.tracker().on_ack(Operation::Unsubscribe, ack.pkid, Ok(()));
            }
            Event::Incoming(Packet::PubAck(ack)) => {
                self.tracker().on_ack(Operation::Publish, ack.pkid, Ok(()));
            }
            Event::Incoming(Packet::PubComp(ack)) => {
                self.tracker().on_ack(Operation::Publish, ack.pkid, Ok(()));
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!(broker = %self.broker, "broker sent DISCONNECT");
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                self.tracker().on_outgoing(Operation::Publish, pkid);
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                self.tracker().on_outgoing(Operation::Subscribe, pkid);
            }
            Event::Outgoing(Outgoing::Unsubscribe(pkid)) => {
                self.tracker().on_outgoing(Operation::Unsubscribe, pkid);
            }
            Event::Outgoing(Outgoing::Disconnect) => return false,
            _ => {}
        }
        true
    }

    fn dispatch(&self, publish: Publish, handlers: &SessionHandlers) {
        let Some(client) = self.client.clone() else {
            return;
        };

        if !self.is_routed(&publish.topic) {
            debug!(topic = %publish.topic, "no subscription matches, dropping message");
            self.unrouted.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = client.try_ack(&publish) {
                warn!(topic = %publish.topic, error = %err, "ack of unrouted message failed");
            }
            return;
        }

        let message = InboundMessage::new(publish.topic.clone(), publish.payload.to_vec())
            .with_qos(publish.qos)
            .with_retained(publish.retain)
            .with_message_id(publish.pkid);
        let topic = publish.topic.clone();
        let message = message.with_acker(move || {
            client
                .try_ack(&publish)
                .map_err(|err| BridgeError::connection(Operation::Ack, topic, err))
        });

        let on_message = handlers.on_message.clone();
        tokio::task::spawn_blocking(move || on_message(message));
    }

    pub(super) fn unrouted(&self) -> u64 {
        self.unrouted.load(Ordering::Relaxed)
    }

    fn fail_pending(&self, reason: &str) {
        let mut tracker = self.tracker();
        let pending = tracker.pending();
        if pending > 0 {
            warn!(pending, %reason, "failing requests awaiting acknowledgement");
        }
        tracker.fail_all(reason);
    }

    /// Records a dropped connection. Runs the lost handler only on the first
    /// error after an established connection.
    pub(super) fn connection_lost(&self, reason: &str, handlers: &SessionHandlers) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let failed = self.tracker().fail_unrecoverable(reason);
        if failed > 0 {
            warn!(failed, %reason, "subscription requests lost with the connection");
        }
        (handlers.on_connection_lost)(reason);
    }
}

impl BrokerSession for SessionInner {
    fn publish(&self, request: &PublishRequest) -> Result<()> {
        let client = self.client(Operation::Publish, &request.topic)?;

        let rx = {
            let mut tracker = self.tracker();
            let rx = tracker.register(
                Operation::Publish,
                &request.topic,
                request.qos == QoS::AtMostOnce,
            );
            if let Err(err) = client.try_publish(
                request.topic.clone(),
                request.qos,
                request.retained,
                request.payload.clone(),
            ) {
                tracker.cancel_last(Operation::Publish);
                return Err(BridgeError::connection(
                    Operation::Publish,
                    &request.topic,
                    err,
                ));
            }
            rx
        };

        acks::wait(rx, Operation::Publish, &request.topic, request.deadline())
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        let client = self.client(Operation::Subscribe, topic)?;

        // Route before the SUBACK so retained messages sent right after it
        // are not dropped.
        let added = self
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_string());

        let result = {
            let mut tracker = self.tracker();
            let rx = tracker.register(Operation::Subscribe, topic, false);
            match client.try_subscribe(topic, qos) {
                Ok(()) => Ok(rx),
                Err(err) => {
                    tracker.cancel_last(Operation::Subscribe);
                    Err(BridgeError::connection(Operation::Subscribe, topic, err))
                }
            }
        }
        .and_then(|rx| acks::wait(rx, Operation::Subscribe, topic, None));

        if result.is_err() && added {
            self.routes
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(topic);
        }
        result
    }

    fn unsubscribe(&self, topics: &[String]) -> Result<()> {
        let mut errors = Vec::new();

        for topic in topics {
            let result = self.client(Operation::Unsubscribe, topic).and_then(|client| {
                let rx = {
                    let mut tracker = self.tracker();
                    let rx = tracker.register(Operation::Unsubscribe, topic, false);
                    if let Err(err) = client.try_unsubscribe(topic.clone()) {
                        tracker.cancel_last(Operation::Unsubscribe);
                        return Err(BridgeError::connection(Operation::Unsubscribe, topic, err));
                    }
                    rx
                };
                acks::wait(rx, Operation::Unsubscribe, topic, None)
            });

            match result {
                Ok(()) => {
                    self.routes
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(topic);
                }
                Err(err) => {
                    error!(%topic, error = %err, "unsubscribe failed");
                    errors.push(err);
                }
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => BridgeError::combine(errors),
        }
    }

    fn disconnect(&self, _grace: Duration) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(client) = &self.client {
            if let Err(err) = client.try_disconnect() {
                debug!(error = %err, "disconnect request not delivered");
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        self.fail_pending("session closed");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn drive(inner: Arc<SessionInner>, mut eventloop: EventLoop, handlers: SessionHandlers) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match eventloop.poll().await {
            Ok(event) => {
                backoff = INITIAL_BACKOFF;
                if !inner.handle_event(event, &handlers) {
                    break;
                }
            }
            Err(err) => {
                if inner.closing.load(Ordering::SeqCst) {
                    break;
                }
                let reason = err.to_string();
                inner.connection_lost(&reason, &handlers);
                debug!(broker = %inner.broker, %reason, retry_in = ?backoff, "reconnecting");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }

    debug!(broker = %inner.broker, "event loop stopped");
}

async fn await_connack(
    eventloop: &mut EventLoop,
    timeout: Duration,
) -> std::result::Result<(), String> {
    let handshake = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return if ack.code == ConnectReturnCode::Success {
                        Ok(())
                    } else {
                        Err(format!("broker refused the connection: {:?}", ack.code))
                    };
                }
                Ok(_) => continue,
                Err(err) => return Err(err.to_string()),
            }
        }
    };

    tokio::time::timeout(timeout, handshake)
        .await
        .unwrap_or_else(|_| {
            Err(format!(
                "no CONNACK within {}",
                humantime::format_duration(timeout)
            ))
        })
}

fn mqtt_options(
    settings: &Settings,
    address: &BrokerAddress,
    tls: Option<TlsConfiguration>,
) -> MqttOptions {
    let mut options = MqttOptions::new(
        settings.client_id.clone(),
        address.host.clone(),
        address.port,
    );
    options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
    options.set_clean_session(true);
    options.set_manual_acks(true);

    if let Some(username) = &settings.username {
        options.set_credentials(
            username.clone(),
            settings.password.clone().unwrap_or_default(),
        );
    }

    if address.tls {
        options.set_transport(Transport::Tls(tls.unwrap_or_default()));
    }

    options
}
