//! In-process stand-in for a broker session, used by unit tests.
//!
//! Records every call, keeps the broker-side subscription set, can be told to
//! fail specific topics, and lets tests inject deliveries, reconnects and
//! connection losses.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::acks::{self, AckTracker};
use super::{BrokerSession, InboundMessage, PublishRequest, QoS, SessionHandlers, topic_matches};
use crate::utils::error::{BridgeError, Operation, Result};

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub subscribe_calls: Vec<(String, QoS)>,
    pub unsubscribe_calls: Vec<String>,
    pub publish_calls: Vec<PublishRequest>,
    pub disconnects: usize,
    /// Broker-side subscriptions.
    pub subscribed: BTreeMap<String, QoS>,
    /// Message ids acknowledged back to the broker.
    pub acked: Vec<u16>,
    pub fail_subscribe: HashSet<String>,
    pub fail_unsubscribe: HashSet<String>,
    /// When set, publishes never receive an acknowledgement.
    pub withhold_publish_acks: bool,
}

#[derive(Default)]
pub(crate) struct MockSession {
    handlers: Mutex<SessionHandlers>,
    state: Arc<Mutex<MockState>>,
    tracker: Mutex<AckTracker>,
}

impl MockSession {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Session factory for the table adapters that hands out this mock.
    pub(crate) fn factory(
        self: &Arc<Self>,
    ) -> impl FnOnce(SessionHandlers) -> Result<Arc<dyn BrokerSession>> + use<> {
        let session = Arc::clone(self);
        move |handlers| {
            *session.handlers.lock().unwrap() = handlers;
            Ok(session as Arc<dyn BrokerSession>)
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    fn handlers(&self) -> SessionHandlers {
        self.handlers.lock().unwrap().clone()
    }

    /// Delivers a message the way the broker would: only when a broker-side
    /// subscription matches. Returns whether the handler ran.
    pub(crate) fn deliver(&self, topic: &str, payload: &[u8], message_id: u16) -> bool {
        let routed = self
            .state()
            .subscribed
            .keys()
            .any(|filter| topic_matches(filter, topic));
        if !routed {
            return false;
        }

        let state = Arc::clone(&self.state);
        let message = InboundMessage::new(topic, payload.to_vec())
            .with_qos(QoS::AtLeastOnce)
            .with_message_id(message_id)
            .with_acker(move || {
                state.lock().unwrap().acked.push(message_id);
                Ok(())
            });
        (self.handlers().on_message)(message);
        true
    }

    /// Simulates a reconnect: the broker forgot every subscription (clean
    /// session) and the connected handler runs.
    pub(crate) fn simulate_reconnect(&self) {
        self.state().subscribed.clear();
        (self.handlers().on_connect)(self);
    }

    pub(crate) fn simulate_connection_lost(&self, reason: &str) {
        (self.handlers().on_connection_lost)(reason);
    }
}

impl BrokerSession for MockSession {
    fn publish(&self, request: &PublishRequest) -> Result<()> {
        let withhold = {
            let mut state = self.state();
            state.publish_calls.push(request.clone());
            state.withhold_publish_acks
        };

        let rx = self
            .tracker
            .lock()
            .unwrap()
            .register(Operation::Publish, &request.topic, false);
        if !withhold {
            let mut tracker = self.tracker.lock().unwrap();
            tracker.on_outgoing(Operation::Publish, 1);
            tracker.on_ack(Operation::Publish, 1, Ok(()));
        }
        acks::wait(rx, Operation::Publish, &request.topic, request.deadline())
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        let mut state = self.state();
        state.subscribe_calls.push((topic.to_string(), qos));
        if state.fail_subscribe.contains(topic) {
            return Err(BridgeError::connection(
                Operation::Subscribe,
                topic,
                "broker rejected the subscription",
            ));
        }
        state.subscribed.insert(topic.to_string(), qos);
        Ok(())
    }

    fn unsubscribe(&self, topics: &[String]) -> Result<()> {
        let mut state = self.state();
        let mut errors = Vec::new();
        for topic in topics {
            state.unsubscribe_calls.push(topic.clone());
            if state.fail_unsubscribe.contains(topic) {
                errors.push(BridgeError::connection(
                    Operation::Unsubscribe,
                    topic,
                    "broker refused",
                ));
            } else {
                state.subscribed.remove(topic);
            }
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => BridgeError::combine(errors),
        }
    }

    fn disconnect(&self, _grace: Duration) {
        self.state().disconnects += 1;
    }

    fn is_connected(&self) -> bool {
        self.state().disconnects == 0
    }
}
