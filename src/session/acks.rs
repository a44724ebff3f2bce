//! Correlation of blocking requests with broker acknowledgements.
//!
//! `rumqttc` does not hand out per-request tokens, so the session does the
//! bookkeeping itself. A caller registers a waiter and enqueues its request
//! while holding the tracker lock, which keeps the per-operation queue in the
//! same order as the client's request channel. When the event loop reports the
//! outgoing packet, the front waiter is bound to that packet id; the matching
//! SUBACK/UNSUBACK/PUBACK/PUBCOMP then resolves it.
//!
//! When the connection drops, requests still in the client's channel and
//! unacknowledged QoS 1/2 publishes are sent again after the reconnect, the
//! publishes under their original packet id. Their waiters stay registered.
//! Subscribes and unsubscribes already on the wire are not resent, so only
//! those waiters fail.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

use crate::utils::error::{BridgeError, Operation, Result};

/// Outcome delivered to a waiter: `Err` carries the broker/transport reason.
pub(crate) type AckOutcome = std::result::Result<(), String>;

struct Waiter {
    topic: String,
    settle_on_write: bool,
    tx: Sender<AckOutcome>,
}

impl Waiter {
    fn resolve(self, outcome: AckOutcome) {
        // The caller may have given up already (timeout).
        let _ = self.tx.send(outcome);
    }
}

#[derive(Default)]
pub(crate) struct AckTracker {
    queued: HashMap<Operation, VecDeque<Waiter>>,
    inflight: HashMap<(Operation, u16), Waiter>,
}

impl AckTracker {
    /// Registers a waiter for the next request of `operation`.
    ///
    /// `settle_on_write` resolves the waiter as soon as the packet is written
    /// (QoS 0 publishes carry no acknowledgement).
    pub(crate) fn register(
        &mut self,
        operation: Operation,
        topic: &str,
        settle_on_write: bool,
    ) -> Receiver<AckOutcome> {
        let (tx, rx) = bounded(1);
        self.queued.entry(operation).or_default().push_back(Waiter {
            topic: topic.to_string(),
            settle_on_write,
            tx,
        });
        rx
    }

    /// Drops the most recent waiter of `operation`, used when the request
    /// could not be enqueued.
    pub(crate) fn cancel_last(&mut self, operation: Operation) {
        if let Some(queue) = self.queued.get_mut(&operation) {
            queue.pop_back();
        }
    }

    pub(crate) fn on_outgoing(&mut self, operation: Operation, pkid: u16) {
        if pkid != 0 && self.inflight.contains_key(&(operation, pkid)) {
            // retransmission of a publish already bound to this packet id
            return;
        }

        let Some(waiter) = self
            .queued
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        else {
            return;
        };

        if waiter.settle_on_write {
            waiter.resolve(Ok(()));
        } else {
            self.inflight.insert((operation, pkid), waiter);
        }
    }

    pub(crate) fn on_ack(&mut self, operation: Operation, pkid: u16, outcome: AckOutcome) {
        if let Some(waiter) = self.inflight.remove(&(operation, pkid)) {
            tracing::trace!(%operation, topic = %waiter.topic, pkid, "acknowledged");
            waiter.resolve(outcome);
        }
    }

    /// Fails the waiters whose requests died with the connection: subscribes
    /// and unsubscribes awaiting their ack. Returns how many failed.
    pub(crate) fn fail_unrecoverable(&mut self, reason: &str) -> usize {
        let lost: Vec<(Operation, u16)> = self
            .inflight
            .keys()
            .filter(|(operation, _)| *operation != Operation::Publish)
            .copied()
            .collect();
        for key in &lost {
            if let Some(waiter) = self.inflight.remove(key) {
                waiter.resolve(Err(reason.to_string()));
            }
        }
        lost.len()
    }

    /// Fails every waiter, used once the session is closed for good.
    pub(crate) fn fail_all(&mut self, reason: &str) {
        let queued = self.queued.drain().flat_map(|(_, queue)| queue);
        let inflight = self.inflight.drain().map(|(_, waiter)| waiter);
        for waiter in queued.chain(inflight) {
            waiter.resolve(Err(reason.to_string()));
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.queued.values().map(VecDeque::len).sum::<usize>() + self.inflight.len()
    }
}

/// Blocks the calling thread until the waiter resolves or `timeout` elapses.
pub(crate) fn wait(
    rx: Receiver<AckOutcome>,
    operation: Operation,
    topic: &str,
    timeout: Option<Duration>,
) -> Result<()> {
    let outcome = match timeout.filter(|t| !t.is_zero()) {
        Some(after) => match rx.recv_timeout(after) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                return Err(BridgeError::Timeout {
                    operation,
                    topic: topic.to_string(),
                    after,
                });
            }
            Err(RecvTimeoutError::Disconnected) => Err("session closed".to_string()),
        },
        None => rx
            .recv()
            .unwrap_or_else(|_| Err("session closed".to_string())),
    };

    outcome.map_err(|reason| BridgeError::connection(operation, topic, reason))
}
