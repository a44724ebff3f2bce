//! Connection state handlers shared by the table adapters.
//!
//! After the session re-establishes a lost connection the broker no longer
//! knows about our subscriptions, so the subscription table replays its
//! registry. The replay is best effort: failures are logged and the registry
//! is never rolled back.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::registry::SubscriptionRegistry;
use crate::session::{BrokerSession, ConnectHandler, ConnectionLostHandler, qos_to_int};
use crate::utils::logging::Logger;

/// Handler that resubscribes every registry entry once on reconnect.
pub fn resubscribe_handler(
    table: String,
    registry: Arc<SubscriptionRegistry>,
    logger: Logger,
) -> ConnectHandler {
    Arc::new(move |session: &dyn BrokerSession| {
        let _log = logger.enter();
        replay(&table, &registry, session);
    })
}

/// Reissues a subscribe for each registry entry with its stored QoS.
/// Returns how many the broker accepted.
pub fn replay(table: &str, registry: &SubscriptionRegistry, session: &dyn BrokerSession) -> usize {
    let subscriptions = registry.snapshot();
    debug!(
        virtual_table = %table,
        subscriptions = subscriptions.len(),
        "connected to broker"
    );

    let mut restored = 0;
    for subscription in subscriptions {
        match session.subscribe(&subscription.topic, subscription.qos) {
            Ok(()) => restored += 1,
            Err(err) => warn!(
                virtual_table = %table,
                topic = %subscription.topic,
                qos = qos_to_int(subscription.qos),
                error = %err,
                "resubscribe failed"
            ),
        }
    }
    restored
}

/// Handler that only logs the reconnect.
pub fn connected_handler(table: String, logger: Logger) -> ConnectHandler {
    Arc::new(move |_: &dyn BrokerSession| {
        let _log = logger.enter();
        debug!(virtual_table = %table, "connected to broker");
    })
}

pub fn connection_lost_handler(table: String, logger: Logger) -> ConnectionLostHandler {
    Arc::new(move |reason: &str| {
        let _log = logger.enter();
        error!(virtual_table = %table, error = reason, "lost connection to the broker");
    })
}
