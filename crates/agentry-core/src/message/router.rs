//! Type-based fan-out on top of the message bus.
//!
//! A route maps a `MessageType` to an ordered list of receivers. Routed
//! messages are stamped once and delivered as independent copies straight
//! into each target mailbox. Messages without a route fall through to a
//! normal addressed `send`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use agentry_types::agent::AgentId;
use agentry_types::message::{AgentMessage, MessageType};
use tracing::{Instrument, Span, debug, info_span, warn};

use super::bus::{BusError, MessageBus};
use crate::sync::{read, write};

/// Fan-out router keyed by message type.
pub struct MessageRouter {
    bus: Arc<MessageBus>,
    routes: RwLock<HashMap<MessageType, Vec<AgentId>>>,
    span: Span,
}

impl MessageRouter {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            bus,
            routes: RwLock::new(HashMap::new()),
            span: info_span!("message_router"),
        }
    }

    /// Set the receivers for `message_type`, replacing any previous list.
    pub fn add_route(&self, message_type: MessageType, targets: Vec<AgentId>) {
        let _enter = self.span.enter();
        debug!(%message_type, targets = targets.len(), "route set");
        write(&self.routes).insert(message_type, targets);
    }

    /// Drop the route for `message_type`, returning its targets.
    pub fn remove_route(&self, message_type: MessageType) -> Option<Vec<AgentId>> {
        write(&self.routes).remove(&message_type)
    }

    /// Snapshot of every route.
    pub fn routes(&self) -> BTreeMap<MessageType, Vec<AgentId>> {
        read(&self.routes)
            .iter()
            .map(|(message_type, targets)| (*message_type, targets.clone()))
            .collect()
    }

    /// Deliver `msg` according to its type's route.
    ///
    /// Without a route the message is queued for `msg.receiver` and `1` is
    /// returned. With a route, returns the number of target mailboxes that
    /// accepted a copy; targets that are not subscribed are skipped.
    pub async fn route_message(&self, mut msg: AgentMessage) -> Result<usize, BusError> {
        let message_type = msg.message_type();
        let targets = read(&self.routes).get(&message_type).cloned();

        let Some(targets) = targets else {
            self.bus.send(msg)?;
            return Ok(1);
        };
        if self.bus.is_shutting_down() {
            return Err(BusError::ShuttingDown);
        }
        msg.stamp(self.bus.clock().now());

        let (known, unknown): (Vec<AgentId>, Vec<AgentId>) = targets
            .into_iter()
            .partition(|target| self.bus.is_subscribed(target));
        {
            let _enter = self.span.enter();
            for target in &unknown {
                warn!(%target, %message_type, "route target not subscribed, skipping");
            }
        }

        let delivered = self
            .bus
            .deliver_copies(&msg, known)
            .instrument(self.span.clone())
            .await;
        Ok(delivered)
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("routes", &read(&self.routes).len())
            .finish()
    }
}
