//! Fan-out of `RuntimeEvent`s to observers.
//!
//! Registry, health monitor and recovery manager publish into one shared
//! `EventBus`; the CLI, the auto-recovery listener and tests subscribe. The
//! channel is a `tokio::sync::broadcast`, so a slow observer lags and skips
//! events instead of stalling the publishers.

use agentry_types::event::RuntimeEvent;
use tokio::sync::broadcast;
use tracing::trace;

/// Channel capacity used by `EventBus::default`.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Shared publisher handle. Clones publish into the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receiver for every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    /// Publish to the current observers and return how many there were.
    ///
    /// With nobody listening the event is dropped.
    pub fn publish(&self, event: RuntimeEvent) -> usize {
        let agent_id = event.agent_id().clone();
        match self.sender.send(event) {
            Ok(observers) => {
                trace!(%agent_id, observers, "runtime event published");
                observers
            }
            Err(_) => 0,
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
