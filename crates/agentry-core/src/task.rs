//! Supervised background tasks.
//!
//! A `SupervisedTask` is a spawned tokio task bound to a cancellation token
//! derived from its owner's lifecycle token. Cancelling the parent cancels
//! every child, so owners compose hierarchically: the runtime token is the
//! parent of the bus, registry, and monitor tokens, and the registry token is
//! the parent of its health loop.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Cancellable, joinable unit of concurrent work owned by one component.
#[derive(Debug)]
pub struct SupervisedTask {
    name: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl SupervisedTask {
    /// Spawn `body` with a child token of `parent`.
    ///
    /// The body receives its token and must return once it is cancelled.
    pub fn spawn<F, Fut>(name: impl Into<String>, parent: &CancellationToken, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let token = parent.child_token();
        let handle = tokio::spawn(body(token.clone()));
        debug!(task = %name, "spawned supervised task");
        Self {
            name,
            token,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Token the task body observes.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Signal the task to stop without waiting for it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task to exit. A panic inside the task is logged.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                warn!(task = %self.name, "supervised task panicked");
            } else {
                debug!(task = %self.name, "supervised task aborted");
            }
        }
    }

    /// Cancel and wait for exit.
    pub async fn shutdown(self) {
        self.cancel();
        self.join().await;
    }
}
