//! Per-agent bounded mailboxes.
//!
//! A `Mailbox` is the read end handed to a subscriber. The bus keeps the
//! matching `MailboxSender`. Closing is signalled through a cancellation
//! token rather than by dropping senders, because in-flight deliveries may
//! still hold a sender clone when the subscriber is removed.

use agentry_types::agent::AgentId;
use agentry_types::message::AgentMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Read end of an agent's mailbox. Messages arrive in send order.
#[derive(Debug)]
pub struct Mailbox {
    owner: AgentId,
    rx: mpsc::Receiver<AgentMessage>,
    closed: CancellationToken,
}

/// Write end kept by the bus.
#[derive(Debug, Clone)]
pub(crate) struct MailboxSender {
    pub(crate) tx: mpsc::Sender<AgentMessage>,
    pub(crate) closed: CancellationToken,
}

impl MailboxSender {
    /// Close the mailbox. Queued messages are discarded by the reader.
    pub(crate) fn close(&self) {
        self.closed.cancel();
    }
}

/// Create a bounded mailbox pair. `capacity` must be non-zero.
pub(crate) fn channel(owner: AgentId, capacity: usize) -> (MailboxSender, Mailbox) {
    let (tx, rx) = mpsc::channel(capacity);
    let closed = CancellationToken::new();
    (
        MailboxSender {
            tx,
            closed: closed.clone(),
        },
        Mailbox { owner, rx, closed },
    )
}

impl Mailbox {
    pub fn owner(&self) -> &AgentId {
        &self.owner
    }

    /// Receive the next message, or `None` once the mailbox is closed.
    ///
    /// Closure wins over pending messages: after `unsubscribe` or bus stop
    /// the reader sees `None` immediately.
    pub async fn recv(&mut self) -> Option<AgentMessage> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            msg = self.rx.recv() => msg,
        }
    }

    /// Non-blocking receive. `None` when empty or closed.
    pub fn try_recv(&mut self) -> Option<AgentMessage> {
        if self.closed.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the mailbox is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}
