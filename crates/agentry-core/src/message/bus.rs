//! Mailbox-based message bus with a single dispatch loop.
//!
//! Producers call [`MessageBus::send`], which stamps the message and pushes it
//! onto a bounded ingress queue without blocking. One dispatch task drains the
//! queue and delivers each message into the addressed mailbox, waiting at most
//! the delivery timeout on a full mailbox. Failed deliveries are counted and
//! logged, never retried.
//!
//! [`MessageBus::broadcast`] and routed fan-out bypass the ingress queue and
//! deliver one copy per target concurrently.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use agentry_types::agent::AgentId;
use agentry_types::config::BusConfig;
use agentry_types::message::AgentMessage;
use agentry_types::metrics::MessageBusMetrics;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use super::mailbox::{self, Mailbox, MailboxSender};
use crate::clock::SharedClock;
use crate::sync::lock;
use crate::task::SupervisedTask;

/// Errors surfaced synchronously by bus operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("agent {0} is already subscribed")]
    AlreadySubscribed(AgentId),

    #[error("agent {0} is not subscribed")]
    NotSubscribed(AgentId),

    #[error("message bus is shutting down")]
    ShuttingDown,

    /// The ingress queue is full. Producers apply their own backpressure.
    #[error("message bus buffer is full")]
    BusBufferFull,

    #[error("mailbox buffer size must be greater than 0")]
    InvalidBufferSize,
}

#[derive(Debug, Clone, Copy)]
enum DeliveryFailure {
    NoMailbox,
    Timeout,
    Closed,
    Cancelled,
}

impl DeliveryFailure {
    fn as_str(self) -> &'static str {
        match self {
            DeliveryFailure::NoMailbox => "no mailbox",
            DeliveryFailure::Timeout => "delivery timed out",
            DeliveryFailure::Closed => "mailbox closed",
            DeliveryFailure::Cancelled => "bus stopped",
        }
    }
}

/// In-process message bus.
///
/// Built with [`MessageBus::new`], shared as `Arc<MessageBus>`, and activated
/// with [`MessageBus::start`]. Until started, sends queue up on the ingress
/// channel and nothing is delivered.
pub struct MessageBus {
    subscribers: DashMap<AgentId, MailboxSender>,
    ingress_tx: mpsc::Sender<AgentMessage>,
    ingress_rx: Mutex<Option<mpsc::Receiver<AgentMessage>>>,
    delivery_timeout: Duration,
    default_mailbox_size: usize,
    metrics: Mutex<MessageBusMetrics>,
    shutting_down: AtomicBool,
    lifecycle: CancellationToken,
    dispatcher: Mutex<Option<SupervisedTask>>,
    clock: SharedClock,
    span: Span,
}

impl MessageBus {
    pub fn new(config: &BusConfig, clock: SharedClock) -> Self {
        let (ingress_tx, ingress_rx) = mpsc::channel(config.ingress_capacity.max(1));
        Self {
            subscribers: DashMap::new(),
            ingress_tx,
            ingress_rx: Mutex::new(Some(ingress_rx)),
            delivery_timeout: config.delivery_timeout(),
            default_mailbox_size: config.default_mailbox_size.max(1),
            metrics: Mutex::new(MessageBusMetrics::default()),
            shutting_down: AtomicBool::new(false),
            lifecycle: CancellationToken::new(),
            dispatcher: Mutex::new(None),
            clock,
            span: info_span!("message_bus"),
        }
    }

    /// Tie the bus lifecycle to a parent token.
    pub fn with_lifecycle(mut self, parent: &CancellationToken) -> Self {
        self.lifecycle = parent.child_token();
        self
    }

    /// Spawn the dispatch loop. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let _enter = self.span.enter();
        if self.is_shutting_down() {
            warn!("cannot start a stopped message bus");
            return;
        }
        let Some(mut ingress) = lock(&self.ingress_rx).take() else {
            debug!("dispatch loop already running");
            return;
        };

        let bus = Arc::clone(self);
        let span = self.span.clone();
        let task = SupervisedTask::spawn("bus-dispatch", &self.lifecycle, move |token| {
            async move {
                loop {
                    let msg = tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        next = ingress.recv() => match next {
                            Some(msg) => msg,
                            None => break,
                        },
                    };
                    bus.deliver(msg).await;
                }
                debug!("dispatch loop exited");
            }
            .instrument(span)
        });
        *lock(&self.dispatcher) = Some(task);
        info!(
            delivery_timeout_ms = self.delivery_timeout.as_millis() as u64,
            "message bus started"
        );
    }

    /// Create the mailbox for `id`.
    pub fn subscribe(&self, id: AgentId, buffer_size: usize) -> Result<Mailbox, BusError> {
        let _enter = self.span.enter();
        if buffer_size == 0 {
            return Err(BusError::InvalidBufferSize);
        }
        if self.is_shutting_down() {
            return Err(BusError::ShuttingDown);
        }

        let (sender, mailbox) = mailbox::channel(id.clone(), buffer_size);
        match self.subscribers.entry(id.clone()) {
            Entry::Occupied(_) => return Err(BusError::AlreadySubscribed(id)),
            Entry::Vacant(slot) => {
                slot.insert(sender.clone());
            }
        }

        // `stop` may have cleared the table between the check above and the
        // insert; a mailbox it never saw must not stay open.
        if self.is_shutting_down() {
            self.subscribers.remove(&id);
            sender.close();
            return Err(BusError::ShuttingDown);
        }
        debug!(agent_id = %id, buffer_size, "subscribed mailbox");
        Ok(mailbox)
    }

    /// Close and remove the mailbox for `id`. Queued messages are lost.
    pub fn unsubscribe(&self, id: &AgentId) -> Result<(), BusError> {
        let _enter = self.span.enter();
        let (_, sender) = self
            .subscribers
            .remove(id)
            .ok_or_else(|| BusError::NotSubscribed(id.clone()))?;
        sender.close();
        debug!(agent_id = %id, "unsubscribed mailbox");
        Ok(())
    }

    /// Capacity for agents whose config leaves the mailbox size unset.
    pub fn default_mailbox_size(&self) -> usize {
        self.default_mailbox_size
    }

    pub fn is_subscribed(&self, id: &AgentId) -> bool {
        self.subscribers.contains_key(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Currently subscribed ids, sorted.
    pub fn subscribers(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self
            .subscribers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Queue `msg` for delivery to `msg.receiver`. Never blocks.
    pub fn send(&self, mut msg: AgentMessage) -> Result<(), BusError> {
        if self.is_shutting_down() {
            return Err(BusError::ShuttingDown);
        }
        msg.stamp(self.clock.now());

        self.ingress_tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(msg) => {
                let _enter = self.span.enter();
                warn!(receiver = %msg.receiver, "ingress queue full, message rejected");
                BusError::BusBufferFull
            }
            TrySendError::Closed(_) => BusError::ShuttingDown,
        })
    }

    /// Deliver a copy of `msg` to every subscribed mailbox, including the
    /// sender's. Returns how many copies were accepted.
    pub async fn broadcast(&self, mut msg: AgentMessage) -> Result<usize, BusError> {
        if self.is_shutting_down() {
            return Err(BusError::ShuttingDown);
        }
        msg.stamp(self.clock.now());

        let targets = self.subscribers();
        let attempted = targets.len();
        let delivered = self
            .deliver_copies(&msg, targets)
            .instrument(self.span.clone())
            .await;

        let _enter = self.span.enter();
        debug!(
            sender = %msg.sender,
            message_type = %msg.message_type(),
            attempted,
            delivered,
            "broadcast complete"
        );
        Ok(delivered)
    }

    /// Snapshot of the delivery counters.
    pub fn metrics(&self) -> MessageBusMetrics {
        lock(&self.metrics).clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Stop dispatching, close every mailbox and wait for the loop to exit.
    ///
    /// Idempotent. After this returns, `send` and `broadcast` fail with
    /// `ShuttingDown`.
    pub async fn stop(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.lifecycle.cancel();

        let dispatcher = lock(&self.dispatcher).take();
        if let Some(task) = dispatcher {
            task.join().await;
        }
        lock(&self.ingress_rx).take();

        for entry in self.subscribers.iter() {
            entry.value().close();
        }
        let closed = self.subscribers.len();
        self.subscribers.clear();

        let _enter = self.span.enter();
        info!(mailboxes_closed = closed, "message bus stopped");
    }

    /// Deliver one copy per target concurrently. Unknown targets count as
    /// failed deliveries.
    pub(crate) async fn deliver_copies(&self, msg: &AgentMessage, targets: Vec<AgentId>) -> usize {
        let deliveries = targets
            .into_iter()
            .map(|target| self.deliver(msg.readdressed(target)));
        join_all(deliveries)
            .await
            .into_iter()
            .filter(|delivered| *delivered)
            .count()
    }

    /// Move one message into its receiver's mailbox, bounded by the delivery
    /// timeout and by bus shutdown.
    pub(crate) async fn deliver(&self, msg: AgentMessage) -> bool {
        let receiver = msg.receiver.clone();
        let message_type = msg.message_type();
        lock(&self.metrics).total_messages += 1;

        let sender = self
            .subscribers
            .get(&receiver)
            .map(|entry| entry.value().clone());
        let started = Instant::now();

        let outcome = match sender {
            None => Err(DeliveryFailure::NoMailbox),
            Some(sender) => tokio::select! {
                biased;
                _ = self.lifecycle.cancelled() => Err(DeliveryFailure::Cancelled),
                _ = sender.closed.cancelled() => Err(DeliveryFailure::Closed),
                sent = sender.tx.send_timeout(msg, self.delivery_timeout) => {
                    sent.map_err(|e| match e {
                        SendTimeoutError::Timeout(_) => DeliveryFailure::Timeout,
                        SendTimeoutError::Closed(_) => DeliveryFailure::Closed,
                    })
                }
            },
        };

        match outcome {
            Ok(()) => {
                let latency_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
                {
                    let mut metrics = lock(&self.metrics);
                    metrics.successful_delivery += 1;
                    metrics.record_latency(latency_us);
                }
                debug!(%receiver, %message_type, latency_us, "delivered message");
                true
            }
            Err(failure) => {
                lock(&self.metrics).failed_delivery += 1;
                warn!(
                    %receiver,
                    %message_type,
                    reason = failure.as_str(),
                    "message delivery failed"
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("subscribers", &self.subscribers.len())
            .field("delivery_timeout", &self.delivery_timeout)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use agentry_types::message::{MessagePayload, Priority, TaskRequest};

    fn make_bus(delivery_timeout_ms: u64, ingress_capacity: usize) -> Arc<MessageBus> {
        let config = BusConfig {
            ingress_capacity,
            delivery_timeout_ms,
            ..BusConfig::default()
        };
        Arc::new(MessageBus::new(&config, SystemClock::shared()))
    }

    fn task_to(receiver: &str, suite: &str) -> AgentMessage {
        AgentMessage::new(
            AgentId::new("orchestrator"),
            AgentId::new(receiver),
            MessagePayload::Task(TaskRequest::Run {
                suite: suite.to_string(),
            }),
        )
    }

    fn suite_of(msg: &AgentMessage) -> &str {
        match &msg.payload {
            MessagePayload::Task(TaskRequest::Run { suite }) => suite,
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    async fn wait_for_metrics(
        bus: &MessageBus,
        pred: impl Fn(&MessageBusMetrics) -> bool,
    ) -> MessageBusMetrics {
        for _ in 0..400 {
            let metrics = bus.metrics();
            if pred(&metrics) {
                return metrics;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("metrics never matched: {:?}", bus.metrics());
    }

    #[tokio::test]
    async fn mailbox_preserves_send_order_regardless_of_priority() {
        let bus = make_bus(500, 64);
        bus.start();
        let mut mailbox = bus.subscribe(AgentId::new("sec"), 32).unwrap();

        let priorities = [
            Priority::Low,
            Priority::Critical,
            Priority::Medium,
            Priority::High,
            Priority::Low,
        ];
        for (i, priority) in priorities.iter().enumerate() {
            bus.send(task_to("sec", &format!("s{i}")).with_priority(*priority))
                .unwrap();
        }

        for i in 0..priorities.len() {
            let msg = mailbox.recv().await.unwrap();
            assert_eq!(suite_of(&msg), format!("s{i}"));
            assert!(msg.id.is_some());
            assert!(msg.timestamp.is_some());
        }
        bus.stop().await;
    }

    #[tokio::test]
    async fn double_subscribe_is_rejected() {
        let bus = make_bus(100, 8);
        let _mailbox = bus.subscribe(AgentId::new("sec"), 4).unwrap();

        let err = bus.subscribe(AgentId::new("sec"), 4).unwrap_err();
        assert_eq!(err, BusError::AlreadySubscribed(AgentId::new("sec")));

        bus.unsubscribe(&AgentId::new("sec")).unwrap();
        assert!(bus.subscribe(AgentId::new("sec"), 4).is_ok());
    }

    #[tokio::test]
    async fn zero_buffer_is_rejected() {
        let bus = make_bus(100, 8);
        assert_eq!(
            bus.subscribe(AgentId::new("sec"), 0).unwrap_err(),
            BusError::InvalidBufferSize
        );
        assert!(!bus.is_subscribed(&AgentId::new("sec")));
    }

    #[tokio::test]
    async fn unsubscribe_unknown_fails() {
        let bus = make_bus(100, 8);
        let err = bus.unsubscribe(&AgentId::new("ghost")).unwrap_err();
        assert!(matches!(err, BusError::NotSubscribed(_)));
    }

    #[tokio::test]
    async fn unsubscribe_closes_read_end() {
        let bus = make_bus(100, 8);
        let mut mailbox = bus.subscribe(AgentId::new("sec"), 4).unwrap();
        bus.unsubscribe(&AgentId::new("sec")).unwrap();
        assert!(mailbox.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_to_ghost_counts_failure_only() {
        let bus = make_bus(100, 8);
        bus.start();

        bus.send(task_to("ghost", "unit")).unwrap();

        let metrics = wait_for_metrics(&bus, |m| m.failed_delivery == 1).await;
        assert_eq!(metrics.successful_delivery, 0);
        assert_eq!(metrics.total_messages, 1);
        bus.stop().await;
    }

    #[tokio::test]
    async fn stop_is_terminal() {
        let bus = make_bus(100, 8);
        bus.start();
        let mut a = bus.subscribe(AgentId::new("a"), 4).unwrap();
        let mut b = bus.subscribe(AgentId::new("b"), 4).unwrap();

        bus.stop().await;
        bus.stop().await;

        assert_eq!(
            bus.send(task_to("a", "unit")).unwrap_err(),
            BusError::ShuttingDown
        );
        assert_eq!(
            bus.broadcast(task_to("a", "unit")).await.unwrap_err(),
            BusError::ShuttingDown
        );
        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);
        assert!(matches!(
            bus.subscribe(AgentId::new("c"), 1),
            Err(BusError::ShuttingDown)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn subscribe_racing_stop_never_leaves_an_open_mailbox() {
        for round in 0..50 {
            let bus = make_bus(100, 8);
            bus.start();

            let subscribers: Vec<_> = (0..8)
                .map(|i| {
                    let bus = Arc::clone(&bus);
                    tokio::spawn(async move {
                        tokio::task::yield_now().await;
                        bus.subscribe(AgentId::new(format!("agent-{round}-{i}")), 4)
                    })
                })
                .collect();
            bus.stop().await;

            for handle in subscribers {
                match handle.await.unwrap() {
                    Ok(mailbox) => assert!(mailbox.is_closed()),
                    Err(e) => assert_eq!(e, BusError::ShuttingDown),
                }
            }
            assert_eq!(bus.subscriber_count(), 0);
        }
    }

    #[tokio::test]
    async fn full_mailbox_times_out_then_recovers_after_drain() {
        let bus = make_bus(50, 8);
        bus.start();
        let mut mailbox = bus.subscribe(AgentId::new("sec"), 1).unwrap();

        bus.send(task_to("sec", "first")).unwrap();
        bus.send(task_to("sec", "second")).unwrap();

        let metrics = wait_for_metrics(&bus, |m| m.failed_delivery == 1).await;
        assert_eq!(metrics.successful_delivery, 1);

        let first = mailbox.recv().await.unwrap();
        assert_eq!(suite_of(&first), "first");

        bus.send(task_to("sec", "third")).unwrap();
        let third = mailbox.recv().await.unwrap();
        assert_eq!(suite_of(&third), "third");
        bus.stop().await;
    }

    #[tokio::test]
    async fn full_ingress_rejects_immediately() {
        // Not started, so nothing drains the ingress queue.
        let bus = make_bus(100, 2);
        bus.send(task_to("sec", "a")).unwrap();
        bus.send(task_to("sec", "b")).unwrap();
        assert_eq!(
            bus.send(task_to("sec", "c")).unwrap_err(),
            BusError::BusBufferFull
        );
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let bus = make_bus(100, 8);
        let mut sender = bus.subscribe(AgentId::new("orchestrator"), 4).unwrap();
        let mut sec = bus.subscribe(AgentId::new("sec"), 4).unwrap();
        let mut docs = bus.subscribe(AgentId::new("docs"), 4).unwrap();

        let delivered = bus.broadcast(task_to("anyone", "smoke")).await.unwrap();
        assert_eq!(delivered, 3);

        let to_sec = sec.recv().await.unwrap();
        let to_docs = docs.recv().await.unwrap();
        let to_sender = sender.recv().await.unwrap();
        assert_eq!(to_sec.receiver.as_str(), "sec");
        assert_eq!(to_docs.receiver.as_str(), "docs");
        assert_eq!(to_sender.receiver.as_str(), "orchestrator");
        assert_eq!(to_sec.id, to_docs.id);

        let metrics = bus.metrics();
        assert_eq!(metrics.total_messages, 3);
        assert_eq!(metrics.successful_delivery, 3);
    }

    #[tokio::test]
    async fn caller_supplied_identity_is_preserved() {
        let bus = make_bus(100, 8);
        bus.start();
        let mut mailbox = bus.subscribe(AgentId::new("sec"), 4).unwrap();

        let mut msg = task_to("sec", "unit");
        let id = uuid::Uuid::now_v7();
        msg.id = Some(id);
        bus.send(msg).unwrap();

        assert_eq!(mailbox.recv().await.unwrap().id, Some(id));
        bus.stop().await;
    }

    #[tokio::test]
    async fn parent_cancellation_stops_dispatch() {
        let parent = CancellationToken::new();
        let bus = Arc::new(
            MessageBus::new(&BusConfig::default(), SystemClock::shared()).with_lifecycle(&parent),
        );
        bus.start();
        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), bus.stop())
            .await
            .expect("stop should return promptly");
    }

    #[test]
    fn debug_impl() {
        let bus = make_bus(100, 8);
        let debug = format!("{bus:?}");
        assert!(debug.contains("MessageBus"));
        assert!(debug.contains("subscribers"));
    }
}
