//! Shared plumbing for workers.
//!
//! `BaseAgent` owns the status cell, a handler table keyed by `MessageType`,
//! the mailbox subscription and the processing loop. Workers either use it
//! directly with registered handlers or wrap it and delegate the `Agent`
//! methods they do not override.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use agentry_types::agent::{AgentId, AgentStatus};
use agentry_types::error::AgentError;
use agentry_types::message::{AgentMessage, MessagePayload, MessageType};
use agentry_types::metrics::AgentMetrics;
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use super::contract::Agent;
use crate::message::envelope;
use crate::message::{BusError, Mailbox, MessageBus};
use crate::sync::{lock, read, write};
use crate::task::SupervisedTask;

/// Async handler for one message type.
pub type MessageHandler =
    Arc<dyn Fn(AgentMessage) -> BoxFuture<'static, Result<(), AgentError>> + Send + Sync>;

struct Shared {
    id: AgentId,
    capabilities: Vec<String>,
    mailbox_size: usize,
    bus: Arc<MessageBus>,
    status: RwLock<AgentStatus>,
    handlers: RwLock<HashMap<MessageType, MessageHandler>>,
    metrics: Mutex<AgentMetrics>,
    worker: Mutex<Option<SupervisedTask>>,
    started: AtomicBool,
    lifecycle: CancellationToken,
    span: Span,
}

/// Reusable agent core. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct BaseAgent {
    shared: Arc<Shared>,
}

impl BaseAgent {
    pub fn new(
        id: AgentId,
        capabilities: Vec<String>,
        mailbox_size: usize,
        bus: Arc<MessageBus>,
    ) -> Self {
        let span = info_span!("agent", agent_id = %id);
        Self {
            shared: Arc::new(Shared {
                id,
                capabilities,
                mailbox_size,
                bus,
                status: RwLock::new(AgentStatus::Offline),
                handlers: RwLock::new(HashMap::new()),
                metrics: Mutex::new(AgentMetrics::default()),
                worker: Mutex::new(None),
                started: AtomicBool::new(false),
                lifecycle: CancellationToken::new(),
                span,
            }),
        }
    }

    /// Install the handler for `message_type`, replacing any previous one.
    pub fn register_handler<F, Fut>(&self, message_type: MessageType, handler: F)
    where
        F: Fn(AgentMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AgentError>> + Send + 'static,
    {
        let boxed: MessageHandler = Arc::new(
            move |msg: AgentMessage| -> BoxFuture<'static, Result<(), AgentError>> {
                Box::pin(handler(msg))
            },
        );
        write(&self.shared.handlers).insert(message_type, boxed);
    }

    pub fn has_handler(&self, message_type: MessageType) -> bool {
        read(&self.shared.handlers).contains_key(&message_type)
    }

    pub fn set_status(&self, status: AgentStatus) {
        *write(&self.shared.status) = status;
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.shared.bus
    }

    /// Capacity of the mailbox subscribed on `start`.
    pub fn mailbox_size(&self) -> usize {
        self.shared.mailbox_size
    }

    /// Queue a message on the bus.
    pub fn send(&self, msg: AgentMessage) -> Result<(), AgentError> {
        self.shared
            .bus
            .send(msg)
            .map_err(|e| AgentError::Bus(e.to_string()))
    }

    /// Answer `original` through the bus.
    pub fn reply(&self, original: &AgentMessage, payload: MessagePayload) -> Result<(), AgentError> {
        self.send(envelope::reply(self.shared.id.clone(), original, payload))
    }

    fn worker_alive(&self) -> bool {
        lock(&self.shared.worker)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Shared {
    async fn dispatch(&self, msg: AgentMessage) -> Result<(), AgentError> {
        let message_type = msg.message_type();
        let handler = read(&self.handlers).get(&message_type).cloned();
        match handler {
            Some(handler) => handler(msg).await,
            None => Err(AgentError::NoHandler(message_type)),
        }
    }

    /// Run one message through its handler and account for it.
    async fn handle(&self, msg: AgentMessage) {
        let message_type = msg.message_type();
        let sender = msg.sender.clone();
        self.transition(AgentStatus::Idle, AgentStatus::Busy);

        let started = Instant::now();
        let result = self.dispatch(msg).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        {
            let mut metrics = lock(&self.metrics);
            match &result {
                Ok(()) => metrics.messages_processed += 1,
                Err(_) => metrics.messages_failed += 1,
            }
            *metrics
                .processing_ms_by_type
                .entry(message_type.to_string())
                .or_insert(0) += elapsed_ms;
            metrics.last_activity = Some(self.bus.clock().now());
        }
        self.transition(AgentStatus::Busy, AgentStatus::Idle);

        if let Err(e) = result {
            warn!(%sender, %message_type, error = %e, "message processing failed");
        } else {
            debug!(%sender, %message_type, elapsed_ms, "message processed");
        }
    }

    fn transition(&self, from: AgentStatus, to: AgentStatus) {
        let mut status = write(&self.status);
        if *status == from {
            *status = to;
        }
    }
}

async fn process_mailbox(shared: Arc<Shared>, mut mailbox: Mailbox, token: CancellationToken) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = mailbox.recv() => match next {
                Some(msg) => msg,
                None => break,
            },
        };
        shared.handle(msg).await;
    }
    debug!("processing loop exited");
}

impl Agent for BaseAgent {
    fn id(&self) -> &AgentId {
        &self.shared.id
    }

    fn status(&self) -> AgentStatus {
        *read(&self.shared.status)
    }

    fn capabilities(&self) -> &[String] {
        &self.shared.capabilities
    }

    async fn start(&self) -> Result<(), AgentError> {
        let shared = &self.shared;
        if shared.started.swap(true, Ordering::SeqCst) {
            return Err(AgentError::AlreadyStarted);
        }
        self.set_status(AgentStatus::Starting);

        let mailbox = match shared.bus.subscribe(shared.id.clone(), shared.mailbox_size) {
            Ok(mailbox) => mailbox,
            Err(e) => {
                self.set_status(AgentStatus::Error);
                return Err(AgentError::Bus(e.to_string()));
            }
        };

        let loop_state = Arc::clone(shared);
        let span = shared.span.clone();
        let task = SupervisedTask::spawn(
            format!("agent-{}", shared.id),
            &shared.lifecycle,
            move |token| process_mailbox(loop_state, mailbox, token).instrument(span),
        );
        *lock(&shared.worker) = Some(task);

        lock(&shared.metrics).started_at = Some(shared.bus.clock().now());
        self.set_status(AgentStatus::Idle);

        let _enter = shared.span.enter();
        info!(capabilities = ?shared.capabilities, "agent started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), AgentError> {
        let shared = &self.shared;
        if Agent::status(self) != AgentStatus::Offline {
            self.set_status(AgentStatus::Stopping);
        }

        let worker = lock(&shared.worker).take();
        if let Some(task) = worker {
            task.shutdown().await;
        }

        match shared.bus.unsubscribe(&shared.id) {
            Ok(()) | Err(BusError::NotSubscribed(_)) => {}
            Err(e) => {
                let _enter = shared.span.enter();
                debug!(error = %e, "unsubscribe during stop");
            }
        }

        self.set_status(AgentStatus::Offline);
        let _enter = shared.span.enter();
        info!("agent stopped");
        Ok(())
    }

    async fn process_message(&self, msg: AgentMessage) -> Result<(), AgentError> {
        self.shared.dispatch(msg).await
    }

    async fn health_check(&self) -> Result<(), AgentError> {
        let status = Agent::status(self);
        if !status.is_active() {
            return Err(AgentError::HealthCheck(format!("agent is {status:?}")));
        }
        if !self.worker_alive() {
            return Err(AgentError::HealthCheck(
                "processing loop is not running".to_string(),
            ));
        }
        Ok(())
    }

    fn metrics(&self) -> AgentMetrics {
        lock(&self.shared.metrics).clone()
    }
}

impl std::fmt::Debug for BaseAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseAgent")
            .field("id", &self.shared.id)
            .field("status", &*read(&self.shared.status))
            .field("handlers", &read(&self.shared.handlers).len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
