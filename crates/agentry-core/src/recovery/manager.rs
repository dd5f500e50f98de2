//! Recovery manager with per-agent strategies, backoff and escalation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use agentry_types::agent::{AgentId, RECOVERY_MANAGER_ID};
use agentry_types::config::RecoveryConfig;
use agentry_types::event::RuntimeEvent;
use agentry_types::health::HealthStatus;
use agentry_types::message::{ErrorKind, Priority, TaskRequest};
use agentry_types::metrics::RecoveryMetrics;
use agentry_types::recovery::{RecoveryAction, RecoveryOutcome, RecoveryRecord, RecoveryStrategy};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, info_span, warn};

use crate::clock::SharedClock;
use crate::event::EventBus;
use crate::message::{MessageBus, envelope};
use crate::registry::{AgentRegistry, RegistryError};
use crate::sync::lock;

// ---------------------------------------------------------------------------
// RecoveryError
// ---------------------------------------------------------------------------

/// Terminal outcomes of a recovery run that are not a recovered agent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    /// Misconfiguration. Never retried.
    #[error("recovery of agent {agent_id} is misconfigured: {reason}")]
    Configuration { agent_id: AgentId, reason: String },

    #[error("failed to recover after {attempts} attempts (agent {agent_id}): {last_error}")]
    RecoveryFailed {
        agent_id: AgentId,
        attempts: u32,
        last_error: String,
    },

    #[error("recovery already in progress for agent {0}")]
    InProgress(AgentId),

    #[error("recovery of agent {0} was cancelled")]
    Cancelled(AgentId),
}

/// Why a single attempt failed.
enum AttemptError {
    Configuration(String),
    Transient(String),
}

/// Clears an agent's in-progress mark when dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<AgentId>>,
    id: AgentId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.set).remove(&self.id);
    }
}

// ---------------------------------------------------------------------------
// RecoveryManager
// ---------------------------------------------------------------------------

pub struct RecoveryManager {
    registry: Arc<AgentRegistry>,
    bus: Arc<MessageBus>,
    events: EventBus,
    clock: SharedClock,
    default_strategy: RecoveryStrategy,
    strategies: DashMap<AgentId, RecoveryStrategy>,
    in_progress: Mutex<HashSet<AgentId>>,
    history: Mutex<HashMap<AgentId, VecDeque<RecoveryRecord>>>,
    history_limit: usize,
    metrics: Mutex<RecoveryMetrics>,
    lifecycle: CancellationToken,
    span: Span,
}

impl RecoveryManager {
    /// Build a manager acting on `registry`. Waits use the bus clock.
    pub fn new(registry: Arc<AgentRegistry>, events: EventBus, config: &RecoveryConfig) -> Self {
        let bus = Arc::clone(registry.bus());
        let clock = Arc::clone(bus.clock());
        Self {
            registry,
            bus,
            events,
            clock,
            default_strategy: config.default_strategy.clone(),
            strategies: DashMap::new(),
            in_progress: Mutex::new(HashSet::new()),
            history: Mutex::new(HashMap::new()),
            history_limit: config.history_limit.max(1),
            metrics: Mutex::new(RecoveryMetrics::default()),
            lifecycle: CancellationToken::new(),
            span: info_span!("recovery_manager"),
        }
    }

    /// Tie pending backoff waits to a parent token.
    pub fn with_lifecycle(mut self, parent: &CancellationToken) -> Self {
        self.lifecycle = parent.child_token();
        self
    }

    /// Override the strategy for `id`. Strategies with no attempts or a
    /// shrinking backoff are rejected.
    pub fn set_recovery_strategy(
        &self,
        id: AgentId,
        strategy: RecoveryStrategy,
    ) -> Result<(), RecoveryError> {
        let _enter = self.span.enter();
        strategy
            .validate()
            .map_err(|reason| RecoveryError::Configuration {
                agent_id: id.clone(),
                reason,
            })?;
        debug!(agent_id = %id, action = %strategy.action, max_retries = strategy.max_retries, "recovery strategy set");
        self.strategies.insert(id, strategy);
        Ok(())
    }

    /// The override for `id`, or the default strategy.
    pub fn recovery_strategy(&self, id: &AgentId) -> RecoveryStrategy {
        self.strategies
            .get(id)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| self.default_strategy.clone())
    }

    pub fn metrics(&self) -> RecoveryMetrics {
        lock(&self.metrics).clone()
    }

    /// Recent recovery runs for `id`, oldest first.
    pub fn history(&self, id: &AgentId) -> Vec<RecoveryRecord> {
        lock(&self.history)
            .get(id)
            .map(|records| records.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_recovering(&self, id: &AgentId) -> bool {
        lock(&self.in_progress).contains(id)
    }

    /// Run the configured strategy against `id`.
    ///
    /// Makes at most `max_retries` attempts. After every failed attempt the
    /// manager waits `retry_delay`, multiplied by `backoff_factor` after each
    /// wait, so `R` failures wait `retry_delay * (backoff^R - 1) / (backoff - 1)`
    /// in total. Configuration errors end the run at once. Exhaustion sends a
    /// `Critical` escalation notice to the orchestrator and returns
    /// `RecoveryError::RecoveryFailed`.
    pub async fn recover_agent(
        &self,
        id: &AgentId,
        health: &HealthStatus,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        let _in_flight = self.begin(id)?;
        let strategy = self.recovery_strategy(id);
        let started_at = self.clock.now();

        lock(&self.metrics).recoveries_started += 1;
        {
            let _enter = self.span.enter();
            info!(
                agent_id = %id,
                action = %strategy.action,
                max_retries = strategy.max_retries,
                health = %health.state,
                consecutive_fails = health.consecutive_fails,
                "starting recovery"
            );
        }
        self.events.publish(RuntimeEvent::RecoveryStarted {
            agent_id: id.clone(),
            action: strategy.action,
            max_retries: strategy.max_retries,
        });

        let mut wait = strategy.retry_delay();
        let mut last_error = String::from("no attempt made");
        let mut attempts = 0;

        for attempt in 1..=strategy.max_retries {
            attempts = attempt;
            lock(&self.metrics).total_attempts += 1;

            match self.attempt(id, strategy.action).await {
                Ok(outcome) => {
                    self.finish_success(id, &strategy, outcome, attempts, started_at);
                    return Ok(outcome);
                }
                Err(AttemptError::Configuration(reason)) => {
                    self.finish_failure(id, &strategy, attempts, started_at, &reason);
                    return Err(RecoveryError::Configuration {
                        agent_id: id.clone(),
                        reason,
                    });
                }
                Err(AttemptError::Transient(reason)) => {
                    warn!(parent: &self.span, agent_id = %id, attempt, error = %reason, "recovery attempt failed");
                    last_error = reason;
                }
            }

            debug!(parent: &self.span, agent_id = %id, wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX), "backing off");
            tokio::select! {
                biased;
                _ = self.lifecycle.cancelled() => {
                    self.finish_failure(id, &strategy, attempts, started_at, "recovery cancelled");
                    return Err(RecoveryError::Cancelled(id.clone()));
                }
                _ = self.clock.sleep(wait) => {}
            }
            wait = strategy.next_delay(wait);
        }

        let error = RecoveryError::RecoveryFailed {
            agent_id: id.clone(),
            attempts,
            last_error,
        };
        self.finish_failure(id, &strategy, attempts, started_at, &error.to_string());
        self.escalate(id, &format!("automatic recovery exhausted: {error}"));
        Err(error)
    }

    fn begin(&self, id: &AgentId) -> Result<InFlight<'_>, RecoveryError> {
        if !lock(&self.in_progress).insert(id.clone()) {
            return Err(RecoveryError::InProgress(id.clone()));
        }
        Ok(InFlight {
            set: &self.in_progress,
            id: id.clone(),
        })
    }

    async fn attempt(
        &self,
        id: &AgentId,
        action: RecoveryAction,
    ) -> Result<RecoveryOutcome, AttemptError> {
        match action {
            RecoveryAction::Restart | RecoveryAction::Recreate => self.recreate(id).await,
            RecoveryAction::Reload => {
                let msg = envelope::task(
                    AgentId::new(RECOVERY_MANAGER_ID),
                    id.clone(),
                    TaskRequest::ReloadConfig,
                )
                .with_priority(Priority::Critical);
                self.bus
                    .send(msg)
                    .map_err(|e| AttemptError::Transient(format!("reload request not sent: {e}")))?;
                Ok(RecoveryOutcome::Recovered)
            }
            RecoveryAction::Escalate => {
                self.escalate(id, "manual intervention requested by recovery strategy");
                Ok(RecoveryOutcome::Escalated)
            }
        }
    }

    /// Stop the agent keeping its config, then build it again.
    async fn recreate(&self, id: &AgentId) -> Result<RecoveryOutcome, AttemptError> {
        let config = self.registry.agent_config(id).ok_or_else(|| {
            AttemptError::Configuration("no retained configuration".to_string())
        })?;
        if !self.registry.has_factory(id) {
            return Err(AttemptError::Configuration(
                "no factory registered".to_string(),
            ));
        }

        match self.registry.stop_agent_only(id).await {
            Ok(()) | Err(RegistryError::AgentNotFound(_)) => {}
            Err(e) => warn!(parent: &self.span, agent_id = %id, error = %e, "stop before recreate failed"),
        }

        match self.registry.create_agent(id.clone(), config).await {
            Ok(()) => Ok(RecoveryOutcome::Recovered),
            Err(e) if e.is_configuration() => Err(AttemptError::Configuration(e.to_string())),
            Err(e) => Err(AttemptError::Transient(e.to_string())),
        }
    }

    /// Send a `Critical` escalation notice. Never fails.
    fn escalate(&self, id: &AgentId, reason: &str) {
        let notice = envelope::alert(
            AgentId::new(RECOVERY_MANAGER_ID),
            ErrorKind::RecoveryEscalation,
            Some(id.clone()),
            format!("agent {id} needs manual intervention: {reason}"),
            true,
        );
        if let Err(e) = self.bus.send(notice) {
            warn!(parent: &self.span, agent_id = %id, error = %e, "escalation notice not sent");
        }
        lock(&self.metrics).escalations += 1;
        self.events.publish(RuntimeEvent::RecoveryEscalated {
            agent_id: id.clone(),
            reason: reason.to_string(),
        });
    }

    fn finish_success(
        &self,
        id: &AgentId,
        strategy: &RecoveryStrategy,
        outcome: RecoveryOutcome,
        attempts: u32,
        started_at: DateTime<Utc>,
    ) {
        if outcome == RecoveryOutcome::Recovered {
            lock(&self.metrics).recovered += 1;
            info!(parent: &self.span, agent_id = %id, attempts, "agent recovered");
            self.events.publish(RuntimeEvent::RecoverySucceeded {
                agent_id: id.clone(),
                attempts,
            });
        }
        self.record(RecoveryRecord {
            agent_id: id.clone(),
            action: strategy.action,
            outcome,
            attempts,
            started_at,
            finished_at: self.clock.now(),
            error: None,
        });
    }

    fn finish_failure(
        &self,
        id: &AgentId,
        strategy: &RecoveryStrategy,
        attempts: u32,
        started_at: DateTime<Utc>,
        error: &str,
    ) {
        lock(&self.metrics).failed += 1;
        warn!(parent: &self.span, agent_id = %id, attempts, %error, "recovery failed");
        self.events.publish(RuntimeEvent::RecoveryFailed {
            agent_id: id.clone(),
            attempts,
            error: error.to_string(),
        });
        self.record(RecoveryRecord {
            agent_id: id.clone(),
            action: strategy.action,
            outcome: RecoveryOutcome::Failed,
            attempts,
            started_at,
            finished_at: self.clock.now(),
            error: Some(error.to_string()),
        });
    }

    fn record(&self, record: RecoveryRecord) {
        let mut history = lock(&self.history);
        let records = history.entry(record.agent_id.clone()).or_default();
        records.push_back(record);
        while records.len() > self.history_limit {
            records.pop_front();
        }
    }
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("default_strategy", &self.default_strategy)
            .field("overrides", &self.strategies.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
