//! Agent registry: construction recipes, live instances and their lifecycle.
//!
//! The registry is the only component that constructs or destroys agents.
//! Creation is all-or-nothing: an agent is visible in the table only once it
//! has been built and started. The table lock is never held while calling
//! into an agent or the bus.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentry_types::agent::{AgentConfig, AgentId, AgentInfo, AgentStatus, REGISTRY_ID};
use agentry_types::config::RegistryConfig;
use agentry_types::error::AgentError;
use agentry_types::event::RuntimeEvent;
use agentry_types::message::ErrorKind;
use agentry_types::metrics::AgentRegistryMetrics;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::agent::{AgentFactory, BoxAgent, BoxAgentFactory};
use crate::event::EventBus;
use crate::message::{MessageBus, envelope};
use crate::sync::lock;
use crate::task::SupervisedTask;

/// Errors returned by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("factory already registered for agent {0}")]
    FactoryAlreadyRegistered(AgentId),

    #[error("agent {0} already exists")]
    AgentAlreadyExists(AgentId),

    #[error("no factory registered for agent {0}")]
    NoFactory(AgentId),

    #[error("no configuration registered for agent {0}")]
    NoConfig(AgentId),

    #[error("agent {0} not found")]
    AgentNotFound(AgentId),

    #[error("failed to construct agent {id}: {source}")]
    Construction {
        id: AgentId,
        #[source]
        source: AgentError,
    },

    #[error("failed to start agent {id}: {source}")]
    Start {
        id: AgentId,
        #[source]
        source: AgentError,
    },

    #[error("failed to stop agent {id}: {source}")]
    Stop {
        id: AgentId,
        #[source]
        source: AgentError,
    },

    #[error("agent {id} did not stop within {timeout:?}")]
    StopTimeout { id: AgentId, timeout: Duration },

    #[error("registry is stopping, agent {0} was not registered")]
    ShuttingDown(AgentId),

    #[error("failed to stop {} agent(s): {}", .failures.len(), summarize(.failures))]
    StopAll { failures: Vec<RegistryError> },
}

fn summarize(failures: &[RegistryError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl RegistryError {
    /// Misconfiguration, or a stopping registry. Retrying cannot fix either.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RegistryError::FactoryAlreadyRegistered(_)
                | RegistryError::NoFactory(_)
                | RegistryError::NoConfig(_)
                | RegistryError::ShuttingDown(_)
        )
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    created: u64,
    stopped: u64,
    creation_failures: u64,
}

/// Removes an id from the in-flight creation set when dropped.
struct Reservation<'a> {
    pending: &'a Mutex<HashSet<AgentId>>,
    id: AgentId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

/// Owns live agents and the recipes to rebuild them.
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, Arc<BoxAgent>>>,
    pending: Mutex<HashSet<AgentId>>,
    configs: DashMap<AgentId, AgentConfig>,
    factories: DashMap<AgentId, BoxAgentFactory>,
    bus: Arc<MessageBus>,
    events: EventBus,
    health_interval: Duration,
    health_timeout: Duration,
    stop_timeout: Duration,
    counters: Mutex<Counters>,
    lifecycle: CancellationToken,
    health_loop: Mutex<Option<SupervisedTask>>,
    span: Span,
}

impl AgentRegistry {
    pub fn new(bus: Arc<MessageBus>, events: EventBus, config: &RegistryConfig) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            configs: DashMap::new(),
            factories: DashMap::new(),
            bus,
            events,
            health_interval: config.health_interval(),
            health_timeout: config.health_timeout(),
            stop_timeout: config.stop_timeout(),
            counters: Mutex::new(Counters::default()),
            lifecycle: CancellationToken::new(),
            health_loop: Mutex::new(None),
            span: info_span!("agent_registry"),
        }
    }

    /// Tie the registry lifecycle to a parent token.
    pub fn with_lifecycle(mut self, parent: &CancellationToken) -> Self {
        self.lifecycle = parent.child_token();
        self
    }

    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    // -----------------------------------------------------------------------
    // Recipes
    // -----------------------------------------------------------------------

    /// Register the factory used to build agent `id`.
    pub fn register_factory(
        &self,
        id: AgentId,
        factory: impl AgentFactory + 'static,
    ) -> Result<(), RegistryError> {
        match self.factories.entry(id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::FactoryAlreadyRegistered(id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(factory));
                let _enter = self.span.enter();
                debug!(agent_id = %id, "factory registered");
                Ok(())
            }
        }
    }

    pub fn has_factory(&self, id: &AgentId) -> bool {
        self.factories.contains_key(id)
    }

    /// Persist a configuration without creating the agent.
    pub fn register_agent(&self, id: AgentId, config: AgentConfig) {
        self.configs.insert(id, config);
    }

    pub fn agent_config(&self, id: &AgentId) -> Option<AgentConfig> {
        self.configs.get(id).map(|entry| entry.value().clone())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Build and start agent `id`, then register it.
    ///
    /// On construction or start failure nothing is registered. Once
    /// [`AgentRegistry::stop_all`] has begun, creation fails with
    /// `ShuttingDown` and an agent started in the meantime is stopped again.
    pub async fn create_agent(&self, id: AgentId, config: AgentConfig) -> Result<(), RegistryError> {
        if self.lifecycle.is_cancelled() {
            return Err(RegistryError::ShuttingDown(id));
        }
        let _reservation = self.reserve(&id)?;
        if self.agents.read().await.contains_key(&id) {
            return Err(RegistryError::AgentAlreadyExists(id));
        }

        let factory = self
            .factories
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RegistryError::NoFactory(id.clone()))?;

        let agent = match factory.create(&id, &config, &self.bus) {
            Ok(agent) => agent,
            Err(source) => {
                lock(&self.counters).creation_failures += 1;
                return Err(RegistryError::Construction { id, source });
            }
        };

        if let Err(source) = agent.start().await {
            lock(&self.counters).creation_failures += 1;
            if let Err(e) = agent.stop().await {
                debug!(parent: &self.span, agent_id = %id, error = %e, "cleanup after failed start");
            }
            return Err(RegistryError::Start { id, source });
        }

        let kind = config.kind.clone();
        {
            // stop_all cancels before it swaps the table out, so checking under
            // the write lock decides which side owns the new agent.
            let mut agents = self.agents.write().await;
            if self.lifecycle.is_cancelled() {
                drop(agents);
                warn!(parent: &self.span, agent_id = %id, "registry stopping, discarding new agent");
                if let Err(e) = self.shutdown_agent(Arc::new(agent)).await {
                    debug!(parent: &self.span, agent_id = %id, error = %e, "cleanup after cancelled create");
                }
                return Err(RegistryError::ShuttingDown(id));
            }
            self.configs.insert(id.clone(), config);
            agents.insert(id.clone(), Arc::new(agent));
        }
        lock(&self.counters).created += 1;

        info!(parent: &self.span, agent_id = %id, %kind, "agent created");
        self.events.publish(RuntimeEvent::AgentCreated { agent_id: id, kind });
        Ok(())
    }

    /// Create agent `id` from its persisted configuration.
    pub async fn start_agent(&self, id: &AgentId) -> Result<(), RegistryError> {
        let config = self
            .agent_config(id)
            .ok_or_else(|| RegistryError::NoConfig(id.clone()))?;
        self.create_agent(id.clone(), config).await
    }

    /// Stop agent `id` and forget its configuration.
    pub async fn stop_agent(&self, id: &AgentId) -> Result<(), RegistryError> {
        let agent = self.detach(id).await?;
        let result = self.shutdown_agent(agent).await;
        self.configs.remove(id);
        self.events.publish(RuntimeEvent::AgentStopped {
            agent_id: id.clone(),
            config_retained: false,
        });
        result
    }

    /// Stop agent `id` but keep its configuration for a later restart.
    pub async fn stop_agent_only(&self, id: &AgentId) -> Result<(), RegistryError> {
        let agent = self.detach(id).await?;
        let result = self.shutdown_agent(agent).await;
        self.events.publish(RuntimeEvent::AgentStopped {
            agent_id: id.clone(),
            config_retained: true,
        });
        result
    }

    /// Halt the health loop and stop every agent concurrently.
    ///
    /// The table is always cleared. Individual failures are collected into
    /// `RegistryError::StopAll`.
    pub async fn stop_all(&self) -> Result<(), RegistryError> {
        self.lifecycle.cancel();
        let health_loop = lock(&self.health_loop).take();
        if let Some(task) = health_loop {
            task.join().await;
        }

        let agents = std::mem::take(&mut *self.agents.write().await);
        let count = agents.len();
        let results = join_all(agents.into_values().map(|agent| async move {
            let id = agent.id().clone();
            (id, self.shutdown_agent(agent).await)
        }))
        .await;

        let mut failures = Vec::new();
        for (id, result) in results {
            self.events.publish(RuntimeEvent::AgentStopped {
                agent_id: id,
                config_retained: true,
            });
            if let Err(e) = result {
                failures.push(e);
            }
        }

        let _enter = self.span.enter();
        if failures.is_empty() {
            info!(agents = count, "all agents stopped");
            Ok(())
        } else {
            warn!(agents = count, failed = failures.len(), "some agents failed to stop");
            Err(RegistryError::StopAll { failures })
        }
    }

    fn reserve(&self, id: &AgentId) -> Result<Reservation<'_>, RegistryError> {
        if !lock(&self.pending).insert(id.clone()) {
            return Err(RegistryError::AgentAlreadyExists(id.clone()));
        }
        Ok(Reservation {
            pending: &self.pending,
            id: id.clone(),
        })
    }

    async fn detach(&self, id: &AgentId) -> Result<Arc<BoxAgent>, RegistryError> {
        self.agents
            .write()
            .await
            .remove(id)
            .ok_or_else(|| RegistryError::AgentNotFound(id.clone()))
    }

    /// Graceful stop bounded by the stop timeout. The agent is already out of
    /// the table, so a failure here never leaves it registered.
    async fn shutdown_agent(&self, agent: Arc<BoxAgent>) -> Result<(), RegistryError> {
        let id = agent.id().clone();
        let timeout = self.stop_timeout;
        let result = match tokio::time::timeout(timeout, agent.stop()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(RegistryError::Stop {
                id: id.clone(),
                source,
            }),
            Err(_) => Err(RegistryError::StopTimeout {
                id: id.clone(),
                timeout,
            }),
        };

        let _enter = self.span.enter();
        match &result {
            Ok(()) => {
                lock(&self.counters).stopped += 1;
                info!(agent_id = %id, "agent stopped");
            }
            Err(e) => warn!(agent_id = %id, error = %e, "agent stop failed"),
        }
        result
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn agent(&self, id: &AgentId) -> Option<Arc<BoxAgent>> {
        self.agents.read().await.get(id).cloned()
    }

    pub async fn agent_status(&self, id: &AgentId) -> Option<AgentStatus> {
        let agent = self.agent(id).await?;
        Some(agent.status())
    }

    /// Live agent ids, sorted.
    pub async fn agent_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.agents.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn agent_count(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Id, status and capabilities of every live agent, sorted by id.
    pub async fn list_agents(&self) -> Vec<AgentInfo> {
        let mut infos: Vec<AgentInfo> = self.snapshot().await.iter().map(|a| a.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Point-in-time classification plus lifetime counters.
    pub async fn metrics(&self) -> AgentRegistryMetrics {
        let agents = self.snapshot().await;
        let counters = *lock(&self.counters);

        let mut metrics = AgentRegistryMetrics {
            total_agents: agents.len(),
            agents_created: counters.created,
            agents_stopped: counters.stopped,
            creation_failures: counters.creation_failures,
            last_updated: Some(self.bus.clock().now()),
            ..AgentRegistryMetrics::default()
        };
        for agent in &agents {
            let status = agent.status();
            if status.is_active() {
                metrics.active_agents += 1;
            } else if status.is_failed() {
                metrics.failed_agents += 1;
            }
        }
        metrics
    }

    async fn snapshot(&self) -> Vec<Arc<BoxAgent>> {
        self.agents.read().await.values().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Background health loop
    // -----------------------------------------------------------------------

    /// Spawn the periodic health loop. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut slot = lock(&self.health_loop);
        if slot.is_some() || self.lifecycle.is_cancelled() {
            return;
        }

        let registry = Arc::clone(self);
        let period = self.health_interval;
        let task = SupervisedTask::spawn("registry-health", &self.lifecycle, move |token| {
            async move {
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        _ = registry.health_sweep() => {}
                    }
                }
                debug!("registry health loop exited");
            }
            .instrument(self.span.clone())
        });
        *slot = Some(task);

        let _enter = self.span.enter();
        info!(interval_secs = period.as_secs_f64(), "registry health loop started");
    }

    /// Check every live agent once and alert the orchestrator about each
    /// failure. Returns the ids that failed.
    pub async fn health_sweep(&self) -> Vec<AgentId> {
        let agents = self.snapshot().await;
        let timeout = self.health_timeout;

        let checks = agents.iter().map(|agent| async move {
            let check = AssertUnwindSafe(agent.health_check()).catch_unwind();
            let result = match tokio::time::timeout(timeout, check).await {
                Ok(Ok(Ok(()))) => Ok(()),
                Ok(Ok(Err(e))) => Err(e.to_string()),
                Ok(Err(_)) => Err("health check panicked".to_string()),
                Err(_) => Err(format!("health check timed out after {timeout:?}")),
            };
            (agent.id().clone(), result)
        });

        let mut failed = Vec::new();
        for (id, result) in join_all(checks).await {
            let Err(reason) = result else { continue };
            warn!(parent: &self.span, agent_id = %id, %reason, "agent health check failed");
            let alert = envelope::alert(
                AgentId::new(REGISTRY_ID),
                ErrorKind::HealthCheckFailed,
                Some(id.clone()),
                format!("health check failed for agent {id}: {reason}"),
                false,
            );
            if let Err(e) = self.bus.send(alert) {
                debug!(parent: &self.span, error = %e, "could not deliver health alert");
            }
            failed.push(id);
        }
        failed
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("factories", &self.factories.len())
            .field("configs", &self.configs.len())
            .field("stop_timeout", &self.stop_timeout)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
