//! Composition root for the agent runtime.
//!
//! `AgentRuntime` builds the message bus, registry, health monitor and
//! recovery manager from one `RuntimeConfig` and ties their lifecycles to a
//! single root token. Shutdown runs in reverse dependency order: the
//! auto-recovery listener first, the message bus last.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use agentry_types::agent::AgentId;
use agentry_types::config::RuntimeConfig;
use agentry_types::event::RuntimeEvent;
use agentry_types::health::HealthState;
use agentry_types::recovery::RecoveryOutcome;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::clock::SharedClock;
use crate::event::EventBus;
use crate::health::HealthMonitor;
use crate::message::{MessageBus, MessageRouter};
use crate::recovery::{RecoveryError, RecoveryManager};
use crate::registry::{AgentRegistry, RegistryError};
use crate::sync::lock;
use crate::task::SupervisedTask;

pub struct AgentRuntime {
    config: RuntimeConfig,
    lifecycle: CancellationToken,
    events: EventBus,
    bus: Arc<MessageBus>,
    router: Arc<MessageRouter>,
    registry: Arc<AgentRegistry>,
    monitor: Arc<HealthMonitor>,
    recovery: Arc<RecoveryManager>,
    auto_recovery: Mutex<Option<SupervisedTask>>,
    started: AtomicBool,
    span: Span,
}

impl AgentRuntime {
    /// Build every component. Nothing runs until [`AgentRuntime::start`].
    pub fn new(config: RuntimeConfig, clock: SharedClock) -> Self {
        let lifecycle = CancellationToken::new();
        let events = EventBus::default();

        let bus = Arc::new(MessageBus::new(&config.bus, clock).with_lifecycle(&lifecycle));
        let router = Arc::new(MessageRouter::new(Arc::clone(&bus)));
        let registry = Arc::new(
            AgentRegistry::new(Arc::clone(&bus), events.clone(), &config.registry)
                .with_lifecycle(&lifecycle),
        );
        let monitor = Arc::new(
            HealthMonitor::new(Arc::clone(&registry), events.clone(), &config.health)
                .with_lifecycle(&lifecycle),
        );
        let recovery = Arc::new(
            RecoveryManager::new(Arc::clone(&registry), events.clone(), &config.recovery)
                .with_lifecycle(&lifecycle),
        );

        Self {
            config,
            lifecycle,
            events,
            bus,
            router,
            registry,
            monitor,
            recovery,
            auto_recovery: Mutex::new(None),
            started: AtomicBool::new(false),
            span: info_span!("agent_runtime"),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Start the background loops and load the configured recipes.
    ///
    /// Agents are only registered here; call
    /// [`AgentRuntime::start_configured_agents`] once their factories exist.
    /// Calling `start` twice is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.bus.start();

        for (id, strategy) in &self.config.recovery.overrides {
            if let Err(e) = self
                .recovery
                .set_recovery_strategy(AgentId::new(id.as_str()), strategy.clone())
            {
                warn!(parent: &self.span, agent_id = %id, error = %e, "recovery override ignored");
            }
        }
        for (id, agent) in &self.config.agents {
            self.registry
                .register_agent(AgentId::new(id.as_str()), agent.clone());
        }

        self.registry.start();
        self.monitor.start();

        if self.config.recovery.auto_recover {
            self.spawn_auto_recovery();
        }

        let _enter = self.span.enter();
        info!(
            configured_agents = self.config.agents.len(),
            auto_recover = self.config.recovery.auto_recover,
            "agent runtime started"
        );
    }

    /// Start every enabled configured agent that has a factory.
    ///
    /// Failures are collected per agent; one bad agent does not keep the
    /// others from starting.
    pub async fn start_configured_agents(&self) -> Vec<(AgentId, RegistryError)> {
        let mut failures = Vec::new();
        for (id, agent) in &self.config.agents {
            let id = AgentId::new(id.as_str());
            if !agent.enabled {
                debug!(parent: &self.span, agent_id = %id, "agent disabled, not starting");
                continue;
            }
            if !self.registry.has_factory(&id) {
                warn!(parent: &self.span, agent_id = %id, kind = %agent.kind, "no factory for configured agent");
                continue;
            }
            if let Err(e) = self.registry.start_agent(&id).await {
                warn!(parent: &self.span, agent_id = %id, error = %e, "configured agent failed to start");
                failures.push((id, e));
            }
        }
        failures
    }

    /// Stop everything in reverse order and release the root token.
    ///
    /// Returns the registry's aggregate stop error, if any.
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        let auto_recovery = lock(&self.auto_recovery).take();
        if let Some(task) = auto_recovery {
            task.shutdown().await;
        }

        self.monitor.stop().await;
        let result = self.registry.stop_all().await;
        self.bus.stop().await;
        self.lifecycle.cancel();

        match &result {
            Ok(()) => info!(parent: &self.span, "agent runtime stopped"),
            Err(e) => warn!(parent: &self.span, error = %e, "agent runtime stopped with errors"),
        }
        result
    }

    /// Listen for agents turning unhealthy and hand them to recovery.
    fn spawn_auto_recovery(&self) {
        let mut slot = lock(&self.auto_recovery);
        if slot.is_some() {
            return;
        }

        let mut rx = self.events.subscribe();
        let monitor = Arc::clone(&self.monitor);
        let recovery = Arc::clone(&self.recovery);
        let span = self.span.clone();

        let task = SupervisedTask::spawn("auto-recovery", &self.lifecycle, move |token| {
            async move {
                let mut running = JoinSet::new();
                loop {
                    let event = tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        Some(_) = running.join_next(), if !running.is_empty() => continue,
                        event = rx.recv() => event,
                    };

                    let agent_id = match event {
                        Ok(RuntimeEvent::HealthChanged {
                            agent_id,
                            to: HealthState::Unhealthy,
                            ..
                        }) => agent_id,
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "auto-recovery lagged behind runtime events");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    };

                    let health = monitor.health_status(&agent_id).unwrap_or_default();
                    let recovery = Arc::clone(&recovery);
                    let monitor = Arc::clone(&monitor);
                    running.spawn(
                        async move {
                            match recovery.recover_agent(&agent_id, &health).await {
                                Ok(RecoveryOutcome::Recovered) => {
                                    // The new instance earns its own failure streak
                                    monitor.reset(&agent_id);
                                    debug!(agent_id = %agent_id, "auto-recovery finished")
                                }
                                Ok(outcome) => {
                                    debug!(agent_id = %agent_id, ?outcome, "auto-recovery finished")
                                }
                                Err(RecoveryError::InProgress(_)) => {
                                    debug!(agent_id = %agent_id, "recovery already running")
                                }
                                Err(e) => {
                                    warn!(agent_id = %agent_id, error = %e, "auto-recovery failed")
                                }
                            }
                        }
                        .in_current_span(),
                    );
                }
                running.shutdown().await;
                debug!("auto-recovery listener exited");
            }
            .instrument(span)
        });
        *slot = Some(task);
    }
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("agents", &self.config.agents.len())
            .field("shut_down", &self.lifecycle.is_cancelled())
            .finish()
    }
}

// ---- Tests ----
