//! Periodic, concurrent health checking with a consecutive-failure state
//! machine.
//!
//! Each sweep issues one check per live agent in a `JoinSet`, bounded by the
//! check timeout. A panicking check is caught and recorded as a failure, so a
//! single misbehaving agent never aborts the sweep. After all checks finish,
//! the aggregate is analyzed and a `High` system alert is raised when any
//! agent is unhealthy or more than half are degraded.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use agentry_types::agent::{AgentId, HEALTH_MONITOR_ID};
use agentry_types::config::HealthConfig;
use agentry_types::event::RuntimeEvent;
use agentry_types::health::{HealthState, HealthStatus};
use agentry_types::message::{ErrorKind, Priority};
use agentry_types::metrics::HealthMonitorMetrics;
use futures_util::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::event::EventBus;
use crate::message::{MessageBus, envelope};
use crate::registry::AgentRegistry;
use crate::sync::{lock, read, write};
use crate::task::SupervisedTask;

#[derive(Debug)]
enum CheckOutcome {
    Passed,
    Failed(String),
    Missing,
}

/// Health monitor over the agents of one registry.
pub struct HealthMonitor {
    registry: Arc<AgentRegistry>,
    bus: Arc<MessageBus>,
    events: EventBus,
    statuses: RwLock<HashMap<AgentId, HealthStatus>>,
    check_interval: Duration,
    check_timeout: Duration,
    max_failures: u32,
    metrics: Mutex<HealthMonitorMetrics>,
    lifecycle: CancellationToken,
    sweeper: Mutex<Option<SupervisedTask>>,
    span: Span,
}

impl HealthMonitor {
    pub fn new(registry: Arc<AgentRegistry>, events: EventBus, config: &HealthConfig) -> Self {
        let bus = Arc::clone(registry.bus());
        Self {
            registry,
            bus,
            events,
            statuses: RwLock::new(HashMap::new()),
            check_interval: config.check_interval(),
            check_timeout: config.check_timeout(),
            max_failures: config.max_failures.max(1),
            metrics: Mutex::new(HealthMonitorMetrics::default()),
            lifecycle: CancellationToken::new(),
            sweeper: Mutex::new(None),
            span: info_span!("health_monitor"),
        }
    }

    /// Tie the monitor lifecycle to a parent token.
    pub fn with_lifecycle(mut self, parent: &CancellationToken) -> Self {
        self.lifecycle = parent.child_token();
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    /// Spawn the periodic sweep. Calling it again while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut slot = lock(&self.sweeper);
        if slot.is_some() || self.lifecycle.is_cancelled() {
            return;
        }

        let monitor = Arc::clone(self);
        let period = self.check_interval;
        let task = SupervisedTask::spawn("health-sweep", &self.lifecycle, move |token| {
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
                        _ = monitor.check_all() => {}
                    }
                }
                debug!("health sweep loop exited");
            }
            .instrument(self.span.clone())
        });
        *slot = Some(task);

        let _enter = self.span.enter();
        info!(
            interval_secs = period.as_secs_f64(),
            max_failures = self.max_failures,
            "health monitor started"
        );
    }

    /// Stop the periodic sweep and wait for it. Tracked state is kept.
    pub async fn stop(&self) {
        let sweeper = lock(&self.sweeper).take();
        if let Some(task) = sweeper {
            task.shutdown().await;
            let _enter = self.span.enter();
            info!("health monitor stopped");
        }
    }

    /// Check a single agent now and return its updated status.
    pub async fn check_agent(&self, id: &AgentId) -> HealthStatus {
        let started = Instant::now();
        let outcome = match self.registry.agent(id).await {
            Some(agent) => {
                let timeout = self.check_timeout;
                run_check(timeout, async move { agent.health_check().await }).await
            }
            None => CheckOutcome::Missing,
        };
        self.apply(id, outcome, elapsed_ms(started))
    }

    /// One full sweep: check every live agent concurrently, mark vanished
    /// agents `Unknown`, then analyze system health. Returns the statuses of
    /// the agents checked in this sweep.
    pub async fn check_all(&self) -> HashMap<AgentId, HealthStatus> {
        let ids = self.registry.agent_ids().await;
        let timeout = self.check_timeout;

        let mut checks = JoinSet::new();
        for id in &ids {
            let agent = self.registry.agent(id).await;
            let id = id.clone();
            checks.spawn(async move {
                let started = Instant::now();
                let outcome = match agent {
                    Some(agent) => run_check(timeout, async move { agent.health_check().await }).await,
                    None => CheckOutcome::Missing,
                };
                (id, outcome, elapsed_ms(started))
            });
        }

        let mut swept = HashMap::with_capacity(ids.len());
        while let Some(joined) = checks.join_next().await {
            match joined {
                Ok((id, outcome, ms)) => {
                    let status = self.apply(&id, outcome, ms);
                    swept.insert(id, status);
                }
                Err(e) => warn!(parent: &self.span, error = %e, "health check task failed"),
            }
        }

        let vanished: Vec<AgentId> = read(&self.statuses)
            .keys()
            .filter(|id| !swept.contains_key(*id))
            .cloned()
            .collect();
        for id in vanished {
            self.apply(&id, CheckOutcome::Missing, 0);
        }

        self.analyze(&swept);
        swept
    }

    /// Copy of the tracked status of `id`.
    pub fn health_status(&self, id: &AgentId) -> Option<HealthStatus> {
        read(&self.statuses).get(id).cloned()
    }

    /// Copies of every tracked status.
    pub fn all_health_status(&self) -> HashMap<AgentId, HealthStatus> {
        read(&self.statuses).clone()
    }

    /// Clear the failure streak of `id` so its next failures run through the
    /// state machine again. Returns the status as it was before the reset.
    pub fn reset(&self, id: &AgentId) -> Option<HealthStatus> {
        let (previous, consecutive_fails) = {
            let mut statuses = write(&self.statuses);
            let status = statuses.get_mut(id)?;
            let before = status.clone();
            status.reset();
            (before, status.consecutive_fails)
        };

        if previous.state != HealthState::Unknown {
            let _enter = self.span.enter();
            info!(agent_id = %id, from = %previous.state, "agent health reset");
            self.events.publish(RuntimeEvent::HealthChanged {
                agent_id: id.clone(),
                from: previous.state,
                to: HealthState::Unknown,
                consecutive_fails,
            });
        }
        Some(previous)
    }

    /// Drop the tracked state of a removed agent.
    pub fn forget(&self, id: &AgentId) -> Option<HealthStatus> {
        write(&self.statuses).remove(id)
    }

    pub fn metrics(&self) -> HealthMonitorMetrics {
        let mut metrics = lock(&self.metrics).clone();
        let statuses = read(&self.statuses);
        metrics.healthy_agents = count_in(&statuses, HealthState::Healthy);
        metrics.degraded_agents = count_in(&statuses, HealthState::Degraded);
        metrics.unhealthy_agents = count_in(&statuses, HealthState::Unhealthy);
        metrics
    }

    /// Fold one check result into the state machine.
    fn apply(&self, id: &AgentId, outcome: CheckOutcome, response_ms: u64) -> HealthStatus {
        let now = self.bus.clock().now();
        let failed = !matches!(outcome, CheckOutcome::Passed);

        let (previous, current) = {
            let mut statuses = write(&self.statuses);
            if matches!(outcome, CheckOutcome::Missing) && !statuses.contains_key(id) {
                let mut status = HealthStatus::default();
                status.record_missing(now);
                return status;
            }
            let status = statuses.entry(id.clone()).or_default();
            let previous = status.state;
            match &outcome {
                CheckOutcome::Passed => status.record_success(now, response_ms),
                CheckOutcome::Failed(reason) => {
                    status.record_failure(now, response_ms, reason.clone(), self.max_failures);
                    *status.metrics.entry("failures".to_string()).or_insert(0.0) += 1.0;
                }
                CheckOutcome::Missing => status.record_missing(now),
            }
            *status.metrics.entry("checks".to_string()).or_insert(0.0) += 1.0;
            (previous, status.clone())
        };

        {
            let mut metrics = lock(&self.metrics);
            metrics.total_checks += 1;
            if failed {
                metrics.failed_checks += 1;
            }
        }

        let _enter = self.span.enter();
        if previous != current.state {
            info!(
                agent_id = %id,
                from = %previous,
                to = %current.state,
                consecutive_fails = current.consecutive_fails,
                "agent health changed"
            );
            self.events.publish(RuntimeEvent::HealthChanged {
                agent_id: id.clone(),
                from: previous,
                to: current.state,
                consecutive_fails: current.consecutive_fails,
            });
        } else if let CheckOutcome::Failed(reason) = &outcome {
            debug!(agent_id = %id, %reason, consecutive_fails = current.consecutive_fails, "health check failed");
        }

        if current.state == HealthState::Unhealthy {
            let alert = envelope::alert(
                AgentId::new(HEALTH_MONITOR_ID),
                ErrorKind::AgentUnhealthy,
                Some(id.clone()),
                format!(
                    "agent {id} is unhealthy after {} consecutive failures: {}",
                    current.consecutive_fails,
                    current.error_message.as_deref().unwrap_or("unknown error")
                ),
                true,
            );
            self.send_alert(alert);
        }
        current
    }

    fn analyze(&self, swept: &HashMap<AgentId, HealthStatus>) {
        let total = swept.len();
        let healthy = count_in(swept, HealthState::Healthy);
        let degraded = count_in(swept, HealthState::Degraded);
        let unhealthy = count_in(swept, HealthState::Unhealthy);

        {
            let mut metrics = lock(&self.metrics);
            metrics.sweeps += 1;
            metrics.last_sweep = Some(self.bus.clock().now());
        }

        let _enter = self.span.enter();
        info!(total, healthy, degraded, unhealthy, "health sweep complete");

        if unhealthy > 0 || degraded * 2 > total {
            let alert = envelope::alert(
                AgentId::new(HEALTH_MONITOR_ID),
                ErrorKind::SystemDegraded,
                None,
                format!(
                    "system health degraded: {unhealthy} unhealthy, {degraded} degraded of {total} agents"
                ),
                unhealthy > 0,
            )
            .with_priority(Priority::High);
            self.send_alert(alert);
        }
    }

    fn send_alert(&self, alert: agentry_types::message::AgentMessage) {
        match self.bus.send(alert) {
            Ok(()) => lock(&self.metrics).alerts_sent += 1,
            Err(e) => warn!(error = %e, "could not send health alert"),
        }
    }
}

async fn run_check<F>(timeout: Duration, check: F) -> CheckOutcome
where
    F: std::future::Future<Output = Result<(), agentry_types::error::AgentError>>,
{
    match tokio::time::timeout(timeout, AssertUnwindSafe(check).catch_unwind()).await {
        Ok(Ok(Ok(()))) => CheckOutcome::Passed,
        Ok(Ok(Err(e))) => CheckOutcome::Failed(e.to_string()),
        Ok(Err(_)) => {
            warn!("health check panicked");
            CheckOutcome::Failed("health check panicked".to_string())
        }
        Err(_) => CheckOutcome::Failed(format!("health check timed out after {timeout:?}")),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn count_in(statuses: &HashMap<AgentId, HealthStatus>, state: HealthState) -> usize {
    statuses.values().filter(|s| s.state == state).count()
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("tracked", &read(&self.statuses).len())
            .field("check_interval", &self.check_interval)
            .field("max_failures", &self.max_failures)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Switches, scripted_factory, started_bus};
    use agentry_types::agent::AgentConfig;
    use agentry_types::config::RegistryConfig;
    use agentry_types::message::{AgentMessage, MessagePayload};
    use crate::message::Mailbox;
    use std::sync::atomic::Ordering;

    struct Fixture {
        registry: Arc<AgentRegistry>,
        monitor: Arc<HealthMonitor>,
        events: EventBus,
        orchestrator: Mailbox,
    }

    async fn fixture(agents: &[(&str, Arc<Switches>)]) -> Fixture {
        let bus = started_bus();
        let orchestrator = bus.subscribe(AgentId::orchestrator(), 64).unwrap();
        let events = EventBus::default();
        let registry = Arc::new(AgentRegistry::new(
            bus,
            events.clone(),
            &RegistryConfig::default(),
        ));
        for (id, switches) in agents {
            registry
                .register_factory(AgentId::new(*id), scripted_factory(Arc::clone(switches)))
                .unwrap();
            registry
                .create_agent(AgentId::new(*id), AgentConfig::default())
                .await
                .unwrap();
        }
        let config = HealthConfig {
            max_failures: 3,
            ..HealthConfig::default()
        };
        let monitor = Arc::new(
            HealthMonitor::new(Arc::clone(&registry), events.clone(), &config)
                .with_check_timeout(Duration::from_millis(100)),
        );
        Fixture {
            registry,
            monitor,
            events,
            orchestrator,
        }
    }

    async fn next_alert(mailbox: &mut Mailbox) -> AgentMessage {
        tokio::time::timeout(Duration::from_secs(2), mailbox.recv())
            .await
            .expect("alert expected")
            .expect("mailbox open")
    }

    #[tokio::test]
    async fn three_failures_then_success() {
        let switches = Switches::shared();
        let fx = fixture(&[("sec", Arc::clone(&switches))]).await;
        let sec = AgentId::new("sec");

        switches.set_failing(true);
        let mut states = Vec::new();
        for _ in 0..3 {
            states.push(fx.monitor.check_agent(&sec).await.state);
        }
        assert_eq!(
            states,
            vec![
                HealthState::Degraded,
                HealthState::Degraded,
                HealthState::Unhealthy
            ]
        );

        switches.set_failing(false);
        let status = fx.monitor.check_agent(&sec).await;
        assert_eq!(status.state, HealthState::Healthy);
        assert_eq!(status.consecutive_fails, 0);
        assert!(status.last_success.is_some());
    }

    #[tokio::test]
    async fn unhealthy_agent_raises_critical_alert() {
        let switches = Switches::shared();
        switches.set_failing(true);
        let mut fx = fixture(&[("sec", switches)]).await;
        let sec = AgentId::new("sec");

        for _ in 0..3 {
            fx.monitor.check_agent(&sec).await;
        }

        let alert = next_alert(&mut fx.orchestrator).await;
        assert_eq!(alert.priority, Priority::Critical);
        let MessagePayload::Error(notice) = alert.payload else {
            panic!("expected error notice");
        };
        assert_eq!(notice.kind, ErrorKind::AgentUnhealthy);
        assert_eq!(notice.agent_id, Some(sec));
        assert!(notice.action_required);
    }

    #[tokio::test]
    async fn sweep_survives_panic_and_timeout() {
        let panicking = Switches::shared();
        panicking.panic_health.store(true, Ordering::SeqCst);
        let hanging = Switches::shared();
        hanging.hang_health.store(true, Ordering::SeqCst);
        let fine = Switches::shared();

        let fx = fixture(&[
            ("panics", panicking),
            ("hangs", hanging),
            ("fine", Arc::clone(&fine)),
        ])
        .await;

        let swept = fx.monitor.check_all().await;
        assert_eq!(swept.len(), 3);
        assert_eq!(swept[&AgentId::new("fine")].state, HealthState::Healthy);
        assert_eq!(swept[&AgentId::new("panics")].state, HealthState::Degraded);
        assert!(
            swept[&AgentId::new("hangs")]
                .error_message
                .as_deref()
                .unwrap()
                .contains("timed out")
        );
        assert_eq!(fine.health_checks.load(Ordering::SeqCst), 1);

        let metrics = fx.monitor.metrics();
        assert_eq!(metrics.total_checks, 3);
        assert_eq!(metrics.failed_checks, 2);
        assert_eq!(metrics.sweeps, 1);
        assert_eq!(metrics.degraded_agents, 2);
    }

    #[tokio::test]
    async fn majority_degraded_raises_system_alert() {
        let a = Switches::shared();
        a.set_failing(true);
        let b = Switches::shared();
        b.set_failing(true);
        let mut fx = fixture(&[("a", a), ("b", b), ("c", Switches::shared())]).await;

        fx.monitor.check_all().await;

        let alert = next_alert(&mut fx.orchestrator).await;
        assert_eq!(alert.priority, Priority::High);
        let MessagePayload::Error(notice) = alert.payload else {
            panic!("expected error notice");
        };
        assert_eq!(notice.kind, ErrorKind::SystemDegraded);
        assert!(notice.agent_id.is_none());
    }

    #[tokio::test]
    async fn healthy_sweep_sends_nothing() {
        let mut fx = fixture(&[("a", Switches::shared()), ("b", Switches::shared())]).await;
        fx.monitor.check_all().await;
        assert_eq!(fx.monitor.metrics().alerts_sent, 0);
        assert!(fx.orchestrator.try_recv().is_none());
    }

    #[tokio::test]
    async fn removed_agent_becomes_unknown() {
        let fx = fixture(&[("sec", Switches::shared())]).await;
        let sec = AgentId::new("sec");
        fx.monitor.check_all().await;
        assert_eq!(
            fx.monitor.health_status(&sec).unwrap().state,
            HealthState::Healthy
        );

        fx.registry.stop_agent(&sec).await.unwrap();
        fx.monitor.check_all().await;
        assert_eq!(
            fx.monitor.health_status(&sec).unwrap().state,
            HealthState::Unknown
        );

        assert!(fx.monitor.forget(&sec).is_some());
        assert!(fx.monitor.health_status(&sec).is_none());
    }

    #[tokio::test]
    async fn reset_lets_a_failing_agent_turn_unhealthy_again() {
        let switches = Switches::shared();
        switches.set_failing(true);
        let fx = fixture(&[("sec", switches)]).await;
        let mut rx = fx.events.subscribe();
        let sec = AgentId::new("sec");

        for _ in 0..3 {
            fx.monitor.check_agent(&sec).await;
        }
        let before = fx.monitor.reset(&sec).unwrap();
        assert_eq!(before.state, HealthState::Unhealthy);
        assert_eq!(before.consecutive_fails, 3);

        let status = fx.monitor.health_status(&sec).unwrap();
        assert_eq!(status.state, HealthState::Unknown);
        assert_eq!(status.consecutive_fails, 0);

        let mut to_unhealthy = 0;
        let mut to_unknown = 0;
        for _ in 0..3 {
            fx.monitor.check_agent(&sec).await;
        }
        while let Ok(event) = rx.try_recv() {
            match event {
                RuntimeEvent::HealthChanged { to: HealthState::Unhealthy, .. } => to_unhealthy += 1,
                RuntimeEvent::HealthChanged { to: HealthState::Unknown, .. } => to_unknown += 1,
                _ => {}
            }
        }
        assert_eq!(to_unknown, 1);
        assert_eq!(to_unhealthy, 2);
        assert!(fx.monitor.reset(&AgentId::new("ghost")).is_none());
    }

    #[tokio::test]
    async fn untracked_ghost_is_not_recorded() {
        let fx = fixture(&[]).await;
        let status = fx.monitor.check_agent(&AgentId::new("ghost")).await;
        assert_eq!(status.state, HealthState::Unknown);
        assert!(fx.monitor.all_health_status().is_empty());
    }

    #[tokio::test]
    async fn returned_status_is_a_copy() {
        let fx = fixture(&[("sec", Switches::shared())]).await;
        let sec = AgentId::new("sec");
        fx.monitor.check_agent(&sec).await;

        let mut copy = fx.monitor.health_status(&sec).unwrap();
        copy.state = HealthState::Unhealthy;
        copy.consecutive_fails = 99;

        let stored = fx.monitor.health_status(&sec).unwrap();
        assert_eq!(stored.state, HealthState::Healthy);
        assert_eq!(stored.consecutive_fails, 0);
    }

    #[tokio::test]
    async fn transitions_publish_events() {
        let switches = Switches::shared();
        let fx = fixture(&[("sec", Arc::clone(&switches))]).await;
        let mut rx = fx.events.subscribe();
        let sec = AgentId::new("sec");

        fx.monitor.check_agent(&sec).await;
        switches.set_failing(true);
        fx.monitor.check_agent(&sec).await;
        fx.monitor.check_agent(&sec).await;

        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first,
            RuntimeEvent::HealthChanged {
                from: HealthState::Unknown,
                to: HealthState::Healthy,
                ..
            }
        ));
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second,
            RuntimeEvent::HealthChanged {
                to: HealthState::Degraded,
                consecutive_fails: 1,
                ..
            }
        ));
        // Degraded -> Degraded is not a transition.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn periodic_loop_checks_until_stopped() {
        let switches = Switches::shared();
        let bus = started_bus();
        let events = EventBus::default();
        let registry = Arc::new(AgentRegistry::new(bus, events.clone(), &RegistryConfig::default()));
        registry
            .register_factory(AgentId::new("sec"), scripted_factory(Arc::clone(&switches)))
            .unwrap();
        registry
            .create_agent(AgentId::new("sec"), AgentConfig::default())
            .await
            .unwrap();
        let monitor = Arc::new(
            HealthMonitor::new(registry, events, &HealthConfig::default())
                .with_check_interval(Duration::from_millis(10)),
        );

        monitor.start();
        crate::testing::eventually(|| switches.health_checks.load(Ordering::SeqCst) >= 3).await;
        monitor.stop().await;

        let after_stop = switches.health_checks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(switches.health_checks.load(Ordering::SeqCst), after_stop);
        assert!(monitor.metrics().sweeps >= 2);
    }
}
