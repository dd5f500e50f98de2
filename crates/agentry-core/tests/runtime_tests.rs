//! End-to-end scenarios against the public runtime API.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use agentry_core::AgentRuntime;
use agentry_core::agent::{Agent, AgentFactory, BaseAgent, BoxAgent};
use agentry_core::clock::{RecordingClock, SystemClock};
use agentry_core::message::{BusError, Mailbox, MessageBus, envelope};
use agentry_core::recovery::RecoveryError;
use agentry_core::registry::RegistryError;
use agentry_types::agent::{AgentConfig, AgentId, AgentStatus};
use agentry_types::config::RuntimeConfig;
use agentry_types::error::AgentError;
use agentry_types::event::RuntimeEvent;
use agentry_types::health::HealthState;
use agentry_types::message::{
    AgentMessage, ErrorKind, MessagePayload, MessageType, Priority, TaskRequest,
};
use agentry_types::metrics::AgentMetrics;
use agentry_types::recovery::{RecoveryAction, RecoveryStrategy};
use serde_json::json;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Echo worker built on `BaseAgent` whose health can be switched off.
struct FlakyAgent {
    base: BaseAgent,
    healthy: Arc<AtomicBool>,
}

impl Agent for FlakyAgent {
    fn id(&self) -> &AgentId {
        self.base.id()
    }

    fn status(&self) -> AgentStatus {
        Agent::status(&self.base)
    }

    fn capabilities(&self) -> &[String] {
        self.base.capabilities()
    }

    async fn start(&self) -> Result<(), AgentError> {
        self.base.start().await
    }

    async fn stop(&self) -> Result<(), AgentError> {
        self.base.stop().await
    }

    async fn process_message(&self, msg: AgentMessage) -> Result<(), AgentError> {
        self.base.process_message(msg).await
    }

    async fn health_check(&self) -> Result<(), AgentError> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(AgentError::HealthCheck("switched off".to_string()));
        }
        self.base.health_check().await
    }

    fn metrics(&self) -> AgentMetrics {
        Agent::metrics(&self.base)
    }
}

#[derive(Default)]
struct Flags {
    healthy: Arc<AtomicBool>,
    built: AtomicUsize,
}

fn flaky_factory(flags: Arc<Flags>) -> impl AgentFactory + 'static {
    move |id: &AgentId, config: &AgentConfig, bus: &Arc<MessageBus>| -> Result<BoxAgent, AgentError> {
        flags.built.fetch_add(1, Ordering::SeqCst);
        let base = BaseAgent::new(
            id.clone(),
            config.capabilities.clone(),
            config.mailbox_capacity(bus.default_mailbox_size()),
            Arc::clone(bus),
        );
        let replier = base.clone();
        base.register_handler(MessageType::Task, move |msg: AgentMessage| {
            let replier = replier.clone();
            async move {
                let MessagePayload::Task(request) = &msg.payload else {
                    return Ok(());
                };
                let reply = envelope::task_result(
                    replier.id().clone(),
                    &msg,
                    request.action(),
                    true,
                    json!({ "echo": request.action() }),
                );
                replier
                    .bus()
                    .send(reply)
                    .map_err(|e| AgentError::Bus(e.to_string()))
            }
        });
        Ok(BoxAgent::new(FlakyAgent {
            base,
            healthy: Arc::clone(&flags.healthy),
        }))
    }
}

fn broken_factory() -> impl AgentFactory + 'static {
    |_id: &AgentId, _config: &AgentConfig, _bus: &Arc<MessageBus>| -> Result<BoxAgent, AgentError> {
        Err(AgentError::Construction("dependency unavailable".to_string()))
    }
}

fn quick_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.bus.delivery_timeout_ms = 100;
    config.registry.stop_timeout_secs = 2;
    config
}

fn with_agent(mut config: RuntimeConfig, id: &str) -> RuntimeConfig {
    config.agents.insert(
        id.to_string(),
        AgentConfig {
            capabilities: vec!["security_scan".to_string()],
            ..AgentConfig::of_kind("flaky")
        },
    );
    config
}

async fn recv(mailbox: &mut Mailbox) -> AgentMessage {
    tokio::time::timeout(Duration::from_secs(2), mailbox.recv())
        .await
        .expect("message expected")
        .expect("mailbox open")
}

async fn wait_for(pred: impl Fn() -> bool) {
    for _ in 0..400 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held");
}

fn sec() -> AgentId {
    AgentId::new("sec")
}

// ---------------------------------------------------------------------------
// Messaging
// ---------------------------------------------------------------------------

#[tokio::test]
async fn task_round_trip_through_registered_agent() {
    let flags = Arc::new(Flags::default());
    flags.healthy.store(true, Ordering::SeqCst);
    let runtime = AgentRuntime::new(with_agent(quick_config(), "sec"), SystemClock::shared());
    runtime
        .registry()
        .register_factory(sec(), flaky_factory(Arc::clone(&flags)))
        .unwrap();
    runtime.start();
    assert!(runtime.start_configured_agents().await.is_empty());

    let mut client = runtime.bus().subscribe(AgentId::new("client"), 8).unwrap();
    let request = envelope::task(
        AgentId::new("client"),
        sec(),
        TaskRequest::Analyze {
            target: "src/lib.rs".to_string(),
        },
    )
    .with_correlation_id("req-1")
    .with_priority(Priority::High);
    runtime.bus().send(request).unwrap();

    let reply = recv(&mut client).await;
    assert_eq!(reply.sender, sec());
    assert_eq!(reply.correlation_id.as_deref(), Some("req-1"));
    assert_eq!(reply.priority, Priority::High);
    let MessagePayload::Result(result) = reply.payload else {
        panic!("expected a task result");
    };
    assert!(result.success);
    assert_eq!(result.output, json!({ "echo": "analyze" }));

    let agent = runtime.registry().agent(&sec()).await.unwrap();
    wait_for(|| agent.metrics().messages_processed == 1).await;
    assert_eq!(agent.capabilities(), ["security_scan".to_string()]);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn full_mailbox_times_out_until_drained() {
    let runtime = AgentRuntime::new(quick_config(), SystemClock::shared());
    runtime.start();
    let bus = runtime.bus();
    let mut mailbox = bus.subscribe(sec(), 1).unwrap();
    let note = || envelope::status(AgentId::new("client"), sec(), AgentStatus::Idle, None);

    bus.send(note()).unwrap();
    bus.send(note()).unwrap();
    wait_for(|| bus.metrics().failed_delivery == 1).await;
    assert_eq!(bus.metrics().successful_delivery, 1);

    recv(&mut mailbox).await;
    bus.send(note()).unwrap();
    wait_for(|| bus.metrics().successful_delivery == 2).await;
    assert_eq!(bus.metrics().total_messages, 3);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn router_fans_out_by_message_type() {
    let runtime = AgentRuntime::new(quick_config(), SystemClock::shared());
    runtime.start();
    let mut ops = runtime.bus().subscribe(AgentId::new("ops"), 4).unwrap();
    let mut audit = runtime.bus().subscribe(AgentId::new("audit"), 4).unwrap();
    runtime.router().add_route(
        MessageType::Error,
        vec![AgentId::new("ops"), AgentId::new("audit"), AgentId::new("gone")],
    );

    let alert = envelope::alert(
        AgentId::new("health_monitor"),
        ErrorKind::SystemDegraded,
        None,
        "half the fleet is degraded",
        false,
    );
    let delivered = runtime.router().route_message(alert).await.unwrap();

    assert_eq!(delivered, 2);
    let a = recv(&mut ops).await;
    let b = recv(&mut audit).await;
    assert_eq!(a.receiver, AgentId::new("ops"));
    assert_eq!(b.receiver, AgentId::new("audit"));
    assert_eq!(a.id, b.id);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_is_terminal_for_bus_and_mailboxes() {
    let runtime = AgentRuntime::new(quick_config(), SystemClock::shared());
    runtime.start();
    let mut mailbox = runtime.bus().subscribe(AgentId::new("client"), 4).unwrap();

    runtime.shutdown().await.unwrap();

    let err = runtime
        .bus()
        .send(envelope::shutdown(AgentId::orchestrator(), sec(), "late"))
        .unwrap_err();
    assert_eq!(err, BusError::ShuttingDown);
    assert!(mailbox.recv().await.is_none());
    assert!(mailbox.is_closed());
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn double_create_is_rejected_and_registry_stays_consistent() {
    let flags = Arc::new(Flags::default());
    let runtime = AgentRuntime::new(quick_config(), SystemClock::shared());
    let registry = runtime.registry();
    registry
        .register_factory(sec(), flaky_factory(Arc::clone(&flags)))
        .unwrap();
    registry
        .register_factory(AgentId::new("bad"), broken_factory())
        .unwrap();
    runtime.start();

    registry
        .create_agent(sec(), AgentConfig::of_kind("flaky"))
        .await
        .unwrap();
    let err = registry
        .create_agent(sec(), AgentConfig::of_kind("flaky"))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::AgentAlreadyExists(_)));

    let err = registry
        .create_agent(AgentId::new("bad"), AgentConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Construction { .. }));

    assert_eq!(registry.agent_ids().await, vec![sec()]);
    assert_eq!(registry.agent_status(&sec()).await, Some(AgentStatus::Idle));
    let metrics = registry.metrics().await;
    assert_eq!(metrics.agents_created, 1);
    assert_eq!(metrics.creation_failures, 1);

    registry.stop_agent(&sec()).await.unwrap();
    assert!(registry.agent_config(&sec()).is_none());
    assert!(!runtime.bus().is_subscribed(&sec()));

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn health_escalates_and_resets() {
    let flags = Arc::new(Flags::default());
    flags.healthy.store(true, Ordering::SeqCst);
    let mut config = with_agent(quick_config(), "sec");
    config.recovery.auto_recover = false;
    let runtime = AgentRuntime::new(config, SystemClock::shared());
    runtime
        .registry()
        .register_factory(sec(), flaky_factory(Arc::clone(&flags)))
        .unwrap();
    runtime.start();
    runtime.start_configured_agents().await;
    let monitor = runtime.health_monitor();

    assert_eq!(monitor.check_agent(&sec()).await.state, HealthState::Healthy);

    flags.healthy.store(false, Ordering::SeqCst);
    let mut states = Vec::new();
    for _ in 0..3 {
        states.push(monitor.check_agent(&sec()).await.state);
    }
    assert_eq!(
        states,
        vec![
            HealthState::Degraded,
            HealthState::Degraded,
            HealthState::Unhealthy
        ]
    );

    flags.healthy.store(true, Ordering::SeqCst);
    let status = monitor.check_agent(&sec()).await;
    assert_eq!(status.state, HealthState::Healthy);
    assert_eq!(status.consecutive_fails, 0);

    runtime.shutdown().await.unwrap();
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn recovery_with_broken_factory_fails_after_bounded_attempts() {
    let clock = Arc::new(RecordingClock::new());
    let mut config = with_agent(quick_config(), "sec");
    config.recovery.overrides.insert(
        "sec".to_string(),
        RecoveryStrategy {
            max_retries: 2,
            retry_delay_ms: 5_000,
            backoff_factor: 2.0,
            action: RecoveryAction::Restart,
        },
    );
    let runtime = AgentRuntime::new(config, clock.clone());
    runtime
        .registry()
        .register_factory(sec(), broken_factory())
        .unwrap();
    runtime.start();
    let mut orchestrator = runtime.bus().subscribe(AgentId::orchestrator(), 8).unwrap();

    let health = runtime.health_monitor().check_agent(&sec()).await;
    let err = runtime
        .recovery()
        .recover_agent(&sec(), &health)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("failed to recover after 2 attempts"));
    assert!(matches!(err, RecoveryError::RecoveryFailed { attempts: 2, .. }));
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(5)]);

    let notice = recv(&mut orchestrator).await;
    assert_eq!(notice.priority, Priority::Critical);
    assert_eq!(notice.message_type(), MessageType::Error);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn recovery_waits_follow_geometric_backoff() {
    let clock = Arc::new(RecordingClock::new());
    let mut config = with_agent(quick_config(), "sec");
    config.recovery.default_strategy = RecoveryStrategy {
        max_retries: 3,
        retry_delay_ms: 1_000,
        backoff_factor: 3.0,
        action: RecoveryAction::Recreate,
    };
    let runtime = AgentRuntime::new(config, clock.clone());
    runtime
        .registry()
        .register_factory(sec(), broken_factory())
        .unwrap();
    runtime.start();

    let health = runtime.health_monitor().check_agent(&sec()).await;
    let err = runtime
        .recovery()
        .recover_agent(&sec(), &health)
        .await
        .unwrap_err();

    assert!(matches!(err, RecoveryError::RecoveryFailed { attempts: 3, .. }));
    // d * (b^(R-1) - 1) / (b - 1) = 1s * (9 - 1) / 2
    assert_eq!(clock.total_slept(), Duration::from_secs(4));
    assert_eq!(runtime.recovery().metrics().total_attempts, 3);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn unhealthy_agent_is_recreated_and_events_follow() {
    let flags = Arc::new(Flags::default());
    flags.healthy.store(true, Ordering::SeqCst);
    let mut config = with_agent(quick_config(), "sec");
    config.health.max_failures = 2;
    let runtime = AgentRuntime::new(config, SystemClock::shared());
    runtime
        .registry()
        .register_factory(sec(), flaky_factory(Arc::clone(&flags)))
        .unwrap();
    let mut events = runtime.events().subscribe();
    runtime.start();
    runtime.start_configured_agents().await;
    let mut orchestrator = runtime.bus().subscribe(AgentId::orchestrator(), 16).unwrap();

    flags.healthy.store(false, Ordering::SeqCst);
    runtime.health_monitor().check_all().await;
    runtime.health_monitor().check_all().await;
    flags.healthy.store(true, Ordering::SeqCst);

    wait_for(|| runtime.recovery().metrics().recovered == 1).await;
    assert_eq!(flags.built.load(Ordering::SeqCst), 2);
    assert_eq!(
        runtime.registry().agent_status(&sec()).await,
        Some(AgentStatus::Idle)
    );
    assert!(runtime.bus().is_subscribed(&sec()));

    let status = runtime.health_monitor().check_agent(&sec()).await;
    assert_eq!(status.state, HealthState::Healthy);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.iter().any(|e| matches!(
        e,
        RuntimeEvent::HealthChanged {
            to: HealthState::Unhealthy,
            ..
        }
    )));
    assert!(seen
        .iter()
        .any(|e| matches!(e, RuntimeEvent::RecoverySucceeded { attempts: 1, .. })));

    let alert = recv(&mut orchestrator).await;
    assert!(alert.priority >= Priority::High);

    runtime.shutdown().await.unwrap();
}
