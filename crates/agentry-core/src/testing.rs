//! Scripted agents and fixtures shared by the unit tests.

use std::future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use agentry_types::agent::{AgentConfig, AgentId, AgentStatus};
use agentry_types::config::BusConfig;
use agentry_types::error::AgentError;
use agentry_types::message::AgentMessage;

use crate::agent::{Agent, AgentFactory, BoxAgent};
use crate::clock::SystemClock;
use crate::message::MessageBus;

/// Knobs a test flips while the agent is running.
#[derive(Debug, Default)]
pub(crate) struct Switches {
    pub fail_health: AtomicBool,
    pub panic_health: AtomicBool,
    pub hang_health: AtomicBool,
    pub health_checks: AtomicUsize,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

impl Switches {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_health.store(failing, Ordering::SeqCst);
    }
}

pub(crate) struct ScriptedAgent {
    id: AgentId,
    capabilities: Vec<String>,
    status: RwLock<AgentStatus>,
    switches: Arc<Switches>,
    fail_start: bool,
    fail_stop: bool,
    start_delay: Duration,
    stop_delay: Duration,
}

impl ScriptedAgent {
    pub fn new(id: AgentId, switches: Arc<Switches>) -> Self {
        Self {
            id,
            capabilities: vec!["scripted".to_string()],
            status: RwLock::new(AgentStatus::Offline),
            switches,
            fail_start: false,
            fail_stop: false,
            start_delay: Duration::ZERO,
            stop_delay: Duration::ZERO,
        }
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn failing_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    pub fn slow_start(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn slow_stop(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    fn set_status(&self, status: AgentStatus) {
        *self.status.write().unwrap() = status;
    }
}

impl Agent for ScriptedAgent {
    fn id(&self) -> &AgentId {
        &self.id
    }

    fn status(&self) -> AgentStatus {
        *self.status.read().unwrap()
    }

    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    async fn start(&self) -> Result<(), AgentError> {
        self.switches.starts.fetch_add(1, Ordering::SeqCst);
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        if self.fail_start {
            self.set_status(AgentStatus::Error);
            return Err(AgentError::Processing("scripted start failure".to_string()));
        }
        self.set_status(AgentStatus::Idle);
        Ok(())
    }

    async fn stop(&self) -> Result<(), AgentError> {
        self.switches.stops.fetch_add(1, Ordering::SeqCst);
        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }
        self.set_status(AgentStatus::Offline);
        if self.fail_stop {
            return Err(AgentError::Processing("scripted stop failure".to_string()));
        }
        Ok(())
    }

    async fn process_message(&self, msg: AgentMessage) -> Result<(), AgentError> {
        Err(AgentError::NoHandler(msg.message_type()))
    }

    async fn health_check(&self) -> Result<(), AgentError> {
        self.switches.health_checks.fetch_add(1, Ordering::SeqCst);
        if self.switches.panic_health.load(Ordering::SeqCst) {
            panic!("scripted health panic");
        }
        if self.switches.hang_health.load(Ordering::SeqCst) {
            future::pending::<()>().await;
        }
        if self.switches.fail_health.load(Ordering::SeqCst) {
            return Err(AgentError::HealthCheck("scripted failure".to_string()));
        }
        Ok(())
    }
}

/// Factory producing healthy scripted agents wired to `switches`.
pub(crate) fn scripted_factory(switches: Arc<Switches>) -> impl AgentFactory + 'static {
    move |id: &AgentId, _config: &AgentConfig, _bus: &Arc<MessageBus>| -> Result<BoxAgent, AgentError> {
        Ok(BoxAgent::new(ScriptedAgent::new(id.clone(), Arc::clone(&switches))))
    }
}

/// Factory that can never build its agent.
pub(crate) fn broken_factory() -> impl AgentFactory + 'static {
    |_id: &AgentId, _config: &AgentConfig, _bus: &Arc<MessageBus>| -> Result<BoxAgent, AgentError> {
        Err(AgentError::Construction("scripted construction failure".to_string()))
    }
}

/// Started bus with a short delivery timeout.
pub(crate) fn started_bus() -> Arc<MessageBus> {
    let config = BusConfig {
        delivery_timeout_ms: 200,
        ..BusConfig::default()
    };
    let bus = Arc::new(MessageBus::new(&config, SystemClock::shared()));
    bus.start();
    bus
}

/// Poll `pred` until it holds, failing the test after about two seconds.
pub(crate) async fn eventually(pred: impl Fn() -> bool) {
    for _ in 0..400 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held");
}
