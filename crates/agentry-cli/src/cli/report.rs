//! Metrics report printed when a run ends.

use agentry_core::AgentRuntime;
use agentry_types::agent::{AgentId, AgentStatus};
use agentry_types::health::HealthState;
use agentry_types::metrics::{
    AgentRegistryMetrics, HealthMonitorMetrics, MessageBusMetrics, RecoveryMetrics,
};
use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde::Serialize;

/// One live agent as seen just before shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRow {
    pub id: AgentId,
    pub status: AgentStatus,
    pub health: HealthState,
    pub consecutive_fails: u32,
    pub messages_processed: u64,
    pub messages_failed: u64,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub agents: Vec<AgentRow>,
    pub bus: MessageBusMetrics,
    pub registry: AgentRegistryMetrics,
    pub health: HealthMonitorMetrics,
    pub recovery: RecoveryMetrics,
    pub alerts_received: u64,
}

/// Capture the live agents. Must run before shutdown clears the registry.
pub async fn snapshot_agents(runtime: &AgentRuntime) -> Vec<AgentRow> {
    let monitor = runtime.health_monitor();
    let mut rows = Vec::new();
    for id in runtime.registry().agent_ids().await {
        let Some(agent) = runtime.registry().agent(&id).await else {
            continue;
        };
        let health = monitor.health_status(&id).unwrap_or_default();
        let metrics = agent.metrics();
        rows.push(AgentRow {
            status: agent.status(),
            health: health.state,
            consecutive_fails: health.consecutive_fails,
            messages_processed: metrics.messages_processed,
            messages_failed: metrics.messages_failed,
            capabilities: agent.capabilities().to_vec(),
            id,
        });
    }
    rows
}

impl RunReport {
    /// Combine the agent snapshot with the final component counters.
    pub async fn collect(runtime: &AgentRuntime, agents: Vec<AgentRow>, alerts_received: u64) -> Self {
        Self {
            agents,
            bus: runtime.bus().metrics(),
            registry: runtime.registry().metrics().await,
            health: runtime.health_monitor().metrics(),
            recovery: runtime.recovery().metrics(),
            alerts_received,
        }
    }
}

pub fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!();
    println!("  {}", style("── Agents ──").dim());
    if report.agents.is_empty() {
        println!("  {}", style("No agents were running.").dim());
    } else {
        println!("{}", agents_table(&report.agents));
    }
    println!();
    println!("  {}", style("── Runtime ──").dim());
    println!("{}", counters_table(report));
    println!();
    Ok(())
}

pub fn agents_table(rows: &[AgentRow]) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("Agent").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Health").fg(Color::White),
        Cell::new("Fails").fg(Color::White),
        Cell::new("Processed").fg(Color::White),
        Cell::new("Failed").fg(Color::White),
        Cell::new("Capabilities").fg(Color::White),
    ]);

    for row in rows {
        table.add_row(vec![
            Cell::new(row.id.as_str()).fg(Color::Cyan),
            Cell::new(row.status.to_string()).fg(status_color(row.status)),
            Cell::new(row.health.to_string()).fg(health_color(row.health)),
            Cell::new(row.consecutive_fails),
            Cell::new(row.messages_processed),
            Cell::new(row.messages_failed),
            Cell::new(row.capabilities.join(", ")).fg(Color::DarkGrey),
        ]);
    }
    table
}

pub fn counters_table(report: &RunReport) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Component").fg(Color::White),
        Cell::new("Counter").fg(Color::White),
        Cell::new("Value").fg(Color::White),
    ]);

    let bus = &report.bus;
    let registry = &report.registry;
    let health = &report.health;
    let recovery = &report.recovery;
    let rows: [(&str, &str, String); 16] = [
        ("bus", "messages", bus.total_messages.to_string()),
        ("bus", "delivered", bus.successful_delivery.to_string()),
        ("bus", "failed", bus.failed_delivery.to_string()),
        ("bus", "avg latency", format!("{} µs", bus.average_latency_us)),
        ("registry", "created", registry.agents_created.to_string()),
        ("registry", "stopped", registry.agents_stopped.to_string()),
        ("registry", "creation failures", registry.creation_failures.to_string()),
        ("health", "checks", health.total_checks.to_string()),
        ("health", "failed checks", health.failed_checks.to_string()),
        ("health", "sweeps", health.sweeps.to_string()),
        ("health", "alerts", health.alerts_sent.to_string()),
        ("recovery", "started", recovery.recoveries_started.to_string()),
        ("recovery", "recovered", recovery.recovered.to_string()),
        ("recovery", "failed", recovery.failed.to_string()),
        ("recovery", "escalations", recovery.escalations.to_string()),
        ("orchestrator", "alerts received", report.alerts_received.to_string()),
    ];
    for (component, counter, value) in rows {
        table.add_row(vec![
            Cell::new(component).fg(Color::DarkGrey),
            Cell::new(counter),
            Cell::new(value).fg(Color::Cyan),
        ]);
    }
    table
}

fn status_color(status: AgentStatus) -> Color {
    match status {
        AgentStatus::Idle => Color::Green,
        AgentStatus::Busy => Color::Cyan,
        AgentStatus::Starting | AgentStatus::Stopping => Color::Yellow,
        AgentStatus::Error => Color::Red,
        AgentStatus::Offline => Color::DarkGrey,
    }
}

fn health_color(state: HealthState) -> Color {
    match state {
        HealthState::Healthy => Color::Green,
        HealthState::Degraded => Color::Yellow,
        HealthState::Unhealthy => Color::Red,
        HealthState::Unknown => Color::DarkGrey,
    }
}
