//! `agentry run`: start the runtime and supervise it until interrupted.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use agentry_core::AgentRuntime;
use agentry_core::clock::SystemClock;
use agentry_core::message::Mailbox;
use agentry_types::agent::AgentId;
use agentry_types::config::RuntimeConfig;
use agentry_types::message::{AgentMessage, MessagePayload, Priority};
use anyhow::{Context, Result};
use console::style;
use tracing::{info, warn};

use super::report::{RunReport, print_report, snapshot_agents};
use crate::agents::register_builtin_factories;

/// Capacity of the CLI's orchestrator inbox.
const ORCHESTRATOR_INBOX: usize = 256;

pub async fn run(
    config: RuntimeConfig,
    config_path: &Path,
    duration: Option<Duration>,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let runtime = AgentRuntime::new(config, SystemClock::shared());

    let unknown = register_builtin_factories(&runtime).context("failed to register agent factories")?;
    for (id, kind) in &unknown {
        warn!(agent_id = %id, %kind, "no built-in agent of this kind, it will not start");
    }

    runtime.start();

    // The CLI plays the orchestrator: every alert and escalation lands here.
    let inbox = runtime
        .bus()
        .subscribe(AgentId::orchestrator(), ORCHESTRATOR_INBOX)
        .context("failed to subscribe the orchestrator inbox")?;
    let alerts = Arc::new(AtomicU64::new(0));
    let drain = tokio::spawn(drain_orchestrator_inbox(inbox, Arc::clone(&alerts), quiet || json));

    let failures = runtime.start_configured_agents().await;
    let running = runtime.registry().agent_count().await;

    if !json && !quiet {
        println!();
        println!(
            "  {} Agentry runtime started with {} agent(s) from {}",
            style("⚡").bold(),
            style(running).green().bold(),
            style(config_path.display()).dim()
        );
        for (id, err) in &failures {
            println!("  {} {}: {}", style("✗").red(), style(id).cyan(), err);
        }
        println!("  {}", style("Press Ctrl+C to stop").dim());
    }

    wait_for_stop(duration).await;
    info!("stopping agent runtime");

    let agents = snapshot_agents(&runtime).await;
    let shutdown = runtime.shutdown().await;

    // The inbox closes with the bus; the drain task ends on its own.
    if let Err(e) = drain.await {
        warn!(error = %e, "orchestrator inbox task failed");
    }

    let report = RunReport::collect(&runtime, agents, alerts.load(Ordering::Relaxed)).await;
    print_report(&report, json)?;

    shutdown.context("some agents did not stop cleanly")?;
    Ok(())
}

/// Log every message addressed to the orchestrator until the bus closes.
async fn drain_orchestrator_inbox(mut inbox: Mailbox, alerts: Arc<AtomicU64>, silent: bool) {
    while let Some(msg) = inbox.recv().await {
        if matches!(msg.payload, MessagePayload::Error(_)) {
            alerts.fetch_add(1, Ordering::Relaxed);
        }
        report_inbound(&msg, silent);
    }
}

fn report_inbound(msg: &AgentMessage, silent: bool) {
    let MessagePayload::Error(notice) = &msg.payload else {
        info!(from = %msg.sender, message_type = %msg.message_type(), "orchestrator message");
        return;
    };

    let about = notice
        .agent_id
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_string());
    warn!(
        from = %msg.sender,
        agent_id = %about,
        priority = %msg.priority,
        action_required = notice.action_required,
        "{}",
        notice.message
    );

    if silent {
        return;
    }
    let marker = if msg.priority == Priority::Critical {
        style("!").red().bold()
    } else {
        style("!").yellow().bold()
    };
    println!(
        "  {} [{}] {} {}",
        marker,
        style(&msg.sender).dim(),
        style(&about).cyan(),
        notice.message
    );
}

/// Wait for Ctrl+C, SIGTERM, or the optional deadline.
async fn wait_for_stop(duration: Option<Duration>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = deadline => {},
    }
}
