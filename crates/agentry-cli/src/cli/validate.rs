//! `agentry validate`: check a config file and show what it would run.

use std::path::Path;

use agentry_types::config::RuntimeConfig;
use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use crate::agents::ECHO_KIND;

pub fn validate(config: &RuntimeConfig, config_path: &Path, json: bool) -> Result<()> {
    if json {
        let summary = serde_json::json!({
            "valid": true,
            "path": config_path.display().to_string(),
            "config": config,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} is valid",
        style("✓").green().bold(),
        style(config_path.display()).cyan()
    );
    println!();
    println!(
        "  Bus:       ingress {} · mailbox {} · delivery timeout {} ms",
        config.bus.ingress_capacity, config.bus.default_mailbox_size, config.bus.delivery_timeout_ms
    );
    println!(
        "  Health:    every {}s · timeout {}s · unhealthy after {} failures",
        config.health.check_interval_secs,
        config.health.check_timeout_secs,
        config.health.max_failures
    );
    let strategy = &config.recovery.default_strategy;
    println!(
        "  Recovery:  {} · {} retries · {} ms × {} · auto {}",
        strategy.action,
        strategy.max_retries,
        strategy.retry_delay_ms,
        strategy.backoff_factor,
        if config.recovery.auto_recover { "on" } else { "off" }
    );
    println!();

    if config.agents.is_empty() {
        println!("  {}", style("No agents configured.").dim());
    } else {
        println!("{}", agents_table(config));
    }
    println!();
    Ok(())
}

fn agents_table(config: &RuntimeConfig) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Agent").fg(Color::White),
        Cell::new("Kind").fg(Color::White),
        Cell::new("Enabled").fg(Color::White),
        Cell::new("Mailbox").fg(Color::White),
        Cell::new("Recovery").fg(Color::White),
        Cell::new("Capabilities").fg(Color::White),
    ]);

    for (id, agent) in &config.agents {
        let kind_color = if agent.kind == ECHO_KIND {
            Color::Reset
        } else {
            Color::Yellow
        };
        let recovery = config
            .recovery
            .overrides
            .get(id)
            .map(|s| format!("{} (override)", s.action))
            .unwrap_or_else(|| config.recovery.default_strategy.action.to_string());
        table.add_row(vec![
            Cell::new(id).fg(Color::Cyan),
            Cell::new(&agent.kind).fg(kind_color),
            Cell::new(if agent.enabled { "yes" } else { "no" }),
            Cell::new(agent.mailbox_capacity(config.bus.default_mailbox_size)),
            Cell::new(recovery),
            Cell::new(agent.capabilities.join(", ")).fg(Color::DarkGrey),
        ]);
    }
    table
}
