use anyhow::Result;
use colored::Colorize;
use serde::Serialize;
use tabled::builder::Builder;
use tabled::settings::Style;

use converge::{Application, HealthStatus, SyncOperation, SyncOutcome};

use crate::cli::OutputFormat;

/// Prints `value` as JSON or YAML. Returns false for table output so the
/// caller can render its own table.
pub fn print_structured<T: Serialize>(value: &T, format: OutputFormat) -> Result<bool> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
        OutputFormat::Table => return Ok(false),
    }
    Ok(true)
}

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

fn health_cell(health: HealthStatus) -> String {
    let text = health.to_string();
    match health {
        HealthStatus::Healthy => text.green().to_string(),
        HealthStatus::Progressing => text.yellow().to_string(),
        HealthStatus::Degraded => text.red().to_string(),
        HealthStatus::Missing => text.dimmed().to_string(),
    }
}

fn outcome_cell(outcome: Option<SyncOutcome>) -> String {
    match outcome {
        Some(SyncOutcome::Succeeded) => "Succeeded".green().to_string(),
        Some(SyncOutcome::PartiallyApplied) => "PartiallyApplied".yellow().to_string(),
        Some(SyncOutcome::Failed) => "Failed".red().to_string(),
        None => "-".to_string(),
    }
}

fn short(revision: Option<&str>) -> &str {
    revision.map(|r| &r[..r.len().min(8)]).unwrap_or("-")
}

pub fn print_applications(apps: &[Application]) {
    if apps.is_empty() {
        println!("No applications registered.");
        return;
    }
    let mut builder = Builder::default();
    builder.push_record(["Name", "Source", "Revision", "Sync", "Health", "Policy"]);
    for app in apps {
        let policy = app.spec.sync_policy;
        let mode = if policy.automated {
            let mut flags = vec!["auto"];
            if policy.prune {
                flags.push("prune");
            }
            if policy.self_heal {
                flags.push("self-heal");
            }
            flags.join("+")
        } else {
            "manual".to_string()
        };
        builder.push_record([
            app.name.clone(),
            format!("{}@{}", app.spec.source.repo_url, app.spec.source.reference),
            short(app.status.last_synced_revision.as_deref()).to_string(),
            outcome_cell(app.status.last_outcome),
            health_cell(app.status.health),
            mode,
        ]);
    }
    println!("{}", builder.build().with(Style::rounded()));
}

pub fn print_application(app: &Application) {
    let status = &app.status;
    println!("{} {}", "Application:".cyan(), app.name.cyan());
    println!(
        "  Source:      {} @ {} ({})",
        app.spec.source.repo_url, app.spec.source.reference, app.spec.source.path
    );
    println!(
        "  Destination: {}/{}",
        app.spec.destination.endpoint, app.spec.destination.namespace
    );
    println!("  Phase:       {}", status.phase);
    println!(
        "  Synced:      {}",
        status.last_synced_revision.as_deref().unwrap_or("-")
    );
    println!("  Outcome:     {}", outcome_cell(status.last_outcome));
    println!("  Health:      {}", health_cell(status.health));
    if let Some(message) = &status.health_message {
        println!("               {}", message.dimmed());
    }
    if let Some(time) = status.last_sync_time {
        println!("  Last sync:   {}", time.to_rfc3339());
    }
    if let Some(error) = &status.last_error {
        println!("  {} {}", "Error:".red(), error);
    }
    if let Some(alert) = &status.alert {
        println!("  {} {}", "Alert:".yellow(), alert);
    }
}

pub fn print_history(operations: &[SyncOperation]) {
    if operations.is_empty() {
        println!("No sync operations recorded.");
        return;
    }
    let mut builder = Builder::default();
    builder.push_record(["Started", "Revision", "Trigger", "Outcome", "Changes", "Error"]);
    for op in operations {
        let changed = op
            .records
            .iter()
            .filter(|r| r.op != converge::DiffOp::NoOp)
            .count();
        builder.push_record([
            op.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            short(Some(&op.revision)).to_string(),
            op.trigger.to_string(),
            outcome_cell(op.outcome),
            format!("{}/{}", changed, op.records.len()),
            op.error.clone().unwrap_or_default(),
        ]);
    }
    println!("{}", builder.build().with(Style::rounded()));
}

pub fn print_operation(op: &SyncOperation) {
    println!(
        "{} {} at {} ({})",
        "Sync".cyan(),
        outcome_cell(op.outcome),
        short(Some(&op.revision)),
        op.trigger
    );
    for record in &op.records {
        let line = format!("  {:<7} {} {:?}", record.op.to_string(), record.key, record.status);
        match &record.message {
            Some(message) => println!("{line}: {}", message.dimmed()),
            None => println!("{line}"),
        }
    }
    for warning in &op.warnings {
        println!("  {} {}", "warning:".yellow(), warning);
    }
    if let Some(error) = &op.error {
        println!("  {} {}", "error:".red(), error);
    }
}
