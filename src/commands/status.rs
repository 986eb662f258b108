//! `rigger status`: what the state record says about each step

use anyhow::Result;
use chrono::{DateTime, Utc};
use colored::Colorize;
use converge::{StateStore, StepStatus};
use serde::Serialize;

use super::Session;
use crate::{Context, ui};

#[derive(Debug, Serialize)]
struct StatusRow {
    name: String,
    kind: String,
    /// `None` when the step never settled
    status: Option<StepStatus>,
    fingerprint: Option<String>,
    /// Inputs differ from the ones the recorded status refers to
    inputs_changed: bool,
    updated_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    error: Option<String>,
    /// Recorded but no longer declared in the manifest
    orphaned: bool,
}

pub fn run(ctx: &Context, json: bool) -> Result<()> {
    let session = Session::open(ctx)?;
    let store = StateStore::open_read_only(&session.state_dir)?;
    let record = store.record();
    let steps = session.steps(true)?;

    let mut rows: Vec<StatusRow> = Vec::new();
    for step in &steps {
        let entry = record.get(step.name());
        let current = step.fingerprint().ok();
        rows.push(StatusRow {
            name: step.name().to_string(),
            kind: step.kind().to_string(),
            status: entry.map(|e| e.status),
            fingerprint: entry.map(|e| e.fingerprint.as_str().to_string()),
            inputs_changed: match (entry, &current) {
                (Some(e), Some(fp)) => &e.fingerprint != fp,
                _ => false,
            },
            updated_at: entry.map(|e| e.updated_at),
            last_success_at: entry.and_then(|e| e.last_success_at),
            error: entry.and_then(|e| e.error.as_ref()).map(ToString::to_string),
            orphaned: false,
        });
    }
    for (name, entry) in &record.steps {
        if steps.iter().any(|s| s.name() == name) {
            continue;
        }
        rows.push(StatusRow {
            name: name.clone(),
            kind: String::new(),
            status: Some(entry.status),
            fingerprint: Some(entry.fingerprint.as_str().to_string()),
            inputs_changed: false,
            updated_at: Some(entry.updated_at),
            last_success_at: entry.last_success_at,
            error: entry.error.as_ref().map(ToString::to_string),
            orphaned: true,
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    ui::header("Rigger Status");
    ui::kv("Manifest", &session.manifest_path.display().to_string());
    ui::kv("State", &session.state_dir.display().to_string());
    if let Some(path) = store.path()
        && path.exists()
    {
        ui::kv("Last updated", &record.last_updated.format("%Y-%m-%d %H:%M:%S UTC").to_string());
    }

    ui::section("Steps");
    let width = rows.iter().map(|r| r.name.len()).max().unwrap_or(0);
    for row in &rows {
        print_row(row, width);
    }

    let pending = rows
        .iter()
        .filter(|r| !r.orphaned && (r.inputs_changed || !r.status.is_some_and(|s| s.is_settled_ok())))
        .count();
    println!();
    if pending == 0 {
        ui::success("All steps recorded as converged");
    } else {
        ui::info(&format!("{} step(s) will be evaluated by the next apply", pending));
    }
    Ok(())
}

fn print_row(row: &StatusRow, width: usize) {
    let marker = match row.status {
        Some(status) => ui::status_marker(status),
        None => "·".dimmed(),
    };
    let state = match row.status {
        Some(status) => status.to_string(),
        None => "never run".to_string(),
    };
    let mut detail = String::new();
    if let Some(at) = row.updated_at {
        detail.push_str(&at.format("%Y-%m-%d %H:%M").to_string());
    }
    if row.inputs_changed {
        detail.push_str(&format!(" {}", "inputs changed".yellow()));
    }
    if row.orphaned {
        detail.push_str(&format!(" {}", "not in manifest".yellow()));
    }

    println!(
        "  {} {:<width$}  {:<10} {}",
        marker,
        row.name,
        state,
        detail.dimmed(),
        width = width
    );
    if let Some(error) = &row.error {
        println!("      {}", error.red());
    }
}
