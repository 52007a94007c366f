//! `todosync conflicts [--json]`

use anyhow::{Context, Result};
use clap::Args;
use tabled::{settings::Style, Table, Tabled};

use todosync_daemon::DaemonRequest;
use todosync_sync::{Conflict, TaskVersion};

use super::{call, home};

#[derive(Args, Debug)]
pub struct ConflictsArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct ConflictRow {
    #[tabled(rename = "task")]
    task: String,
    #[tabled(rename = "conflict")]
    detail: String,
    #[tabled(rename = "file")]
    file: String,
    #[tabled(rename = "app")]
    app: String,
    #[tabled(rename = "detected")]
    detected: String,
}

impl ConflictsArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let (data, _) =
            call(&home, &DaemonRequest::new("conflicts")).context("failed to list conflicts")?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&data).context("failed to render conflicts JSON")?
            );
            return Ok(());
        }

        let conflicts: Vec<Conflict> =
            serde_json::from_value(data).context("unexpected conflicts response")?;
        if conflicts.is_empty() {
            println!("No pending conflicts.");
            return Ok(());
        }

        let rows: Vec<ConflictRow> = conflicts
            .iter()
            .map(|c| ConflictRow {
                task: c.task_id.to_string(),
                detail: c.describe(),
                file: version_title(&c.file),
                app: version_title(&c.app),
                detected: c.detected_at.format("%Y-%m-%d %H:%M").to_string(),
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        println!("Run 'todosync resolve <task> --take file|app' to settle one.");
        Ok(())
    }
}

fn version_title(version: &TaskVersion) -> String {
    match version.as_task() {
        Some(task) => format!("{} [{}, {}]", task.title, task.status, task.priority),
        None => "(deleted)".to_string(),
    }
}
