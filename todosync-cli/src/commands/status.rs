//! `todosync status [--json]`

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};

use todosync_daemon::DaemonRequest;

use super::{call, home, Via};

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct Row {
    #[tabled(rename = "")]
    key: &'static str,
    #[tabled(rename = "")]
    value: String,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let (status, via) = call(&home, &DaemonRequest::new("status")).context("status failed")?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&status).context("failed to render status JSON")?
            );
            return Ok(());
        }

        let daemon = match via {
            Via::Daemon => format!("running (pid {})", text(&status["pid"])).green().to_string(),
            Via::Local => "not running".bright_black().to_string(),
        };
        let state = &status["state"];
        let state_label = match text(&state["state"]).as_str() {
            "error" => format!("error: {}", text(&state["message"])).red().bold().to_string(),
            "syncing" => "syncing".yellow().to_string(),
            other => other.to_string(),
        };
        let stats = &status["stats"];
        let breakers = &status["breakers"];

        let rows = vec![
            Row { key: "daemon", value: daemon },
            Row { key: "file", value: text(&status["todo_path"]) },
            Row { key: "direction", value: text(&status["direction"]) },
            Row { key: "strategy", value: text(&status["strategy"]) },
            Row { key: "conflicts policy", value: text(&status["conflict_resolution"]) },
            Row { key: "state", value: state_label },
            Row { key: "last sync", value: text(&status["sync"]["last_synced_at"]) },
            Row {
                key: "syncs",
                value: format!(
                    "{} total, {} ok, {} failed",
                    text(&stats["total_syncs"]),
                    text(&stats["success_count"]),
                    text(&stats["failure_count"])
                ),
            },
            Row { key: "retries", value: text(&stats["retry_count"]) },
            Row {
                key: "breakers",
                value: format!(
                    "file read {}, file write {}, db read {}, db write {}",
                    text(&breakers["file_read"]),
                    text(&breakers["file_write"]),
                    text(&breakers["db_read"]),
                    text(&breakers["db_write"])
                ),
            },
            Row { key: "pending conflicts", value: pending(&status["pending_conflicts"]) },
        ];
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::Null => "never".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn pending(value: &Value) -> String {
    match value.as_u64() {
        Some(0) | None => "0".to_string(),
        Some(n) => n.to_string().yellow().bold().to_string(),
    }
}
