//! `todosync sync [--direction ...]`

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use todosync_core::SyncDirection;
use todosync_daemon::DaemonRequest;
use todosync_sync::{SyncOutcome, SyncReport};

use super::{call, home, Via};

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Only this direction: file-to-app | app-to-file | bidirectional.
    /// Defaults to the configured direction.
    #[arg(long, short = 'd')]
    pub direction: Option<SyncDirection>,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let request = DaemonRequest {
            direction: self.direction,
            ..DaemonRequest::new("sync")
        };
        let (data, via) = call(&home, &request).context("sync failed")?;
        let reports: Vec<SyncReport> =
            serde_json::from_value(data).context("unexpected sync response")?;

        if via == Via::Daemon {
            println!("(via daemon)");
        }
        for report in &reports {
            print_report(report);
        }
        Ok(())
    }
}

fn print_report(report: &SyncReport) {
    let mark = match report.outcome {
        SyncOutcome::Success => "✓".green().bold(),
        SyncOutcome::NoChange => "·".bright_black().bold(),
        SyncOutcome::Failed => "✗".red().bold(),
    };
    println!(
        "{mark} {}: {} ({} written, {} deleted) in {}ms",
        report.direction, report.outcome, report.tasks_written, report.tasks_deleted, report.duration_ms
    );
    for conflict in &report.conflicts {
        println!("  ⚠  {} {}", conflict.task_id, conflict.describe());
    }
    if report.pending_conflicts > 0 {
        println!(
            "  {} conflict(s) need a decision; see `todosync conflicts`",
            report.pending_conflicts
        );
    }
    if let Some(backup) = &report.backup {
        println!("  backup: {}", backup.display());
    }
}
