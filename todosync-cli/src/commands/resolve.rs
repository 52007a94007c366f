//! `todosync resolve <task-id> --take file|app`

use anyhow::{Context, Result};
use clap::Args;

use todosync_daemon::DaemonRequest;
use todosync_sync::{Conflict, Side};

use super::{call, home};

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Id of the conflicted task.
    pub task_id: String,

    /// Side whose version wins: file | app
    #[arg(long)]
    pub take: Side,
}

impl ResolveArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let request = DaemonRequest {
            task_id: Some(self.task_id.clone()),
            side: Some(self.take),
            ..DaemonRequest::new("resolve")
        };
        let (data, _) = call(&home, &request)
            .with_context(|| format!("failed to resolve '{}'", self.task_id))?;
        let conflict: Conflict =
            serde_json::from_value(data).context("unexpected resolve response")?;
        println!(
            "✓ {} resolved with the {} version ({})",
            conflict.task_id,
            self.take,
            conflict.describe()
        );
        Ok(())
    }
}
