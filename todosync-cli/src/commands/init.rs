//! `todosync init <todo-path> [--direction ...] [--strategy ...] [--conflicts ...]`

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

use todosync_core::config::{config_path_at, save_at};
use todosync_core::{ConflictPolicy, SyncConfig, SyncDirection, SyncStrategy};

use super::home;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Markdown task file to sync. Created on the first app-to-file sync
    /// if it does not exist yet.
    pub todo_path: PathBuf,

    /// file-to-app | app-to-file | bidirectional
    #[arg(long, short = 'd', default_value_t = SyncDirection::Bidirectional)]
    pub direction: SyncDirection,

    /// three-way-merge | last-write-wins
    #[arg(long, short = 's', default_value_t = SyncStrategy::ThreeWayMerge)]
    pub strategy: SyncStrategy,

    /// Conflict policy: prefer-file | prefer-app | last-write-wins | manual
    #[arg(long = "conflicts", short = 'c', value_name = "POLICY", default_value_t = ConflictPolicy::LastWriteWins)]
    pub conflict_resolution: ConflictPolicy,

    /// Overwrite an existing config.
    #[arg(long)]
    pub force: bool,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let config_path = config_path_at(&home);
        if config_path.exists() && !self.force {
            bail!(
                "{} already exists; pass --force to replace it",
                config_path.display()
            );
        }

        let todo_path = if self.todo_path.is_absolute() {
            self.todo_path.clone()
        } else {
            std::env::current_dir()
                .context("cannot resolve the current directory")?
                .join(&self.todo_path)
        };
        let mut config = SyncConfig::new(todo_path);
        config.direction = self.direction;
        config.strategy = self.strategy;
        config.conflict_resolution = self.conflict_resolution;
        config
            .validate()
            .with_context(|| format!("invalid todo path '{}'", self.todo_path.display()))?;

        let saved = save_at(&home, &config).context("failed to write config")?;
        println!(
            "✓ Syncing '{}' ({}, {}, conflicts: {})",
            config.todo_path.display(),
            config.direction,
            config.strategy,
            config.conflict_resolution
        );
        println!("  Saved to: {}", saved.display());
        Ok(())
    }
}
