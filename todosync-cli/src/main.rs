//! todosync: keep a Markdown task file and the task store in step.
//!
//! # Usage
//!
//! ```text
//! todosync init <todo-path> [--direction ...] [--strategy ...] [--conflicts ...]
//! todosync sync [--direction file-to-app|app-to-file|bidirectional]
//! todosync status [--json]
//! todosync diff
//! todosync conflicts [--json]
//! todosync resolve <task-id> --take file|app
//! todosync daemon start|stop|status
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    conflicts::ConflictsArgs, daemon::DaemonCommand, diff::DiffArgs, init::InitArgs,
    resolve::ResolveArgs, status::StatusArgs, sync::SyncArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "todosync",
    version,
    about = "Bidirectional sync between a Markdown task file and the task store",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Point todosync at a Markdown task file and write the config.
    Init(InitArgs),

    /// Run one sync now, through the daemon when it is running.
    Sync(SyncArgs),

    /// Show coordinator state, sync statistics and breaker health.
    Status(StatusArgs),

    /// Show the unified diff an app-to-file sync would write.
    Diff(DiffArgs),

    /// List conflicts waiting for a manual decision.
    Conflicts(ConflictsArgs),

    /// Settle a pending conflict by taking one side.
    Resolve(ResolveArgs),

    /// Run or control the background sync daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Sync(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Diff(args) => args.run(),
        Commands::Conflicts(args) => args.run(),
        Commands::Resolve(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
