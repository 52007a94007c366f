//! Subcommands, plus the plumbing they share: reach the daemon when it is
//! up, otherwise run the request against a short-lived local coordinator.

pub mod conflicts;
pub mod daemon;
pub mod diff;
pub mod init;
pub mod resolve;
pub mod status;
pub mod sync;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde_json::Value;

use todosync_daemon::{handle_request, open_coordinator, send_request, DaemonError, DaemonRequest};

pub fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// Where a request was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Via {
    Daemon,
    Local,
}

/// Send `request` to the running daemon, or answer it in-process.
pub fn call(home: &Path, request: &DaemonRequest) -> Result<(Value, Via)> {
    match send_request(home, request) {
        Ok(response) if response.ok => Ok((response.data.unwrap_or(Value::Null), Via::Daemon)),
        Ok(response) => Err(anyhow!(response
            .error
            .unwrap_or_else(|| "unknown daemon error".to_string()))),
        Err(DaemonError::DaemonNotRunning { .. }) => local(home, request).map(|v| (v, Via::Local)),
        Err(err) => Err(err).context("daemon request failed"),
    }
}

fn local(home: &Path, request: &DaemonRequest) -> Result<Value> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(async {
        let coordinator = open_coordinator(home, false)
            .await
            .context("failed to open sync state; run `todosync init` first")?;
        let response = handle_request(&coordinator, request, None).await;
        coordinator.stop().await;
        if response.ok {
            Ok(response.data.unwrap_or(Value::Null))
        } else {
            Err(anyhow!(response
                .error
                .unwrap_or_else(|| "request failed".to_string())))
        }
    })
}

/// Warnings and errors to stderr; `RUST_LOG` overrides.
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
