use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::{self, error::RecvError};

use todosync_core::{config, SyncDirection, TaskId};
use todosync_sync::{
    FileWatcher, JsonFileDatabase, JsonStateBackend, LocalFileSystem, NotifyWatcher,
    SyncCoordinator, SyncDependencies, SyncEvent,
};

use crate::error::{io_err, DaemonError};
use crate::paths::{run_dir, socket_path, tasks_path};
use crate::protocol::{DaemonRequest, DaemonResponse};

const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Build and start a coordinator over the on-disk store and state under
/// `home`. With `watch`, file changes trigger syncs on their own.
pub async fn open_coordinator(home: &Path, watch: bool) -> Result<SyncCoordinator, DaemonError> {
    let config = config::load_at(home)?;
    let db = JsonFileDatabase::open(tasks_path(home)).await?;
    let watcher: Option<Arc<dyn FileWatcher>> = if watch {
        Some(Arc::new(NotifyWatcher::new()))
    } else {
        None
    };
    let coordinator = SyncCoordinator::new(
        config,
        SyncDependencies {
            fs: Arc::new(LocalFileSystem::new()),
            db: Arc::new(db),
            state: Arc::new(JsonStateBackend::at_home(home)),
            watcher,
        },
    );
    coordinator.start().await?;
    Ok(coordinator)
}

/// Run the daemon runtime until a `stop` request or ctrl-c.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;
    let coordinator = open_coordinator(&home, true).await?;
    let started_at = Utc::now();

    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let events_handle = {
        let shutdown = shutdown_tx.clone();
        let events = coordinator.subscribe();
        tokio::spawn(async move {
            let result = event_log_task(events, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let result = socket_server_task(
                home,
                coordinator,
                shutdown.clone(),
                shutdown.subscribe(),
                started_at,
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (events_result, socket_result, signal_result) =
        tokio::join!(events_handle, socket_handle, signal_handle);

    coordinator.stop().await;

    handle_join("event_log", events_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

/// Mirror coordinator events into the log.
async fn event_log_task(
    mut events: broadcast::Receiver<SyncEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event log fell behind");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::SyncStarted { sync_id, direction } => {
            tracing::debug!(%sync_id, %direction, "sync started");
        }
        SyncEvent::SyncCompleted(report) => tracing::info!(
            sync_id = %report.sync_id,
            direction = %report.direction,
            outcome = %report.outcome,
            written = report.tasks_written,
            deleted = report.tasks_deleted,
            conflicts = report.conflicts.len(),
            duration_ms = report.duration_ms,
            "sync completed"
        ),
        SyncEvent::SyncError {
            sync_id,
            direction,
            kind,
            message,
        } => tracing::error!(%sync_id, %direction, kind = %kind, "sync failed: {message}"),
        SyncEvent::ConflictDetected(conflict) => tracing::warn!(
            task_id = %conflict.task_id,
            "conflict: {}",
            conflict.describe()
        ),
    }
}

async fn socket_server_task(
    home: PathBuf,
    coordinator: SyncCoordinator,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
    started_at: DateTime<Utc>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "daemon listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let coordinator = coordinator.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, coordinator, shutdown_tx, started_at).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    coordinator: SyncCoordinator,
    shutdown_tx: broadcast::Sender<()>,
    started_at: DateTime<Utc>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        if request.cmd == "stop" {
            let _ = shutdown_tx.send(());
            write_response(&mut writer, &DaemonResponse::ok(json!({ "stopping": true }))).await?;
            break;
        }
        let response = handle_request(&coordinator, &request, Some(started_at)).await;
        write_response(&mut writer, &response).await?;
    }

    Ok(())
}

/// Answer one control request against `coordinator`.
///
/// Shared by the socket server and by the CLI when no daemon is running;
/// `daemon_started_at` is `None` in the latter case. `stop` is not handled
/// here since only the daemon has something to stop.
pub async fn handle_request(
    coordinator: &SyncCoordinator,
    request: &DaemonRequest,
    daemon_started_at: Option<DateTime<Utc>>,
) -> DaemonResponse {
    let result: Result<Value, String> = match request.cmd.as_str() {
        "status" => Ok(status_payload(coordinator, daemon_started_at)),
        "sync" => {
            // Bidirectional (or no direction) runs whatever the config enables.
            let reports = match request.direction {
                Some(SyncDirection::FileToApp) => coordinator.sync_file_to_app().await.map(|r| vec![r]),
                Some(SyncDirection::AppToFile) => coordinator.sync_app_to_file().await.map(|r| vec![r]),
                Some(SyncDirection::Bidirectional) | None => coordinator.sync().await,
            };
            reports.map(|r| json!(r)).map_err(|e| e.to_string())
        }
        "history" => {
            let limit = request.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
            Ok(json!(coordinator.history(limit)))
        }
        "conflicts" => Ok(json!(coordinator.conflicts())),
        "resolve" => match (&request.task_id, request.side) {
            (Some(task_id), Some(side)) => coordinator
                .resolve_conflict(&TaskId::from(task_id.as_str()), side)
                .await
                .map(|c| json!(c))
                .map_err(|e| e.to_string()),
            _ => Err("resolve needs task_id and side".to_string()),
        },
        "diff" => coordinator
            .preview_app_to_file()
            .await
            .map(|p| json!(p))
            .map_err(|e| e.to_string()),
        other => Err(format!("unknown command '{other}'")),
    };
    match result {
        Ok(data) => DaemonResponse::ok(data),
        Err(message) => DaemonResponse::error(message),
    }
}

/// Coordinator status as reported by `status`.
pub fn status_payload(coordinator: &SyncCoordinator, daemon_started_at: Option<DateTime<Utc>>) -> Value {
    let config = coordinator.config();
    json!({
        "running": daemon_started_at.is_some(),
        "pid": daemon_started_at.map(|_| std::process::id()),
        "started_at": daemon_started_at,
        "todo_path": config.todo_path.display().to_string(),
        "direction": config.direction,
        "strategy": config.strategy,
        "conflict_resolution": config.conflict_resolution,
        "state": coordinator.state(),
        "sync": coordinator.sync_state(),
        "stats": coordinator.stats(),
        "breakers": coordinator.breaker_states(),
        "pending_conflicts": coordinator.conflicts().len(),
    })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    let run = run_dir(home);
    if !run.exists() {
        fs::create_dir_all(&run).map_err(|e| io_err(&run, e))?;
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// `RUST_LOG`-driven subscriber, `info` by default. Safe to call twice.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
