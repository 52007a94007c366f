//! Daemon runtime: sync coordinator + file watcher + control socket.

mod error;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{
    request_conflicts, request_history, request_resolve, request_status, request_stop,
    request_sync, send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{
    handle_request, init_tracing, open_coordinator, run, start_blocking, status_payload,
};
