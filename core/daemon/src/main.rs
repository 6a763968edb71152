//! LogIt daemon entrypoint.
//!
//! A single-writer service that samples the process table once per interval,
//! keeps one numbered session per running user-facing application in SQLite,
//! and answers read requests on a local socket. Sessions left open by a
//! crash are closed from their last persisted duration before monitoring
//! starts.

use clap::Parser;
use fs_err as fs;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use logit_daemon_protocol::{
    parse_append_session, parse_list_programs, parse_program_sessions, ErrorInfo, Method, Request,
    Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use serde::Serialize;

mod catalog;
mod config;
mod db;
mod desktop;
mod error;
mod ledger;
mod logging;
mod monitor;
mod reconcile;
mod repair;
mod run_history;
mod sampler;
mod shutdown;
mod state;

use db::Db;
use reconcile::Reconciler;
use run_history::StartupReport;
use sampler::SystemSampler;
use shutdown::CancellationToken;
use state::SharedState;

const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

#[derive(Parser)]
#[command(name = "logit-daemon")]
#[command(about = "LogIt process session monitor")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.logit/daemon/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// SQLite database file (default: ~/.logit/daemon/logit.db)
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Milliseconds between monitor ticks
    #[arg(long, value_name = "MS")]
    interval_ms: Option<u64>,
}

/// What socket handlers need besides the shared state.
struct ServerContext {
    state: Arc<SharedState>,
    interval: Duration,
    startup: Option<StartupReport>,
}

#[derive(Debug, thiserror::Error)]
enum SocketError {
    #[error("another logit-daemon is already listening on {0}")]
    InUse(PathBuf),

    #[error("{0}")]
    Unavailable(String),
}

fn main() {
    let cli = Cli::parse();
    let log_dir = logit_dir().ok().map(|dir| dir.join("logs"));
    let _log_guard = logging::init_logging(log_dir.as_deref());

    let root = match logit_dir() {
        Ok(root) => root,
        Err(err) => {
            error!(error = %err, "Failed to resolve LogIt data directory");
            std::process::exit(1);
        }
    };

    let mut config = match config::load_config(cli.config.clone()) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load daemon config; using defaults");
            config::DaemonConfig::default()
        }
    };
    if let Some(interval_ms) = cli.interval_ms {
        config.monitor.interval_ms = interval_ms;
    }

    // The socket doubles as the single-instance guard: a second monitor would
    // repair the first one's live sessions and number sessions twice.
    let socket_path = root.join(SOCKET_NAME);
    let listener = match claim_socket(&socket_path) {
        Ok(listener) => Some(listener),
        Err(err @ SocketError::InUse(_)) => {
            error!(error = %err, "Refusing to start a second daemon");
            std::process::exit(1);
        }
        Err(err) => {
            warn!(error = %err, "Read surface unavailable; monitoring without it");
            None
        }
    };
    let serving = listener.is_some();

    let db_path = cli
        .db
        .or_else(|| config.storage.db_path.clone())
        .unwrap_or_else(|| root.join("daemon").join("logit.db"));
    let db = match Db::new(db_path.clone()) {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, path = %db_path.display(), "Failed to initialize daemon database");
            if serving {
                let _ = remove_socket(&socket_path);
            }
            std::process::exit(1);
        }
    };

    let history_path = root.join("daemon").join("run-history.json");
    let mut startup = match run_history::record_start(&history_path, monitor::clock_now()) {
        Ok(report) => Some(report),
        Err(err) => {
            warn!(error = %err, "Failed to record daemon start");
            None
        }
    };

    let repair = match repair::repair_open_sessions(&db) {
        Ok(stats) => Some(stats),
        Err(err) => {
            warn!(error = %err, "Startup repair failed; open sessions left as-is");
            None
        }
    };
    if let Some(stats) = repair.filter(|stats| stats.repaired > 0 || stats.failed > 0) {
        info!(
            repaired = stats.repaired,
            failed = stats.failed,
            "Startup repair finished"
        );
    }
    if let Some(report) = startup.as_mut() {
        report.repair = repair;
        if report.repaired_after_crash() {
            warn!(
                previous_run = ?report.previous_run,
                repaired = report.repair.map(|stats| stats.repaired).unwrap_or(0),
                "Previous run ended without a clean shutdown; closed its sessions at last save"
            );
        }
        if report.restart_loop {
            warn!(
                unclean_starts = report.recent_unclean_starts,
                "Daemon keeps restarting without a clean shutdown"
            );
        }
    }

    let state = Arc::new(SharedState::new(db));
    let token = CancellationToken::new();
    {
        let token = token.clone();
        if let Err(err) = ctrlc::set_handler(move || token.cancel()) {
            warn!(error = %err, "Failed to install shutdown signal handler");
        }
    }

    let policy = config.policy();
    if !cfg!(target_os = "linux") && policy.require_visible_window {
        warn!(
            "Visible-window detection is unavailable here; \
             set relevance.require_visible_window = false to monitor by executable path"
        );
    }
    let probe = desktop::platform_probe(config.window_probe_timeout());
    let reconciler = Reconciler::new(Arc::clone(&state), SystemSampler::new(policy, probe));

    let interval = config.interval();
    let monitor = match monitor::spawn_monitor(reconciler, token.clone(), interval) {
        Ok(handle) => handle,
        Err(err) => {
            error!(error = %err, "Failed to start monitor thread");
            if serving {
                let _ = remove_socket(&socket_path);
            }
            std::process::exit(1);
        }
    };

    info!(
        socket = %socket_path.display(),
        db = %db_path.display(),
        interval_ms = interval.as_millis() as u64,
        "LogIt daemon started"
    );

    if let Some(listener) = listener {
        let context = Arc::new(ServerContext {
            state: Arc::clone(&state),
            interval,
            startup,
        });
        if let Err(err) = thread::Builder::new()
            .name("logit-socket".to_string())
            .spawn(move || serve(listener, context))
        {
            warn!(error = %err, "Failed to start socket server; monitoring without it");
        }
    }

    if monitor.join().is_err() {
        error!("Monitor thread panicked");
    }

    info!(
        open_sessions = state.open_session_count(),
        "LogIt daemon stopping; open sessions will be closed on next start"
    );
    if let Err(err) = run_history::record_clean_stop(&history_path, monitor::clock_now()) {
        warn!(error = %err, "Failed to record clean shutdown");
    }
    if serving {
        if let Err(err) = remove_socket(&socket_path) {
            warn!(error = %err, "Failed to remove daemon socket");
        }
    }
}

fn serve(listener: UnixListener, context: Arc<ServerContext>) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let context = Arc::clone(&context);
                thread::spawn(move || handle_connection(stream, &context));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn logit_dir() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".logit"))
}

/// Binds the daemon socket. A leftover socket file is replaced only when no
/// daemon answers on it.
fn claim_socket(socket_path: &Path) -> Result<UnixListener, SocketError> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| SocketError::Unavailable("Socket path has no parent".to_string()))?;
    fs::create_dir_all(parent).map_err(|err| {
        SocketError::Unavailable(format!("Failed to create socket directory: {}", err))
    })?;

    if socket_path.exists() {
        if UnixStream::connect(socket_path).is_ok() {
            return Err(SocketError::InUse(socket_path.to_path_buf()));
        }
        remove_socket(socket_path).map_err(SocketError::Unavailable)?;
    }

    UnixListener::bind(socket_path).map_err(|err| {
        SocketError::Unavailable(format!(
            "Failed to bind daemon socket {}: {}",
            socket_path.display(),
            err
        ))
    })
}

fn remove_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove stale socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, context: &ServerContext) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handle_request(request, context);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let line = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(line).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, context: &ServerContext) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let state = &context.state;
    match request.method {
        Method::GetHealth => {
            let mut data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "interval_ms": context.interval.as_millis() as u64,
                "tracked": state.open_session_count(),
            });
            if let Some(report) = state.last_tick() {
                if let Ok(value) = serde_json::to_value(report) {
                    data["last_tick"] = value;
                }
            }
            if let Some(startup) = context.startup.as_ref() {
                if let Ok(value) = serde_json::to_value(startup) {
                    data["startup"] = value;
                }
            }
            Response::ok(request.id, data)
        }
        Method::ListPrograms => {
            let params = match parse_list_programs(request.params) {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            match state.programs_snapshot(params.active_only) {
                Ok(programs) => {
                    tracing::debug!(
                        programs = programs.len(),
                        active_only = params.active_only,
                        "Programs snapshot"
                    );
                    serialized(request.id, &programs, "programs")
                }
                Err(err) => Response::error(
                    request.id,
                    "programs_error",
                    format!("Failed to fetch programs: {}", err),
                ),
            }
        }
        Method::GetProgramSessions => {
            let params = match request.params {
                Some(params) => params,
                None => {
                    return Response::error(request.id, "invalid_params", "program_id is required")
                }
            };
            let parsed = match parse_program_sessions(params) {
                Ok(parsed) => parsed,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            match state.program_sessions_snapshot(parsed.program_id) {
                Ok(Some(sessions)) => serialized(request.id, &sessions, "sessions"),
                Ok(None) => program_not_found(request.id, parsed.program_id),
                Err(err) => Response::error(
                    request.id,
                    "sessions_error",
                    format!("Failed to fetch sessions: {}", err),
                ),
            }
        }
        Method::GetTracked => {
            serialized(request.id, &state.tracked_snapshot(), "tracked processes")
        }
        Method::AppendSession => {
            let params = match request.params {
                Some(params) => params,
                None => {
                    return Response::error(request.id, "invalid_params", "session is required")
                }
            };
            let parsed = match parse_append_session(params) {
                Ok(parsed) => parsed,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            match state.append_session(&parsed) {
                Ok(Some(session)) => serialized(request.id, &session, "session"),
                Ok(None) => program_not_found(request.id, parsed.program_id),
                Err(err) => Response::error(
                    request.id,
                    "append_error",
                    format!("Failed to append session: {}", err),
                ),
            }
        }
    }
}

fn program_not_found(id: Option<String>, program_id: i64) -> Response {
    Response::error(
        id,
        "program_not_found",
        format!("no program with id {}", program_id),
    )
}

fn serialized<T: Serialize>(id: Option<String>, value: &T, what: &str) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize {}: {}", what, err),
        ),
    }
}

fn write_response(stream: &mut UnixStream, response: Response) -> Result<(), String> {
    let mut payload = serde_json::to_vec(&response)
        .map_err(|err| format!("Failed to serialize response: {}", err))?;
    payload.push(b'\n');
    stream
        .write_all(&payload)
        .map_err(|err| format!("Failed to write response: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};

    fn context() -> (tempfile::TempDir, ServerContext) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("logit.db")).expect("db init");
        let context = ServerContext {
            state: Arc::new(SharedState::new(db)),
            interval: Duration::from_millis(1000),
            startup: None,
        };
        (temp_dir, context)
    }

    fn request(method: Method, params: Option<Value>) -> Request {
        Request {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: Some("t".to_string()),
            params,
        }
    }

    fn error_code(response: &Response) -> Option<&str> {
        response.error.as_ref().map(|err| err.code.as_str())
    }

    #[test]
    fn health_reports_interval_and_tracked_count() {
        let (_dir, context) = context();
        let response = handle_request(request(Method::GetHealth, None), &context);

        assert!(response.ok);
        let data = response.data.expect("data");
        assert_eq!(data["status"], "ok");
        assert_eq!(data["interval_ms"], 1000);
        assert_eq!(data["tracked"], 0);
        assert!(data.get("last_tick").is_none());
    }

    #[test]
    fn rejects_protocol_mismatch() {
        let (_dir, context) = context();
        let mut mismatched = request(Method::GetHealth, None);
        mismatched.protocol_version = PROTOCOL_VERSION + 1;

        let response = handle_request(mismatched, &context);
        assert_eq!(error_code(&response), Some("protocol_mismatch"));
    }

    #[test]
    fn append_then_list_program_sessions() {
        let (_dir, context) = context();
        let start = Utc.with_ymd_and_hms(2026, 2, 1, 9, 0, 0).unwrap();
        let program =
            catalog::find_or_create(context.state.db(), "Best Editor", start).expect("program");

        let response = handle_request(
            request(
                Method::AppendSession,
                Some(json!({
                    "program_id": program.program_id,
                    "start_time": "2026-02-01T09:00:00Z",
                    "end_time": "2026-02-01T09:30:00Z",
                })),
            ),
            &context,
        );
        assert!(response.ok, "append failed: {:?}", response.error);
        let session = response.data.expect("session");
        assert_eq!(session["session_number"], 1);
        assert_eq!(session["duration_ms"], 30 * 60 * 1000);

        let response = handle_request(
            request(
                Method::GetProgramSessions,
                Some(json!({ "program_id": program.program_id })),
            ),
            &context,
        );
        let sessions = response.data.expect("sessions");
        assert_eq!(sessions.as_array().map(Vec::len), Some(1));

        let response = handle_request(
            request(Method::ListPrograms, Some(json!({ "active_only": true }))),
            &context,
        );
        assert_eq!(response.data.expect("programs"), json!([]));
    }

    #[test]
    fn unknown_program_is_reported() {
        let (_dir, context) = context();
        let response = handle_request(
            request(Method::GetProgramSessions, Some(json!({ "program_id": 42 }))),
            &context,
        );
        assert_eq!(error_code(&response), Some("program_not_found"));

        let response = handle_request(
            request(
                Method::AppendSession,
                Some(json!({ "program_id": 42, "start_time": "2026-02-01T09:00:00Z" })),
            ),
            &context,
        );
        assert_eq!(error_code(&response), Some("program_not_found"));
    }

    #[test]
    fn invalid_params_are_rejected() {
        let (_dir, context) = context();
        let response = handle_request(request(Method::AppendSession, None), &context);
        assert_eq!(error_code(&response), Some("invalid_params"));

        let response = handle_request(
            request(
                Method::AppendSession,
                Some(json!({
                    "program_id": 1,
                    "start_time": "2026-02-01T09:00:00Z",
                    "end_time": "2026-02-01T08:00:00Z",
                })),
            ),
            &context,
        );
        assert_eq!(error_code(&response), Some("invalid_params"));

        let response = handle_request(
            request(Method::ListPrograms, Some(json!({ "unexpected": 1 }))),
            &context,
        );
        assert_eq!(error_code(&response), Some("invalid_params"));
    }

    #[test]
    fn tracked_snapshot_is_empty_before_first_tick() {
        let (_dir, context) = context();
        let response = handle_request(request(Method::GetTracked, None), &context);
        assert_eq!(response.data.expect("tracked"), json!([]));
    }

    #[test]
    fn live_socket_is_not_claimed() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let socket_path = temp_dir.path().join(SOCKET_NAME);
        let _live = claim_socket(&socket_path).expect("first claim");

        let second = claim_socket(&socket_path);
        assert!(matches!(second, Err(SocketError::InUse(_))));
        assert!(socket_path.exists());
        assert!(UnixStream::connect(&socket_path).is_ok());
    }

    #[test]
    fn stale_socket_file_is_replaced() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let socket_path = temp_dir.path().join("run").join(SOCKET_NAME);
        drop(claim_socket(&socket_path).expect("first claim"));
        assert!(socket_path.exists());

        let listener = claim_socket(&socket_path).expect("reclaim");
        assert!(UnixStream::connect(&socket_path).is_ok());
        drop(listener);
    }
}
