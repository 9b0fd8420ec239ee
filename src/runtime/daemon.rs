use super::event_server::EventServer;
use super::services::open_orchestrator;
use super::start_requests::drain_start_requests;
use super::worker_primitives::sleep_with_stop;
use super::{bootstrap_state_root, RuntimeError, StatePaths};
use crate::config::Settings;
use crate::orchestration::requests::RequestContext;
use crate::shared::clock::{Clock, SystemClock};
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::logging::Logger;
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DAEMON_POLL_INTERVAL: Duration = Duration::from_millis(100);
const SHUTDOWN_REASON: &str = "daemon shutdown";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DaemonState {
    pub running: bool,
    pub pid: Option<u32>,
    /// Address the event server actually bound.
    pub addr: Option<String>,
    pub started_at: Option<i64>,
    pub stopped_at: Option<i64>,
    pub recovered_runs: usize,
    pub started_runs: usize,
    pub last_error: Option<String>,
}

pub fn load_daemon_state(paths: &StatePaths) -> Result<Option<DaemonState>, RuntimeError> {
    let path = paths.daemon_state_path();
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(RuntimeError::Io {
                path: path.display().to_string(),
                source,
            })
        }
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|source| RuntimeError::Json {
            path: path.display().to_string(),
            source,
        })
}

pub fn save_daemon_state(paths: &StatePaths, state: &DaemonState) -> Result<(), RuntimeError> {
    let path = paths.daemon_state_path();
    let body = serde_json::to_vec_pretty(state).map_err(|source| RuntimeError::Json {
        path: path.display().to_string(),
        source,
    })?;
    atomic_write_file(&path, &body).map_err(|source| RuntimeError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Asks a running daemon to shut down by dropping the stop file.
pub fn signal_stop(paths: &StatePaths) -> Result<(), RuntimeError> {
    bootstrap_state_root(paths)?;
    let path = paths.stop_signal_path();
    fs::write(&path, b"stop").map_err(|source| RuntimeError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Hosts the engine, the hub and the event server until the stop file
/// appears or `stop` is raised.
///
/// Startup recovery runs before anything else can start a run. Runs still
/// driven by this process at shutdown are cancelled and their workers joined.
pub fn serve(
    paths: &StatePaths,
    settings: &Settings,
    stop: Arc<AtomicBool>,
) -> Result<DaemonState, RuntimeError> {
    bootstrap_state_root(paths)?;
    let stop_path = paths.stop_signal_path();
    if stop_path.exists() {
        let _ = fs::remove_file(&stop_path);
    }

    let clock = SystemClock;
    let logger = Logger::to_file(paths.runtime_log_path());
    let orchestrator = open_orchestrator(paths, settings)?;
    let ctx = RequestContext::new("daemon", "daemon-startup");
    let recovered = orchestrator.recover_interrupted_runs(&ctx)?;

    let maintenance = orchestrator
        .hub()
        .spawn_maintenance(Arc::clone(&stop))
        .map_err(|source| RuntimeError::Spawn {
            what: "hub maintenance".to_string(),
            source,
        })?;
    let server = EventServer::bind(
        &settings.server.bind,
        orchestrator.hub().clone(),
        logger.clone(),
    )?;
    let addr = server.local_addr()?;
    let server_handle = server.spawn(Arc::clone(&stop))?;

    let mut state = DaemonState {
        running: true,
        pid: Some(std::process::id()),
        addr: Some(addr.to_string()),
        started_at: Some(clock.now_millis()),
        stopped_at: None,
        recovered_runs: recovered.len(),
        started_runs: 0,
        last_error: None,
    };
    save_daemon_state(paths, &state)?;
    logger.info(
        "daemon.started",
        format!(
            "pid={} addr={addr} recovered={}",
            std::process::id(),
            recovered.len()
        ),
    );

    while !stop.load(Ordering::Relaxed) {
        if stop_path.exists() {
            stop.store(true, Ordering::Relaxed);
            logger.info("daemon.stop.signal", "stop file detected");
            break;
        }
        match drain_start_requests(paths, &orchestrator, &logger) {
            Ok(started) => state.started_runs += started,
            Err(err) => {
                logger.error("daemon.start_requests.failed", err.to_string());
                state.last_error = Some(err.to_string());
            }
        }
        sleep_with_stop(&stop, DAEMON_POLL_INTERVAL);
    }
    stop.store(true, Ordering::Relaxed);

    let engine = orchestrator.engine();
    let shutdown_ctx = RequestContext::new("daemon", "daemon-shutdown");
    for run_id in engine.active_run_ids() {
        match orchestrator.stop(&shutdown_ctx, &run_id, SHUTDOWN_REASON) {
            Ok(_) => {}
            Err(err) => {
                logger.warn(
                    "daemon.shutdown.cancel_failed",
                    format!("run={run_id} error={err}"),
                );
            }
        }
    }
    engine.join_all();
    orchestrator.hub().close_all();
    let _ = server_handle.join();
    let _ = maintenance.join();
    let _ = fs::remove_file(&stop_path);

    state.running = false;
    state.stopped_at = Some(clock.now_millis());
    save_daemon_state(paths, &state)?;
    logger.info("daemon.stopped", format!("started_runs={}", state.started_runs));
    Ok(state)
}
