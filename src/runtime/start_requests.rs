use super::{RuntimeError, StatePaths};
use crate::orchestration::requests::{validate_run_id, RequestContext};
use crate::orchestration::Orchestrator;
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::logging::Logger;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// A start handed to the daemon by a detached CLI invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    pub run_id: String,
    pub actor: String,
    pub requested_at: i64,
}

pub fn enqueue_start_request(
    paths: &StatePaths,
    request: &StartRequest,
) -> Result<PathBuf, RuntimeError> {
    validate_run_id(&request.run_id)?;
    let path = paths
        .start_requests_dir()
        .join(format!("{}.json", request.run_id));
    let body = serde_json::to_vec_pretty(request).map_err(|source| RuntimeError::Json {
        path: path.display().to_string(),
        source,
    })?;
    atomic_write_file(&path, &body).map_err(|source| RuntimeError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(path)
}

/// Claims every queued start request, oldest first, and starts its run.
///
/// A request file is removed before its start is attempted so a run that
/// cannot start is not retried on the next pass.
pub fn drain_start_requests(
    paths: &StatePaths,
    orchestrator: &Orchestrator,
    logger: &Logger,
) -> Result<usize, RuntimeError> {
    let mut requests = Vec::new();
    let dir = paths.start_requests_dir();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(source) => {
            return Err(RuntimeError::Io {
                path: dir.display().to_string(),
                source,
            })
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        match read_request(&path) {
            Ok(request) => requests.push((path, request)),
            Err(err) => {
                logger.warn("daemon.start_request.invalid", err.to_string());
                let _ = fs::remove_file(&path);
            }
        }
    }
    requests.sort_by(|left, right| {
        left.1
            .requested_at
            .cmp(&right.1.requested_at)
            .then_with(|| left.1.run_id.cmp(&right.1.run_id))
    });

    let mut started = 0;
    for (path, request) in requests {
        if let Err(source) = fs::remove_file(&path) {
            if source.kind() == std::io::ErrorKind::NotFound {
                continue;
            }
            return Err(RuntimeError::Io {
                path: path.display().to_string(),
                source,
            });
        }
        let ctx = RequestContext::new(request.actor.clone(), format!("start-{}", request.run_id));
        match orchestrator.start(&ctx, &request.run_id) {
            Ok(_) => {
                started += 1;
                logger.info(
                    "daemon.start_request.started",
                    format!("run={} actor={}", request.run_id, request.actor),
                );
            }
            Err(err) => logger.warn(
                "daemon.start_request.failed",
                format!("run={} error={err}", request.run_id),
            ),
        }
    }
    Ok(started)
}

fn read_request(path: &Path) -> Result<StartRequest, RuntimeError> {
    let raw = fs::read(path).map_err(|source| RuntimeError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|source| RuntimeError::Json {
        path: path.display().to_string(),
        source,
    })
}
