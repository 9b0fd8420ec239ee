use crate::orchestration::error::OrchestratorError;
use crate::orchestration::run::{
    HistoryEntry, HistoryKind, RunError, RunErrorKind, RunFilter, RunRecord, RunStatus,
    TERMINAL_STATUSES,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CAS_RETRIES: usize = 3;

const RUN_COLUMNS: &str = "id, tag, spec, profile_id, status, phase, percent_complete, \
     current_action, run_attempt_id, completed_steps, history, error_message, error_step_id, \
     error_kind, cancel_reason, created_at, updated_at, started_at, completed_at";

/// Input for `create_run`. The caller supplies the id and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRun {
    pub id: String,
    pub tag: Option<String>,
    pub spec: Value,
    pub profile_id: Option<String>,
}

/// Optional data written alongside a status change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionDetails {
    pub reason: Option<String>,
    pub actor: Option<String>,
    pub error: Option<RunError>,
    pub cancel_reason: Option<String>,
}

impl TransitionDetails {
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_error(mut self, error: RunError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_cancel_reason(mut self, reason: impl Into<String>) -> Self {
        self.cancel_reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub percent_complete: u8,
    pub regressed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredRun {
    pub run_id: String,
    pub from: RunStatus,
    pub to: RunStatus,
}

/// Durable run storage. Every state change is a guarded UPDATE; nothing here
/// performs an unguarded read-modify-write.
pub struct RunStore {
    db_path: PathBuf,
    connection: Mutex<Connection>,
}

impl std::fmt::Debug for RunStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStore")
            .field("db_path", &self.db_path)
            .finish()
    }
}

impl RunStore {
    pub fn open(db_path: &Path) -> Result<Self, OrchestratorError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|source| OrchestratorError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let connection = Connection::open(db_path)?;
        Self::from_connection(db_path.to_path_buf(), connection)
    }

    pub fn open_in_memory() -> Result<Self, OrchestratorError> {
        let connection = Connection::open_in_memory()?;
        Self::from_connection(PathBuf::from(":memory:"), connection)
    }

    fn from_connection(db_path: PathBuf, connection: Connection) -> Result<Self, OrchestratorError> {
        connection.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self {
            db_path,
            connection: Mutex::new(connection),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> MutexGuard<'_, Connection> {
        self.connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_schema(&self) -> Result<(), OrchestratorError> {
        let connection = self.connect();
        connection.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                tag TEXT,
                spec TEXT NOT NULL,
                profile_id TEXT,
                status TEXT NOT NULL,
                phase TEXT NOT NULL DEFAULT '',
                percent_complete INTEGER NOT NULL DEFAULT 0,
                current_action TEXT NOT NULL DEFAULT '',
                run_attempt_id TEXT,
                completed_steps TEXT NOT NULL DEFAULT '[]',
                history TEXT NOT NULL DEFAULT '[]',
                error_message TEXT,
                error_step_id TEXT,
                error_kind TEXT,
                cancel_reason TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
            CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at DESC);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_active_tag ON runs(tag)
                WHERE tag IS NOT NULL
                  AND status NOT IN ('completed', 'failed', 'cancelled', 'rejected');
            ",
        )?;
        Ok(())
    }

    pub fn create_run(&self, new_run: NewRun, now: i64) -> Result<RunRecord, OrchestratorError> {
        let spec = encode_json(&new_run.spec, &new_run.id)?;
        {
            let connection = self.connect();
            let inserted = connection.execute(
                "
                INSERT INTO runs (id, tag, spec, profile_id, status, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                ",
                params![
                    new_run.id,
                    new_run.tag,
                    spec,
                    new_run.profile_id,
                    RunStatus::Pending.as_str(),
                    now
                ],
            );
            if let Err(err) = inserted {
                return Err(map_insert_conflict(err, &new_run));
            }
        }
        self.get_run(&new_run.id)
    }

    pub fn get_run(&self, run_id: &str) -> Result<RunRecord, OrchestratorError> {
        let connection = self.connect();
        let raw = connection
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                params![run_id],
                RawRunRow::from_row,
            )
            .optional()?;
        raw.ok_or_else(|| OrchestratorError::UnknownRun {
            run_id: run_id.to_string(),
        })?
        .into_record()
    }

    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, OrchestratorError> {
        let mut sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE 1 = 1");
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(status) = filter.status {
            values.push(SqlValue::Text(status.as_str().to_string()));
            sql.push_str(&format!(" AND status = ?{}", values.len()));
        }
        if let Some(tag) = filter.tag.as_ref() {
            values.push(SqlValue::Text(tag.clone()));
            sql.push_str(&format!(" AND tag = ?{}", values.len()));
        }
        if !filter.include_terminal {
            sql.push_str(&format!(" AND status NOT IN ({})", terminal_status_list()));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            values.push(SqlValue::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let connection = self.connect();
        let mut statement = connection.prepare(&sql)?;
        let rows = statement
            .query_map(params_from_iter(values), RawRunRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawRunRow::into_record).collect()
    }

    /// The non-terminal run carrying `tag`, or else the newest terminal one.
    pub fn get_by_tag(&self, tag: &str) -> Result<RunRecord, OrchestratorError> {
        let connection = self.connect();
        let raw = connection
            .query_row(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE tag = ?1
                     ORDER BY CASE WHEN status IN ({}) THEN 1 ELSE 0 END, created_at DESC
                     LIMIT 1",
                    terminal_status_list()
                ),
                params![tag],
                RawRunRow::from_row,
            )
            .optional()?;
        raw.ok_or_else(|| OrchestratorError::UnknownTag {
            tag: tag.to_string(),
        })?
        .into_record()
    }

    /// Moves a pending run to running under a fresh attempt id, clearing the
    /// completed-step set, error and progress.
    pub fn start_run(
        &self,
        run_id: &str,
        attempt_id: &str,
        actor: Option<&str>,
        now: i64,
    ) -> Result<RunRecord, OrchestratorError> {
        let entry = status_entry(now, RunStatus::Running, Some(RunStatus::Pending), None, actor);
        let changed = {
            let connection = self.connect();
            connection.execute(
                "
                UPDATE runs SET
                    status = ?2,
                    run_attempt_id = ?3,
                    completed_steps = '[]',
                    phase = '',
                    percent_complete = 0,
                    current_action = '',
                    error_message = NULL,
                    error_step_id = NULL,
                    error_kind = NULL,
                    cancel_reason = NULL,
                    started_at = ?4,
                    updated_at = ?4,
                    completed_at = NULL,
                    history = json_insert(history, '$[#]', json(?5))
                WHERE id = ?1 AND status = ?6
                ",
                params![
                    run_id,
                    RunStatus::Running.as_str(),
                    attempt_id,
                    now,
                    entry,
                    RunStatus::Pending.as_str()
                ],
            )?
        };
        let run = self.get_run(run_id)?;
        if changed == 1 {
            return Ok(run);
        }
        if run.status.is_terminal() {
            return Err(OrchestratorError::Terminal {
                run_id: run_id.to_string(),
                status: run.status,
            });
        }
        Err(OrchestratorError::AlreadyRunning {
            run_id: run_id.to_string(),
            status: run.status,
        })
    }

    /// Records `step_id` for the current attempt. Returns `false` when it was
    /// already recorded.
    pub fn mark_step_completed(
        &self,
        run_id: &str,
        attempt_id: &str,
        step_id: &str,
        now: i64,
    ) -> Result<bool, OrchestratorError> {
        let entry = history_json(&HistoryEntry::new(
            now,
            HistoryKind::StepCompleted,
            json!({ "step_id": step_id, "attempt_id": attempt_id }),
        ))?;
        let changed = {
            let connection = self.connect();
            connection.execute(
                "
                UPDATE runs SET
                    completed_steps = json_insert(completed_steps, '$[#]', ?3),
                    history = json_insert(history, '$[#]', json(?4)),
                    updated_at = ?5
                WHERE id = ?1
                  AND run_attempt_id = ?2
                  AND NOT EXISTS (
                      SELECT 1 FROM json_each(runs.completed_steps) WHERE json_each.value = ?3
                  )
                ",
                params![run_id, attempt_id, step_id, entry, now],
            )?
        };
        if changed == 1 {
            return Ok(true);
        }
        let run = self.get_run(run_id)?;
        if run.run_attempt_id.as_deref() != Some(attempt_id) {
            return Err(OrchestratorError::StaleAttempt {
                run_id: run_id.to_string(),
                attempt_id: attempt_id.to_string(),
            });
        }
        Ok(false)
    }

    /// Compare-and-set status change from `from` to `to`.
    pub fn transition(
        &self,
        run_id: &str,
        from: RunStatus,
        to: RunStatus,
        details: TransitionDetails,
        now: i64,
    ) -> Result<RunRecord, OrchestratorError> {
        if !from.can_transition_to(to) {
            return Err(OrchestratorError::InvalidRunTransition { from, to });
        }
        let entry = status_entry(
            now,
            to,
            Some(from),
            details.reason.as_deref(),
            details.actor.as_deref(),
        );
        let (error_message, error_step_id, error_kind) = match details.error.as_ref() {
            Some(error) => (
                Some(error.message.clone()),
                error.step_id.clone(),
                Some(error.kind.as_str()),
            ),
            None => (None, None, None),
        };
        let changed = {
            let connection = self.connect();
            connection.execute(
                "
                UPDATE runs SET
                    status = ?3,
                    updated_at = ?4,
                    completed_at = CASE WHEN ?5 THEN ?4 ELSE completed_at END,
                    percent_complete = CASE WHEN ?3 = 'completed' THEN 100 ELSE percent_complete END,
                    error_message = CASE WHEN ?6 IS NULL THEN error_message ELSE ?6 END,
                    error_step_id = CASE WHEN ?6 IS NULL THEN error_step_id ELSE ?7 END,
                    error_kind = CASE WHEN ?6 IS NULL THEN error_kind ELSE ?8 END,
                    cancel_reason = COALESCE(?9, cancel_reason),
                    history = json_insert(history, '$[#]', json(?10))
                WHERE id = ?1 AND status = ?2
                ",
                params![
                    run_id,
                    from.as_str(),
                    to.as_str(),
                    now,
                    to.is_terminal(),
                    error_message,
                    error_step_id,
                    error_kind,
                    details.cancel_reason,
                    entry
                ],
            )?
        };
        let run = self.get_run(run_id)?;
        if changed == 1 {
            return Ok(run);
        }
        Err(OrchestratorError::StatusChanged {
            run_id: run_id.to_string(),
            expected: from,
            actual: run.status,
        })
    }

    /// Moves the run to `to` from whatever status it currently has, enforcing
    /// the state machine. Retries when another writer wins the race.
    pub fn set_status(
        &self,
        run_id: &str,
        to: RunStatus,
        details: TransitionDetails,
        now: i64,
    ) -> Result<RunRecord, OrchestratorError> {
        let mut last_error = None;
        for _ in 0..MAX_CAS_RETRIES {
            let current = self.get_run(run_id)?.status;
            match self.transition(run_id, current, to, details.clone(), now) {
                Ok(run) => return Ok(run),
                Err(err @ OrchestratorError::StatusChanged { .. }) => last_error = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            OrchestratorError::Internal(format!("status update for `{run_id}` did not converge"))
        }))
    }

    pub fn append_history(
        &self,
        run_id: &str,
        entry: &HistoryEntry,
    ) -> Result<(), OrchestratorError> {
        let body = history_json(entry)?;
        let changed = {
            let connection = self.connect();
            connection.execute(
                "UPDATE runs SET history = json_insert(history, '$[#]', json(?2)) WHERE id = ?1",
                params![run_id, body],
            )?
        };
        if changed == 0 {
            return Err(OrchestratorError::UnknownRun {
                run_id: run_id.to_string(),
            });
        }
        Ok(())
    }

    /// Stores executor progress. The stored percent never decreases within an
    /// attempt and stays below 100 until the run completes.
    pub fn update_progress(
        &self,
        run_id: &str,
        attempt_id: &str,
        phase: &str,
        percent: i64,
        current_action: &str,
        now: i64,
    ) -> Result<ProgressUpdate, OrchestratorError> {
        let requested = percent.clamp(0, 99);
        let connection = self.connect();
        let changed = connection.execute(
            "
            UPDATE runs SET
                history = json_insert(history, '$[#]', json_object(
                    'timestamp', ?6,
                    'kind', 'progress',
                    'payload', json_object(
                        'phase', ?3,
                        'percent', MAX(percent_complete, ?4),
                        'current_action', ?5
                    )
                )),
                phase = ?3,
                percent_complete = MAX(percent_complete, ?4),
                current_action = ?5,
                updated_at = ?6
            WHERE id = ?1
              AND run_attempt_id = ?2
              AND status IN ('running', 'awaiting_approval', 'stopping')
            ",
            params![run_id, attempt_id, phase, requested, current_action, now],
        )?;
        let current = connection
            .query_row(
                "SELECT percent_complete, run_attempt_id FROM runs WHERE id = ?1",
                params![run_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?;
        let Some((stored, current_attempt)) = current else {
            return Err(OrchestratorError::UnknownRun {
                run_id: run_id.to_string(),
            });
        };
        if changed == 0 && current_attempt.as_deref() != Some(attempt_id) {
            return Err(OrchestratorError::StaleAttempt {
                run_id: run_id.to_string(),
                attempt_id: attempt_id.to_string(),
            });
        }
        Ok(ProgressUpdate {
            percent_complete: stored.clamp(0, 100) as u8,
            regressed: percent < stored,
        })
    }

    pub fn get_completed_steps(&self, run_id: &str) -> Result<Vec<String>, OrchestratorError> {
        Ok(self.get_run(run_id)?.completed_steps)
    }

    pub fn get_history(&self, run_id: &str) -> Result<Vec<HistoryEntry>, OrchestratorError> {
        Ok(self.get_run(run_id)?.history)
    }

    /// Returns runs abandoned by a dead process to a restartable state:
    /// running and awaiting_approval go back to pending, stopping finishes as
    /// cancelled.
    pub fn recover_interrupted(&self, now: i64) -> Result<Vec<RecoveredRun>, OrchestratorError> {
        let stranded = self
            .list_runs(&RunFilter::non_terminal())?
            .into_iter()
            .filter(|run| run.status.is_active())
            .collect::<Vec<_>>();

        let mut recovered = Vec::new();
        for run in stranded {
            let (to, reason, error) = if run.status == RunStatus::Stopping {
                let reason = run
                    .cancel_reason
                    .clone()
                    .unwrap_or_else(|| "cancelled".to_string());
                (
                    RunStatus::Cancelled,
                    reason.clone(),
                    Some(RunError::new(RunErrorKind::Cancelled, reason)),
                )
            } else {
                (
                    RunStatus::Pending,
                    "recovered after restart".to_string(),
                    None,
                )
            };
            let entry = status_entry(now, to, Some(run.status), Some(&reason), Some("recovery"));
            let (error_message, error_kind) = match error.as_ref() {
                Some(error) => (Some(error.message.clone()), Some(error.kind.as_str())),
                None => (None, None),
            };
            let changed = {
                let connection = self.connect();
                connection.execute(
                    "
                    UPDATE runs SET
                        status = ?3,
                        updated_at = ?4,
                        completed_at = CASE WHEN ?3 = 'cancelled' THEN ?4 ELSE completed_at END,
                        error_message = ?5,
                        error_step_id = NULL,
                        error_kind = ?6,
                        history = json_insert(history, '$[#]', json(?7))
                    WHERE id = ?1 AND status = ?2
                    ",
                    params![
                        run.id,
                        run.status.as_str(),
                        to.as_str(),
                        now,
                        error_message,
                        error_kind,
                        entry
                    ],
                )?
            };
            if changed == 1 {
                recovered.push(RecoveredRun {
                    run_id: run.id,
                    from: run.status,
                    to,
                });
            }
        }
        Ok(recovered)
    }
}

fn terminal_status_list() -> String {
    TERMINAL_STATUSES
        .iter()
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn map_insert_conflict(err: rusqlite::Error, new_run: &NewRun) -> OrchestratorError {
    if let rusqlite::Error::SqliteFailure(inner, message) = &err {
        if inner.code == rusqlite::ErrorCode::ConstraintViolation {
            let message = message.as_deref().unwrap_or_default();
            if message.contains("runs.tag") {
                return OrchestratorError::TagConflict {
                    tag: new_run.tag.clone().unwrap_or_default(),
                };
            }
            return OrchestratorError::RunExists {
                run_id: new_run.id.clone(),
            };
        }
    }
    OrchestratorError::Sql { source: err }
}

fn encode_json(value: &Value, run_id: &str) -> Result<String, OrchestratorError> {
    serde_json::to_string(value).map_err(|source| OrchestratorError::Json {
        path: format!("runs/{run_id}"),
        source,
    })
}

fn history_json(entry: &HistoryEntry) -> Result<String, OrchestratorError> {
    serde_json::to_string(entry).map_err(|source| OrchestratorError::Json {
        path: "runs.history".to_string(),
        source,
    })
}

fn status_entry(
    now: i64,
    status: RunStatus,
    from: Option<RunStatus>,
    reason: Option<&str>,
    actor: Option<&str>,
) -> String {
    let mut payload = serde_json::Map::new();
    payload.insert("status".to_string(), json!(status.as_str()));
    if let Some(from) = from {
        payload.insert("from".to_string(), json!(from.as_str()));
    }
    if let Some(reason) = reason {
        payload.insert("reason".to_string(), json!(reason));
    }
    if let Some(actor) = actor {
        payload.insert("actor".to_string(), json!(actor));
    }
    json!({
        "timestamp": now,
        "kind": "status",
        "payload": Value::Object(payload),
    })
    .to_string()
}

struct RawRunRow {
    id: String,
    tag: Option<String>,
    spec: String,
    profile_id: Option<String>,
    status: String,
    phase: String,
    percent_complete: i64,
    current_action: String,
    run_attempt_id: Option<String>,
    completed_steps: String,
    history: String,
    error_message: Option<String>,
    error_step_id: Option<String>,
    error_kind: Option<String>,
    cancel_reason: Option<String>,
    created_at: i64,
    updated_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

impl RawRunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tag: row.get(1)?,
            spec: row.get(2)?,
            profile_id: row.get(3)?,
            status: row.get(4)?,
            phase: row.get(5)?,
            percent_complete: row.get(6)?,
            current_action: row.get(7)?,
            run_attempt_id: row.get(8)?,
            completed_steps: row.get(9)?,
            history: row.get(10)?,
            error_message: row.get(11)?,
            error_step_id: row.get(12)?,
            error_kind: row.get(13)?,
            cancel_reason: row.get(14)?,
            created_at: row.get(15)?,
            updated_at: row.get(16)?,
            started_at: row.get(17)?,
            completed_at: row.get(18)?,
        })
    }

    fn into_record(self) -> Result<RunRecord, OrchestratorError> {
        let corrupt = |reason: String| OrchestratorError::CorruptRecord {
            run_id: self.id.clone(),
            reason,
        };
        let status = RunStatus::parse(&self.status).map_err(corrupt)?;
        let spec = serde_json::from_str(&self.spec)
            .map_err(|err| corrupt(format!("spec: {err}")))?;
        let completed_steps = serde_json::from_str(&self.completed_steps)
            .map_err(|err| corrupt(format!("completed_steps: {err}")))?;
        let history = serde_json::from_str(&self.history)
            .map_err(|err| corrupt(format!("history: {err}")))?;
        let error = match (self.error_message.clone(), self.error_kind.as_deref()) {
            (Some(message), Some(kind)) => Some(RunError {
                message,
                step_id: self.error_step_id.clone(),
                kind: RunErrorKind::parse(kind).map_err(corrupt)?,
            }),
            _ => None,
        };
        Ok(RunRecord {
            id: self.id,
            tag: self.tag,
            spec,
            profile_id: self.profile_id,
            status,
            phase: self.phase,
            percent_complete: self.percent_complete.clamp(0, 100) as u8,
            current_action: self.current_action,
            run_attempt_id: self.run_attempt_id,
            completed_steps,
            history,
            error,
            cancel_reason: self.cancel_reason,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}
