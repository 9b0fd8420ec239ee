use crate::orchestration::run::RunStatus;
use crate::profiles::ProfileError;
use crate::shared::errors::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("run `{run_id}` not found")]
    UnknownRun { run_id: String },
    #[error("no run tagged `{tag}`")]
    UnknownTag { tag: String },
    #[error("profile `{profile_id}` not found")]
    UnknownProfile { profile_id: String },
    #[error("run `{run_id}` already exists")]
    RunExists { run_id: String },
    #[error("tag `{tag}` is already used by a non-terminal run")]
    TagConflict { tag: String },
    #[error("run `{run_id}` is already {status}")]
    AlreadyRunning { run_id: String, status: RunStatus },
    #[error("run `{run_id}` is terminal ({status})")]
    Terminal { run_id: String, status: RunStatus },
    #[error("cannot {operation} run `{run_id}` while it is {status}")]
    InvalidState {
        run_id: String,
        status: RunStatus,
        operation: &'static str,
    },
    #[error("run state transition `{from}` -> `{to}` is invalid")]
    InvalidRunTransition { from: RunStatus, to: RunStatus },
    #[error("run `{run_id}` changed concurrently: expected {expected}, found {actual}")]
    StatusChanged {
        run_id: String,
        expected: RunStatus,
        actual: RunStatus,
    },
    #[error("attempt `{attempt_id}` is no longer current for run `{run_id}`")]
    StaleAttempt { run_id: String, attempt_id: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to spawn worker for run `{run_id}`: {source}")]
    WorkerSpawn {
        run_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("internal error: {0}")]
    Internal(String),
    #[error("corrupt run record `{run_id}`: {reason}")]
    CorruptRecord { run_id: String, reason: String },
    #[error("sqlite error: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Profile(#[from] ProfileError),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownRun { .. } | Self::UnknownTag { .. } | Self::UnknownProfile { .. } => {
                ErrorKind::NotFound
            }
            Self::RunExists { .. }
            | Self::TagConflict { .. }
            | Self::AlreadyRunning { .. }
            | Self::StatusChanged { .. }
            | Self::StaleAttempt { .. } => ErrorKind::Conflict,
            Self::Terminal { .. } | Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Profile(err) => err.kind(),
            Self::Sql { source } if is_busy(source) => ErrorKind::Transient,
            Self::Io { .. } => ErrorKind::Transient,
            Self::InvalidRunTransition { .. }
            | Self::WorkerSpawn { .. }
            | Self::Internal(_)
            | Self::CorruptRecord { .. }
            | Self::Sql { .. }
            | Self::Json { .. } => ErrorKind::Fatal,
        }
    }
}

impl From<rusqlite::Error> for OrchestratorError {
    fn from(source: rusqlite::Error) -> Self {
        Self::Sql { source }
    }
}

fn is_busy(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::DatabaseBusy
                || inner.code == rusqlite::ErrorCode::DatabaseLocked
    )
}
