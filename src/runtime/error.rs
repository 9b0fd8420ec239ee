use crate::config::ConfigError;
use crate::orchestration::error::OrchestratorError;
use crate::orchestration::hub::HubError;
use crate::profiles::ProfileError;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
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
    #[error("failed to bind event server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn {what}: {source}")]
    Spawn {
        what: String,
        #[source]
        source: std::io::Error,
    },
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Hub(#[from] HubError),
    #[error(transparent)]
    Profile(#[from] ProfileError),
}

impl RuntimeError {
    pub fn kind(&self) -> crate::shared::errors::ErrorKind {
        use crate::shared::errors::ErrorKind;
        match self {
            Self::Orchestrator(err) => err.kind(),
            Self::Profile(err) => err.kind(),
            Self::Hub(_) => ErrorKind::InvalidState,
            Self::Config(_) => ErrorKind::InvalidArgument,
            Self::Bind { .. } | Self::WebSocket(_) | Self::Io { .. } => ErrorKind::Transient,
            Self::CreateDir { .. } | Self::Json { .. } | Self::Spawn { .. } => ErrorKind::Fatal,
        }
    }
}
