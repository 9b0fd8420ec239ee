use crate::shared::errors::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("profile `{profile_id}` not found")]
    NotFound { profile_id: String },
    #[error("invalid profile argument: {0}")]
    InvalidArgument(String),
    #[error("failed to generate profile id: {0}")]
    IdGeneration(String),
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
}

impl ProfileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Io { .. } => ErrorKind::Transient,
            Self::IdGeneration(_) | Self::Json { .. } => ErrorKind::Fatal,
        }
    }
}
