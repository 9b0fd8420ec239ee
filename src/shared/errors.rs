use serde::{Deserialize, Serialize};

/// Domain-level classification shared by every subsystem error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidState,
    InvalidArgument,
    Transient,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::InvalidState => "invalid_state",
            Self::InvalidArgument => "invalid_argument",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }

    /// Process exit code used by the command line surface.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::NotFound => 3,
            Self::Conflict | Self::InvalidState => 4,
            Self::InvalidArgument => 2,
            Self::Transient | Self::Fatal => 1,
        }
    }

    pub fn is_retryable(self) -> bool {
        self == Self::Transient
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
