use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    AwaitingApproval,
    Stopping,
    Completed,
    Failed,
    Cancelled,
    Rejected,
}

pub const TERMINAL_STATUSES: [RunStatus; 4] = [
    RunStatus::Completed,
    RunStatus::Failed,
    RunStatus::Cancelled,
    RunStatus::Rejected,
];

pub const ACTIVE_STATUSES: [RunStatus; 3] = [
    RunStatus::Running,
    RunStatus::AwaitingApproval,
    RunStatus::Stopping,
];

impl RunStatus {
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Cancelled)
                | (RunStatus::Running, RunStatus::AwaitingApproval)
                | (RunStatus::Running, RunStatus::Stopping)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::AwaitingApproval, RunStatus::Running)
                | (RunStatus::AwaitingApproval, RunStatus::Rejected)
                | (RunStatus::AwaitingApproval, RunStatus::Stopping)
                | (RunStatus::Stopping, RunStatus::Cancelled)
                | (RunStatus::Stopping, RunStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        TERMINAL_STATUSES.contains(&self)
    }

    /// A worker owns the run in these states.
    pub fn is_active(self) -> bool {
        ACTIVE_STATUSES.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::AwaitingApproval => "awaiting_approval",
            RunStatus::Stopping => "stopping",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim() {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "awaiting_approval" => Ok(RunStatus::AwaitingApproval),
            "stopping" => Ok(RunStatus::Stopping),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            "rejected" => Ok(RunStatus::Rejected),
            other => Err(format!("unknown run status `{other}`")),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    StepFailed,
    Fatal,
    EngineError,
    Cancelled,
    Rejected,
}

impl RunErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StepFailed => "step_failed",
            Self::Fatal => "fatal",
            Self::EngineError => "engine_error",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "step_failed" => Ok(Self::StepFailed),
            "fatal" => Ok(Self::Fatal),
            "engine_error" => Ok(Self::EngineError),
            "cancelled" => Ok(Self::Cancelled),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown run error kind `{other}`")),
        }
    }
}

/// Terminal error attached to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub kind: RunErrorKind,
}

impl RunError {
    pub fn new(kind: RunErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            step_id: None,
            kind,
        }
    }

    pub fn at_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Status,
    Progress,
    Log,
    StepCompleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: i64,
    pub kind: HistoryKind,
    #[serde(default)]
    pub payload: Value,
}

impl HistoryEntry {
    pub fn new(timestamp: i64, kind: HistoryKind, payload: Value) -> Self {
        Self {
            timestamp,
            kind,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    #[serde(default)]
    pub tag: Option<String>,
    pub spec: Value,
    #[serde(default)]
    pub profile_id: Option<String>,
    pub status: RunStatus,
    pub phase: String,
    pub percent_complete: u8,
    pub current_action: String,
    #[serde(default)]
    pub run_attempt_id: Option<String>,
    #[serde(default)]
    pub completed_steps: Vec<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub error: Option<RunError>,
    #[serde(default)]
    pub cancel_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub completed_at: Option<i64>,
}

/// Selection for `list_runs`. Results are ordered newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub tag: Option<String>,
    pub include_terminal: bool,
    pub limit: Option<usize>,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            status: None,
            tag: None,
            include_terminal: true,
            limit: None,
        }
    }
}

impl RunFilter {
    pub fn non_terminal() -> Self {
        Self {
            include_terminal: false,
            ..Self::default()
        }
    }

    pub fn with_status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}
