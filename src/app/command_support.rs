use crate::config::{load_settings, ConfigError, Settings};
use crate::orchestration::error::OrchestratorError;
use crate::orchestration::hub::HubError;
use crate::orchestration::requests::RequestContext;
use crate::orchestration::run::RunRecord;
use crate::profiles::ProfileError;
use crate::runtime::{RuntimeError, StatePaths};
use crate::shared::clock::{format_millis_rfc3339, Clock, SystemClock};
use crate::shared::errors::ErrorKind;
use std::path::PathBuf;

pub const USAGE_EXIT_CODE: i32 = 2;

/// A failed command: the message for stderr and the process exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliError {
    pub exit_code: i32,
    pub message: String,
}

impl CliError {
    pub fn usage(message: impl Into<String>) -> Self {
        Self {
            exit_code: USAGE_EXIT_CODE,
            message: message.into(),
        }
    }

    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            exit_code: kind.exit_code(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CliError {}

impl From<OrchestratorError> for CliError {
    fn from(err: OrchestratorError) -> Self {
        Self::from_kind(err.kind(), err.to_string())
    }
}

impl From<ProfileError> for CliError {
    fn from(err: ProfileError) -> Self {
        Self::from_kind(err.kind(), err.to_string())
    }
}

impl From<RuntimeError> for CliError {
    fn from(err: RuntimeError) -> Self {
        Self::from_kind(err.kind(), err.to_string())
    }
}

impl From<HubError> for CliError {
    fn from(err: HubError) -> Self {
        Self::from_kind(ErrorKind::InvalidState, err.to_string())
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        Self {
            exit_code: 1,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalOptions {
    pub config: Option<PathBuf>,
    pub state_root: Option<PathBuf>,
}

/// Splits leading `--config` / `--state-root` options from the command.
pub fn split_global_options(args: &[String]) -> Result<(GlobalOptions, &[String]), CliError> {
    let mut options = GlobalOptions::default();
    let mut index = 0;
    while index < args.len() {
        match args[index].as_str() {
            "--config" => {
                let value = args
                    .get(index + 1)
                    .ok_or_else(|| CliError::usage("--config requires a path"))?;
                options.config = Some(PathBuf::from(value));
                index += 2;
            }
            "--state-root" => {
                let value = args
                    .get(index + 1)
                    .ok_or_else(|| CliError::usage("--state-root requires a path"))?;
                options.state_root = Some(PathBuf::from(value));
                index += 2;
            }
            _ => break,
        }
    }
    Ok((options, &args[index..]))
}

/// Settings and state paths resolved for one invocation.
#[derive(Debug, Clone)]
pub struct CliContext {
    pub settings: Settings,
    pub paths: StatePaths,
}

impl CliContext {
    pub fn load(options: &GlobalOptions) -> Result<Self, CliError> {
        let mut settings = load_settings(options.config.as_deref())?;
        if let Some(root) = options.state_root.as_ref() {
            settings.state_root = Some(root.clone());
        }
        let root = settings.resolve_state_root()?;
        Ok(Self {
            settings,
            paths: StatePaths::new(root),
        })
    }
}

pub fn request_context() -> RequestContext {
    let subject = std::env::var("USER")
        .ok()
        .filter(|user| !user.trim().is_empty())
        .map(|user| format!("cli:{user}"))
        .unwrap_or_else(|| "cli".to_string());
    RequestContext::new(subject, format!("cli-{}", SystemClock.now_millis()))
}

/// Pulls `--flag value` out of `args`, returning the remaining positionals.
pub fn take_flag_value(args: &mut Vec<String>, flag: &str) -> Result<Option<String>, CliError> {
    let Some(index) = args.iter().position(|arg| arg == flag) else {
        return Ok(None);
    };
    if index + 1 >= args.len() {
        return Err(CliError::usage(format!("{flag} requires a value")));
    }
    let value = args.remove(index + 1);
    args.remove(index);
    Ok(Some(value))
}

pub fn take_switch(args: &mut Vec<String>, flag: &str) -> bool {
    match args.iter().position(|arg| arg == flag) {
        Some(index) => {
            args.remove(index);
            true
        }
        None => false,
    }
}

pub fn reject_unknown_flags(args: &[String]) -> Result<(), CliError> {
    match args.iter().find(|arg| arg.starts_with("--")) {
        Some(flag) => Err(CliError::usage(format!("unknown option `{flag}`"))),
        None => Ok(()),
    }
}

pub fn run_summary_line(run: &RunRecord) -> String {
    format!(
        "{}\t{}\t{}%\t{}\t{}",
        run.id,
        run.status,
        run.percent_complete,
        run.tag.as_deref().unwrap_or("-"),
        format_millis_rfc3339(run.created_at)
    )
}

pub fn to_pretty_json<T: serde::Serialize>(value: &T) -> Result<String, CliError> {
    serde_json::to_string_pretty(value)
        .map_err(|err| CliError::from_kind(ErrorKind::Fatal, format!("failed to encode output: {err}")))
}
