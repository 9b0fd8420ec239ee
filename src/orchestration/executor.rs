use crate::shared::ids::StepId;
use crate::shared::logging::LogLevel;
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;

/// One executor-visible unit of work. `id` is stable across attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDescriptor {
    pub id: StepId,
    pub label: String,
    pub config: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Ok,
    OkWithApprovalRequired,
    Failed(String),
    Fatal(String),
}

impl StepOutcome {
    /// Maps an untrusted outcome string. Anything unrecognised is a failure.
    pub fn from_wire(raw: &str, reason: Option<&str>) -> Self {
        let reason = reason.unwrap_or("step reported failure").to_string();
        match raw.trim() {
            "ok" => Self::Ok,
            "ok_with_approval_required" => Self::OkWithApprovalRequired,
            "failed" => Self::Failed(reason),
            "fatal" => Self::Fatal(reason),
            other => Self::Failed(format!("unknown step outcome `{other}`")),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok | Self::OkWithApprovalRequired)
    }
}

/// Callback surface the engine hands to an executor for one attempt.
pub trait StepReporter {
    fn run_id(&self) -> &str;
    fn attempt_id(&self) -> &str;
    fn report_progress(&self, phase: &str, percent: i64, current_action: &str);
    /// Records a recoverable problem without ending the attempt.
    fn report_transient(&self, message: &str);
    fn log(&self, level: LogLevel, message: &str);
    fn is_cancelled(&self) -> bool;
    /// Cooperative sleep. Returns `false` when interrupted by cancellation.
    fn sleep(&self, duration: Duration) -> bool;
}

pub trait StepExecutor: Send + Sync {
    /// Expands a run spec into its ordered steps.
    fn plan(&self, spec: &Value) -> Result<Vec<StepDescriptor>, String>;
    fn run_step(&self, step: &StepDescriptor, reporter: &dyn StepReporter) -> StepOutcome;
}

/// Executes runs described as `{"steps": [...]}`.
///
/// Each step is either a bare id string or an object:
/// `{"id", "label"?, "sleep_ms"?, "phase"?, "percent"?, "action"?,
///   "transient"?, "approval"?, "fail"?, "fatal"?, "outcome"?}`.
/// Progress is reported when the step begins, before any sleep.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpecStepExecutor;

impl StepExecutor for SpecStepExecutor {
    fn plan(&self, spec: &Value) -> Result<Vec<StepDescriptor>, String> {
        let steps = spec
            .get("steps")
            .and_then(Value::as_array)
            .ok_or_else(|| "run spec must contain a `steps` array".to_string())?;

        let mut seen = BTreeSet::new();
        let mut planned = Vec::with_capacity(steps.len());
        for (index, raw) in steps.iter().enumerate() {
            let (id, config) = match raw {
                Value::String(id) => (id.as_str(), Value::Object(Default::default())),
                Value::Object(map) => {
                    let id = map
                        .get("id")
                        .and_then(Value::as_str)
                        .ok_or_else(|| format!("steps[{index}] requires a string `id`"))?;
                    (id, raw.clone())
                }
                _ => return Err(format!("steps[{index}] must be a string or an object")),
            };
            let id = StepId::parse(id).map_err(|err| format!("steps[{index}]: {err}"))?;
            if !seen.insert(id.clone()) {
                return Err(format!("duplicate step id `{id}`"));
            }
            let label = config
                .get("label")
                .and_then(Value::as_str)
                .unwrap_or(id.as_str())
                .to_string();
            planned.push(StepDescriptor { id, label, config });
        }
        Ok(planned)
    }

    fn run_step(&self, step: &StepDescriptor, reporter: &dyn StepReporter) -> StepOutcome {
        let config = &step.config;

        if let Some(percent) = config.get("percent").and_then(Value::as_i64) {
            reporter.report_progress(
                config_text(config, "phase").unwrap_or(""),
                percent,
                config_text(config, "action").unwrap_or(step.label.as_str()),
            );
        }
        if let Some(message) = config_text(config, "transient") {
            reporter.report_transient(message);
        }
        if let Some(sleep_ms) = config.get("sleep_ms").and_then(Value::as_u64) {
            if !reporter.sleep(Duration::from_millis(sleep_ms)) {
                return StepOutcome::Failed(format!("step `{}` interrupted", step.id));
            }
        }

        if let Some(reason) = config_text(config, "fatal") {
            return StepOutcome::Fatal(reason.to_string());
        }
        if let Some(reason) = config_text(config, "fail") {
            return StepOutcome::Failed(reason.to_string());
        }
        if let Some(outcome) = config.get("outcome") {
            return match outcome.as_str() {
                Some(raw) => StepOutcome::from_wire(raw, config_text(config, "reason")),
                None => StepOutcome::Failed(format!("step `{}` returned a non-string outcome", step.id)),
            };
        }
        if config.get("approval").and_then(Value::as_bool) == Some(true) {
            return StepOutcome::OkWithApprovalRequired;
        }
        StepOutcome::Ok
    }
}

fn config_text<'a>(config: &'a Value, key: &str) -> Option<&'a str> {
    config.get(key).and_then(Value::as_str)
}
