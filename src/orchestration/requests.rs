use crate::orchestration::error::OrchestratorError;
use crate::shared::ids::{validate_identifier_value, ProfileId};
use serde_json::{Map, Value};

pub const MAX_TAG_LEN: usize = 64;
pub const MAX_REASON_LEN: usize = 512;
pub const DEFAULT_STOP_REASON: &str = "user";
pub const DEFAULT_REJECT_REASON: &str = "rejected";

/// The caller on whose behalf an operation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
}

impl Principal {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }
}

/// Explicit per-request context passed to every mutating facade call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub principal: Principal,
    pub request_id: String,
}

impl RequestContext {
    pub fn new(subject: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            principal: Principal::new(subject),
            request_id: request_id.into(),
        }
    }

    pub fn system() -> Self {
        Self::new("system", "system")
    }

    pub fn actor(&self) -> &str {
        &self.principal.subject
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateRunRequest {
    pub spec: Value,
    pub tag: Option<String>,
    pub profile_id: Option<ProfileId>,
}

impl CreateRunRequest {
    pub fn new(spec: Value) -> Self {
        Self {
            spec,
            tag: None,
            profile_id: None,
        }
    }

    /// Decodes `{"spec": {..}, "tag"?: "..", "profile_id"?: ".."}`.
    pub fn decode(body: &Value) -> Result<Self, OrchestratorError> {
        let fields = expect_object(body, "request body")?;
        reject_unknown_fields(fields, &["spec", "tag", "profile_id"])?;
        let spec = match fields.get("spec") {
            Some(spec @ Value::Object(_)) => spec.clone(),
            Some(_) => return Err(invalid("`spec` must be a JSON object")),
            None => return Err(invalid("`spec` is required")),
        };
        let tag = optional_string(fields, "tag")?
            .map(|tag| validate_tag(&tag).map(|_| tag))
            .transpose()?;
        let profile_id = optional_string(fields, "profile_id")?
            .map(|raw| ProfileId::parse(&raw).map_err(OrchestratorError::InvalidArgument))
            .transpose()?;
        Ok(Self {
            spec,
            tag,
            profile_id,
        })
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if !self.spec.is_object() {
            return Err(invalid("`spec` must be a JSON object"));
        }
        if let Some(tag) = self.tag.as_deref() {
            validate_tag(tag)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopRunRequest {
    pub run_id: String,
    pub reason: String,
}

impl StopRunRequest {
    pub fn decode(body: &Value) -> Result<Self, OrchestratorError> {
        let (run_id, reason) = decode_run_and_reason(body, DEFAULT_STOP_REASON)?;
        Ok(Self { run_id, reason })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectRunRequest {
    pub run_id: String,
    pub reason: String,
}

impl RejectRunRequest {
    pub fn decode(body: &Value) -> Result<Self, OrchestratorError> {
        let (run_id, reason) = decode_run_and_reason(body, DEFAULT_REJECT_REASON)?;
        Ok(Self { run_id, reason })
    }
}

pub fn validate_tag(tag: &str) -> Result<(), OrchestratorError> {
    if tag.is_empty() || tag.len() > MAX_TAG_LEN {
        return Err(invalid(format!(
            "tag must be 1-{MAX_TAG_LEN} characters"
        )));
    }
    if !tag
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Err(invalid("tag must use only ASCII letters, digits, '-' or '_'"));
    }
    Ok(())
}

pub fn validate_reason(reason: &str) -> Result<(), OrchestratorError> {
    if reason.trim().is_empty() {
        return Err(invalid("reason must be non-empty"));
    }
    if reason.chars().count() > MAX_REASON_LEN {
        return Err(invalid(format!(
            "reason must be at most {MAX_REASON_LEN} characters"
        )));
    }
    Ok(())
}

pub fn validate_run_id(run_id: &str) -> Result<(), OrchestratorError> {
    validate_identifier_value("run id", run_id).map_err(OrchestratorError::InvalidArgument)
}

fn decode_run_and_reason(
    body: &Value,
    default_reason: &str,
) -> Result<(String, String), OrchestratorError> {
    let fields = expect_object(body, "request body")?;
    reject_unknown_fields(fields, &["run_id", "reason"])?;
    let run_id = optional_string(fields, "run_id")?.ok_or_else(|| invalid("`run_id` is required"))?;
    validate_run_id(&run_id)?;
    let reason = optional_string(fields, "reason")?
        .map(|reason| reason.trim().to_string())
        .unwrap_or_else(|| default_reason.to_string());
    validate_reason(&reason)?;
    Ok((run_id, reason))
}

fn expect_object<'a>(
    value: &'a Value,
    what: &str,
) -> Result<&'a Map<String, Value>, OrchestratorError> {
    value
        .as_object()
        .ok_or_else(|| invalid(format!("{what} must be a JSON object")))
}

fn reject_unknown_fields(
    fields: &Map<String, Value>,
    allowed: &[&str],
) -> Result<(), OrchestratorError> {
    match fields.keys().find(|key| !allowed.contains(&key.as_str())) {
        Some(key) => Err(invalid(format!("unknown field `{key}`"))),
        None => Ok(()),
    }
}

fn optional_string(
    fields: &Map<String, Value>,
    key: &str,
) -> Result<Option<String>, OrchestratorError> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(invalid(format!("`{key}` must be a string"))),
    }
}

fn invalid(message: impl Into<String>) -> OrchestratorError {
    OrchestratorError::InvalidArgument(message.into())
}
