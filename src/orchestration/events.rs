use crate::orchestration::hub::{EventHub, HubError, PublishOutcome};
use crate::orchestration::run::{RunError, RunStatus};
use crate::shared::clock::Clock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Closed set of event kinds. Each variant carries its typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum EventBody {
    Progress {
        phase: String,
        percent: u8,
        current_action: String,
    },
    Status {
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous: Option<RunStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Log {
        level: String,
        message: String,
    },
    StepCompleted {
        step_id: String,
        attempt_id: String,
    },
    AwaitingApproval {
        step_id: String,
    },
    Terminal {
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RunError>,
    },
    Connected {
        server_time: i64,
        subscriber_id: u64,
    },
    Ping {
        server_time: i64,
    },
    Pong {
        server_time: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Progress,
    Status,
    Log,
    StepCompleted,
    AwaitingApproval,
    Terminal,
    Connected,
    Ping,
    Pong,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Status => "status",
            Self::Log => "log",
            Self::StepCompleted => "step_completed",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Terminal => "terminal",
            Self::Connected => "connected",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    /// Kinds only the hub itself may produce.
    pub fn is_hub_originated(self) -> bool {
        matches!(self, Self::Connected | Self::Ping | Self::Pong)
    }
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Progress { .. } => EventKind::Progress,
            Self::Status { .. } => EventKind::Status,
            Self::Log { .. } => EventKind::Log,
            Self::StepCompleted { .. } => EventKind::StepCompleted,
            Self::AwaitingApproval { .. } => EventKind::AwaitingApproval,
            Self::Terminal { .. } => EventKind::Terminal,
            Self::Connected { .. } => EventKind::Connected,
            Self::Ping { .. } => EventKind::Ping,
            Self::Pong { .. } => EventKind::Pong,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunEvent {
    pub run_id: Option<String>,
    pub sequence: u64,
    pub timestamp: i64,
    pub body: EventBody,
}

impl RunEvent {
    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame must be a json object")]
    NotAnObject,
    #[error("frame field `{0}` is missing or malformed")]
    Field(&'static str),
}

/// Renders an event as `{kind, payload, run_id?, sequence, timestamp}`.
pub fn encode_frame(event: &RunEvent) -> Result<String, FrameError> {
    let mut frame = match serde_json::to_value(&event.body)? {
        Value::Object(map) => map,
        _ => return Err(FrameError::NotAnObject),
    };
    if let Some(run_id) = event.run_id.as_ref() {
        frame.insert("run_id".to_string(), Value::String(run_id.clone()));
    }
    frame.insert("sequence".to_string(), Value::from(event.sequence));
    frame.insert("timestamp".to_string(), Value::from(event.timestamp));
    Ok(Value::Object(frame).to_string())
}

pub fn decode_frame(raw: &str) -> Result<RunEvent, FrameError> {
    let Value::Object(mut frame) = serde_json::from_str::<Value>(raw)? else {
        return Err(FrameError::NotAnObject);
    };
    let run_id = match frame.remove("run_id") {
        None | Some(Value::Null) => None,
        Some(Value::String(value)) => Some(value),
        Some(_) => return Err(FrameError::Field("run_id")),
    };
    let sequence = frame
        .remove("sequence")
        .and_then(|value| value.as_u64())
        .ok_or(FrameError::Field("sequence"))?;
    let timestamp = frame
        .remove("timestamp")
        .and_then(|value| value.as_i64())
        .ok_or(FrameError::Field("timestamp"))?;
    let body = serde_json::from_value(Value::Object(strip_to_body(frame)))?;
    Ok(RunEvent {
        run_id,
        sequence,
        timestamp,
        body,
    })
}

fn strip_to_body(mut frame: Map<String, Value>) -> Map<String, Value> {
    frame.retain(|key, _| key == "kind" || key == "payload");
    frame
}

/// Client-to-server control messages on an event connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlMessage {
    Subscribe { run_id: String },
    Unsubscribe { run_id: String },
    SubscribeAll,
    UnsubscribeAll,
    Ping,
}

impl ControlMessage {
    /// Unknown or malformed messages yield `None` and are ignored by callers.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Stamps run events with a per-run sequence and publishes them.
///
/// The sequence lock is held across `publish` so that events of one run reach
/// the hub in sequence order even when several threads emit for that run.
#[derive(Clone)]
pub struct RunEventEmitter {
    hub: EventHub,
    clock: Arc<dyn Clock>,
    sequences: Arc<Mutex<HashMap<String, u64>>>,
}

impl RunEventEmitter {
    pub fn new(hub: EventHub, clock: Arc<dyn Clock>) -> Self {
        Self {
            hub,
            clock,
            sequences: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub fn emit(&self, run_id: &str, body: EventBody) -> Result<PublishOutcome, HubError> {
        let mut sequences = self
            .sequences
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = sequences.entry(run_id.to_string()).or_insert(0);
        *next += 1;
        let event = RunEvent {
            run_id: Some(run_id.to_string()),
            sequence: *next,
            timestamp: self.clock.now_millis(),
            body,
        };
        self.hub.publish(event)
    }

    /// Drops the sequence counter of a finished run.
    pub fn forget(&self, run_id: &str) {
        self.sequences
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::run::RunErrorKind;

    #[test]
    fn frames_carry_flat_envelope_fields() {
        let event = RunEvent {
            run_id: Some("run-1".to_string()),
            sequence: 7,
            timestamp: 1_700_000_000_000,
            body: EventBody::Progress {
                phase: "build".to_string(),
                percent: 40,
                current_action: "compiling".to_string(),
            },
        };
        let raw = encode_frame(&event).expect("encode");
        let value: Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["kind"], "progress");
        assert_eq!(value["payload"]["percent"], 40);
        assert_eq!(value["run_id"], "run-1");
        assert_eq!(value["sequence"], 7);
        assert_eq!(decode_frame(&raw).expect("decode"), event);
    }

    #[test]
    fn hub_frames_omit_run_id() {
        let event = RunEvent {
            run_id: None,
            sequence: 1,
            timestamp: 5,
            body: EventBody::Connected {
                server_time: 5,
                subscriber_id: 3,
            },
        };
        let raw = encode_frame(&event).expect("encode");
        assert!(!raw.contains("run_id"));
        assert!(decode_frame(&raw).expect("decode").kind().is_hub_originated());
    }

    #[test]
    fn terminal_frame_keeps_error_detail() {
        let event = RunEvent {
            run_id: Some("run-2".to_string()),
            sequence: 9,
            timestamp: 1,
            body: EventBody::Terminal {
                status: RunStatus::Failed,
                error: Some(RunError::new(RunErrorKind::StepFailed, "boom").at_step("s2")),
            },
        };
        let decoded = decode_frame(&encode_frame(&event).expect("encode")).expect("decode");
        assert_eq!(decoded, event);
    }

    #[test]
    fn unknown_kinds_are_rejected_when_decoding() {
        let err = decode_frame(r#"{"kind":"mystery","payload":{},"sequence":1,"timestamp":1}"#)
            .expect_err("unknown kind");
        assert!(matches!(err, FrameError::Json(_)));
        assert!(matches!(
            decode_frame(r#"{"kind":"ping","payload":{"server_time":1},"timestamp":1}"#),
            Err(FrameError::Field("sequence"))
        ));
    }

    #[test]
    fn control_messages_parse_known_kinds_only() {
        assert_eq!(
            ControlMessage::parse(r#"{"kind":"subscribe","run_id":"run-1"}"#),
            Some(ControlMessage::Subscribe {
                run_id: "run-1".to_string()
            })
        );
        assert_eq!(
            ControlMessage::parse(r#"{"kind":"subscribe_all"}"#),
            Some(ControlMessage::SubscribeAll)
        );
        assert_eq!(ControlMessage::parse(r#"{"kind":"ping"}"#), Some(ControlMessage::Ping));
        assert_eq!(ControlMessage::parse(r#"{"kind":"reboot"}"#), None);
        assert_eq!(ControlMessage::parse("not json"), None);
        assert_eq!(ControlMessage::parse(r#"{"kind":"subscribe"}"#), None);
    }
}
