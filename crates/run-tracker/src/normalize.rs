//! Maps heterogeneous inbound frames onto [`CanonicalEvent`].
//!
//! Field aliases are resolved through the tables below, first present wins.
//! Frames without a type, and types outside the canonical set, are dropped.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::event::{
    CanonicalEvent, CompleteData, ConversationCreatedData, ErrorData, EventPayload, EventType,
    PhaseData, ThinkingData, ToolData, VerificationItemData,
};

pub const TYPE_FIELDS: &[&str] = &["type", "event", "action"];
pub const TOKEN_TYPES: &[&str] = &["token", "tokens", "stream", "chunk"];
pub const TYPE_RENAMES: &[(&str, &str)] = &[
    ("conversationCreated", "conversation_created"),
    ("verificationItem", "verification_item"),
    ("verificationComplete", "complete"),
    ("verification_complete", "complete"),
    ("phaseChange", "phase"),
    ("toolCall", "tool"),
    ("toolResult", "tool"),
];
pub const RUN_ID_FIELDS: &[&str] = &["run_id", "runId"];
pub const CONVERSATION_ID_FIELDS: &[&str] = &["conversation_id", "conversationId"];
pub const PAYLOAD_FIELDS: &[&str] = &["data", "payload"];
pub const TIMESTAMP_FIELDS: &[&str] = &["timestamp", "time", "ts"];
pub const TOKEN_CONTENT_FIELDS: &[&str] = &["content", "token", "text", "chunk"];

/// Model catalog frames travel on their own channel and never reach a run.
pub const MODELS_FRAME_TYPE: &str = "models";

const THOUGHT_MESSAGE_FIELDS: &[&str] = &["message", "thought"];
const STEP_FIELDS: &[&str] = &["kind", "iteration", "phase"];
const PHASE_NAME_FIELDS: &[&str] = &["phase", "name"];
const PHASE_MESSAGE_FIELDS: &[&str] = &["message", "description"];
const STATUS_FIELDS: &[&str] = &["status"];
const TOOL_NAME_FIELDS: &[&str] = &["tool", "name", "tool_name"];
const TOOL_PARAMS_FIELDS: &[&str] = &["params", "input", "arguments"];
const TOOL_RESULT_FIELDS: &[&str] = &["result", "output"];
const TOOL_EXTRA_FIELDS: &[&str] = &["error", "iteration"];
const CHECK_NAME_FIELDS: &[&str] = &["check_name", "name", "check"];
const CHECK_OUTPUT_FIELDS: &[&str] = &["output", "result"];
const CHECK_EXTRA_FIELDS: &[&str] = &["passed", "error"];
const RESPONSE_FIELDS: &[&str] = &["response", "content", "result"];
const TOOLS_USED_FIELDS: &[&str] = &["tools_used", "toolsUsed"];
const DURATION_FIELDS: &[&str] = &["duration_ms", "durationMs"];
const MODEL_FIELDS: &[&str] = &["model", "model_used", "modelUsed"];
const COMPLETE_EXTRA_FIELDS: &[&str] = &["verification", "verdict", "iterations"];
const ERROR_MESSAGE_FIELDS: &[&str] = &["message", "error", "detail"];
const ERROR_CODE_FIELDS: &[&str] = &["code", "error_code"];
const CREATED_ID_FIELDS: &[&str] = &["conversation_id", "conversationId", "id"];
const TITLE_FIELDS: &[&str] = &["title"];

const UNKNOWN: &str = "unknown";

/// Parses a text frame into JSON.
pub fn parse_frame(text: &str) -> Result<Value, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// The frame's raw type before renaming, if any.
#[must_use]
pub fn raw_type(raw: &Value) -> Option<&str> {
    let frame = raw.as_object()?;
    TYPE_FIELDS
        .iter()
        .filter_map(|key| frame.get(*key))
        .find_map(|value| value.as_str().filter(|value| !value.is_empty()))
}

/// Normalizes a raw frame, returning `None` for anything that is not a
/// canonical event.
#[must_use]
pub fn normalize(raw: &Value, now: DateTime<Utc>) -> Option<CanonicalEvent> {
    classify(raw, now).ok()
}

/// Like [`normalize`] but reports why a frame was dropped.
pub fn classify(raw: &Value, now: DateTime<Utc>) -> Result<CanonicalEvent, ProtocolError> {
    let frame = raw.as_object().ok_or(ProtocolError::NotAnObject)?;
    let kind = raw_type(raw).ok_or(ProtocolError::MissingType)?;

    let timestamp = normalize_timestamp(first_present(frame, TIMESTAMP_FIELDS), now);
    let run_id = envelope_id(frame, RUN_ID_FIELDS);
    let data = PAYLOAD_FIELDS
        .iter()
        .filter_map(|key| frame.get(*key))
        .find(|value| !value.is_null());

    let mut payload = if TOKEN_TYPES.contains(&kind) {
        EventPayload::Thinking(token_data(data))
    } else {
        let canonical = TYPE_RENAMES
            .iter()
            .find(|(legacy, _)| *legacy == kind)
            .map_or(kind, |(_, canonical)| *canonical);
        let event_type = EventType::parse(canonical)
            .ok_or_else(|| ProtocolError::UnsupportedType(kind.to_string()))?;
        match event_type {
            EventType::Thinking => EventPayload::Thinking(thinking_data(data)),
            EventType::Phase => EventPayload::Phase(phase_data(data)),
            EventType::Tool => EventPayload::Tool(tool_data(data)),
            EventType::VerificationItem => EventPayload::VerificationItem(verification_data(data)),
            EventType::Complete => EventPayload::Complete(complete_data(data)),
            EventType::Error => EventPayload::Error(error_data(data)),
            EventType::ConversationCreated => {
                EventPayload::ConversationCreated(conversation_created_data(data))
            }
        }
    };

    let mut conversation_id = envelope_id(frame, CONVERSATION_ID_FIELDS);
    if let EventPayload::ConversationCreated(created) = &mut payload {
        if conversation_id.is_none() {
            conversation_id.clone_from(&created.conversation_id);
        }
        if created.conversation_id.is_none() {
            created.conversation_id.clone_from(&conversation_id);
        }
    }

    Ok(CanonicalEvent {
        timestamp,
        run_id,
        conversation_id,
        payload,
    })
}

/// Formats an instant the way canonical timestamps are written.
#[must_use]
pub fn iso(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn normalize_timestamp(value: Option<&Value>, now: DateTime<Utc>) -> String {
    match value {
        Some(Value::String(raw)) if is_timestamp(raw) => raw.clone(),
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|millis| millis as i64))
            .and_then(DateTime::from_timestamp_millis)
            .map_or_else(|| iso(now), iso),
        _ => iso(now),
    }
}

fn is_timestamp(raw: &str) -> bool {
    let raw = raw.trim();
    !raw.is_empty()
        && (DateTime::parse_from_rfc3339(raw).is_ok()
            || NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
            || NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok())
}

/// Top-level aliases first, then the same aliases one level down.
fn envelope_id(frame: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    first_id(frame, keys).or_else(|| {
        PAYLOAD_FIELDS
            .iter()
            .filter_map(|container| frame.get(*container).and_then(Value::as_object))
            .find_map(|nested| first_id(nested, keys))
    })
}

fn first_id(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find_map(|value| match value {
            Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        })
}

fn first_present<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find(|value| match value {
            Value::Null => false,
            Value::String(text) => !text.is_empty(),
            _ => true,
        })
}

fn first_text(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    first_present(object, keys).and_then(as_text)
}

fn first_u64(object: &Map<String, Value>, keys: &[&str]) -> Option<u64> {
    first_present(object, keys).and_then(|value| {
        value
            .as_u64()
            .or_else(|| value.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64))
    })
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Bool(_) | Value::Number(_) => Some(value.to_string()),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).ok(),
    }
}

fn remainder(object: &Map<String, Value>, claimed: &[&[&str]]) -> Map<String, Value> {
    object
        .iter()
        .filter(|(key, _)| !claimed.iter().any(|keys| keys.contains(&key.as_str())))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn token_data(data: Option<&Value>) -> ThinkingData {
    match data {
        Some(Value::String(content)) => ThinkingData::Token {
            content: content.clone(),
            iteration: None,
            phase: None,
        },
        Some(Value::Object(object)) => token_from_object(object),
        _ => ThinkingData::Token {
            content: String::new(),
            iteration: None,
            phase: None,
        },
    }
}

fn token_from_object(object: &Map<String, Value>) -> ThinkingData {
    ThinkingData::Token {
        content: first_text(object, TOKEN_CONTENT_FIELDS).unwrap_or_default(),
        iteration: first_u64(object, &["iteration"]),
        phase: first_text(object, &["phase"]),
    }
}

fn thinking_data(data: Option<&Value>) -> ThinkingData {
    let object = match data {
        Some(Value::Object(object)) => object,
        Some(Value::String(message)) => {
            return ThinkingData::Thought {
                message: message.clone(),
                iteration: None,
                phase: None,
                extra: Map::new(),
            };
        }
        _ => {
            return ThinkingData::Thought {
                message: String::new(),
                iteration: None,
                phase: None,
                extra: Map::new(),
            };
        }
    };

    let is_token = match object.get("kind").and_then(Value::as_str) {
        Some(kind) => kind == "token",
        None => first_present(object, TOKEN_CONTENT_FIELDS).is_some(),
    };
    if is_token {
        return token_from_object(object);
    }

    // An explicit thought may still carry its text under a token alias.
    let (message, claimed) = match first_text(object, THOUGHT_MESSAGE_FIELDS) {
        Some(message) => (message, THOUGHT_MESSAGE_FIELDS),
        None => (
            first_text(object, TOKEN_CONTENT_FIELDS).unwrap_or_default(),
            TOKEN_CONTENT_FIELDS,
        ),
    };
    ThinkingData::Thought {
        message,
        iteration: first_u64(object, &["iteration"]),
        phase: first_text(object, &["phase"]),
        extra: remainder(object, &[claimed, STEP_FIELDS]),
    }
}

fn phase_data(data: Option<&Value>) -> PhaseData {
    let Some(object) = data.and_then(Value::as_object) else {
        return PhaseData {
            phase: UNKNOWN.to_string(),
            status: "started".to_string(),
            message: None,
            extra: Map::new(),
        };
    };
    PhaseData {
        phase: first_text(object, PHASE_NAME_FIELDS).unwrap_or_else(|| UNKNOWN.to_string()),
        status: first_text(object, STATUS_FIELDS).unwrap_or_else(|| "started".to_string()),
        message: first_text(object, PHASE_MESSAGE_FIELDS),
        extra: remainder(
            object,
            &[PHASE_NAME_FIELDS, STATUS_FIELDS, PHASE_MESSAGE_FIELDS],
        ),
    }
}

fn tool_data(data: Option<&Value>) -> ToolData {
    let Some(object) = data.and_then(Value::as_object) else {
        return ToolData {
            tool: UNKNOWN.to_string(),
            params: None,
            status: "started".to_string(),
            result: None,
            error: None,
            iteration: None,
            extra: Map::new(),
        };
    };
    ToolData {
        tool: first_text(object, TOOL_NAME_FIELDS).unwrap_or_else(|| UNKNOWN.to_string()),
        params: first_present(object, TOOL_PARAMS_FIELDS).cloned(),
        status: first_text(object, STATUS_FIELDS).unwrap_or_else(|| "started".to_string()),
        result: first_present(object, TOOL_RESULT_FIELDS).cloned(),
        error: first_text(object, &["error"]),
        iteration: first_u64(object, &["iteration"]),
        extra: remainder(
            object,
            &[
                TOOL_NAME_FIELDS,
                TOOL_PARAMS_FIELDS,
                STATUS_FIELDS,
                TOOL_RESULT_FIELDS,
                TOOL_EXTRA_FIELDS,
            ],
        ),
    }
}

fn verification_data(data: Option<&Value>) -> VerificationItemData {
    let Some(object) = data.and_then(Value::as_object) else {
        return VerificationItemData {
            check_name: UNKNOWN.to_string(),
            status: "running".to_string(),
            output: None,
            error: None,
            extra: Map::new(),
        };
    };
    let status = first_text(object, STATUS_FIELDS).unwrap_or_else(|| {
        match object.get("passed").and_then(Value::as_bool) {
            Some(true) => "passed".to_string(),
            Some(false) => "failed".to_string(),
            None => "running".to_string(),
        }
    });
    VerificationItemData {
        check_name: first_text(object, CHECK_NAME_FIELDS).unwrap_or_else(|| UNKNOWN.to_string()),
        status,
        output: first_present(object, CHECK_OUTPUT_FIELDS).cloned(),
        error: first_text(object, &["error"]),
        extra: remainder(
            object,
            &[
                CHECK_NAME_FIELDS,
                STATUS_FIELDS,
                CHECK_OUTPUT_FIELDS,
                CHECK_EXTRA_FIELDS,
            ],
        ),
    }
}

fn complete_data(data: Option<&Value>) -> CompleteData {
    let Some(object) = data.and_then(Value::as_object) else {
        return CompleteData {
            response: data.and_then(Value::as_str).map(ToString::to_string),
            ..CompleteData::default()
        };
    };
    CompleteData {
        response: first_text(object, RESPONSE_FIELDS),
        verification: first_present(object, &["verification"]).cloned(),
        verdict: first_present(object, &["verdict"]).cloned(),
        tools_used: first_present(object, TOOLS_USED_FIELDS)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        iterations: first_u64(object, &["iterations"]),
        duration_ms: first_u64(object, DURATION_FIELDS),
        model: first_text(object, MODEL_FIELDS),
        extra: remainder(
            object,
            &[
                RESPONSE_FIELDS,
                TOOLS_USED_FIELDS,
                DURATION_FIELDS,
                MODEL_FIELDS,
                COMPLETE_EXTRA_FIELDS,
            ],
        ),
    }
}

fn error_data(data: Option<&Value>) -> ErrorData {
    match data {
        Some(Value::String(message)) if !message.is_empty() => ErrorData {
            message: message.clone(),
            code: "UNKNOWN".to_string(),
            extra: Map::new(),
        },
        Some(Value::Object(object)) => ErrorData {
            message: first_text(object, ERROR_MESSAGE_FIELDS)
                .unwrap_or_else(|| "Unknown error".to_string()),
            code: first_text(object, ERROR_CODE_FIELDS).unwrap_or_else(|| "UNKNOWN".to_string()),
            extra: remainder(object, &[ERROR_MESSAGE_FIELDS, ERROR_CODE_FIELDS]),
        },
        _ => ErrorData {
            message: "Unknown error".to_string(),
            code: "UNKNOWN".to_string(),
            extra: Map::new(),
        },
    }
}

fn conversation_created_data(data: Option<&Value>) -> ConversationCreatedData {
    let Some(object) = data.and_then(Value::as_object) else {
        return ConversationCreatedData {
            conversation_id: None,
            title: None,
            extra: Map::new(),
        };
    };
    ConversationCreatedData {
        conversation_id: first_id(object, CREATED_ID_FIELDS),
        title: first_text(object, TITLE_FIELDS),
        extra: remainder(object, &[CREATED_ID_FIELDS, TITLE_FIELDS]),
    }
}
