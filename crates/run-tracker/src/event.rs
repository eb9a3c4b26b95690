//! Canonical event vocabulary.
//!
//! Every inbound frame that survives normalization becomes one
//! [`CanonicalEvent`] whose payload is a tagged variant per event type.
//! Fields the normalizer did not claim are preserved in `extra`.

use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ConversationCreated,
    Phase,
    Thinking,
    Tool,
    VerificationItem,
    Complete,
    Error,
}

impl EventType {
    pub const ALL: [Self; 7] = [
        Self::ConversationCreated,
        Self::Phase,
        Self::Thinking,
        Self::Tool,
        Self::VerificationItem,
        Self::Complete,
        Self::Error,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConversationCreated => "conversation_created",
            Self::Phase => "phase",
            Self::Thinking => "thinking",
            Self::Tool => "tool",
            Self::VerificationItem => "verification_item",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationCreatedData {
    pub conversation_id: Option<String>,
    pub title: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseData {
    pub phase: String,
    pub status: String,
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThinkingData {
    Token {
        content: String,
        iteration: Option<u64>,
        phase: Option<String>,
    },
    Thought {
        message: String,
        iteration: Option<u64>,
        phase: Option<String>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolData {
    pub tool: String,
    pub params: Option<Value>,
    pub status: String,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub iteration: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationItemData {
    pub check_name: String,
    pub status: String,
    pub output: Option<Value>,
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompleteData {
    pub response: Option<String>,
    pub verification: Option<Value>,
    pub verdict: Option<Value>,
    pub tools_used: Vec<Value>,
    pub iterations: Option<u64>,
    pub duration_ms: Option<u64>,
    pub model: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorData {
    pub message: String,
    pub code: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    ConversationCreated(ConversationCreatedData),
    Phase(PhaseData),
    Thinking(ThinkingData),
    Tool(ToolData),
    VerificationItem(VerificationItemData),
    Complete(CompleteData),
    Error(ErrorData),
}

impl EventPayload {
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::ConversationCreated(_) => EventType::ConversationCreated,
            Self::Phase(_) => EventType::Phase,
            Self::Thinking(_) => EventType::Thinking,
            Self::Tool(_) => EventType::Tool,
            Self::VerificationItem(_) => EventType::VerificationItem,
            Self::Complete(_) => EventType::Complete,
            Self::Error(_) => EventType::Error,
        }
    }

    /// Unclaimed payload fields, if the variant keeps them.
    #[must_use]
    pub fn extra(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::ConversationCreated(data) => Some(&data.extra),
            Self::Phase(data) => Some(&data.extra),
            Self::Thinking(ThinkingData::Thought { extra, .. }) => Some(extra),
            Self::Thinking(ThinkingData::Token { .. }) => None,
            Self::Tool(data) => Some(&data.extra),
            Self::VerificationItem(data) => Some(&data.extra),
            Self::Complete(data) => Some(&data.extra),
            Self::Error(data) => Some(&data.extra),
        }
    }
}

/// Normalized inbound notification. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalEvent {
    /// ISO-8601.
    pub timestamp: String,
    pub run_id: Option<String>,
    pub conversation_id: Option<String>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl CanonicalEvent {
    #[must_use]
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.event_type().is_terminal()
    }

    #[must_use]
    pub fn is_token(&self) -> bool {
        matches!(self.payload, EventPayload::Thinking(ThinkingData::Token { .. }))
    }

    /// A run id carried inside the payload rather than on the envelope.
    #[must_use]
    pub fn nested_run_id(&self) -> Option<&str> {
        let extra = self.payload.extra()?;
        ["run_id", "runId"]
            .into_iter()
            .filter_map(|key| extra.get(key))
            .find_map(|value| value.as_str().filter(|value| !value.is_empty()))
    }
}
