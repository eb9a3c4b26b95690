//! Boundary to the caller-owned chat message list.
//!
//! The tracker never holds a message: it stores a [`MessageId`] on the run
//! and applies [`MessagePatch`]es through [`MessageStore`] lookups.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(i64),
    Text(String),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl From<i64> for MessageId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Final assistant content plus completion metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinalizedMessage {
    /// `None` keeps the current content (follow-up runs that only re-verify).
    pub content: Option<String>,
    pub tools_used: Vec<Value>,
    pub verification: Option<Value>,
    pub verdict: Option<Value>,
    pub model: Option<String>,
    pub finalized_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessagePatch {
    /// Links the message to a run and conversation once they are known.
    Bind {
        run_id: Option<String>,
        conversation_id: Option<String>,
    },
    AppendStream(String),
    Finalize(FinalizedMessage),
    Fail {
        content: String,
        at: DateTime<Utc>,
    },
}

pub trait MessageStore: Send + Sync {
    /// Applies a patch to the message with `id`. Returns false when no such
    /// message exists.
    fn apply(&self, id: &MessageId, patch: MessagePatch) -> bool;

    /// The most recently created message that is still streaming.
    fn latest_streaming(&self) -> Option<MessageId>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: ChatRole,
    pub content: String,
    pub streaming: bool,
    pub is_error: bool,
    pub run_id: Option<String>,
    pub conversation_id: Option<String>,
    pub tools_used: Vec<Value>,
    pub verification: Option<Value>,
    pub verdict: Option<Value>,
    pub model: Option<String>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    fn new(id: MessageId, role: ChatRole, content: String, streaming: bool) -> Self {
        Self {
            id,
            role,
            content,
            streaming,
            is_error: false,
            run_id: None,
            conversation_id: None,
            tools_used: Vec::new(),
            verification: None,
            verdict: None,
            model: None,
            finalized_at: None,
        }
    }

    fn apply(&mut self, patch: MessagePatch) {
        match patch {
            MessagePatch::Bind {
                run_id,
                conversation_id,
            } => {
                if run_id.is_some() {
                    self.run_id = run_id;
                }
                if conversation_id.is_some() {
                    self.conversation_id = conversation_id;
                }
            }
            MessagePatch::AppendStream(text) => self.content.push_str(&text),
            MessagePatch::Finalize(finalized) => {
                if let Some(content) = finalized.content {
                    self.content = content;
                }
                self.streaming = false;
                if !finalized.tools_used.is_empty() {
                    self.tools_used = finalized.tools_used;
                }
                if finalized.verification.is_some() {
                    self.verification = finalized.verification;
                }
                if finalized.verdict.is_some() {
                    self.verdict = finalized.verdict;
                }
                if finalized.model.is_some() {
                    self.model = finalized.model;
                }
                self.finalized_at = finalized.finalized_at;
            }
            MessagePatch::Fail { content, at } => {
                self.content = content;
                self.streaming = false;
                self.is_error = true;
                self.finalized_at = Some(at);
            }
        }
    }
}

#[derive(Debug, Default)]
struct MessageLog {
    next_id: i64,
    messages: Vec<ChatMessage>,
}

/// Shared in-process message list. Clones observe the same messages; the
/// lock is only held for the duration of a single call.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMessages {
    inner: Arc<Mutex<MessageLog>>,
}

impl InMemoryMessages {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a user message and an empty streaming assistant reply.
    /// Returns `(user_id, assistant_id)`.
    pub fn push_exchange(
        &self,
        user_text: &str,
        conversation_id: Option<&str>,
    ) -> Option<(MessageId, MessageId)> {
        let mut log = self.inner.lock().ok()?;
        log.next_id += 1;
        let user_id = MessageId::Number(log.next_id);
        log.next_id += 1;
        let assistant_id = MessageId::Number(log.next_id);

        let mut user = ChatMessage::new(
            user_id.clone(),
            ChatRole::User,
            user_text.to_string(),
            false,
        );
        user.conversation_id = conversation_id.map(ToString::to_string);
        let mut assistant =
            ChatMessage::new(assistant_id.clone(), ChatRole::Assistant, String::new(), true);
        assistant.conversation_id = conversation_id.map(ToString::to_string);

        log.messages.push(user);
        log.messages.push(assistant);
        Some((user_id, assistant_id))
    }

    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<ChatMessage> {
        let log = self.inner.lock().ok()?;
        log.messages.iter().find(|message| &message.id == id).cloned()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.inner
            .lock()
            .map(|log| log.messages.clone())
            .unwrap_or_default()
    }
}

impl MessageStore for InMemoryMessages {
    fn apply(&self, id: &MessageId, patch: MessagePatch) -> bool {
        let Ok(mut log) = self.inner.lock() else {
            return false;
        };
        match log.messages.iter_mut().find(|message| &message.id == id) {
            Some(message) => {
                message.apply(patch);
                true
            }
            None => false,
        }
    }

    fn latest_streaming(&self) -> Option<MessageId> {
        let log = self.inner.lock().ok()?;
        log.messages
            .iter()
            .rev()
            .find(|message| message.streaming)
            .map(|message| message.id.clone())
    }
}
