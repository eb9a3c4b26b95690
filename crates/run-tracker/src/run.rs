//! The run aggregate and its lifecycle enums.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messages::MessageId;
use crate::timers::TimerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Starting,
    Spec,
    Plan,
    Execute,
    Verify,
    Repair,
    Complete,
}

impl WorkflowPhase {
    pub const ALL: [Self; 7] = [
        Self::Starting,
        Self::Spec,
        Self::Plan,
        Self::Execute,
        Self::Verify,
        Self::Repair,
        Self::Complete,
    ];

    /// Phases that carry a `{status, started_at, ended_at}` record.
    pub const TRACKED: [Self; 6] = [
        Self::Spec,
        Self::Plan,
        Self::Execute,
        Self::Verify,
        Self::Repair,
        Self::Complete,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Spec => "spec",
            Self::Plan => "plan",
            Self::Execute => "execute",
            Self::Verify => "verify",
            Self::Repair => "repair",
            Self::Complete => "complete",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "starting" | "start" => Some(Self::Starting),
            "spec" => Some(Self::Spec),
            "plan" => Some(Self::Plan),
            "execute" => Some(Self::Execute),
            "verify" => Some(Self::Verify),
            "repair" => Some(Self::Repair),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Complete,
    Skipped,
    Failed,
}

impl PhaseStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    /// Maps the status vocabulary used on the wire; unknown values count as
    /// an in-progress phase.
    #[must_use]
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" => Self::Pending,
            "complete" | "completed" | "done" | "success" | "passed" => Self::Complete,
            "skipped" | "skip" => Self::Skipped,
            "failed" | "error" | "failure" => Self::Failed,
            _ => Self::Running,
        }
    }

    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Complete | Self::Skipped | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseState {
    pub status: PhaseStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Default for PhaseState {
    fn default() -> Self {
        Self {
            status: PhaseStatus::Pending,
            started_at: None,
            ended_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseHistoryEntry {
    pub phase: String,
    pub status: String,
    pub message: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingKind {
    Token,
    Thought,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThinkingEntry {
    pub kind: ThinkingKind,
    pub content: String,
    pub iteration: Option<u64>,
    pub phase: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolRecord {
    pub tool: String,
    pub status: String,
    pub params: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub iteration: Option<u64>,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationEntry {
    pub check_name: String,
    pub status: String,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchdogState {
    pub timer_handle: Option<TimerHandle>,
    pub timeout_ms: u64,
    pub last_heartbeat_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunError {
    pub message: String,
    pub code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalKind {
    Complete,
    Error,
    WatchdogTimeout,
    ConnectionLost,
}

impl TerminalKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Error => "error",
            Self::WatchdogTimeout => "watchdog_timeout",
            Self::ConnectionLost => "connection_lost",
        }
    }

    #[must_use]
    pub fn status(self) -> RunStatus {
        match self {
            Self::Complete => RunStatus::Complete,
            Self::Error | Self::WatchdogTimeout | Self::ConnectionLost => RunStatus::Failed,
        }
    }
}

/// The event that ended a run, kept verbatim for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminalEvent {
    pub kind: TerminalKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// How a run came to exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOrigin {
    /// First referenced by an inbound event, no submission matched.
    Placeholder,
    /// Bound to a local submission.
    Submission { temp_id: String },
    /// Local follow-up created by a re-verify request.
    Reverify { parent_run_id: String },
    /// Local follow-up created by a forced repair request.
    Repair { parent_run_id: String },
}

impl RunOrigin {
    #[must_use]
    pub fn is_follow_up(&self) -> bool {
        matches!(self, Self::Reverify { .. } | Self::Repair { .. })
    }
}

/// Metadata copied from a `complete` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunOutcome {
    pub response: Option<String>,
    pub verification: Option<Value>,
    pub verdict: Option<Value>,
    pub tools_used: Vec<Value>,
    pub iterations: Option<u64>,
    pub duration_ms: Option<u64>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Run {
    pub run_id: String,
    pub conversation_id: Option<String>,
    pub status: RunStatus,
    pub terminal: bool,
    pub origin: RunOrigin,
    pub workflow_phase: WorkflowPhase,
    pub phase_history: Vec<PhaseHistoryEntry>,
    pub phases: BTreeMap<WorkflowPhase, PhaseState>,
    pub thinking: Vec<ThinkingEntry>,
    pub tools: Vec<ToolRecord>,
    pub verification: Vec<VerificationEntry>,
    pub tokens: String,
    pub error: Option<RunError>,
    pub outcome: RunOutcome,
    pub terminal_event: Option<TerminalEvent>,
    pub started_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub watchdog: WatchdogState,
    pub associated_message_id: Option<MessageId>,
    pub user_message_id: Option<MessageId>,
    #[serde(skip)]
    pub(crate) created_seq: u64,
}

impl Run {
    #[must_use]
    pub fn new(run_id: impl Into<String>, origin: RunOrigin, now: DateTime<Utc>, timeout_ms: u64) -> Self {
        let phases = WorkflowPhase::TRACKED
            .into_iter()
            .map(|phase| (phase, PhaseState::default()))
            .collect();
        Self {
            run_id: run_id.into(),
            conversation_id: None,
            status: RunStatus::Pending,
            terminal: false,
            origin,
            workflow_phase: WorkflowPhase::Starting,
            phase_history: Vec::new(),
            phases,
            thinking: Vec::new(),
            tools: Vec::new(),
            verification: Vec::new(),
            tokens: String::new(),
            error: None,
            outcome: RunOutcome::default(),
            terminal_event: None,
            started_at: now,
            last_event_at: now,
            ended_at: None,
            watchdog: WatchdogState {
                timer_handle: None,
                timeout_ms,
                last_heartbeat_at: now,
            },
            associated_message_id: None,
            user_message_id: None,
            created_seq: 0,
        }
    }

    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        !self.terminal
    }

    /// Binds the run to a conversation. Returns false when the run already
    /// belongs to a different conversation.
    pub fn bind_conversation(&mut self, conversation_id: &str) -> bool {
        match self.conversation_id.as_deref() {
            Some(existing) if existing != conversation_id => false,
            Some(_) => true,
            None => {
                self.conversation_id = Some(conversation_id.to_string());
                if self.status == RunStatus::Pending && !self.terminal {
                    self.status = RunStatus::Running;
                }
                true
            }
        }
    }

    /// Records the terminal transition. A second call is rejected and leaves
    /// every terminal field as it was.
    pub fn set_terminal(&mut self, kind: TerminalKind, payload: Value, now: DateTime<Utc>) -> bool {
        if self.terminal {
            return false;
        }
        self.terminal = true;
        self.status = kind.status();
        self.ended_at = Some(now);
        self.last_event_at = now;
        self.workflow_phase = WorkflowPhase::Complete;
        self.terminal_event = Some(TerminalEvent {
            kind,
            payload,
            timestamp: now,
        });
        true
    }

    pub fn update_phase_status(&mut self, phase: WorkflowPhase, status: PhaseStatus, now: DateTime<Utc>) {
        let Some(state) = self.phases.get_mut(&phase) else {
            return;
        };
        state.status = status;
        if status == PhaseStatus::Running && state.started_at.is_none() {
            state.started_at = Some(now);
        }
        if status.is_finished() {
            state.started_at.get_or_insert(now);
            state.ended_at = Some(now);
        }
    }

    /// Replaces the entry with the same check name in place, or appends.
    pub fn upsert_verification(&mut self, entry: VerificationEntry) {
        match self
            .verification
            .iter_mut()
            .find(|existing| existing.check_name == entry.check_name)
        {
            Some(existing) => *existing = entry,
            None => self.verification.push(entry),
        }
    }

    #[must_use]
    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|ended| (ended - self.started_at).num_milliseconds())
    }
}
