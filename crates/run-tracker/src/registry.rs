//! Run registry: owns every tracked run and applies canonical events.
//!
//! Correlation follows a fixed precedence (see [`RunRegistry::resolve_run_id`]).
//! The conversation and single-running-run fallbacks are heuristics: two
//! submissions started close together on the same or no conversation can
//! be attributed to the wrong run. They are kept for wire compatibility.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::aggregator::{TokenAggregator, TokenFlush};
use crate::bus::Notification;
use crate::config::RetentionConfig;
use crate::event::{
    CanonicalEvent, CompleteData, ErrorData, EventPayload, PhaseData, ThinkingData, ToolData,
    VerificationItemData,
};
use crate::messages::{FinalizedMessage, MessageId, MessagePatch, MessageStore};
use crate::normalize::iso;
use crate::orphans::OrphanBuffer;
use crate::run::{
    PhaseHistoryEntry, PhaseStatus, Run, RunError, RunOrigin, RunOutcome, RunStatus,
    TerminalKind, ThinkingEntry, ThinkingKind, ToolRecord, VerificationEntry, WorkflowPhase,
};
use crate::timers::{TimerHandle, TimerQueue};
use crate::watchdog::{TIMEOUT_ERROR_CODE, Watchdog, WatchdogVerdict};

pub const CONNECTION_LOST_CODE: &str = "CONNECTION_LOST";

/// A local submission waiting for the peer to assign a run id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingSubmission {
    pub temp_id: String,
    pub conversation_id: Option<String>,
    pub user_message_id: Option<MessageId>,
    pub assistant_message_id: MessageId,
    pub run_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { run_id: String },
    /// Token content buffered for a later coalesced flush.
    Buffered { run_id: String },
    Finished { run_id: String, status: RunStatus },
    DuplicateTerminal { run_id: String },
    IgnoredAfterTerminal { run_id: String },
    /// `conversation_created` attached to a submission that has no run yet.
    SubmissionBound { temp_id: String },
    /// Uncorrelated token appended to the latest streaming message.
    StreamedToMessage { message_id: MessageId },
    MessageFinalized { message_id: MessageId },
    MessageFailed { message_id: MessageId },
    /// Uncorrelated error surfaced at connection level.
    ConnectionError,
    Orphaned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUpKind {
    Reverify,
    Repair,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub pending: usize,
    pub running: usize,
    pub complete: usize,
    pub failed: usize,
    pub total: usize,
    pub submissions: usize,
    pub orphans: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RehydrateReport {
    pub failed: Vec<String>,
    pub refreshed: Vec<String>,
    pub orphans_pruned: usize,
}

/// Mutable collaborators threaded through every state transition.
pub(crate) struct ApplyContext<'a> {
    pub timers: &'a mut TimerQueue,
    pub aggregator: &'a mut TokenAggregator,
    pub watchdog: &'a Watchdog,
    pub messages: &'a dyn MessageStore,
    pub notifications: &'a mut Vec<Notification>,
}

#[derive(Debug)]
pub struct RunRegistry {
    pub(crate) retention: RetentionConfig,
    pub(crate) runs: HashMap<String, Run>,
    pub(crate) submissions: VecDeque<PendingSubmission>,
    pub(crate) archive: VecDeque<String>,
    pub(crate) orphans: OrphanBuffer,
    next_seq: u64,
}

impl RunRegistry {
    #[must_use]
    pub fn new(retention: RetentionConfig) -> Self {
        let orphans = OrphanBuffer::new(retention.orphan_capacity);
        Self {
            retention,
            runs: HashMap::new(),
            submissions: VecDeque::new(),
            archive: VecDeque::new(),
            orphans,
            next_seq: 0,
        }
    }

    #[must_use]
    pub fn get(&self, run_id: &str) -> Option<&Run> {
        self.runs.get(run_id)
    }

    #[must_use]
    pub fn contains(&self, run_id: &str) -> bool {
        self.runs.contains_key(run_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Runs of a conversation in creation order.
    #[must_use]
    pub fn list_for_conversation(&self, conversation_id: &str) -> Vec<&Run> {
        let mut runs: Vec<&Run> = self
            .runs
            .values()
            .filter(|run| run.conversation_id.as_deref() == Some(conversation_id))
            .collect();
        runs.sort_by_key(|run| run.created_seq);
        runs
    }

    /// Most recently finished run ids, oldest first.
    pub fn archive(&self) -> impl Iterator<Item = &str> {
        self.archive.iter().map(String::as_str)
    }

    pub fn submissions(&self) -> impl Iterator<Item = &PendingSubmission> {
        self.submissions.iter()
    }

    #[must_use]
    pub fn orphans(&self) -> &OrphanBuffer {
        &self.orphans
    }

    #[must_use]
    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            total: self.runs.len(),
            submissions: self.submissions.len(),
            orphans: self.orphans.len(),
            ..RunSummary::default()
        };
        for run in self.runs.values() {
            match run.status {
                RunStatus::Pending => summary.pending += 1,
                RunStatus::Running => summary.running += 1,
                RunStatus::Complete => summary.complete += 1,
                RunStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }

    pub fn add_submission(&mut self, submission: PendingSubmission) {
        self.submissions.push_back(submission);
    }

    pub fn take_submission(&mut self, temp_id: &str) -> Option<PendingSubmission> {
        let index = self
            .submissions
            .iter()
            .position(|submission| submission.temp_id == temp_id)?;
        self.submissions.remove(index)
    }

    /// The run a submission was bound to, if any.
    #[must_use]
    pub fn run_for_submission(&self, temp_id: &str) -> Option<&Run> {
        self.runs.values().find(|run| {
            matches!(&run.origin, RunOrigin::Submission { temp_id: bound } if bound == temp_id)
        })
    }

    /// Resolves the run an event belongs to:
    /// (a) the event's own run id, (b) a run id nested in its payload,
    /// (c) the only running run of the event's conversation,
    /// (d) the only running run overall.
    #[must_use]
    pub fn resolve_run_id(&self, event: &CanonicalEvent) -> Option<String> {
        if let Some(run_id) = event.run_id.as_deref().filter(|id| !id.is_empty()) {
            return Some(run_id.to_string());
        }
        if let Some(run_id) = event.nested_run_id() {
            return Some(run_id.to_string());
        }
        if let Some(conversation_id) = event.conversation_id.as_deref()
            && let Some(run_id) = self.single_running(|run| {
                run.conversation_id.as_deref() == Some(conversation_id)
            })
        {
            return Some(run_id);
        }
        self.single_running(|_| true)
    }

    fn single_running<F>(&self, filter: F) -> Option<String>
    where
        F: Fn(&Run) -> bool,
    {
        let mut running = self
            .runs
            .values()
            .filter(|run| run.status == RunStatus::Running && filter(run));
        let first = running.next()?;
        if running.next().is_some() {
            return None;
        }
        Some(first.run_id.clone())
    }

    pub(crate) fn apply(
        &mut self,
        event: CanonicalEvent,
        now: DateTime<Utc>,
        ctx: &mut ApplyContext<'_>,
    ) -> ApplyOutcome {
        if matches!(event.payload, EventPayload::ConversationCreated(_)) {
            return self.apply_conversation_created(event, now, ctx);
        }
        let Some(run_id) = self.resolve_run_id(&event) else {
            return self.apply_unresolved(event, now, ctx);
        };
        self.get_or_create(&run_id, &event, now, ctx);

        let terminal = self.runs.get(&run_id).is_none_or(|run| run.terminal);
        if terminal {
            if event.is_terminal() {
                debug!(run_id = %run_id, event_type = event.event_type().as_str(), "duplicate terminal event ignored");
                return ApplyOutcome::DuplicateTerminal { run_id };
            }
            debug!(run_id = %run_id, event_type = event.event_type().as_str(), "event for finished run ignored");
            return ApplyOutcome::IgnoredAfterTerminal { run_id };
        }

        if let Some(conversation_id) = event.conversation_id.as_deref() {
            self.bind_conversation(&run_id, conversation_id, ctx);
        }

        let outcome = match &event.payload {
            EventPayload::Thinking(ThinkingData::Token { content, .. }) => {
                ctx.aggregator.push(&run_id, content, now, ctx.timers);
                self.record_activity(&run_id, now, ctx);
                return ApplyOutcome::Buffered { run_id };
            }
            EventPayload::Complete(data) => {
                let outcome = self.complete_run(&run_id, data, now, ctx);
                ctx.notifications.push(Notification::Event { event });
                return outcome;
            }
            EventPayload::Error(data) => {
                let outcome = self.fail_from_error(&run_id, data, now, ctx);
                ctx.notifications.push(Notification::Event { event });
                return outcome;
            }
            EventPayload::Thinking(ThinkingData::Thought {
                message,
                iteration,
                phase,
                ..
            }) => self.with_run(&run_id, |run| {
                run.thinking.push(ThinkingEntry {
                    kind: ThinkingKind::Thought,
                    content: message.clone(),
                    iteration: *iteration,
                    phase: phase.clone(),
                    timestamp: event.timestamp.clone(),
                });
            }),
            EventPayload::Phase(data) => {
                self.with_run(&run_id, |run| apply_phase(run, data, &event.timestamp, now))
            }
            EventPayload::Tool(data) => {
                self.with_run(&run_id, |run| run.tools.push(tool_record(data, &event.timestamp)))
            }
            EventPayload::VerificationItem(data) => self.with_run(&run_id, |run| {
                run.upsert_verification(verification_entry(data, &event.timestamp));
            }),
            EventPayload::ConversationCreated(_) => true,
        };
        if !outcome {
            return ApplyOutcome::Orphaned;
        }

        self.record_activity(&run_id, now, ctx);
        ctx.notifications.push(Notification::Event { event });
        ApplyOutcome::Applied { run_id }
    }

    fn with_run<F>(&mut self, run_id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut Run),
    {
        match self.runs.get_mut(run_id) {
            Some(run) => {
                mutate(run);
                true
            }
            None => false,
        }
    }

    fn record_activity(&mut self, run_id: &str, now: DateTime<Utc>, ctx: &mut ApplyContext<'_>) {
        if let Some(run) = self.runs.get_mut(run_id) {
            run.last_event_at = now;
            ctx.watchdog.heartbeat(run, now);
            if run.watchdog.timer_handle.is_none() {
                ctx.watchdog.start(run, now, ctx.timers);
            }
        }
    }

    fn apply_unresolved(
        &mut self,
        event: CanonicalEvent,
        now: DateTime<Utc>,
        ctx: &mut ApplyContext<'_>,
    ) -> ApplyOutcome {
        match &event.payload {
            EventPayload::Thinking(ThinkingData::Token { content, .. }) if !content.is_empty() => {
                if let Some(message_id) = ctx.messages.latest_streaming()
                    && ctx
                        .messages
                        .apply(&message_id, MessagePatch::AppendStream(content.clone()))
                {
                    return ApplyOutcome::StreamedToMessage { message_id };
                }
            }
            EventPayload::Error(data) => {
                warn!(code = %data.code, message = %data.message, "uncorrelated error frame");
                ctx.notifications.push(Notification::ConnectionError {
                    message: data.message.clone(),
                    code: data.code.clone(),
                });
                return ApplyOutcome::ConnectionError;
            }
            _ => {}
        }
        debug!(event_type = event.event_type().as_str(), "orphaned event");
        self.orphans.push(event, now);
        ApplyOutcome::Orphaned
    }

    /// Looks up `run_id`, creating it when absent. A new run binds to the
    /// oldest submission matching the event's conversation, or to any
    /// unbound submission when the conversation is new to the registry.
    /// An event without a conversation never claims a submission whose
    /// conversation already has runs.
    pub(crate) fn get_or_create(
        &mut self,
        run_id: &str,
        event: &CanonicalEvent,
        now: DateTime<Utc>,
        ctx: &mut ApplyContext<'_>,
    ) {
        if self.runs.contains_key(run_id) {
            return;
        }
        let submission = self.match_submission(event.conversation_id.as_deref());
        self.create_run(run_id, submission, now, ctx);
    }

    pub(crate) fn create_run(
        &mut self,
        run_id: &str,
        submission: Option<PendingSubmission>,
        now: DateTime<Utc>,
        ctx: &mut ApplyContext<'_>,
    ) {
        let run = match submission {
            Some(submission) => {
                let mut run = Run::new(
                    run_id,
                    RunOrigin::Submission {
                        temp_id: submission.temp_id.clone(),
                    },
                    now,
                    ctx.watchdog.default_timeout(),
                );
                run.status = RunStatus::Running;
                run.conversation_id = submission.conversation_id.clone();
                run.associated_message_id = Some(submission.assistant_message_id.clone());
                run.user_message_id = submission.user_message_id.clone();
                ctx.messages.apply(
                    &submission.assistant_message_id,
                    MessagePatch::Bind {
                        run_id: Some(run_id.to_string()),
                        conversation_id: submission.conversation_id.clone(),
                    },
                );
                debug!(run_id, temp_id = %submission.temp_id, "run bound to submission");
                run
            }
            None => {
                debug!(run_id, "placeholder run created");
                Run::new(
                    run_id,
                    RunOrigin::Placeholder,
                    now,
                    ctx.watchdog.default_timeout(),
                )
            }
        };
        self.insert_run(run, now, ctx);
    }

    fn insert_run(&mut self, mut run: Run, now: DateTime<Utc>, ctx: &mut ApplyContext<'_>) {
        self.make_room(ctx);
        self.next_seq += 1;
        run.created_seq = self.next_seq;
        ctx.watchdog.start(&mut run, now, ctx.timers);
        self.runs.insert(run.run_id.clone(), run);
    }

    fn match_submission(&mut self, conversation_id: Option<&str>) -> Option<PendingSubmission> {
        let unbound = || {
            self.submissions
                .iter()
                .position(|submission| submission.conversation_id.is_none())
        };
        let index = match conversation_id {
            Some(conversation_id) => self
                .submissions
                .iter()
                .position(|submission| {
                    submission.conversation_id.as_deref() == Some(conversation_id)
                })
                .or_else(|| {
                    if self.knows_conversation(conversation_id) {
                        None
                    } else {
                        unbound()
                    }
                }),
            // Without a conversation, a submission already tied to a live
            // conversation stays reserved for that conversation's own run.
            None => unbound().or_else(|| {
                self.submissions.iter().position(|submission| {
                    submission
                        .conversation_id
                        .as_deref()
                        .is_none_or(|conversation_id| !self.knows_conversation(conversation_id))
                })
            }),
        }?;
        self.submissions.remove(index)
    }

    fn knows_conversation(&self, conversation_id: &str) -> bool {
        self.runs
            .values()
            .any(|run| run.conversation_id.as_deref() == Some(conversation_id))
    }

    fn bind_conversation(
        &mut self,
        run_id: &str,
        conversation_id: &str,
        ctx: &mut ApplyContext<'_>,
    ) -> bool {
        let Some(run) = self.runs.get_mut(run_id) else {
            return false;
        };
        let was_unbound = run.conversation_id.is_none();
        if !run.bind_conversation(conversation_id) {
            warn!(
                run_id,
                bound = ?run.conversation_id,
                incoming = conversation_id,
                "refusing to rebind run to another conversation"
            );
            return false;
        }
        if was_unbound && let Some(message_id) = &run.associated_message_id {
            ctx.messages.apply(
                message_id,
                MessagePatch::Bind {
                    run_id: None,
                    conversation_id: Some(conversation_id.to_string()),
                },
            );
        }
        true
    }

    fn apply_conversation_created(
        &mut self,
        event: CanonicalEvent,
        now: DateTime<Utc>,
        ctx: &mut ApplyContext<'_>,
    ) -> ApplyOutcome {
        let conversation_id = match &event.payload {
            EventPayload::ConversationCreated(data) => data.conversation_id.clone(),
            _ => None,
        }
        .or_else(|| event.conversation_id.clone());
        let Some(conversation_id) = conversation_id else {
            self.orphans.push(event, now);
            return ApplyOutcome::Orphaned;
        };

        let explicit = event
            .run_id
            .clone()
            .or_else(|| event.nested_run_id().map(ToString::to_string));
        let target = match explicit {
            Some(run_id) => {
                self.get_or_create(&run_id, &event, now, ctx);
                Some(run_id)
            }
            None => self
                .runs
                .values()
                .filter(|run| run.is_in_flight() && run.conversation_id.is_none())
                .max_by_key(|run| run.created_seq)
                .map(|run| run.run_id.clone()),
        };

        if let Some(run_id) = target {
            if self.bind_conversation(&run_id, &conversation_id, ctx) {
                if self.runs.get(&run_id).is_some_and(Run::is_in_flight) {
                    self.record_activity(&run_id, now, ctx);
                }
                ctx.notifications.push(Notification::Event { event });
                return ApplyOutcome::Applied { run_id };
            }
            self.orphans.push(event, now);
            return ApplyOutcome::Orphaned;
        }

        if let Some(submission) = self
            .submissions
            .iter_mut()
            .find(|submission| submission.conversation_id.is_none())
        {
            submission.conversation_id = Some(conversation_id.clone());
            let temp_id = submission.temp_id.clone();
            let bind = MessagePatch::Bind {
                run_id: None,
                conversation_id: Some(conversation_id),
            };
            if let Some(user_message_id) = &submission.user_message_id {
                ctx.messages.apply(user_message_id, bind.clone());
            }
            ctx.messages.apply(&submission.assistant_message_id, bind);
            ctx.notifications.push(Notification::Event { event });
            return ApplyOutcome::SubmissionBound { temp_id };
        }

        debug!(conversation_id = %conversation_id, "conversation_created with nothing to bind");
        self.orphans.push(event, now);
        ApplyOutcome::Orphaned
    }

    /// Moves buffered token content into the run and its message.
    pub(crate) fn apply_flush(&mut self, flush: TokenFlush, now: DateTime<Utc>, ctx: &mut ApplyContext<'_>) {
        let Some(run) = self.runs.get_mut(&flush.run_id) else {
            return;
        };
        if run.terminal {
            return;
        }
        run.tokens.push_str(&flush.content);
        run.thinking.push(ThinkingEntry {
            kind: ThinkingKind::Token,
            content: flush.content.clone(),
            iteration: None,
            phase: Some(run.workflow_phase.as_str().to_string()),
            timestamp: iso(now),
        });
        if let Some(message_id) = &run.associated_message_id {
            ctx.messages
                .apply(message_id, MessagePatch::AppendStream(flush.content.clone()));
        }
        ctx.notifications.push(Notification::TokensFlushed {
            run_id: flush.run_id,
            content: flush.content,
        });
    }

    fn flush_tokens(&mut self, run_id: &str, now: DateTime<Utc>, ctx: &mut ApplyContext<'_>) {
        if let Some(flush) = ctx.aggregator.flush(run_id, ctx.timers) {
            self.apply_flush(flush, now, ctx);
        }
    }

    pub(crate) fn complete_run(
        &mut self,
        run_id: &str,
        data: &CompleteData,
        now: DateTime<Utc>,
        ctx: &mut ApplyContext<'_>,
    ) -> ApplyOutcome {
        self.flush_tokens(run_id, now, ctx);
        let Some(run) = self.runs.get_mut(run_id) else {
            return ApplyOutcome::Orphaned;
        };
        let payload = serde_json::to_value(data).unwrap_or(Value::Null);
        if !run.set_terminal(TerminalKind::Complete, payload, now) {
            return ApplyOutcome::DuplicateTerminal {
                run_id: run_id.to_string(),
            };
        }

        let final_text = data
            .response
            .clone()
            .filter(|response| !response.is_empty())
            .unwrap_or_else(|| run.tokens.clone());
        run.outcome = RunOutcome {
            response: Some(final_text.clone()),
            verification: data.verification.clone(),
            verdict: data.verdict.clone(),
            tools_used: data.tools_used.clone(),
            iterations: data.iterations,
            duration_ms: data.duration_ms,
            model: data.model.clone(),
        };
        ctx.watchdog.stop(run, ctx.timers);

        if let Some(message_id) = &run.associated_message_id {
            let content = if run.origin.is_follow_up() && final_text.is_empty() {
                None
            } else {
                Some(final_text)
            };
            ctx.messages.apply(
                message_id,
                MessagePatch::Finalize(FinalizedMessage {
                    content,
                    tools_used: data.tools_used.clone(),
                    verification: data.verification.clone(),
                    verdict: data.verdict.clone(),
                    model: data.model.clone(),
                    finalized_at: Some(now),
                }),
            );
        }
        self.finish(run_id, RunStatus::Complete, None, ctx)
    }

    fn fail_from_error(
        &mut self,
        run_id: &str,
        data: &ErrorData,
        now: DateTime<Utc>,
        ctx: &mut ApplyContext<'_>,
    ) -> ApplyOutcome {
        let payload = serde_json::to_value(data).unwrap_or(Value::Null);
        self.fail_run(run_id, TerminalKind::Error, &data.message, &data.code, payload, now, ctx)
    }

    /// Shared failure path for peer errors, watchdog timeouts and
    /// connection loss.
    #[expect(clippy::too_many_arguments)]
    pub(crate) fn fail_run(
        &mut self,
        run_id: &str,
        kind: TerminalKind,
        message: &str,
        code: &str,
        payload: Value,
        now: DateTime<Utc>,
        ctx: &mut ApplyContext<'_>,
    ) -> ApplyOutcome {
        self.flush_tokens(run_id, now, ctx);
        let Some(run) = self.runs.get_mut(run_id) else {
            return ApplyOutcome::Orphaned;
        };
        if run.terminal {
            debug!(run_id, kind = kind.as_str(), "run already finished");
            return ApplyOutcome::DuplicateTerminal {
                run_id: run_id.to_string(),
            };
        }
        run.error = Some(RunError {
            message: message.to_string(),
            code: code.to_string(),
        });
        run.set_terminal(kind, payload, now);
        ctx.watchdog.stop(run, ctx.timers);
        if let Some(message_id) = &run.associated_message_id {
            ctx.messages.apply(
                message_id,
                MessagePatch::Fail {
                    content: format!("Error: {message}"),
                    at: now,
                },
            );
        }
        self.finish(run_id, RunStatus::Failed, Some(message.to_string()), ctx)
    }

    fn finish(
        &mut self,
        run_id: &str,
        status: RunStatus,
        error: Option<String>,
        ctx: &mut ApplyContext<'_>,
    ) -> ApplyOutcome {
        if !self.archive.iter().any(|archived| archived == run_id) {
            self.archive.push_back(run_id.to_string());
        }
        while self.archive.len() > self.retention.archive_len.max(1) {
            self.archive.pop_front();
        }
        ctx.notifications.push(Notification::RunFinished {
            run_id: run_id.to_string(),
            status,
            error,
        });
        ApplyOutcome::Finished {
            run_id: run_id.to_string(),
            status,
        }
    }

    /// Periodic watchdog check. Stale handles are ignored.
    pub(crate) fn watchdog_tick(
        &mut self,
        run_id: &str,
        handle: TimerHandle,
        now: DateTime<Utc>,
        ctx: &mut ApplyContext<'_>,
    ) -> Option<ApplyOutcome> {
        let run = self.runs.get_mut(run_id)?;
        if run.watchdog.timer_handle != Some(handle) {
            return None;
        }
        run.watchdog.timer_handle = None;
        match ctx.watchdog.check(run, now) {
            WatchdogVerdict::Terminal => None,
            WatchdogVerdict::Alive { .. } => {
                ctx.watchdog.schedule_tick(run, now, ctx.timers);
                None
            }
            verdict @ WatchdogVerdict::TimedOut { .. } => {
                let message = verdict.failure_message().unwrap_or_default();
                warn!(run_id, message = %message, "watchdog timeout");
                let payload = match &verdict {
                    WatchdogVerdict::TimedOut {
                        elapsed_ms,
                        timeout_ms,
                        phase,
                    } => json!({
                        "elapsed_ms": elapsed_ms,
                        "timeout_ms": timeout_ms,
                        "phase": phase.as_str(),
                    }),
                    _ => Value::Null,
                };
                Some(self.fail_run(
                    run_id,
                    TerminalKind::WatchdogTimeout,
                    &message,
                    TIMEOUT_ERROR_CODE,
                    payload,
                    now,
                    ctx,
                ))
            }
        }
    }

    /// Reconnection recovery: in-flight runs silent for longer than
    /// `stale_after_ms` fail with a connection-loss error, the rest get a
    /// fresh watchdog window. Old orphans are pruned with the same cutoff.
    pub(crate) fn rehydrate(
        &mut self,
        stale_after_ms: u64,
        now: DateTime<Utc>,
        ctx: &mut ApplyContext<'_>,
    ) -> RehydrateReport {
        let stale_after = Duration::milliseconds(i64::try_from(stale_after_ms).unwrap_or(i64::MAX));
        let mut in_flight: Vec<(u64, String, Duration)> = self
            .runs
            .values()
            .filter(|run| run.is_in_flight())
            .map(|run| (run.created_seq, run.run_id.clone(), now - run.last_event_at))
            .collect();
        in_flight.sort();

        let mut report = RehydrateReport::default();
        for (_, run_id, silence) in in_flight {
            if silence > stale_after {
                let message = format!(
                    "Connection lost: no events for {}s before reconnect",
                    silence.num_seconds()
                );
                warn!(run_id = %run_id, message = %message, "failing stale run after reconnect");
                let payload = json!({ "silence_ms": silence.num_milliseconds() });
                self.fail_run(
                    &run_id,
                    TerminalKind::ConnectionLost,
                    &message,
                    CONNECTION_LOST_CODE,
                    payload,
                    now,
                    ctx,
                );
                report.failed.push(run_id);
            } else if let Some(run) = self.runs.get_mut(&run_id) {
                ctx.watchdog.heartbeat(run, now);
                if run.watchdog.timer_handle.is_none() {
                    ctx.watchdog.start(run, now, ctx.timers);
                }
                report.refreshed.push(run_id);
            }
        }
        report.orphans_pruned = self.orphans.prune_older_than(now - stale_after);
        report
    }

    /// Starts a local follow-up run for a re-verify or repair request on a
    /// finished run. Uncorrelated follow-up frames resolve to it while it is
    /// the only running run.
    pub(crate) fn create_follow_up(
        &mut self,
        parent_run_id: &str,
        kind: FollowUpKind,
        now: DateTime<Utc>,
        ctx: &mut ApplyContext<'_>,
    ) -> Option<String> {
        let parent = self.runs.get(parent_run_id)?;
        let (suffix, origin, phase) = match kind {
            FollowUpKind::Reverify => (
                "reverify",
                RunOrigin::Reverify {
                    parent_run_id: parent_run_id.to_string(),
                },
                WorkflowPhase::Verify,
            ),
            FollowUpKind::Repair => (
                "repair",
                RunOrigin::Repair {
                    parent_run_id: parent_run_id.to_string(),
                },
                WorkflowPhase::Repair,
            ),
        };
        let run_id = format!("{parent_run_id}:{suffix}-{}", self.next_seq + 1);
        let mut run = Run::new(run_id.clone(), origin, now, ctx.watchdog.timeout_for(phase));
        run.status = RunStatus::Running;
        run.workflow_phase = phase;
        run.conversation_id.clone_from(&parent.conversation_id);
        run.associated_message_id.clone_from(&parent.associated_message_id);
        run.user_message_id.clone_from(&parent.user_message_id);
        run.update_phase_status(phase, PhaseStatus::Running, now);
        self.insert_run(run, now, ctx);
        Some(run_id)
    }

    /// Stops every watchdog timer. Safe with no timers running.
    pub(crate) fn stop_all_watchdogs(&mut self, ctx: &mut ApplyContext<'_>) -> usize {
        ctx.watchdog.stop_all(self.runs.values_mut(), ctx.timers)
    }
}

fn apply_phase(run: &mut Run, data: &PhaseData, timestamp: &str, now: DateTime<Utc>) {
    run.phase_history.push(PhaseHistoryEntry {
        phase: data.phase.clone(),
        status: data.status.clone(),
        message: data.message.clone(),
        timestamp: timestamp.to_string(),
    });
    if let Some(phase) = WorkflowPhase::parse(&data.phase) {
        run.workflow_phase = phase;
        run.update_phase_status(phase, PhaseStatus::from_wire(&data.status), now);
    }
}

fn tool_record(data: &ToolData, timestamp: &str) -> ToolRecord {
    ToolRecord {
        tool: data.tool.clone(),
        status: data.status.clone(),
        params: data.params.clone(),
        result: data.result.clone(),
        error: data.error.clone(),
        iteration: data.iteration,
        timestamp: timestamp.to_string(),
    }
}

fn verification_entry(data: &VerificationItemData, timestamp: &str) -> VerificationEntry {
    VerificationEntry {
        check_name: data.check_name.clone(),
        status: data.status.clone(),
        output: data.output.clone(),
        error: data.error.clone(),
        timestamp: timestamp.to_string(),
    }
}
