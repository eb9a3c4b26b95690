//! Sans-IO facade over the connection, registry and timers.
//!
//! Every entry point takes the current instant, mutates state synchronously
//! and leaves IO to the caller: [`Tracker::take_effects`] yields what the
//! socket should do, [`Tracker::next_deadline`] says when to call
//! [`Tracker::fire_due`] next.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::TokenAggregator;
use crate::bus::{EventBus, Handler, Notification, SubscriptionId, Topic};
use crate::config::RunTrackerConfig;
use crate::error::{Result, TrackerError, TransportError};
use crate::event::{CanonicalEvent, CompleteData, EventPayload};
use crate::gc::{GcReport, schedule_sweep};
use crate::messages::{FinalizedMessage, MessageId, MessagePatch, MessageStore};
use crate::normalize::{MODELS_FRAME_TYPE, PAYLOAD_FIELDS, classify, iso, parse_frame, raw_type};
use crate::orphans::OrphanEvent;
use crate::registry::{ApplyContext, ApplyOutcome, FollowUpKind, PendingSubmission, RunRegistry};
use crate::run::{
    PhaseHistoryEntry, PhaseState, Run, RunError, RunStatus, TerminalEvent, TerminalKind,
    ToolRecord, VerificationEntry, WorkflowPhase,
};
use crate::timers::{TimerHandle, TimerKey, TimerQueue};
use crate::transport::{
    ABNORMAL_CLOSURE, CloseOutcome, Connection, ConnectionDiagnostics, ConnectionState,
    CredentialProvider, TransportEffect,
};
use crate::watchdog::Watchdog;

pub use crate::registry::RunSummary;

pub const FALLBACK_FAILED_CODE: &str = "FALLBACK_FAILED";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Applied(ApplyOutcome),
    /// Model catalog forwarded to [`Topic::Models`] subscribers.
    Models,
    /// Unparseable or non-canonical frame.
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub message: String,
    pub conversation_id: Option<String>,
    pub model: Option<String>,
    pub user_message_id: Option<MessageId>,
    pub assistant_message_id: MessageId,
    /// Queue the frame for the next connection instead of reporting it
    /// unsent.
    pub queue_if_offline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub temp_id: String,
    /// Transmitted on the open socket.
    pub accepted: bool,
    /// Held in the outbound queue until the socket opens.
    pub queued: bool,
}

impl SubmitReceipt {
    /// Neither sent nor queued: the caller should use the fallback client.
    #[must_use]
    pub fn needs_fallback(&self) -> bool {
        !self.accepted && !self.queued
    }
}

/// Body of the request/response fallback endpoint.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FallbackResponse {
    #[serde(default, alias = "runId")]
    pub run_id: Option<String>,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default, alias = "conversationId")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub verification: Option<Value>,
    #[serde(default)]
    pub verdict: Option<Value>,
    #[serde(default)]
    pub tools_used: Vec<Value>,
    #[serde(default, alias = "model_used")]
    pub model: Option<String>,
    #[serde(default)]
    pub iterations: Option<u64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl FallbackResponse {
    fn into_complete(self) -> (Option<String>, Option<String>, CompleteData) {
        let data = CompleteData {
            response: self.response,
            verification: self.verification,
            verdict: self.verdict,
            tools_used: self.tools_used,
            iterations: self.iterations,
            duration_ms: self.duration_ms,
            model: self.model,
            ..CompleteData::default()
        };
        (self.run_id, self.conversation_id, data)
    }
}

/// Exportable snapshot of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub conversation_id: Option<String>,
    pub status: RunStatus,
    pub workflow_phase: WorkflowPhase,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub phases: BTreeMap<WorkflowPhase, PhaseState>,
    pub phase_history: Vec<PhaseHistoryEntry>,
    pub tools: Vec<ToolRecord>,
    pub verification: Vec<VerificationEntry>,
    pub response: Option<String>,
    pub verdict: Option<Value>,
    pub tools_used: Vec<Value>,
    pub model: Option<String>,
    pub error: Option<RunError>,
    pub terminal_event: Option<TerminalEvent>,
}

impl From<&Run> for RunReport {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.run_id.clone(),
            conversation_id: run.conversation_id.clone(),
            status: run.status,
            workflow_phase: run.workflow_phase,
            started_at: run.started_at,
            ended_at: run.ended_at,
            duration_ms: run.duration_ms(),
            phases: run.phases.clone(),
            phase_history: run.phase_history.clone(),
            tools: run.tools.clone(),
            verification: run.verification.clone(),
            response: run.outcome.response.clone(),
            verdict: run.outcome.verdict.clone(),
            tools_used: run.outcome.tools_used.clone(),
            model: run.outcome.model.clone(),
            error: run.error.clone(),
            terminal_event: run.terminal_event.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackerDiagnostics {
    pub connection: ConnectionDiagnostics,
    pub runs: RunSummary,
    pub archive: Vec<String>,
    pub pending_timers: usize,
    pub subscriptions: usize,
}

#[derive(Debug, Serialize)]
struct SubmitFrame<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ActionFrame<'a> {
    action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    checks: Option<&'a [String]>,
}

pub struct Tracker {
    config: RunTrackerConfig,
    connection: Connection,
    registry: RunRegistry,
    aggregator: TokenAggregator,
    watchdog: Watchdog,
    timers: TimerQueue,
    messages: Arc<dyn MessageStore>,
    bus: EventBus,
    outbox: Vec<Notification>,
    gc_timer: Option<TimerHandle>,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("connection", &self.connection)
            .field("runs", &self.registry.len())
            .field("timers", &self.timers.len())
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl Tracker {
    #[must_use]
    pub fn new(
        config: RunTrackerConfig,
        credentials: Arc<dyn CredentialProvider>,
        messages: Arc<dyn MessageStore>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut timers = TimerQueue::new();
        let gc_timer = Some(schedule_sweep(config.retention.gc_interval_ms, now, &mut timers));
        Self {
            connection: Connection::new(config.transport.clone(), credentials),
            registry: RunRegistry::new(config.retention.clone()),
            aggregator: TokenAggregator::new(&config.aggregator),
            watchdog: Watchdog::new(config.watchdog.clone()),
            timers,
            messages,
            bus: EventBus::new(),
            outbox: Vec::new(),
            gc_timer,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &RunTrackerConfig {
        &self.config
    }

    pub fn subscribe(&mut self, topic: Topic, handler: Handler) -> SubscriptionId {
        self.bus.subscribe(topic, handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Parses, normalizes and applies one inbound text frame.
    pub fn handle_frame(&mut self, text: &str, now: DateTime<Utc>) -> FrameOutcome {
        let raw = match parse_frame(text) {
            Ok(raw) => raw,
            Err(error) => {
                debug!(error = %error, "dropping unparseable frame");
                return FrameOutcome::Dropped;
            }
        };
        if raw_type(&raw) == Some(MODELS_FRAME_TYPE) {
            let models = raw
                .as_object()
                .and_then(|frame| {
                    PAYLOAD_FIELDS
                        .iter()
                        .chain(&["models"])
                        .find_map(|key| frame.get(*key))
                })
                .cloned()
                .unwrap_or(Value::Null);
            self.bus.publish(&Notification::Models { models });
            return FrameOutcome::Models;
        }
        match classify(&raw, now) {
            Ok(event) => FrameOutcome::Applied(self.apply_event(event, now)),
            Err(error) => {
                debug!(error = %error, "dropping frame");
                FrameOutcome::Dropped
            }
        }
    }

    pub fn apply_event(&mut self, event: CanonicalEvent, now: DateTime<Utc>) -> ApplyOutcome {
        self.with_registry(|registry, ctx| registry.apply(event, now, ctx))
    }

    /// Registers a submission and sends its frame.
    ///
    /// # Errors
    ///
    /// [`TrackerError::EmptyMessage`] for blank input.
    pub fn submit_message(&mut self, request: SubmitRequest, now: DateTime<Utc>) -> Result<SubmitReceipt> {
        if request.message.trim().is_empty() {
            return Err(TrackerError::EmptyMessage);
        }
        let temp_id = format!("pending-{}", Uuid::new_v4());
        let model = request.model.or_else(|| self.config.default_model.clone());
        let frame = serde_json::to_string(&SubmitFrame {
            message: &request.message,
            conversation_id: request.conversation_id.as_deref(),
            model: model.as_deref(),
        })?;

        self.registry.add_submission(PendingSubmission {
            temp_id: temp_id.clone(),
            conversation_id: request.conversation_id,
            user_message_id: request.user_message_id,
            assistant_message_id: request.assistant_message_id,
            run_id: None,
            created_at: now,
        });

        let (accepted, queued) = if self.connection.is_connected() {
            (self.transport(|connection, _| connection.try_send(frame)), false)
        } else if request.queue_if_offline {
            self.transport(|connection, timers| connection.send(frame, timers));
            (false, true)
        } else {
            (false, false)
        };
        info!(temp_id = %temp_id, accepted, queued, "message submitted");
        Ok(SubmitReceipt {
            temp_id,
            accepted,
            queued,
        })
    }

    /// Asks the peer to re-run verification of a completed run. Returns the
    /// id of the local follow-up run.
    ///
    /// # Errors
    ///
    /// [`TrackerError::UnknownRun`] or [`TrackerError::RunNotComplete`].
    pub fn request_rerun_verification(
        &mut self,
        run_id: &str,
        checks: Option<Vec<String>>,
        now: DateTime<Utc>,
    ) -> Result<String> {
        self.follow_up(run_id, FollowUpKind::Reverify, "rerun_verify", checks.as_deref(), now)
    }

    /// Asks the peer to force a repair pass on a completed run. Returns the
    /// id of the local follow-up run.
    ///
    /// # Errors
    ///
    /// [`TrackerError::UnknownRun`] or [`TrackerError::RunNotComplete`].
    pub fn request_force_repair(&mut self, run_id: &str, now: DateTime<Utc>) -> Result<String> {
        self.follow_up(run_id, FollowUpKind::Repair, "force_repair", None, now)
    }

    fn follow_up(
        &mut self,
        run_id: &str,
        kind: FollowUpKind,
        action: &'static str,
        checks: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let parent = self
            .registry
            .get(run_id)
            .ok_or_else(|| TrackerError::UnknownRun(run_id.to_string()))?;
        if parent.status != RunStatus::Complete {
            return Err(TrackerError::RunNotComplete {
                run_id: run_id.to_string(),
                status: parent.status,
            });
        }
        let conversation_id = parent.conversation_id.clone();
        let model = parent
            .outcome
            .model
            .clone()
            .or_else(|| self.config.default_model.clone());
        let frame = serde_json::to_string(&ActionFrame {
            action,
            run_id: Some(run_id),
            conversation_id: conversation_id.as_deref(),
            model: model.as_deref(),
            checks,
        })?;

        let follow_up = self
            .with_registry(|registry, ctx| registry.create_follow_up(run_id, kind, now, ctx))
            .ok_or_else(|| TrackerError::UnknownRun(run_id.to_string()))?;
        let sent = self.transport(|connection, timers| connection.send(frame, timers));
        info!(run_id, follow_up = %follow_up, action, sent, "follow-up requested");
        Ok(follow_up)
    }

    /// Requests the model catalog; the reply arrives on [`Topic::Models`].
    ///
    /// # Errors
    ///
    /// Serialization failures only.
    pub fn refresh_models(&mut self) -> Result<bool> {
        let frame = serde_json::to_string(&ActionFrame {
            action: "get_models",
            run_id: None,
            conversation_id: None,
            model: None,
            checks: None,
        })?;
        Ok(self.transport(|connection, timers| connection.send(frame, timers)))
    }

    /// Applies a successful fallback response for a submission that could
    /// not go over the socket. Without a peer run id the message is
    /// finalized directly and no run is created.
    ///
    /// # Errors
    ///
    /// [`TrackerError::UnknownSubmission`] when `temp_id` matches neither a
    /// pending submission nor a run bound to one.
    pub fn apply_fallback_response(
        &mut self,
        temp_id: &str,
        response: FallbackResponse,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        let bound_run = self
            .registry
            .run_for_submission(temp_id)
            .map(|run| run.run_id.clone());
        let submission = self.registry.take_submission(temp_id);
        if bound_run.is_none() && submission.is_none() {
            return Err(TrackerError::UnknownSubmission(temp_id.to_string()));
        }

        let (peer_run_id, conversation_id, data) = response.into_complete();
        match (peer_run_id.or(bound_run), submission) {
            (Some(run_id), submission) => {
                let event = CanonicalEvent {
                    timestamp: iso(now),
                    run_id: Some(run_id.clone()),
                    conversation_id,
                    payload: EventPayload::Complete(data),
                };
                Ok(self.with_registry(|registry, ctx| {
                    if !registry.contains(&run_id) {
                        registry.create_run(&run_id, submission, now, ctx);
                    }
                    registry.apply(event, now, ctx)
                }))
            }
            (None, Some(submission)) => {
                warn!(temp_id, "fallback response without run id, finalizing message directly");
                let message_id = submission.assistant_message_id;
                if conversation_id.is_some() {
                    self.messages.apply(
                        &message_id,
                        MessagePatch::Bind {
                            run_id: None,
                            conversation_id,
                        },
                    );
                }
                self.messages.apply(
                    &message_id,
                    MessagePatch::Finalize(FinalizedMessage {
                        content: Some(data.response.unwrap_or_default()),
                        tools_used: data.tools_used,
                        verification: data.verification,
                        verdict: data.verdict,
                        model: data.model,
                        finalized_at: Some(now),
                    }),
                );
                Ok(ApplyOutcome::MessageFinalized { message_id })
            }
            (None, None) => Err(TrackerError::UnknownSubmission(temp_id.to_string())),
        }
    }

    /// Marks a submission's run, or its message when no run exists, failed
    /// after the fallback request itself failed.
    ///
    /// # Errors
    ///
    /// [`TrackerError::UnknownSubmission`] for an unknown `temp_id`.
    pub fn apply_fallback_failure(
        &mut self,
        temp_id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        if let Some(run_id) = self
            .registry
            .run_for_submission(temp_id)
            .map(|run| run.run_id.clone())
        {
            self.registry.take_submission(temp_id);
            return Ok(self.with_registry(|registry, ctx| {
                registry.fail_run(
                    &run_id,
                    TerminalKind::Error,
                    message,
                    FALLBACK_FAILED_CODE,
                    json!({ "message": message }),
                    now,
                    ctx,
                )
            }));
        }
        let submission = self
            .registry
            .take_submission(temp_id)
            .ok_or_else(|| TrackerError::UnknownSubmission(temp_id.to_string()))?;
        let message_id = submission.assistant_message_id;
        self.messages.apply(
            &message_id,
            MessagePatch::Fail {
                content: format!("Error: {message}"),
                at: now,
            },
        );
        Ok(ApplyOutcome::MessageFailed { message_id })
    }

    /// Starts connecting. Returns false when already open or opening.
    pub fn connect(&mut self) -> bool {
        self.transport(Connection::connect)
    }

    /// Closes intentionally; automatic reconnection stops. In-flight runs
    /// are left to the watchdog or to rehydration on the next connect.
    pub fn disconnect(&mut self, reason: &str) {
        self.transport(|connection, timers| connection.disconnect(reason, timers));
    }

    /// Socket opened. A reconnection rehydrates in-flight runs. Returns true
    /// for a reconnection.
    pub fn on_open(&mut self, now: DateTime<Utc>) -> bool {
        let reconnected = self.transport(Connection::on_open);
        if reconnected {
            let stale_after_ms = self.config.rehydrate.stale_after_ms;
            let report =
                self.with_registry(|registry, ctx| registry.rehydrate(stale_after_ms, now, ctx));
            info!(
                failed = report.failed.len(),
                refreshed = report.refreshed.len(),
                orphans_pruned = report.orphans_pruned,
                "rehydrated runs after reconnect"
            );
        }
        reconnected
    }

    pub fn on_close(&mut self, code: u16, reason: &str, now: DateTime<Utc>) -> CloseOutcome {
        let outcome =
            self.transport(|connection, timers| connection.on_close(code, reason, now, timers));
        if let CloseOutcome::Exhausted { attempts } = outcome {
            self.bus
                .publish(&Notification::ReconnectExhausted { attempts });
        }
        outcome
    }

    /// A connect attempt failed before the socket opened.
    pub fn on_connect_failed(&mut self, error: &TransportError, now: DateTime<Utc>) -> CloseOutcome {
        warn!(error = %error, "websocket connect failed");
        self.on_close(ABNORMAL_CLOSURE, &error.to_string(), now)
    }

    /// Runs every timer due at `now`. Returns how many fired.
    pub fn fire_due(&mut self, now: DateTime<Utc>) -> usize {
        let due = self.timers.pop_due(now);
        let fired = due.len();
        for (handle, key) in due {
            match key {
                TimerKey::Watchdog(run_id) => {
                    self.with_registry(|registry, ctx| {
                        registry.watchdog_tick(&run_id, handle, now, ctx)
                    });
                }
                TimerKey::TokenFlush(run_id) => {
                    if let Some(flush) =
                        self.aggregator
                            .on_timer(&run_id, handle, now, &mut self.timers)
                    {
                        self.with_registry(|registry, ctx| registry.apply_flush(flush, now, ctx));
                    }
                }
                TimerKey::Reconnect => {
                    self.transport(|connection, _| connection.on_reconnect_timer(handle));
                }
                TimerKey::GcSweep => {
                    if self.gc_timer == Some(handle) {
                        self.sweep(now);
                    }
                }
            }
        }
        fired
    }

    /// Runs a retention pass now and reschedules the periodic one.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> GcReport {
        if let Some(handle) = self.gc_timer.take() {
            self.timers.cancel(handle);
        }
        let report = self.with_registry(|registry, ctx| registry.sweep(now, ctx));
        self.gc_timer = Some(schedule_sweep(
            self.config.retention.gc_interval_ms,
            now,
            &mut self.timers,
        ));
        report
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.timers.next_deadline()
    }

    pub fn take_effects(&mut self) -> Vec<TransportEffect> {
        self.connection.take_effects()
    }

    /// Returns a transmitted frame the socket never accepted to the
    /// outbound queue.
    pub fn requeue_undelivered(&mut self, frame: String) {
        self.connection.requeue(frame);
    }

    pub fn stop_all_watchdogs(&mut self) -> usize {
        self.with_registry(|registry, ctx| registry.stop_all_watchdogs(ctx))
    }

    /// Drops finished runs of a conversation past the terminal TTL.
    pub fn cleanup_conversation(&mut self, conversation_id: &str, now: DateTime<Utc>) -> Vec<String> {
        self.with_registry(|registry, ctx| registry.cleanup_conversation(conversation_id, now, ctx))
    }

    #[must_use]
    pub fn get(&self, run_id: &str) -> Option<&Run> {
        self.registry.get(run_id)
    }

    #[must_use]
    pub fn list_for_conversation(&self, conversation_id: &str) -> Vec<&Run> {
        self.registry.list_for_conversation(conversation_id)
    }

    #[must_use]
    pub fn summary(&self) -> RunSummary {
        self.registry.summary()
    }

    pub fn orphans(&self) -> impl Iterator<Item = &OrphanEvent> {
        self.registry.orphans().iter()
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    #[must_use]
    pub fn diagnostics(&self) -> TrackerDiagnostics {
        TrackerDiagnostics {
            connection: self.connection.diagnostics(),
            runs: self.registry.summary(),
            archive: self.registry.archive().map(ToString::to_string).collect(),
            pending_timers: self.timers.len(),
            subscriptions: self.bus.len(),
        }
    }

    /// # Errors
    ///
    /// [`TrackerError::UnknownRun`] when the run is not tracked.
    pub fn run_report(&self, run_id: &str) -> Result<RunReport> {
        self.registry
            .get(run_id)
            .map(RunReport::from)
            .ok_or_else(|| TrackerError::UnknownRun(run_id.to_string()))
    }

    fn with_registry<T, F>(&mut self, apply: F) -> T
    where
        F: FnOnce(&mut RunRegistry, &mut ApplyContext<'_>) -> T,
    {
        let result = {
            let mut ctx = ApplyContext {
                timers: &mut self.timers,
                aggregator: &mut self.aggregator,
                watchdog: &self.watchdog,
                messages: self.messages.as_ref(),
                notifications: &mut self.outbox,
            };
            apply(&mut self.registry, &mut ctx)
        };
        for notification in std::mem::take(&mut self.outbox) {
            self.bus.publish(&notification);
        }
        result
    }

    /// Runs a connection operation and publishes any state change it caused.
    fn transport<T, F>(&mut self, op: F) -> T
    where
        F: FnOnce(&mut Connection, &mut TimerQueue) -> T,
    {
        let from = self.connection.state();
        let result = op(&mut self.connection, &mut self.timers);
        let to = self.connection.state();
        if from != to {
            debug!(from = from.as_str(), to = to.as_str(), "connection state changed");
            self.bus.publish(&Notification::StateChange { from, to });
        }
        result
    }
}
