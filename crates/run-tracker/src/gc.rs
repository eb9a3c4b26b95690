//! Retention for the run registry.
//!
//! Terminal runs expire after a TTL. The registry is also capped: inserting
//! past the cap evicts the oldest terminal runs first, and only then the
//! oldest in-flight ones. Pending submissions that never bound expire too.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::registry::{ApplyContext, RunRegistry};
use crate::run::Run;
use crate::timers::{TimerHandle, TimerKey, TimerQueue};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub expired: Vec<String>,
    pub evicted: Vec<String>,
    pub submissions_dropped: usize,
}

impl GcReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.evicted.is_empty() && self.submissions_dropped == 0
    }
}

fn millis(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

pub(crate) fn schedule_sweep(interval_ms: u64, now: DateTime<Utc>, timers: &mut TimerQueue) -> TimerHandle {
    timers.schedule(TimerKey::GcSweep, now + millis(interval_ms.max(1)))
}

impl RunRegistry {
    /// One retention pass: expire old terminal runs, enforce the cap and
    /// drop stale submissions.
    pub(crate) fn sweep(&mut self, now: DateTime<Utc>, ctx: &mut ApplyContext<'_>) -> GcReport {
        let cutoff = now - millis(self.retention.terminal_ttl_ms);
        let mut expired: Vec<(DateTime<Utc>, u64, String)> = self
            .runs
            .values()
            .filter_map(|run| match run.ended_at {
                Some(ended) if run.terminal && ended < cutoff => {
                    Some((ended, run.created_seq, run.run_id.clone()))
                }
                _ => None,
            })
            .collect();
        expired.sort();

        let mut report = GcReport::default();
        for (_, _, run_id) in expired {
            self.remove_run(&run_id, ctx);
            report.expired.push(run_id);
        }
        report.evicted = self.evict_to(self.retention.max_runs.max(1), ctx);

        let submission_cutoff = now - millis(self.retention.submission_ttl_ms);
        let before = self.submissions.len();
        self.submissions
            .retain(|submission| submission.created_at >= submission_cutoff);
        report.submissions_dropped = before - self.submissions.len();

        if !report.is_empty() {
            info!(
                expired = report.expired.len(),
                evicted = report.evicted.len(),
                submissions_dropped = report.submissions_dropped,
                remaining = self.runs.len(),
                "run registry sweep"
            );
        }
        report
    }

    /// Frees one slot ahead of an insertion.
    pub(crate) fn make_room(&mut self, ctx: &mut ApplyContext<'_>) -> Vec<String> {
        let cap = self.retention.max_runs.max(1);
        self.evict_to(cap - 1, ctx)
    }

    /// Removes the finished runs of a conversation that ended before the
    /// terminal TTL.
    pub(crate) fn cleanup_conversation(
        &mut self,
        conversation_id: &str,
        now: DateTime<Utc>,
        ctx: &mut ApplyContext<'_>,
    ) -> Vec<String> {
        let cutoff = now - millis(self.retention.terminal_ttl_ms);
        let stale: Vec<String> = self
            .runs
            .values()
            .filter(|run| {
                run.conversation_id.as_deref() == Some(conversation_id)
                    && run.terminal
                    && run.ended_at.is_some_and(|ended| ended < cutoff)
            })
            .map(|run| run.run_id.clone())
            .collect();
        for run_id in &stale {
            self.remove_run(run_id, ctx);
        }
        if !stale.is_empty() {
            debug!(conversation_id, removed = stale.len(), "conversation cleanup");
        }
        stale
    }

    fn evict_to(&mut self, cap: usize, ctx: &mut ApplyContext<'_>) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.runs.len() > cap {
            let Some(victim) = self.eviction_candidate() else {
                break;
            };
            if self.remove_run(&victim, ctx).is_some_and(|run| !run.terminal) {
                debug!(run_id = %victim, "evicted in-flight run over capacity");
            }
            evicted.push(victim);
        }
        evicted
    }

    fn eviction_candidate(&self) -> Option<String> {
        let oldest_terminal = self
            .runs
            .values()
            .filter(|run| run.terminal)
            .min_by_key(|run| (run.ended_at, run.created_seq));
        oldest_terminal
            .or_else(|| self.runs.values().min_by_key(|run| run.created_seq))
            .map(|run| run.run_id.clone())
    }

    fn remove_run(&mut self, run_id: &str, ctx: &mut ApplyContext<'_>) -> Option<Run> {
        let mut run = self.runs.remove(run_id)?;
        if let Some(handle) = run.watchdog.timer_handle.take() {
            ctx.timers.cancel(handle);
        }
        ctx.aggregator.discard(run_id, ctx.timers);
        self.archive.retain(|archived| archived != run_id);
        Some(run)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use serde_json::json;

    use crate::aggregator::TokenAggregator;
    use crate::config::{AggregatorConfig, RetentionConfig, WatchdogConfig};
    use crate::messages::{InMemoryMessages, MessageId};
    use crate::normalize::normalize;
    use crate::registry::{ApplyContext, PendingSubmission, RunRegistry};
    use crate::timers::TimerQueue;
    use crate::watchdog::Watchdog;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0)
            .single()
            .expect("valid timestamp")
            + Duration::seconds(secs)
    }

    struct Harness {
        registry: RunRegistry,
        timers: TimerQueue,
        aggregator: TokenAggregator,
        watchdog: Watchdog,
        messages: InMemoryMessages,
        notifications: Vec<crate::bus::Notification>,
    }

    impl Harness {
        fn new(retention: RetentionConfig) -> Self {
            Self {
                registry: RunRegistry::new(retention),
                timers: TimerQueue::new(),
                aggregator: TokenAggregator::new(&AggregatorConfig::default()),
                watchdog: Watchdog::new(WatchdogConfig::default()),
                messages: InMemoryMessages::new(),
                notifications: Vec::new(),
            }
        }

        fn run<F, T>(&mut self, f: F) -> T
        where
            F: FnOnce(&mut RunRegistry, &mut ApplyContext<'_>) -> T,
        {
            let mut ctx = ApplyContext {
                timers: &mut self.timers,
                aggregator: &mut self.aggregator,
                watchdog: &self.watchdog,
                messages: &self.messages,
                notifications: &mut self.notifications,
            };
            f(&mut self.registry, &mut ctx)
        }

        fn feed(&mut self, raw: serde_json::Value, now: DateTime<Utc>) {
            let event = normalize(&raw, now).expect("frame");
            self.run(|registry, ctx| registry.apply(event, now, ctx));
        }
    }

    fn start(run_id: &str) -> serde_json::Value {
        json!({"type": "phase", "run_id": run_id, "data": {"phase": "plan", "status": "started"}})
    }

    fn finish(run_id: &str) -> serde_json::Value {
        json!({"type": "complete", "run_id": run_id, "data": {"response": "ok"}})
    }

    #[test]
    fn cap_evicts_oldest_terminal_runs_first() {
        let mut harness = Harness::new(RetentionConfig {
            max_runs: 3,
            ..RetentionConfig::default()
        });
        harness.feed(start("live"), at(0));
        for (offset, run_id) in ["done-1", "done-2"].into_iter().enumerate() {
            let secs = i64::try_from(offset).expect("small") + 1;
            harness.feed(start(run_id), at(secs));
            harness.feed(finish(run_id), at(secs));
        }
        assert_eq!(harness.registry.len(), 3);

        harness.feed(start("new"), at(10));
        assert_eq!(harness.registry.len(), 3);
        assert!(!harness.registry.contains("done-1"));
        assert!(harness.registry.contains("live"));
        assert!(harness.registry.contains("done-2"));
        assert!(!harness.registry.archive().any(|id| id == "done-1"));

        harness.feed(start("newer"), at(11));
        harness.feed(start("newest"), at(12));
        assert_eq!(harness.registry.len(), 3);
        assert!(!harness.registry.contains("live"), "in-flight evicted last");
    }

    #[test]
    fn sweep_expires_terminal_runs_and_stale_submissions() {
        let mut harness = Harness::new(RetentionConfig::default());
        harness.feed(start("old"), at(0));
        harness.feed(finish("old"), at(1));
        harness.feed(start("running"), at(2));
        harness.registry.add_submission(PendingSubmission {
            temp_id: "pending-1".to_string(),
            conversation_id: None,
            user_message_id: None,
            assistant_message_id: MessageId::Number(1),
            run_id: None,
            created_at: at(3),
        });

        let report = harness.run(|registry, ctx| registry.sweep(at(400), ctx));
        assert_eq!(report.expired, vec!["old".to_string()]);
        assert!(report.evicted.is_empty());
        assert_eq!(report.submissions_dropped, 1);
        assert!(harness.registry.contains("running"));
    }

    #[test]
    fn conversation_cleanup_keeps_recent_and_other_conversations() {
        let mut harness = Harness::new(RetentionConfig::default());
        for (run_id, conversation) in [("a1", "c-a"), ("b1", "c-b")] {
            harness.feed(
                json!({"type": "complete", "run_id": run_id, "conversation_id": conversation, "data": {"response": "ok"}}),
                at(0),
            );
        }
        harness.feed(
            json!({"type": "complete", "run_id": "a2", "conversation_id": "c-a", "data": {"response": "ok"}}),
            at(350),
        );

        let removed = harness.run(|registry, ctx| registry.cleanup_conversation("c-a", at(400), ctx));
        assert_eq!(removed, vec!["a1".to_string()]);
        assert!(harness.registry.contains("a2"));
        assert!(harness.registry.contains("b1"));
    }
}
