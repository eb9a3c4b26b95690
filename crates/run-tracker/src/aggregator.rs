//! Per-run coalescing of streamed token fragments.
//!
//! A buffer holds at most one pending flush timer. When the timer fires the
//! buffer is emitted once the stream has been quiet for the flush delay, or
//! once it has been held for the max wait, whichever comes first.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::config::AggregatorConfig;
use crate::timers::{TimerHandle, TimerKey, TimerQueue};

/// Content emitted for a run in one update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenFlush {
    pub run_id: String,
    pub content: String,
}

#[derive(Debug)]
struct TokenBuffer {
    content: String,
    timer: Option<TimerHandle>,
    first_at: DateTime<Utc>,
    last_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct TokenAggregator {
    flush_delay: Duration,
    max_wait: Duration,
    buffers: HashMap<String, TokenBuffer>,
}

impl TokenAggregator {
    #[must_use]
    pub fn new(config: &AggregatorConfig) -> Self {
        let flush_delay = duration_ms(config.flush_delay_ms);
        Self {
            flush_delay,
            max_wait: duration_ms(config.max_wait_ms).max(flush_delay),
            buffers: HashMap::new(),
        }
    }

    /// Appends a fragment, starting the flush timer if none is pending.
    pub fn push(&mut self, run_id: &str, fragment: &str, now: DateTime<Utc>, timers: &mut TimerQueue) {
        if fragment.is_empty() {
            return;
        }
        let buffer = self
            .buffers
            .entry(run_id.to_string())
            .or_insert_with(|| TokenBuffer {
                content: String::new(),
                timer: None,
                first_at: now,
                last_at: now,
            });
        if buffer.content.is_empty() {
            buffer.first_at = now;
        }
        buffer.content.push_str(fragment);
        buffer.last_at = now;
        if buffer.timer.is_none() {
            buffer.timer = Some(timers.schedule(
                TimerKey::TokenFlush(run_id.to_string()),
                now + self.flush_delay,
            ));
        }
    }

    /// Handles a fired flush timer. Stale handles are ignored.
    pub fn on_timer(
        &mut self,
        run_id: &str,
        handle: TimerHandle,
        now: DateTime<Utc>,
        timers: &mut TimerQueue,
    ) -> Option<TokenFlush> {
        let buffer = self.buffers.get_mut(run_id)?;
        if buffer.timer != Some(handle) {
            return None;
        }
        buffer.timer = None;

        let quiet_at = buffer.last_at + self.flush_delay;
        let give_up_at = buffer.first_at + self.max_wait;
        if now < quiet_at && now < give_up_at {
            buffer.timer = Some(timers.schedule(
                TimerKey::TokenFlush(run_id.to_string()),
                quiet_at.min(give_up_at),
            ));
            return None;
        }
        self.take(run_id)
    }

    /// Emits whatever is buffered for the run right away.
    pub fn flush(&mut self, run_id: &str, timers: &mut TimerQueue) -> Option<TokenFlush> {
        let handle = self.buffers.get_mut(run_id).and_then(|buffer| buffer.timer.take());
        if let Some(handle) = handle {
            timers.cancel(handle);
        }
        self.take(run_id)
    }

    /// Drops the run's buffer without emitting it.
    pub fn discard(&mut self, run_id: &str, timers: &mut TimerQueue) {
        if let Some(buffer) = self.buffers.remove(run_id)
            && let Some(handle) = buffer.timer
        {
            timers.cancel(handle);
        }
    }

    #[must_use]
    pub fn pending(&self, run_id: &str) -> Option<&str> {
        self.buffers
            .get(run_id)
            .map(|buffer| buffer.content.as_str())
            .filter(|content| !content.is_empty())
    }

    fn take(&mut self, run_id: &str) -> Option<TokenFlush> {
        let buffer = self.buffers.remove(run_id)?;
        if buffer.content.is_empty() {
            return None;
        }
        Some(TokenFlush {
            run_id: run_id.to_string(),
            content: buffer.content,
        })
    }
}

fn duration_ms(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}
