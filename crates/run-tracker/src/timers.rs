//! Deadline queue backing every timer in the tracker.
//!
//! Nothing here sleeps: callers schedule keys at absolute instants, ask for
//! the earliest deadline, and pop whatever is due when their clock reaches it.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Cancellation handle returned by [`TimerQueue::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TimerHandle(u64);

impl TimerHandle {
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Watchdog(String),
    TokenFlush(String),
    Reconnect,
    GcSweep,
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    next_handle: u64,
    deadlines: BTreeMap<(DateTime<Utc>, TimerHandle), TimerKey>,
    index: HashMap<TimerHandle, DateTime<Utc>>,
}

impl TimerQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, key: TimerKey, at: DateTime<Utc>) -> TimerHandle {
        self.next_handle = self.next_handle.saturating_add(1);
        let handle = TimerHandle(self.next_handle);
        self.deadlines.insert((at, handle), key);
        self.index.insert(handle, at);
        handle
    }

    /// Returns whether the handle was still pending.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.index.remove(&handle) {
            Some(at) => self.deadlines.remove(&(at, handle)).is_some(),
            None => false,
        }
    }

    #[must_use]
    pub fn is_scheduled(&self, handle: TimerHandle) -> bool {
        self.index.contains_key(&handle)
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.deadlines.keys().next().map(|(at, _)| *at)
    }

    /// Removes and returns every timer due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<(TimerHandle, TimerKey)> {
        let mut due = Vec::new();
        while let Some(entry) = self.deadlines.first_entry() {
            let (at, handle) = *entry.key();
            if at > now {
                break;
            }
            let key = entry.remove();
            self.index.remove(&handle);
            due.push((handle, key));
        }
        due
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
