//! Bounded ring of events that could not be routed to a run.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::event::CanonicalEvent;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrphanEvent {
    pub event: CanonicalEvent,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct OrphanBuffer {
    capacity: usize,
    entries: VecDeque<OrphanEvent>,
}

impl OrphanBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Stores the event, evicting the oldest entry when full.
    pub fn push(&mut self, event: CanonicalEvent, received_at: DateTime<Utc>) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(OrphanEvent { event, received_at });
    }

    /// Drops entries received before `cutoff`. Returns how many were removed.
    pub fn prune_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.received_at >= cutoff);
        before - self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OrphanEvent> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    use super::OrphanBuffer;
    use crate::normalize::normalize;

    #[test]
    fn ring_is_bounded_and_prunes_by_age() {
        let base = Utc
            .timestamp_opt(1_700_000_000, 0)
            .single()
            .expect("valid timestamp");
        let mut orphans = OrphanBuffer::new(2);
        for (offset, phase) in [(0, "spec"), (60, "plan"), (180, "execute")] {
            let event = normalize(&json!({"type": "phase", "data": {"phase": phase}}), base)
                .expect("phase event");
            orphans.push(event, base + Duration::seconds(offset));
        }

        assert_eq!(orphans.len(), 2);
        assert_eq!(orphans.prune_older_than(base + Duration::seconds(120)), 1);
        assert_eq!(orphans.len(), 1);
    }
}
