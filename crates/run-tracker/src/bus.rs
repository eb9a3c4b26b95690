//! Typed subscriptions for tracker notifications.

use std::panic::{AssertUnwindSafe, catch_unwind};

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::event::{CanonicalEvent, EventType};
use crate::run::RunStatus;
use crate::transport::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Event(EventType),
    StateChange,
    Models,
    ConnectionError,
    ReconnectExhausted,
    RunFinished,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "notification", rename_all = "snake_case")]
pub enum Notification {
    /// A canonical event applied to a run.
    Event { event: CanonicalEvent },
    /// Coalesced token content appended to a run.
    TokensFlushed { run_id: String, content: String },
    StateChange {
        from: ConnectionState,
        to: ConnectionState,
    },
    Models { models: Value },
    /// Error frame that no run could claim.
    ConnectionError { message: String, code: String },
    ReconnectExhausted { attempts: u32 },
    RunFinished {
        run_id: String,
        status: RunStatus,
        error: Option<String>,
    },
}

impl Notification {
    #[must_use]
    pub fn topic(&self) -> Topic {
        match self {
            Self::Event { event } => Topic::Event(event.event_type()),
            Self::TokensFlushed { .. } => Topic::Event(EventType::Thinking),
            Self::StateChange { .. } => Topic::StateChange,
            Self::Models { .. } => Topic::Models,
            Self::ConnectionError { .. } => Topic::ConnectionError,
            Self::ReconnectExhausted { .. } => Topic::ReconnectExhausted,
            Self::RunFinished { .. } => Topic::RunFinished,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub type Handler = Box<dyn Fn(&Notification) + Send>;

struct Subscription {
    id: SubscriptionId,
    topic: Topic,
    handler: Handler,
}

#[derive(Default)]
pub struct EventBus {
    next_id: u64,
    subscriptions: Vec<Subscription>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, topic: Topic, handler: Handler) -> SubscriptionId {
        self.next_id = self.next_id.saturating_add(1);
        let id = SubscriptionId(self.next_id);
        self.subscriptions.push(Subscription { id, topic, handler });
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|subscription| subscription.id != id);
        self.subscriptions.len() != before
    }

    /// Delivers to every handler on the notification's topic, in
    /// registration order. A panicking handler is logged and skipped.
    pub fn publish(&self, notification: &Notification) -> usize {
        let topic = notification.topic();
        let mut delivered = 0;
        for subscription in self.subscriptions.iter().filter(|s| s.topic == topic) {
            let outcome = catch_unwind(AssertUnwindSafe(|| (subscription.handler)(notification)));
            if outcome.is_err() {
                warn!(
                    subscription = subscription.id.0,
                    ?topic,
                    "subscription handler panicked"
                );
                continue;
            }
            delivered += 1;
        }
        delivered
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
