//! Client-side run tracking for the chat workflow websocket.
//!
//! The peer streams loosely shaped notification frames (phases, tokens,
//! tool calls, verification checks, terminal results) for one or more
//! concurrently executing runs. [`Tracker`] normalizes those frames into
//! [`CanonicalEvent`]s and reconciles them into per-run state, surviving
//! reconnects, late correlation ids, duplicated terminal frames and silent
//! stalls. It performs no IO itself: [`driver::spawn`] pairs it with a
//! websocket [`Connector`] and a timer loop.

#![cfg_attr(test, allow(clippy::expect_used, clippy::panic))]

pub mod aggregator;
pub mod bus;
pub mod config;
pub mod driver;
pub mod error;
pub mod event;
pub mod gc;
pub mod messages;
pub mod normalize;
pub mod orphans;
pub mod registry;
pub mod run;
pub mod timers;
pub mod tracker;
pub mod transport;
pub mod watchdog;

pub use bus::{EventBus, Notification, SubscriptionId, Topic};
pub use config::{
    AggregatorConfig, ConfigError, PhaseTimeouts, RehydrateConfig, RetentionConfig,
    RunTrackerConfig, TransportConfig, WatchdogConfig,
};
pub use driver::{RunTrackerHandle, spawn};
pub use error::{ProtocolError, Result, TrackerError, TransportError};
pub use event::{
    CanonicalEvent, CompleteData, ConversationCreatedData, ErrorData, EventPayload, EventType,
    PhaseData, ThinkingData, ToolData, VerificationItemData,
};
pub use messages::{ChatMessage, ChatRole, InMemoryMessages, MessageId, MessagePatch, MessageStore};
pub use normalize::normalize;
pub use registry::{ApplyOutcome, PendingSubmission, RunRegistry};
pub use run::{PhaseStatus, Run, RunOrigin, RunStatus, WorkflowPhase};
pub use tracker::{
    FallbackResponse, FrameOutcome, RunReport, RunSummary, SubmitReceipt, SubmitRequest, Tracker,
    TrackerDiagnostics,
};
pub use transport::socket::{Connector, SocketCommand, SocketEvent, SocketLink, WsConnector};
pub use transport::{
    ConnectionDiagnostics, ConnectionState, CredentialProvider, EnvCredential, StaticCredential,
};
