//! Error types for the run tracker.

use thiserror::Error;

use crate::run::RunStatus;

/// Failures of the physical connection. These are recovered by the reconnect
/// policy and never fail a run on their own.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid websocket url: {0}")]
    InvalidUrl(String),

    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("connection closed with code {code}: {reason}")]
    Closed { code: u16, reason: String },

    #[error("not connected")]
    NotConnected,

    #[error("reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },
}

/// Reasons an inbound frame is discarded before it reaches the registry.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a json object")]
    NotAnObject,

    #[error("frame carries no type field")]
    MissingType,

    #[error("unsupported frame type: {0}")]
    UnsupportedType(String),
}

/// Errors returned by the caller-facing tracker API.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("unknown run: {0}")]
    UnknownRun(String),

    #[error("run {run_id} is {status}, expected complete", status = .status.as_str())]
    RunNotComplete { run_id: String, status: RunStatus },

    #[error("unknown submission: {0}")]
    UnknownSubmission(String),

    #[error("message is empty")]
    EmptyMessage,

    #[error("tracker driver stopped")]
    DriverStopped,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrackerError>;
