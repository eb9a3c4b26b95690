//! Connection state machine for the chat websocket.
//!
//! [`Connection`] owns reconnection policy and the outbound queue but
//! performs no IO. It emits [`TransportEffect`]s that the driver executes
//! against a [`socket::Connector`], and is told about socket lifecycle
//! through `on_open`/`on_close`.

pub mod socket;

use std::collections::VecDeque;
use std::env;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::TransportConfig;
use crate::timers::{TimerHandle, TimerKey, TimerQueue};

pub const NORMAL_CLOSURE: u16 = 1000;
pub const ABNORMAL_CLOSURE: u16 = 1006;
pub const USER_DISCONNECT_REASON: &str = "User disconnect";

/// Supplies the opaque bearer token offered during the handshake.
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticCredential {
    token: Option<String>,
}

impl StaticCredential {
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|token| !token.trim().is_empty()),
        }
    }

    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }
}

impl CredentialProvider for StaticCredential {
    fn bearer_token(&self) -> Option<String> {
        self.token.clone()
    }
}

/// Reads the token from an environment variable on every connect attempt,
/// so a refreshed value is picked up by the next reconnect.
#[derive(Debug, Clone)]
pub struct EnvCredential {
    var: String,
}

impl EnvCredential {
    #[must_use]
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl CredentialProvider for EnvCredential {
    fn bearer_token(&self) -> Option<String> {
        env::var(&self.var)
            .ok()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum TransportEffect {
    Open { url: String, protocols: Vec<String> },
    Transmit(String),
    Close { code: u16, reason: String },
}

impl fmt::Debug for TransportEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { url, protocols } => f
                .debug_struct("Open")
                .field("url", url)
                .field("protocols", &format!("<{} redacted>", protocols.len()))
                .finish(),
            Self::Transmit(frame) => f.debug_tuple("Transmit").field(frame).finish(),
            Self::Close { code, reason } => f
                .debug_struct("Close")
                .field("code", code)
                .field("reason", reason)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Normal or intentional closure; no reconnect.
    Stopped,
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// The attempt cap was reached.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionDiagnostics {
    pub url: String,
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub last_close_code: Option<u16>,
    pub last_close_reason: Option<String>,
    pub token_present: bool,
    pub queued_frames: usize,
    pub intentional_disconnect: bool,
}

/// `min(base * 2^attempts, max)`
#[must_use]
pub fn backoff_ms(config: &TransportConfig, attempts: u32) -> u64 {
    let factor = 1_u64.checked_shl(attempts).unwrap_or(u64::MAX);
    config
        .reconnect_base_ms
        .saturating_mul(factor)
        .min(config.reconnect_max_ms)
}

pub struct Connection {
    config: TransportConfig,
    credentials: Arc<dyn CredentialProvider>,
    state: ConnectionState,
    attempts: u32,
    queue: VecDeque<String>,
    last_close: Option<(u16, String)>,
    intentional: bool,
    token_present: bool,
    opened_before: bool,
    reconnect_timer: Option<TimerHandle>,
    effects: Vec<TransportEffect>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.config.url)
            .field("state", &self.state)
            .field("attempts", &self.attempts)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl Connection {
    #[must_use]
    pub fn new(config: TransportConfig, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            config,
            credentials,
            state: ConnectionState::Disconnected,
            attempts: 0,
            queue: VecDeque::new(),
            last_close: None,
            intentional: false,
            token_present: false,
            opened_before: false,
            reconnect_timer: None,
            effects: Vec::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    #[must_use]
    pub fn queued_frames(&self) -> usize {
        self.queue.len()
    }

    /// Starts a connection attempt. Clears the intentional-disconnect latch.
    /// Returns false when a connection is already open or opening.
    pub fn connect(&mut self, timers: &mut TimerQueue) -> bool {
        self.intentional = false;
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => false,
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                if let Some(handle) = self.reconnect_timer.take() {
                    timers.cancel(handle);
                }
                self.begin_open();
                true
            }
        }
    }

    /// Transmits when connected. Otherwise queues the frame, starts a connect
    /// when idle, and returns false.
    pub fn send(&mut self, frame: String, timers: &mut TimerQueue) -> bool {
        if self.is_connected() {
            self.effects.push(TransportEffect::Transmit(frame));
            return true;
        }
        self.queue.push_back(frame);
        debug!(queued = self.queue.len(), state = self.state.as_str(), "queued outbound frame");
        if self.state == ConnectionState::Disconnected {
            self.connect(timers);
        }
        false
    }

    /// Transmits only when connected; nothing is queued otherwise.
    pub fn try_send(&mut self, frame: String) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.effects.push(TransportEffect::Transmit(frame));
        true
    }

    /// Puts back a frame the link refused after it was counted as sent. It
    /// goes out with the rest of the queue on the next open.
    pub fn requeue(&mut self, frame: String) {
        self.queue.push_back(frame);
        debug!(queued = self.queue.len(), "undelivered frame requeued");
    }

    /// Socket opened. Resets the attempt counter and flushes the queue in
    /// FIFO order. Returns true when this open is a reconnection.
    pub fn on_open(&mut self, timers: &mut TimerQueue) -> bool {
        if let Some(handle) = self.reconnect_timer.take() {
            timers.cancel(handle);
        }
        self.state = ConnectionState::Connected;
        self.attempts = 0;
        let reconnected = self.opened_before;
        self.opened_before = true;
        info!(url = %self.config.url, flushed = self.queue.len(), "websocket connected");
        while let Some(frame) = self.queue.pop_front() {
            self.effects.push(TransportEffect::Transmit(frame));
        }
        reconnected
    }

    /// Socket closed or a connect attempt failed.
    pub fn on_close(
        &mut self,
        code: u16,
        reason: &str,
        now: DateTime<Utc>,
        timers: &mut TimerQueue,
    ) -> CloseOutcome {
        self.last_close = Some((code, reason.to_string()));
        self.state = ConnectionState::Disconnected;

        if self.intentional || code == NORMAL_CLOSURE {
            info!(code, reason, "websocket closed");
            return CloseOutcome::Stopped;
        }
        if self.attempts >= self.config.max_reconnect_attempts {
            error!(
                attempts = self.attempts,
                code, reason, "websocket reconnect attempts exhausted"
            );
            return CloseOutcome::Exhausted {
                attempts: self.attempts,
            };
        }

        let delay_ms = backoff_ms(&self.config, self.attempts);
        self.attempts += 1;
        self.state = ConnectionState::Reconnecting;
        let delay = Duration::milliseconds(i64::try_from(delay_ms).unwrap_or(i64::MAX));
        if let Some(handle) = self.reconnect_timer.take() {
            timers.cancel(handle);
        }
        self.reconnect_timer = Some(timers.schedule(TimerKey::Reconnect, now + delay));
        info!(
            code,
            reason,
            attempt = self.attempts,
            delay_ms,
            "websocket closed abnormally, reconnect scheduled"
        );
        CloseOutcome::Reconnecting {
            attempt: self.attempts,
            delay_ms,
        }
    }

    /// Reconnect timer fired. Stale handles are ignored.
    pub fn on_reconnect_timer(&mut self, handle: TimerHandle) -> bool {
        if self.reconnect_timer != Some(handle) {
            return false;
        }
        self.reconnect_timer = None;
        if self.state != ConnectionState::Reconnecting || self.intentional {
            return false;
        }
        self.begin_open();
        true
    }

    /// Intentional close. Automatic reconnection stops until the next
    /// explicit connect or send.
    pub fn disconnect(&mut self, reason: &str, timers: &mut TimerQueue) {
        self.intentional = true;
        if let Some(handle) = self.reconnect_timer.take() {
            timers.cancel(handle);
        }
        if matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            self.effects.push(TransportEffect::Close {
                code: NORMAL_CLOSURE,
                reason: reason.to_string(),
            });
        }
        self.last_close = Some((NORMAL_CLOSURE, reason.to_string()));
        self.state = ConnectionState::Disconnected;
        info!(reason, "websocket disconnected by caller");
    }

    #[must_use]
    pub fn diagnostics(&self) -> ConnectionDiagnostics {
        ConnectionDiagnostics {
            url: self.config.url.clone(),
            state: self.state,
            reconnect_attempts: self.attempts,
            last_close_code: self.last_close.as_ref().map(|(code, _)| *code),
            last_close_reason: self.last_close.as_ref().map(|(_, reason)| reason.clone()),
            token_present: self.token_present,
            queued_frames: self.queue.len(),
            intentional_disconnect: self.intentional,
        }
    }

    pub fn take_effects(&mut self) -> Vec<TransportEffect> {
        std::mem::take(&mut self.effects)
    }

    fn begin_open(&mut self) {
        let token = self.credentials.bearer_token();
        self.token_present = token.is_some();
        let protocols = token
            .map(|token| vec![format!("Bearer.{token}")])
            .unwrap_or_default();
        self.state = ConnectionState::Connecting;
        debug!(url = %self.config.url, token_present = self.token_present, "opening websocket");
        self.effects.push(TransportEffect::Open {
            url: self.config.url.clone(),
            protocols,
        });
    }
}
