//! Async driver: owns a [`Tracker`], executes its transport effects against
//! a [`Connector`] and fires its timers.
//!
//! Callers talk to the driver through a cloneable [`RunTrackerHandle`]; every
//! command is applied on the driver task, so tracker state is never shared.
//! Each socket link is tagged with a generation and events from superseded
//! links are dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{Notification, SubscriptionId, Topic};
use crate::error::{Result, TrackerError, TransportError};
use crate::registry::{ApplyOutcome, RunSummary};
use crate::run::Run;
use crate::tracker::{
    FallbackResponse, RunReport, SubmitReceipt, SubmitRequest, Tracker, TrackerDiagnostics,
};
use crate::transport::socket::{Connector, SocketCommand, SocketEvent, SocketLink};
use crate::transport::{
    ABNORMAL_CLOSURE, ConnectionState, NORMAL_CLOSURE, TransportEffect, USER_DISCONNECT_REASON,
};

enum Command {
    Connect {
        reply: oneshot::Sender<bool>,
    },
    Disconnect {
        reason: String,
        reply: oneshot::Sender<()>,
    },
    Submit {
        request: SubmitRequest,
        reply: oneshot::Sender<Result<SubmitReceipt>>,
    },
    RerunVerification {
        run_id: String,
        checks: Option<Vec<String>>,
        reply: oneshot::Sender<Result<String>>,
    },
    ForceRepair {
        run_id: String,
        reply: oneshot::Sender<Result<String>>,
    },
    RefreshModels {
        reply: oneshot::Sender<Result<bool>>,
    },
    FallbackResponse {
        temp_id: String,
        response: FallbackResponse,
        reply: oneshot::Sender<Result<ApplyOutcome>>,
    },
    FallbackFailure {
        temp_id: String,
        message: String,
        reply: oneshot::Sender<Result<ApplyOutcome>>,
    },
    Get {
        run_id: String,
        reply: oneshot::Sender<Option<Run>>,
    },
    ListForConversation {
        conversation_id: String,
        reply: oneshot::Sender<Vec<Run>>,
    },
    Summary {
        reply: oneshot::Sender<RunSummary>,
    },
    Diagnostics {
        reply: oneshot::Sender<TrackerDiagnostics>,
    },
    Report {
        run_id: String,
        reply: oneshot::Sender<Result<RunReport>>,
    },
    ConnectionState {
        reply: oneshot::Sender<ConnectionState>,
    },
    Subscribe {
        topic: Topic,
        sink: mpsc::UnboundedSender<Notification>,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: oneshot::Sender<bool>,
    },
    StopAllWatchdogs {
        reply: oneshot::Sender<usize>,
    },
    CleanupConversation {
        conversation_id: String,
        reply: oneshot::Sender<Vec<String>>,
    },
    Shutdown,
}

enum LinkEvent {
    Opened {
        generation: u64,
        outbound: mpsc::UnboundedSender<SocketCommand>,
    },
    Failed {
        generation: u64,
        error: TransportError,
    },
    Frame {
        generation: u64,
        text: String,
    },
    Closed {
        generation: u64,
        code: u16,
        reason: String,
    },
}

impl LinkEvent {
    fn generation(&self) -> u64 {
        match self {
            Self::Opened { generation, .. }
            | Self::Failed { generation, .. }
            | Self::Frame { generation, .. }
            | Self::Closed { generation, .. } => *generation,
        }
    }
}

/// Cloneable async front end to a running driver.
#[derive(Debug, Clone)]
pub struct RunTrackerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connect { .. } => "Connect",
            Self::Disconnect { .. } => "Disconnect",
            Self::Submit { .. } => "Submit",
            Self::RerunVerification { .. } => "RerunVerification",
            Self::ForceRepair { .. } => "ForceRepair",
            Self::RefreshModels { .. } => "RefreshModels",
            Self::FallbackResponse { .. } => "FallbackResponse",
            Self::FallbackFailure { .. } => "FallbackFailure",
            Self::Get { .. } => "Get",
            Self::ListForConversation { .. } => "ListForConversation",
            Self::Summary { .. } => "Summary",
            Self::Diagnostics { .. } => "Diagnostics",
            Self::Report { .. } => "Report",
            Self::ConnectionState { .. } => "ConnectionState",
            Self::Subscribe { .. } => "Subscribe",
            Self::Unsubscribe { .. } => "Unsubscribe",
            Self::StopAllWatchdogs { .. } => "StopAllWatchdogs",
            Self::CleanupConversation { .. } => "CleanupConversation",
            Self::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

/// Moves `tracker` onto a new task and returns a handle to it. The task ends
/// after [`RunTrackerHandle::shutdown`] or when every handle is dropped.
pub fn spawn(tracker: Tracker, connector: Arc<dyn Connector>) -> (RunTrackerHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (links_tx, links_rx) = mpsc::unbounded_channel();
    let driver = Driver {
        tracker,
        connector,
        commands: commands_rx,
        links_tx,
        links_rx,
        generation: 0,
        outbound: None,
    };
    let task = tokio::spawn(driver.run());
    (
        RunTrackerHandle {
            commands: commands_tx,
        },
        task,
    )
}

impl RunTrackerHandle {
    async fn request<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<T>) -> Command,
    {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| TrackerError::DriverStopped)?;
        response.await.map_err(|_| TrackerError::DriverStopped)
    }

    pub async fn connect(&self) -> Result<bool> {
        self.request(|reply| Command::Connect { reply }).await
    }

    pub async fn disconnect(&self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.request(|reply| Command::Disconnect { reason, reply })
            .await
    }

    pub async fn submit_message(&self, request: SubmitRequest) -> Result<SubmitReceipt> {
        self.request(|reply| Command::Submit { request, reply })
            .await?
    }

    pub async fn request_rerun_verification(
        &self,
        run_id: impl Into<String>,
        checks: Option<Vec<String>>,
    ) -> Result<String> {
        let run_id = run_id.into();
        self.request(|reply| Command::RerunVerification {
            run_id,
            checks,
            reply,
        })
        .await?
    }

    pub async fn request_force_repair(&self, run_id: impl Into<String>) -> Result<String> {
        let run_id = run_id.into();
        self.request(|reply| Command::ForceRepair { run_id, reply })
            .await?
    }

    pub async fn refresh_models(&self) -> Result<bool> {
        self.request(|reply| Command::RefreshModels { reply }).await?
    }

    pub async fn apply_fallback_response(
        &self,
        temp_id: impl Into<String>,
        response: FallbackResponse,
    ) -> Result<ApplyOutcome> {
        let temp_id = temp_id.into();
        self.request(|reply| Command::FallbackResponse {
            temp_id,
            response,
            reply,
        })
        .await?
    }

    pub async fn apply_fallback_failure(
        &self,
        temp_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<ApplyOutcome> {
        let temp_id = temp_id.into();
        let message = message.into();
        self.request(|reply| Command::FallbackFailure {
            temp_id,
            message,
            reply,
        })
        .await?
    }

    pub async fn get(&self, run_id: impl Into<String>) -> Result<Option<Run>> {
        let run_id = run_id.into();
        self.request(|reply| Command::Get { run_id, reply }).await
    }

    pub async fn list_for_conversation(&self, conversation_id: impl Into<String>) -> Result<Vec<Run>> {
        let conversation_id = conversation_id.into();
        self.request(|reply| Command::ListForConversation {
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn summary(&self) -> Result<RunSummary> {
        self.request(|reply| Command::Summary { reply }).await
    }

    pub async fn diagnostics(&self) -> Result<TrackerDiagnostics> {
        self.request(|reply| Command::Diagnostics { reply }).await
    }

    pub async fn run_report(&self, run_id: impl Into<String>) -> Result<RunReport> {
        let run_id = run_id.into();
        self.request(|reply| Command::Report { run_id, reply })
            .await?
    }

    pub async fn connection_state(&self) -> Result<ConnectionState> {
        self.request(|reply| Command::ConnectionState { reply })
            .await
    }

    /// Forwards every notification on `topic` into the returned channel.
    pub async fn subscribe_channel(
        &self,
        topic: Topic,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<Notification>)> {
        let (sink, notifications) = mpsc::unbounded_channel();
        let id = self
            .request(|reply| Command::Subscribe { topic, sink, reply })
            .await?;
        Ok((id, notifications))
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool> {
        self.request(|reply| Command::Unsubscribe { id, reply })
            .await
    }

    pub async fn stop_all_watchdogs(&self) -> Result<usize> {
        self.request(|reply| Command::StopAllWatchdogs { reply })
            .await
    }

    pub async fn cleanup_conversation(&self, conversation_id: impl Into<String>) -> Result<Vec<String>> {
        let conversation_id = conversation_id.into();
        self.request(|reply| Command::CleanupConversation {
            conversation_id,
            reply,
        })
        .await
    }

    /// Disconnects and stops the driver task. Returns false when it had
    /// already stopped.
    pub fn shutdown(&self) -> bool {
        self.commands.send(Command::Shutdown).is_ok()
    }
}

struct Driver {
    tracker: Tracker,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
    links_tx: mpsc::UnboundedSender<LinkEvent>,
    links_rx: mpsc::UnboundedReceiver<LinkEvent>,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<SocketCommand>>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            self.execute_effects();
            let sleep_for = self
                .tracker
                .next_deadline()
                .map(|deadline| (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO));

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        self.shutdown();
                        break;
                    }
                    Some(command) => self.handle_command(command),
                },
                Some(event) = self.links_rx.recv() => self.handle_link(event),
                () = sleep_or_park(sleep_for) => {
                    self.tracker.fire_due(Utc::now());
                }
            }
        }
        info!("run tracker driver stopped");
    }

    fn shutdown(&mut self) {
        self.tracker.disconnect(USER_DISCONNECT_REASON);
        let stopped = self.tracker.stop_all_watchdogs();
        self.execute_effects();
        debug!(stopped, "watchdogs stopped on shutdown");
    }

    fn execute_effects(&mut self) {
        for effect in self.tracker.take_effects() {
            match effect {
                TransportEffect::Open { url, protocols } => self.open_link(url, protocols),
                TransportEffect::Transmit(frame) => {
                    let undelivered = match &self.outbound {
                        Some(outbound) => match outbound.send(SocketCommand::Text(frame)) {
                            Ok(()) => None,
                            Err(mpsc::error::SendError(command)) => match command {
                                SocketCommand::Text(frame) => Some(frame),
                                SocketCommand::Close { .. } => None,
                            },
                        },
                        None => Some(frame),
                    };
                    if let Some(frame) = undelivered {
                        warn!("link gone before transmit, frame requeued");
                        self.tracker.requeue_undelivered(frame);
                    }
                }
                TransportEffect::Close { code, reason } => {
                    if let Some(outbound) = self.outbound.take() {
                        let _ = outbound.send(SocketCommand::Close { code, reason });
                    }
                    self.generation += 1;
                }
            }
        }
    }

    fn open_link(&mut self, url: String, protocols: Vec<String>) {
        self.generation += 1;
        self.outbound = None;
        let generation = self.generation;
        let connector = Arc::clone(&self.connector);
        let events = self.links_tx.clone();
        tokio::spawn(async move {
            let SocketLink {
                outbound,
                mut inbound,
            } = match connector.open(&url, &protocols).await {
                Ok(link) => link,
                Err(error) => {
                    let _ = events.send(LinkEvent::Failed { generation, error });
                    return;
                }
            };
            if events
                .send(LinkEvent::Opened {
                    generation,
                    outbound,
                })
                .is_err()
            {
                return;
            }
            while let Some(event) = inbound.recv().await {
                let (forwarded, closed) = match event {
                    SocketEvent::Frame(text) => (LinkEvent::Frame { generation, text }, false),
                    SocketEvent::Closed { code, reason } => (
                        LinkEvent::Closed {
                            generation,
                            code,
                            reason,
                        },
                        true,
                    ),
                };
                if events.send(forwarded).is_err() || closed {
                    return;
                }
            }
            let _ = events.send(LinkEvent::Closed {
                generation,
                code: ABNORMAL_CLOSURE,
                reason: "link dropped".to_string(),
            });
        });
    }

    fn handle_link(&mut self, event: LinkEvent) {
        if event.generation() != self.generation {
            if let LinkEvent::Opened { outbound, .. } = event {
                let _ = outbound.send(SocketCommand::Close {
                    code: NORMAL_CLOSURE,
                    reason: "superseded".to_string(),
                });
            }
            debug!("ignoring event from superseded link");
            return;
        }
        let now = Utc::now();
        match event {
            LinkEvent::Opened { outbound, .. } => {
                self.outbound = Some(outbound);
                self.tracker.on_open(now);
            }
            LinkEvent::Failed { error, .. } => {
                self.tracker.on_connect_failed(&error, now);
            }
            LinkEvent::Frame { text, .. } => {
                self.tracker.handle_frame(&text, now);
            }
            LinkEvent::Closed { code, reason, .. } => {
                self.outbound = None;
                self.tracker.on_close(code, &reason, now);
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        let now = Utc::now();
        match command {
            Command::Connect { reply } => {
                let _ = reply.send(self.tracker.connect());
            }
            Command::Disconnect { reason, reply } => {
                self.tracker.disconnect(&reason);
                let _ = reply.send(());
            }
            Command::Submit { request, reply } => {
                let _ = reply.send(self.tracker.submit_message(request, now));
            }
            Command::RerunVerification {
                run_id,
                checks,
                reply,
            } => {
                let _ = reply.send(self.tracker.request_rerun_verification(&run_id, checks, now));
            }
            Command::ForceRepair { run_id, reply } => {
                let _ = reply.send(self.tracker.request_force_repair(&run_id, now));
            }
            Command::RefreshModels { reply } => {
                let _ = reply.send(self.tracker.refresh_models());
            }
            Command::FallbackResponse {
                temp_id,
                response,
                reply,
            } => {
                let _ = reply.send(self.tracker.apply_fallback_response(&temp_id, response, now));
            }
            Command::FallbackFailure {
                temp_id,
                message,
                reply,
            } => {
                let _ = reply.send(self.tracker.apply_fallback_failure(&temp_id, &message, now));
            }
            Command::Get { run_id, reply } => {
                let _ = reply.send(self.tracker.get(&run_id).cloned());
            }
            Command::ListForConversation {
                conversation_id,
                reply,
            } => {
                let runs = self
                    .tracker
                    .list_for_conversation(&conversation_id)
                    .into_iter()
                    .cloned()
                    .collect();
                let _ = reply.send(runs);
            }
            Command::Summary { reply } => {
                let _ = reply.send(self.tracker.summary());
            }
            Command::Diagnostics { reply } => {
                let _ = reply.send(self.tracker.diagnostics());
            }
            Command::Report { run_id, reply } => {
                let _ = reply.send(self.tracker.run_report(&run_id));
            }
            Command::ConnectionState { reply } => {
                let _ = reply.send(self.tracker.connection_state());
            }
            Command::Subscribe { topic, sink, reply } => {
                let id = self.tracker.subscribe(
                    topic,
                    Box::new(move |notification: &Notification| {
                        let _ = sink.send(notification.clone());
                    }),
                );
                let _ = reply.send(id);
            }
            Command::Unsubscribe { id, reply } => {
                let _ = reply.send(self.tracker.unsubscribe(id));
            }
            Command::StopAllWatchdogs { reply } => {
                let _ = reply.send(self.tracker.stop_all_watchdogs());
            }
            Command::CleanupConversation {
                conversation_id,
                reply,
            } => {
                let _ = reply.send(self.tracker.cleanup_conversation(&conversation_id, now));
            }
            Command::Shutdown => {}
        }
    }
}

async fn sleep_or_park(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}
