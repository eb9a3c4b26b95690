#![allow(clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use chrono::Utc;
use run_tracker::{
    Connector, ConnectionState, InMemoryMessages, Notification, RunStatus, RunTrackerConfig,
    SocketCommand, SocketEvent, SocketLink, StaticCredential, SubmitRequest, Topic, Tracker,
    TrackerError, TransportConfig, TransportError, spawn,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// The far end of one fake socket, held by the test.
struct ServerEnd {
    protocols: Vec<String>,
    commands: mpsc::UnboundedReceiver<SocketCommand>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl ServerEnd {
    fn push(&self, frame: &Value) -> anyhow::Result<()> {
        self.events
            .send(SocketEvent::Frame(frame.to_string()))
            .context("driver dropped the link")
    }

    async fn next_command(&mut self) -> anyhow::Result<SocketCommand> {
        timeout(WAIT, self.commands.recv())
            .await
            .context("timed out waiting for a command")?
            .context("link closed by driver")
    }
}

struct FakeConnector {
    opened: mpsc::UnboundedSender<ServerEnd>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, _url: &str, protocols: &[String]) -> Result<SocketLink, TransportError> {
        let (outbound, commands) = mpsc::unbounded_channel();
        let (events, inbound) = mpsc::unbounded_channel();
        self.opened
            .send(ServerEnd {
                protocols: protocols.to_vec(),
                commands,
                events,
            })
            .map_err(|_| TransportError::Handshake("test server gone".to_string()))?;
        Ok(SocketLink { outbound, inbound })
    }
}

fn start(
    config: RunTrackerConfig,
) -> (
    run_tracker::RunTrackerHandle,
    tokio::task::JoinHandle<()>,
    InMemoryMessages,
    mpsc::UnboundedReceiver<ServerEnd>,
) {
    let (opened, servers) = mpsc::unbounded_channel();
    let messages = InMemoryMessages::new();
    let tracker = Tracker::new(
        config,
        Arc::new(StaticCredential::new(Some("secret-token".to_string()))),
        Arc::new(messages.clone()),
        Utc::now(),
    );
    let (handle, task) = spawn(tracker, Arc::new(FakeConnector { opened }));
    (handle, task, messages, servers)
}

async fn next_server(servers: &mut mpsc::UnboundedReceiver<ServerEnd>) -> anyhow::Result<ServerEnd> {
    timeout(WAIT, servers.recv())
        .await
        .context("timed out waiting for a connect")?
        .context("connector dropped")
}

async fn wait_for_state(
    handle: &run_tracker::RunTrackerHandle,
    expected: ConnectionState,
) -> anyhow::Result<()> {
    for _ in 0..100 {
        if handle.connection_state().await? == expected {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("connection never reached {expected:?}")
}

#[tokio::test]
async fn streams_a_submitted_run_to_completion() -> anyhow::Result<()> {
    let (handle, task, messages, mut servers) = start(RunTrackerConfig::default());
    let (_, mut finished) = handle.subscribe_channel(Topic::RunFinished).await?;

    assert!(handle.connect().await?);
    let mut server = next_server(&mut servers).await?;
    assert!(server.protocols.iter().any(|protocol| protocol.contains("secret-token")));
    wait_for_state(&handle, ConnectionState::Connected).await?;

    let (user, assistant) = messages
        .push_exchange("build a todo app", None)
        .context("exchange")?;
    let receipt = handle
        .submit_message(SubmitRequest {
            message: "build a todo app".to_string(),
            conversation_id: None,
            model: None,
            user_message_id: Some(user),
            assistant_message_id: assistant.clone(),
            queue_if_offline: true,
        })
        .await?;
    assert!(receipt.accepted);

    let SocketCommand::Text(sent) = server.next_command().await? else {
        bail!("expected a submit frame");
    };
    let sent: Value = serde_json::from_str(&sent)?;
    assert_eq!(sent["message"], "build a todo app");

    server.push(&json!({"type": "conversation_created", "data": {"conversation_id": "c1"}}))?;
    server.push(&json!({"type": "phase", "run_id": "r1", "conversation_id": "c1", "data": {"phase": "execute", "status": "started"}}))?;
    server.push(&json!({"type": "token", "run_id": "r1", "data": {"content": "Working"}}))?;
    server.push(&json!({"type": "complete", "run_id": "r1", "conversation_id": "c1", "data": {"response": "Todo app ready", "iterations": 2}}))?;

    let notification = timeout(WAIT, finished.recv())
        .await
        .context("timed out waiting for the run")?
        .context("subscription closed")?;
    let Notification::RunFinished { run_id, status, .. } = notification else {
        bail!("unexpected notification {notification:?}");
    };
    assert_eq!(run_id, "r1");
    assert_eq!(status, RunStatus::Complete);

    let run = handle.get("r1").await?.context("run tracked")?;
    assert_eq!(run.conversation_id.as_deref(), Some("c1"));
    assert_eq!(run.outcome.iterations, Some(2));
    let message = messages.get(&assistant).context("assistant message")?;
    assert_eq!(message.content, "Todo app ready");
    assert!(!message.streaming);

    assert!(handle.shutdown());
    timeout(WAIT, task).await??;
    assert!(matches!(
        server.next_command().await?,
        SocketCommand::Close { code: 1000, .. }
    ));
    Ok(())
}

#[tokio::test]
async fn reconnects_after_abnormal_close() -> anyhow::Result<()> {
    let (handle, task, _, mut servers) = start(RunTrackerConfig {
        transport: TransportConfig {
            reconnect_base_ms: 10,
            reconnect_max_ms: 50,
            ..TransportConfig::default()
        },
        ..RunTrackerConfig::default()
    });

    handle.connect().await?;
    let first = next_server(&mut servers).await?;
    wait_for_state(&handle, ConnectionState::Connected).await?;

    first.events.send(SocketEvent::Closed {
        code: 1006,
        reason: "network".to_string(),
    })?;
    let _second = next_server(&mut servers).await?;
    wait_for_state(&handle, ConnectionState::Connected).await?;

    let diagnostics = handle.diagnostics().await?;
    assert_eq!(diagnostics.connection.reconnect_attempts, 0);
    assert_eq!(diagnostics.connection.last_close_code, Some(1006));

    handle.shutdown();
    timeout(WAIT, task).await??;
    Ok(())
}

#[tokio::test]
async fn frame_refused_by_a_dead_link_is_resent_after_reconnect() -> anyhow::Result<()> {
    let (handle, task, messages, mut servers) = start(RunTrackerConfig {
        transport: TransportConfig {
            reconnect_base_ms: 10,
            reconnect_max_ms: 50,
            ..TransportConfig::default()
        },
        ..RunTrackerConfig::default()
    });

    handle.connect().await?;
    let ServerEnd {
        commands, events, ..
    } = next_server(&mut servers).await?;
    wait_for_state(&handle, ConnectionState::Connected).await?;

    // The socket is gone but its close has not been delivered yet.
    drop(commands);
    let (user, assistant) = messages.push_exchange("retry me", None).context("exchange")?;
    handle
        .submit_message(SubmitRequest {
            message: "retry me".to_string(),
            conversation_id: None,
            model: None,
            user_message_id: Some(user),
            assistant_message_id: assistant,
            queue_if_offline: true,
        })
        .await?;
    let diagnostics = handle.diagnostics().await?;
    assert_eq!(diagnostics.connection.queued_frames, 1);

    events.send(SocketEvent::Closed {
        code: 1006,
        reason: "network".to_string(),
    })?;
    let mut second = next_server(&mut servers).await?;
    let SocketCommand::Text(sent) = second.next_command().await? else {
        bail!("expected the requeued submit frame");
    };
    let sent: Value = serde_json::from_str(&sent)?;
    assert_eq!(sent["message"], "retry me");

    handle.shutdown();
    timeout(WAIT, task).await??;
    Ok(())
}

#[tokio::test]
async fn commands_fail_once_the_driver_stops() -> anyhow::Result<()> {
    let (handle, task, _, _servers) = start(RunTrackerConfig::default());
    assert!(handle.shutdown());
    timeout(WAIT, task).await??;

    assert!(matches!(
        handle.summary().await,
        Err(TrackerError::DriverStopped)
    ));
    assert!(!handle.shutdown());
    Ok(())
}
