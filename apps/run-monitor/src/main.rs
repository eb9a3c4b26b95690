use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use chrono::Utc;
use run_tracker::{
    ConnectionState, EventPayload, EventType, FallbackResponse, InMemoryMessages, MessageId,
    Notification, RunStatus, RunTrackerConfig, RunTrackerHandle, StaticCredential, SubmitRequest,
    Topic, Tracker, WsConnector, spawn,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Submits one chat message and follows the resulting workflow run.
#[derive(Parser, Debug)]
#[command(name = "run-monitor", version)]
struct Args {
    /// Message to submit.
    message: String,

    /// Websocket endpoint. Overrides RUN_TRACKER_WS_URL.
    #[arg(long)]
    url: Option<String>,

    /// Base URL of the HTTP API used when the socket is unavailable.
    #[arg(long, env = "RUN_MONITOR_API_BASE")]
    api_base: Option<String>,

    /// Bearer token offered during the handshake and on the fallback request.
    #[arg(long, env = "RUN_TRACKER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Continue an existing conversation.
    #[arg(long)]
    conversation: Option<String>,

    #[arg(long)]
    model: Option<String>,

    /// Seconds to wait for the socket to open before falling back.
    #[arg(long, default_value_t = 5)]
    connect_timeout: u64,

    /// Seconds to wait for the run to finish.
    #[arg(long, default_value_t = 900)]
    timeout: u64,

    /// Print the final report as JSON instead of the response text.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct FallbackRequest<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = RunTrackerConfig::from_env().context("load run tracker config")?;
    if let Some(url) = &args.url {
        config.transport.url.clone_from(url);
    }
    if args.model.is_some() {
        config.default_model.clone_from(&args.model);
    }

    let messages = InMemoryMessages::new();
    let tracker = Tracker::new(
        config,
        Arc::new(StaticCredential::new(args.token.clone())),
        Arc::new(messages.clone()),
        Utc::now(),
    );
    let connector = WsConnector::with_timeout(Duration::from_secs(args.connect_timeout.max(1)));
    let (handle, task) = spawn(tracker, Arc::new(connector));

    let outcome = monitor(&args, &handle, &messages).await;
    handle.shutdown();
    if let Err(error) = task.await {
        warn!(%error, "driver task ended abnormally");
    }
    outcome
}

async fn monitor(args: &Args, handle: &RunTrackerHandle, messages: &InMemoryMessages) -> Result<()> {
    let (_, mut finished) = handle.subscribe_channel(Topic::RunFinished).await?;
    let (_, mut phases) = handle
        .subscribe_channel(Topic::Event(EventType::Phase))
        .await?;

    let (user, assistant) = messages
        .push_exchange(&args.message, args.conversation.as_deref())
        .ok_or_else(|| anyhow!("message store unavailable"))?;

    handle.connect().await?;
    let connected = wait_until_connected(handle, Duration::from_secs(args.connect_timeout)).await?;

    // Not queued offline: an unsent message goes through the HTTP fallback.
    let receipt = handle
        .submit_message(SubmitRequest {
            message: args.message.clone(),
            conversation_id: args.conversation.clone(),
            model: args.model.clone(),
            user_message_id: Some(user),
            assistant_message_id: assistant.clone(),
            queue_if_offline: false,
        })
        .await?;
    if connected && !receipt.needs_fallback() {
        info!(temp_id = %receipt.temp_id, "message submitted over websocket");
        let run_id = follow_run(&mut finished, &mut phases, Duration::from_secs(args.timeout)).await?;
        return print_report(handle, &run_id, args.json).await;
    }
    let temp_id = receipt.temp_id;

    warn!("websocket unavailable, using HTTP fallback");
    handle.disconnect("fallback").await?;
    run_fallback(args, handle, &temp_id).await?;

    match messages.get(&assistant) {
        Some(message) if message.run_id.is_some() && !message.is_error => {
            let run_id = message.run_id.unwrap_or_default();
            print_report(handle, &run_id, args.json).await
        }
        Some(message) => print_message(&assistant, &message, args.json),
        None => bail!("assistant message {assistant} disappeared"),
    }
}

async fn wait_until_connected(handle: &RunTrackerHandle, limit: Duration) -> Result<bool> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        match handle.connection_state().await? {
            ConnectionState::Connected => return Ok(true),
            ConnectionState::Disconnected => return Ok(false),
            ConnectionState::Connecting | ConnectionState::Reconnecting => {}
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn follow_run(
    finished: &mut mpsc::UnboundedReceiver<Notification>,
    phases: &mut mpsc::UnboundedReceiver<Notification>,
    limit: Duration,
) -> Result<String> {
    let deadline = tokio::time::sleep(limit);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            notification = finished.recv() => {
                let Some(Notification::RunFinished { run_id, status, error }) = notification else {
                    bail!("tracker stopped before the run finished");
                };
                match status {
                    RunStatus::Failed => warn!(%run_id, error = error.as_deref().unwrap_or(""), "run failed"),
                    _ => info!(%run_id, status = status.as_str(), "run finished"),
                }
                return Ok(run_id);
            }
            Some(Notification::Event { event }) = phases.recv() => {
                if let EventPayload::Phase(phase) = &event.payload {
                    info!(
                        run_id = event.run_id.as_deref().unwrap_or("?"),
                        phase = %phase.phase,
                        status = %phase.status,
                        "phase"
                    );
                }
            }
            () = &mut deadline => bail!("run did not finish within {}s", limit.as_secs()),
        }
    }
}

async fn run_fallback(args: &Args, handle: &RunTrackerHandle, temp_id: &str) -> Result<()> {
    let Some(api_base) = args.api_base.as_deref() else {
        handle
            .apply_fallback_failure(temp_id, "websocket unavailable and no API base configured")
            .await?;
        return Ok(());
    };

    let url = format!("{}/chat", api_base.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.timeout))
        .build()
        .context("build http client")?;
    let mut request = client.post(&url).json(&FallbackRequest {
        message: &args.message,
        conversation_id: args.conversation.as_deref(),
        model: args.model.as_deref(),
    });
    if let Some(token) = &args.token {
        request = request.bearer_auth(token);
    }

    let result = async {
        let response = request.send().await?.error_for_status()?;
        response.json::<FallbackResponse>().await
    }
    .await;
    let outcome = match result {
        Ok(body) => handle.apply_fallback_response(temp_id, body).await?,
        Err(error) => {
            warn!(%url, %error, "fallback request failed");
            handle
                .apply_fallback_failure(temp_id, error.to_string())
                .await?
        }
    };
    info!(?outcome, "fallback applied");
    Ok(())
}

async fn print_report(handle: &RunTrackerHandle, run_id: &str, json: bool) -> Result<()> {
    let report = handle.run_report(run_id).await?;
    let mut out = std::io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut out, &report)?;
        writeln!(out)?;
    } else if let Some(error) = &report.error {
        writeln!(out, "run {run_id} failed: {}", error.message)?;
    } else {
        writeln!(out, "{}", report.response.as_deref().unwrap_or_default())?;
    }
    if report.status == RunStatus::Failed {
        bail!("run {run_id} failed");
    }
    Ok(())
}

fn print_message(id: &MessageId, message: &run_tracker::ChatMessage, json: bool) -> Result<()> {
    let mut out = std::io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut out, message)?;
        writeln!(out)?;
    } else {
        writeln!(out, "{}", message.content)?;
    }
    if message.is_error {
        bail!("message {id} failed");
    }
    Ok(())
}
