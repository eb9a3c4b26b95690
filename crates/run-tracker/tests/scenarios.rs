#![allow(clippy::expect_used)]

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use run_tracker::transport::TransportEffect;
use run_tracker::{
    ApplyOutcome, ConnectionState, EventType, FrameOutcome, InMemoryMessages, MessageId,
    Notification, PhaseTimeouts, RetentionConfig, RunStatus, RunTrackerConfig, StaticCredential,
    SubmitRequest, Topic, Tracker, TransportConfig, WatchdogConfig, WorkflowPhase,
};
use serde_json::{Value, json};

fn at_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0)
        .single()
        .expect("valid timestamp")
        + Duration::milliseconds(ms)
}

fn tracker_with(config: RunTrackerConfig) -> (Tracker, InMemoryMessages) {
    let messages = InMemoryMessages::new();
    let tracker = Tracker::new(
        config,
        Arc::new(StaticCredential::none()),
        Arc::new(messages.clone()),
        at_ms(0),
    );
    (tracker, messages)
}

fn tracker() -> (Tracker, InMemoryMessages) {
    tracker_with(RunTrackerConfig::default())
}

fn frame(value: &Value) -> String {
    value.to_string()
}

fn submit(
    tracker: &mut Tracker,
    messages: &InMemoryMessages,
    text: &str,
    now: DateTime<Utc>,
) -> (String, MessageId) {
    let (user, assistant) = messages.push_exchange(text, None).expect("exchange");
    let receipt = tracker
        .submit_message(
            SubmitRequest {
                message: text.to_string(),
                conversation_id: None,
                model: None,
                user_message_id: Some(user),
                assistant_message_id: assistant.clone(),
                queue_if_offline: true,
            },
            now,
        )
        .expect("submit");
    (receipt.temp_id, assistant)
}

fn connect(tracker: &mut Tracker, now: DateTime<Utc>) {
    tracker.connect();
    tracker.on_open(now);
    tracker.take_effects();
}

#[test]
fn second_terminal_event_changes_nothing() {
    let (mut tracker, messages) = tracker();
    connect(&mut tracker, at_ms(0));
    let (_, assistant) = submit(&mut tracker, &messages, "write a parser", at_ms(0));

    tracker.handle_frame(
        &frame(&json!({"type": "complete", "run_id": "r1", "conversation_id": "c1", "data": {"response": "parser written"}})),
        at_ms(1_000),
    );
    let before = tracker.get("r1").expect("run").clone();

    for late in [
        json!({"type": "complete", "run_id": "r1", "data": {"response": "something else"}}),
        json!({"type": "error", "run_id": "r1", "data": {"message": "boom", "code": "E1"}}),
    ] {
        tracker.handle_frame(&frame(&late), at_ms(5_000));
    }

    let after = tracker.get("r1").expect("run");
    assert_eq!(after.status, before.status);
    assert_eq!(after.ended_at, before.ended_at);
    assert_eq!(after.terminal_event, before.terminal_event);
    assert!(after.error.is_none());
    assert_eq!(
        messages.get(&assistant).expect("message").content,
        "parser written"
    );
}

#[test]
fn queued_submissions_flush_in_order() {
    let (mut tracker, messages) = tracker();
    for text in ["A", "B", "C"] {
        submit(&mut tracker, &messages, text, at_ms(0));
    }
    let opening = tracker.take_effects();
    assert_eq!(opening.len(), 1, "one connect attempt for the queue");
    assert!(matches!(opening[0], TransportEffect::Open { .. }));
    assert_eq!(tracker.diagnostics().connection.queued_frames, 3);

    tracker.on_open(at_ms(10));
    let sent: Vec<String> = tracker
        .take_effects()
        .into_iter()
        .filter_map(|effect| match effect {
            TransportEffect::Transmit(frame) => serde_json::from_str::<Value>(&frame)
                .ok()
                .and_then(|value| value["message"].as_str().map(ToString::to_string)),
            _ => None,
        })
        .collect();
    assert_eq!(sent, vec!["A", "B", "C"]);
}

#[test]
fn placeholder_keeps_history_when_conversation_arrives_late() {
    let (mut tracker, _) = tracker();
    let events = [
        json!({"type": "phase", "run_id": "r7", "data": {"phase": "spec", "status": "started"}}),
        json!({"type": "thinking", "run_id": "r7", "data": {"message": "reading the request"}}),
        json!({"type": "tool", "run_id": "r7", "data": {"tool": "read_file", "status": "completed"}}),
    ];
    for event in &events {
        tracker.handle_frame(&frame(event), at_ms(100));
    }
    let run = tracker.get("r7").expect("placeholder");
    assert_eq!(run.status, RunStatus::Pending);
    assert!(run.conversation_id.is_none());

    let outcome = tracker.handle_frame(
        &frame(&json!({"type": "conversation_created", "run_id": "r7", "data": {"conversation_id": "c42"}})),
        at_ms(200),
    );
    assert!(matches!(
        outcome,
        FrameOutcome::Applied(ApplyOutcome::Applied { .. })
    ));

    let run = tracker.get("r7").expect("run");
    assert_eq!(run.conversation_id.as_deref(), Some("c42"));
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.phase_history.len(), 1);
    assert_eq!(run.phase_history[0].phase, "spec");
    assert_eq!(run.thinking.len(), 1);
    assert_eq!(run.thinking[0].content, "reading the request");
    assert_eq!(run.tools.len(), 1);
    assert_eq!(run.tools[0].tool, "read_file");
    assert_eq!(tracker.list_for_conversation("c42").len(), 1);
}

#[test]
fn silent_verify_phase_times_out() {
    let (mut tracker, messages) = tracker();
    connect(&mut tracker, at_ms(0));
    let (_, assistant) = submit(&mut tracker, &messages, "ship it", at_ms(0));
    tracker.handle_frame(
        &frame(&json!({"type": "phase", "run_id": "r1", "conversation_id": "c1", "data": {"phase": "verify", "status": "started"}})),
        at_ms(0),
    );
    assert_eq!(
        tracker.get("r1").expect("run").workflow_phase,
        WorkflowPhase::Verify
    );

    tracker.fire_due(at_ms(60_000));
    assert_eq!(tracker.get("r1").expect("run").status, RunStatus::Running);

    tracker.fire_due(at_ms(120_001));
    let run = tracker.get("r1").expect("run");
    assert_eq!(run.status, RunStatus::Failed);
    let error = run.error.as_ref().expect("timeout error");
    assert!(error.message.contains("Timeout"), "{}", error.message);
    assert_eq!(error.code, "WATCHDOG_TIMEOUT");
    assert!(run.watchdog.timer_handle.is_none());

    let message = messages.get(&assistant).expect("message");
    assert!(message.is_error);
    assert!(message.content.starts_with("Error: Timeout"));
}

#[test]
fn token_fragments_coalesce_into_one_flush() {
    let (mut tracker, messages) = tracker();
    connect(&mut tracker, at_ms(0));
    let (_, assistant) = submit(&mut tracker, &messages, "greet", at_ms(0));

    let flushes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&flushes);
    tracker.subscribe(
        Topic::Event(EventType::Thinking),
        Box::new(move |notification: &Notification| {
            if let Notification::TokensFlushed { content, .. } = notification {
                sink.lock().expect("lock").push(content.clone());
            }
        }),
    );

    for (offset, fragment) in [(0, "Hel"), (4, "lo "), (8, "world")] {
        tracker.handle_frame(
            &frame(&json!({"type": "token", "run_id": "r1", "conversation_id": "c1", "data": {"content": fragment}})),
            at_ms(1_000 + offset),
        );
    }
    assert!(flushes.lock().expect("lock").is_empty());

    let mut now = at_ms(1_008);
    while let Some(deadline) = tracker.next_deadline() {
        if deadline > at_ms(2_000) {
            break;
        }
        now = deadline;
        tracker.fire_due(now);
        if !flushes.lock().expect("lock").is_empty() {
            break;
        }
    }

    assert_eq!(*flushes.lock().expect("lock"), vec!["Hello world".to_string()]);
    assert!(now >= at_ms(1_058), "flushed {now} before the debounce window");
    assert_eq!(tracker.get("r1").expect("run").tokens, "Hello world");
    assert_eq!(messages.get(&assistant).expect("message").content, "Hello world");
}

fn record_flushes_and_finishes(tracker: &mut Tracker) -> Arc<Mutex<Vec<String>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let flushes = Arc::clone(&log);
    tracker.subscribe(
        Topic::Event(EventType::Thinking),
        Box::new(move |notification: &Notification| {
            if let Notification::TokensFlushed { content, .. } = notification {
                flushes.lock().expect("lock").push(format!("flush:{content}"));
            }
        }),
    );
    let finishes = Arc::clone(&log);
    tracker.subscribe(
        Topic::RunFinished,
        Box::new(move |notification: &Notification| {
            if let Notification::RunFinished { run_id, .. } = notification {
                finishes.lock().expect("lock").push(format!("finished:{run_id}"));
            }
        }),
    );
    log
}

#[test]
fn terminal_event_flushes_buffered_tokens_first() {
    let (mut tracker, messages) = tracker();
    connect(&mut tracker, at_ms(0));
    let (_, assistant) = submit(&mut tracker, &messages, "stream it", at_ms(0));
    let log = record_flushes_and_finishes(&mut tracker);

    for (offset, fragment) in [(0, "partial "), (5, "answer")] {
        tracker.handle_frame(
            &frame(&json!({"type": "token", "run_id": "r1", "conversation_id": "c1", "data": {"content": fragment}})),
            at_ms(1_000 + offset),
        );
    }
    // Arrives inside the debounce window, before any flush timer fired.
    tracker.handle_frame(
        &frame(&json!({"type": "complete", "run_id": "r1", "conversation_id": "c1", "data": {}})),
        at_ms(1_020),
    );

    assert_eq!(
        *log.lock().expect("lock"),
        vec!["flush:partial answer".to_string(), "finished:r1".to_string()]
    );
    let run = tracker.get("r1").expect("run");
    assert_eq!(run.status, RunStatus::Complete);
    assert_eq!(run.tokens, "partial answer");
    let message = messages.get(&assistant).expect("message");
    assert_eq!(message.content, "partial answer");
    assert!(!message.streaming);

    tracker.fire_due(at_ms(2_000));
    assert_eq!(log.lock().expect("lock").len(), 2, "no late flush for a finished run");
    assert_eq!(messages.get(&assistant).expect("message").content, "partial answer");
}

#[test]
fn explicit_response_wins_over_flushed_tokens() {
    let (mut tracker, messages) = tracker();
    connect(&mut tracker, at_ms(0));
    let (_, assistant) = submit(&mut tracker, &messages, "stream it", at_ms(0));
    let log = record_flushes_and_finishes(&mut tracker);

    tracker.handle_frame(
        &frame(&json!({"type": "token", "run_id": "r1", "conversation_id": "c1", "data": {"content": "draft"}})),
        at_ms(1_000),
    );
    tracker.handle_frame(
        &frame(&json!({"type": "complete", "run_id": "r1", "data": {"response": "final answer"}})),
        at_ms(1_010),
    );

    assert_eq!(
        *log.lock().expect("lock"),
        vec!["flush:draft".to_string(), "finished:r1".to_string()]
    );
    let run = tracker.get("r1").expect("run");
    assert_eq!(run.tokens, "draft");
    assert_eq!(run.outcome.response.as_deref(), Some("final answer"));
    assert_eq!(messages.get(&assistant).expect("message").content, "final answer");

    tracker.fire_due(at_ms(2_000));
    assert_eq!(log.lock().expect("lock").len(), 2);
}

#[test]
fn registry_never_exceeds_its_cap() {
    let (mut tracker, _) = tracker_with(RunTrackerConfig {
        retention: RetentionConfig {
            max_runs: 4,
            ..RetentionConfig::default()
        },
        ..RunTrackerConfig::default()
    });

    for index in 0..10_i64 {
        let run_id = format!("run-{index}");
        tracker.handle_frame(
            &frame(&json!({"type": "phase", "run_id": run_id, "data": {"phase": "plan", "status": "started"}})),
            at_ms(index * 1_000),
        );
        if index % 2 == 0 {
            tracker.handle_frame(
                &frame(&json!({"type": "complete", "run_id": run_id, "data": {"response": "ok"}})),
                at_ms(index * 1_000 + 500),
            );
        }
        assert!(tracker.summary().total <= 4, "cap exceeded at {index}");
    }

    // Odd runs stayed in flight, so the finished ones went first.
    for in_flight in ["run-5", "run-7", "run-9"] {
        assert!(tracker.get(in_flight).is_some(), "{in_flight} evicted");
    }
    assert!(tracker.get("run-0").is_none());
}

#[test]
fn reconnect_fails_only_runs_silent_past_the_threshold() {
    // Long phase limits keep the watchdog out of the way.
    let (mut tracker, _) = tracker_with(RunTrackerConfig {
        watchdog: WatchdogConfig {
            timeouts: PhaseTimeouts {
                execute: 600_000,
                ..PhaseTimeouts::default()
            },
            ..WatchdogConfig::default()
        },
        ..RunTrackerConfig::default()
    });
    connect(&mut tracker, at_ms(0));

    tracker.handle_frame(
        &frame(&json!({"type": "phase", "run_id": "quiet", "conversation_id": "c1", "data": {"phase": "execute", "status": "started"}})),
        at_ms(0),
    );
    tracker.handle_frame(
        &frame(&json!({"type": "phase", "run_id": "chatty", "conversation_id": "c2", "data": {"phase": "execute", "status": "started"}})),
        at_ms(150_000),
    );

    tracker.on_close(1006, "network", at_ms(170_000));
    tracker.fire_due(at_ms(171_000));
    assert!(tracker.on_open(at_ms(180_000)), "second open is a reconnection");

    let quiet = tracker.get("quiet").expect("quiet run");
    assert_eq!(quiet.status, RunStatus::Failed);
    assert!(
        quiet
            .error
            .as_ref()
            .expect("connection error")
            .message
            .contains("Connection lost")
    );
    assert_eq!(tracker.get("chatty").expect("chatty run").status, RunStatus::Running);
}

#[test]
fn exhausted_reconnects_are_reported() {
    let (mut tracker, _) = tracker_with(RunTrackerConfig {
        transport: TransportConfig {
            max_reconnect_attempts: 1,
            ..TransportConfig::default()
        },
        ..RunTrackerConfig::default()
    });
    let exhausted = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&exhausted);
    tracker.subscribe(
        Topic::ReconnectExhausted,
        Box::new(move |notification: &Notification| {
            if let Notification::ReconnectExhausted { attempts } = notification {
                *sink.lock().expect("lock") = Some(*attempts);
            }
        }),
    );

    tracker.connect();
    tracker.on_close(1006, "refused", at_ms(0));
    tracker.fire_due(at_ms(1_000));
    tracker.on_close(1006, "refused", at_ms(1_100));

    assert_eq!(*exhausted.lock().expect("lock"), Some(1));
    assert_eq!(
        tracker.connection_state(),
        ConnectionState::Disconnected
    );
}
