use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use lmbridge_config::{ConfigPaths, ConfigStore};
use lmbridge_core::channels::{ChannelFrame, PendingRequest};
use lmbridge_core::monitoring::MonitoringService;
use lmbridge_core::respond::{self, ResponseBody};
use lmbridge_core::state::AppState;
use lmbridge_core::stream::spawn_processor;
use lmbridge_protocol::openai::request::ChatCompletionRequest;
use lmbridge_protocol::wire::RequestEnvelope;

fn test_state(tag: &str) -> Arc<AppState> {
    let dir = std::env::temp_dir().join(format!("lmbridge-core-{tag}-{}", std::process::id()));
    let _ = std::fs::create_dir_all(&dir);
    let config = Arc::new(ConfigStore::load(ConfigPaths::in_dir(&dir)));
    let monitoring = Arc::new(MonitoringService::new(dir.join("logs"), 1000, usize::MAX));
    AppState::new(config, monitoring, dir).unwrap()
}

fn chat_request(text: &str) -> ChatCompletionRequest {
    serde_json::from_value(serde_json::json!({
        "model": "m1",
        "messages": [{"role": "user", "content": text}],
        "stream": true
    }))
    .unwrap()
}

fn pending(request_id: &str, tab: &str) -> PendingRequest {
    PendingRequest {
        request_id: request_id.to_string(),
        openai_request: chat_request("hi"),
        model_name: "m1".to_string(),
        session_id: "sess-1".to_string(),
        mode_override: None,
        battle_target_override: None,
        model_kind: Default::default(),
        target_model_id: None,
        tab_id: Some(tab.to_string()),
        original_tab_id: Some(tab.to_string()),
        transfer_count: 0,
        transfer_allowed: true,
        created_at: time::OffsetDateTime::now_utc(),
    }
}

async fn collect_stream(body: ResponseBody) -> String {
    match body {
        ResponseBody::Bytes(bytes) => String::from_utf8_lossy(&bytes).to_string(),
        ResponseBody::Stream(mut rx) => {
            let mut out = String::new();
            while let Some(chunk) = rx.recv().await {
                out.push_str(&String::from_utf8_lossy(&chunk));
            }
            out
        }
    }
}

#[tokio::test]
async fn disconnect_transfers_request_to_surviving_tab() {
    let state = test_state("failover");

    let (t1_tx, _t1_rx) = mpsc::unbounded_channel();
    let (t2_tx, mut t2_rx) = mpsc::unbounded_channel();
    state.tabs.register("T1", t1_tx).await;
    state.tabs.register("T2", t2_tx).await;

    // Request R admitted and accounted to T1.
    let _frames = state.channels.admit(pending("R", "T1"));
    state.tabs.increment("T1").await;

    // T1 drops mid-stream.
    let summary = state.tabs.remove("T1").await;
    assert_eq!(summary.residual_in_flight, 1);
    state.reassign_pending("T1").await;

    let frame = t2_rx.recv().await.expect("transfer envelope");
    let envelope: RequestEnvelope = serde_json::from_str(&frame).unwrap();
    assert_eq!(envelope.request_id, "R");
    assert_eq!(envelope.is_transfer, Some(true));
    assert_eq!(envelope.transfer_count, Some(1));
    assert_eq!(envelope.original_tab_id.as_deref(), Some("T1"));
    assert_eq!(envelope.payload.session_id, "sess-1");

    // Accounting moved with the request.
    assert_eq!(state.tabs.in_flight("T1").await, 0);
    assert_eq!(state.tabs.in_flight("T2").await, 1);
    let meta = state.channels.metadata("R").unwrap();
    assert_eq!(meta.tab_id.as_deref(), Some("T2"));
    assert_eq!(meta.original_tab_id.as_deref(), Some("T1"));
}

#[tokio::test]
async fn exhausted_transfer_budget_terminates_the_request() {
    let state = test_state("exhausted");

    let (t2_tx, mut t2_rx) = mpsc::unbounded_channel();
    state.tabs.register("T2", t2_tx).await;

    let mut meta = pending("R", "T1");
    meta.transfer_count = 3; // default max_request_transfers
    let mut frames = state.channels.admit(meta);

    state.reassign_pending("T1").await;

    assert!(matches!(
        frames.recv().await,
        Some(ChannelFrame::Error(msg)) if msg.contains("transfer attempts")
    ));
    assert_eq!(frames.recv().await, Some(ChannelFrame::Done));
    assert!(t2_rx.try_recv().is_err());
    assert!(state.channels.metadata("R").is_none());
}

#[tokio::test]
async fn stream_pipeline_emits_content_finish_and_single_done() {
    let state = test_state("pipeline");
    let (t1_tx, _t1_rx) = mpsc::unbounded_channel();
    state.tabs.register("T1", t1_tx).await;
    state.tabs.increment("T1").await;

    let request = chat_request("hi");
    state.monitoring.request_start(
        "R",
        "m1",
        None,
        None,
        request.messages.clone(),
        serde_json::json!({}),
    );
    let frames = state.channels.admit(pending("R", "T1"));
    let events = spawn_processor(state.clone(), "R".to_string(), frames);
    let response =
        respond::stream_response(state.clone(), "R".to_string(), "m1".to_string(), events);
    assert_eq!(response.content_type, "text/event-stream");

    state
        .channels
        .route_frame("T1", "R", ChannelFrame::Chunk(r#"a0:"Hello ""#.to_string()));
    state
        .channels
        .route_frame("T1", "R", ChannelFrame::Chunk(r#"a0:"world"ad:{"finishReason":"stop"}"#.to_string()));
    state.channels.route_frame("T1", "R", ChannelFrame::Done);

    let body = collect_stream(response.body).await;
    assert!(body.contains("Hello "));
    assert!(body.contains("world"));
    assert!(body.contains("\"finish_reason\":\"stop\""));
    assert!(body.contains("\"prompt_tokens\""));
    assert_eq!(body.matches("data: [DONE]").count(), 1);
    assert!(body.trim_end().ends_with("data: [DONE]"));

    // Terminal path returned the tab slot.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(state.tabs.in_flight("T1").await, 0);
    let details = state.monitoring.request_details("R").unwrap();
    assert!(details.success);
    assert_eq!(details.response_content.as_deref(), Some("Hello world"));
}

#[tokio::test]
async fn think_tag_mode_prepends_reasoning_before_content() {
    let dir = std::env::temp_dir().join(format!("lmbridge-core-think-{}", std::process::id()));
    let _ = std::fs::create_dir_all(&dir);
    std::fs::write(
        dir.join("config.jsonc"),
        r#"{
            "enable_reasoning_output": true,
            "reasoning_output_mode": "think_tag"
        }"#,
    )
    .unwrap();
    let config = Arc::new(ConfigStore::load(ConfigPaths::in_dir(&dir)));
    let monitoring = Arc::new(MonitoringService::new(dir.join("logs"), 1000, usize::MAX));
    let state = AppState::new(config, monitoring, dir).unwrap();

    let (t1_tx, _t1_rx) = mpsc::unbounded_channel();
    state.tabs.register("T1", t1_tx).await;

    let frames = state.channels.admit(pending("R", "T1"));
    let events = spawn_processor(state.clone(), "R".to_string(), frames);
    let response =
        respond::stream_response(state.clone(), "R".to_string(), "m1".to_string(), events);

    state
        .channels
        .route_frame("T1", "R", ChannelFrame::Chunk(r#"ag:"step one; ""#.to_string()));
    state
        .channels
        .route_frame("T1", "R", ChannelFrame::Chunk(r#"ag:"step two""#.to_string()));
    state
        .channels
        .route_frame("T1", "R", ChannelFrame::Chunk(r#"a0:"answer""#.to_string()));
    state.channels.route_frame("T1", "R", ChannelFrame::Done);

    let body = collect_stream(response.body).await;
    let think_at = body.find("<think>step one; step two</think>").unwrap();
    let answer_at = body.find("answer").unwrap();
    assert!(think_at < answer_at);
    // Nothing after the first content token is ever re-labelled reasoning.
    assert!(!body.contains("reasoning_content"));
}

#[tokio::test]
async fn verification_challenge_closes_the_admission_gate() {
    let state = test_state("verify");
    let (t1_tx, mut t1_rx) = mpsc::unbounded_channel();
    state.tabs.register("T1", t1_tx).await;

    let frames = state.channels.admit(pending("R", "T1"));
    let events = spawn_processor(state.clone(), "R".to_string(), frames);
    let response =
        respond::stream_response(state.clone(), "R".to_string(), "m1".to_string(), events);

    state.channels.route_frame(
        "T1",
        "R",
        ChannelFrame::Chunk("<title>Just a moment...</title>".to_string()),
    );

    let body = collect_stream(response.body).await;
    assert!(body.contains("Human verification challenge detected"));
    assert_eq!(body.matches("data: [DONE]").count(), 1);

    // The tab was told to refresh and new admissions are rejected.
    let refresh = t1_rx.recv().await.unwrap();
    assert!(refresh.contains("\"refresh\""));
    let err = state
        .verification
        .gate(state.config.config().verification.display_skew_seconds)
        .unwrap_err();
    assert!(matches!(
        err,
        lmbridge_common::BridgeError::VerificationChallenge { .. }
    ));

    // A fresh tab connection reopens the gate.
    state.verification.clear();
    assert!(state.verification.gate(0).is_ok());
}

#[tokio::test]
async fn dropping_the_client_cancels_the_tab_fetch() {
    let state = test_state("cancel");
    let (t1_tx, mut t1_rx) = mpsc::unbounded_channel();
    state.tabs.register("T1", t1_tx).await;
    state.tabs.increment("T1").await;

    state.monitoring.request_start(
        "R",
        "m1",
        None,
        None,
        Vec::new(),
        serde_json::json!({}),
    );
    let frames = state.channels.admit(pending("R", "T1"));
    let events = spawn_processor(state.clone(), "R".to_string(), frames);
    let response =
        respond::stream_response(state.clone(), "R".to_string(), "m1".to_string(), events);

    state
        .channels
        .route_frame("T1", "R", ChannelFrame::Chunk(r#"a0:"partial""#.to_string()));

    // Read one chunk, then hang up.
    let ResponseBody::Stream(mut rx) = response.body else {
        panic!("expected a stream body");
    };
    let first = rx.recv().await.unwrap();
    assert!(String::from_utf8_lossy(&first).contains("partial"));
    drop(rx);

    // Next frame forces the formatter to notice the disconnect, which drops
    // the event receiver, which makes the processor send the cancel command.
    state
        .channels
        .route_frame("T1", "R", ChannelFrame::Chunk(r#"a0:"more""#.to_string()));

    let mut saw_cancel = false;
    for _ in 0..50 {
        match tokio::time::timeout(Duration::from_millis(100), t1_rx.recv()).await {
            Ok(Some(frame)) if frame.contains("cancel_request") => {
                saw_cancel = true;
                break;
            }
            Ok(Some(_)) => continue,
            _ => continue,
        }
    }
    assert!(saw_cancel, "cancel command never reached the tab");

    // Cancellation cleans up immediately, no grace period.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(state.channels.channel_count(), 0);
    assert_eq!(state.tabs.in_flight("T1").await, 0);
}
