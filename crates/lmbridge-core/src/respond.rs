use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{info, warn};

use lmbridge_config::ReasoningMode;
use lmbridge_protocol::openai::response::ChatCompletionResponse;
use lmbridge_protocol::openai::stream::ChatCompletionChunk;
use lmbridge_protocol::openai::types::Usage;
use lmbridge_protocol::sse;

use crate::monitoring::RequestOutcome;
use crate::state::AppState;
use crate::stream::{ProcessorEvent, UsageTally};
use crate::tokens;

pub const ATTACHMENT_TOO_LARGE_MARKER: &str = "attachment exceeds the upstream size limit";
const CONTENT_FILTER_NOTE: &str =
    "\n\nThe response was cut short, most likely by upstream moderation or a context limit.";

/// Transport-agnostic response handed to the HTTP layer, mirroring the shape
/// the router converts uniformly.
#[derive(Debug)]
pub struct BridgeResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: ResponseBody,
}

#[derive(Debug)]
pub enum ResponseBody {
    Bytes(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

impl BridgeResponse {
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: ResponseBody::Bytes(Bytes::from(value.to_string())),
        }
    }

    pub fn sse(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            status: 200,
            content_type: "text/event-stream",
            body: ResponseBody::Stream(rx),
        }
    }
}

fn error_body(message: &str, kind: &str) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "message": format!("[LMArena Bridge Error]: {message}"),
            "type": "bridge_error",
            "code": kind,
        }
    })
}

struct Aggregation {
    content: Vec<String>,
    reasoning: Vec<String>,
    finish_reason: String,
    upstream_usage: Option<UsageTally>,
}

impl Aggregation {
    fn new() -> Self {
        Self {
            content: Vec::new(),
            reasoning: Vec::new(),
            finish_reason: "stop".to_string(),
            upstream_usage: None,
        }
    }

    fn full_content(&self) -> String {
        self.content.concat()
    }

    fn full_reasoning(&self) -> Option<String> {
        if self.reasoning.is_empty() {
            None
        } else {
            Some(self.reasoning.concat())
        }
    }
}

/// Final usage: trust the upstream tally when it carries anything, fall back
/// to the configured tokenizer otherwise.
fn resolve_usage(state: &AppState, request_id: &str, model: &str, agg: &Aggregation) -> Usage {
    if let Some(tally) = &agg.upstream_usage
        && (tally.input_tokens > 0 || tally.output_tokens > 0)
    {
        return Usage::new(tally.input_tokens, tally.output_tokens);
    }
    let config = state.config.config();
    let tag = tokens::tokenizer_tag(model, &config);
    let input = state
        .monitoring
        .active_request(request_id)
        .map(|info| tokens::estimate_message_tokens(&info.messages, &tag))
        .unwrap_or(0);
    let output = tokens::estimate_text_tokens(&agg.full_content(), &tag);
    Usage::new(input, output)
}

/// Streaming mode: format processor events as OpenAI SSE chunks. Exactly one
/// terminal `data: [DONE]` is emitted, always last.
pub fn stream_response(
    state: Arc<AppState>,
    request_id: String,
    model: String,
    mut events: mpsc::UnboundedReceiver<ProcessorEvent>,
) -> BridgeResponse {
    let (tx, rx) = mpsc::channel::<Bytes>(32);

    tokio::spawn(async move {
        let response_id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
        let config = state.config.config();
        let reasoning_mode = config.reasoning_output_mode;
        let mut agg = Aggregation::new();

        macro_rules! send_or_disconnect {
            ($bytes:expr) => {
                if tx.send($bytes).await.is_err() {
                    info!(request = %short(&request_id), "client disconnected mid-stream");
                    state.monitoring.request_end(
                        &request_id,
                        RequestOutcome {
                            success: false,
                            error: Some("client disconnected".to_string()),
                            response_content: Some(agg.full_content()),
                            reasoning_content: agg.full_reasoning(),
                            ..RequestOutcome::default()
                        },
                    );
                    // Dropping `events` here makes the processor cancel the
                    // upstream fetch.
                    return;
                }
            };
        }

        while let Some(event) = events.recv().await {
            match event {
                ProcessorEvent::Retry(retry) => {
                    if config.empty_response_retry.show_retry_info_to_client {
                        let note = format!(
                            "\n[retry] attempt {}/{} ({}), waiting {}ms...\n",
                            retry.attempt,
                            retry.max_attempts,
                            retry.reason.as_deref().unwrap_or("empty response"),
                            retry.delay.unwrap_or(0)
                        );
                        let chunk = ChatCompletionChunk::content(&response_id, &model, note);
                        send_or_disconnect!(sse::encode_data(&chunk));
                    }
                }
                ProcessorEvent::Reasoning(text) => {
                    agg.reasoning.push(text.clone());
                    if reasoning_mode == ReasoningMode::Openai {
                        let chunk = ChatCompletionChunk::reasoning(&response_id, &model, text);
                        send_or_disconnect!(sse::encode_data(&chunk));
                    }
                }
                ProcessorEvent::ReasoningEnd => {
                    if reasoning_mode == ReasoningMode::ThinkTag && !agg.reasoning.is_empty() {
                        let wrapped = format!("<think>{}</think>\n\n", agg.reasoning.concat());
                        let chunk = ChatCompletionChunk::content(&response_id, &model, wrapped);
                        send_or_disconnect!(sse::encode_data(&chunk));
                    }
                }
                ProcessorEvent::ReasoningComplete(full) => {
                    agg.reasoning.push(full.clone());
                    let chunk = match reasoning_mode {
                        ReasoningMode::Openai => {
                            ChatCompletionChunk::reasoning(&response_id, &model, full)
                        }
                        ReasoningMode::ThinkTag => ChatCompletionChunk::content(
                            &response_id,
                            &model,
                            format!("<think>{full}</think>\n\n"),
                        ),
                    };
                    send_or_disconnect!(sse::encode_data(&chunk));
                }
                ProcessorEvent::Content(text) => {
                    agg.content.push(text.clone());
                    let chunk = ChatCompletionChunk::content(&response_id, &model, text);
                    send_or_disconnect!(sse::encode_data(&chunk));
                }
                ProcessorEvent::Finish { reason, usage } => {
                    agg.upstream_usage = usage;
                    agg.finish_reason = reason;
                    if agg.finish_reason == "content-filter" {
                        agg.content.push(CONTENT_FILTER_NOTE.to_string());
                        let chunk = ChatCompletionChunk::content(
                            &response_id,
                            &model,
                            CONTENT_FILTER_NOTE,
                        );
                        send_or_disconnect!(sse::encode_data(&chunk));
                    }
                    // The terminal chunk waits for the upstream [DONE].
                }
                ProcessorEvent::Error(message) => {
                    warn!(request = %short(&request_id), %message, "stream error");
                    state.monitoring.request_end(
                        &request_id,
                        RequestOutcome {
                            success: false,
                            error: Some(message.clone()),
                            response_content: Some(agg.full_content()),
                            reasoning_content: agg.full_reasoning(),
                            ..RequestOutcome::default()
                        },
                    );
                    let kind = if message.contains(ATTACHMENT_TOO_LARGE_MARKER) {
                        "attachment_too_large"
                    } else {
                        "processing_error"
                    };
                    send_or_disconnect!(sse::encode_data(&error_body(&message, kind)));
                    let finish =
                        ChatCompletionChunk::finish(&response_id, &model, "stop", None);
                    send_or_disconnect!(sse::encode_data(&finish));
                    let _ = tx.send(sse::encode_done()).await;
                    return;
                }
            }
        }

        // Natural end of the event stream (the processor saw [DONE]).
        let usage = resolve_usage(&state, &request_id, &model, &agg);
        let finish = ChatCompletionChunk::finish(
            &response_id,
            &model,
            agg.finish_reason.clone(),
            Some(usage),
        );
        send_or_disconnect!(sse::encode_data(&finish));
        let _ = tx.send(sse::encode_done()).await;

        state.monitoring.request_end(
            &request_id,
            RequestOutcome {
                success: true,
                response_content: Some(agg.full_content()),
                reasoning_content: agg.full_reasoning(),
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                ..RequestOutcome::default()
            },
        );
    });

    BridgeResponse::sse(rx)
}

/// Non-streaming mode: aggregate the event stream into one JSON object.
pub async fn non_stream_response(
    state: Arc<AppState>,
    request_id: String,
    model: String,
    mut events: mpsc::UnboundedReceiver<ProcessorEvent>,
) -> BridgeResponse {
    let response_id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
    let config = state.config.config();
    let mut agg = Aggregation::new();

    while let Some(event) = events.recv().await {
        match event {
            ProcessorEvent::Retry(retry) => {
                info!(
                    request = %short(&request_id),
                    attempt = retry.attempt,
                    "retry during non-stream aggregation"
                );
            }
            ProcessorEvent::Reasoning(text) => agg.reasoning.push(text),
            ProcessorEvent::ReasoningComplete(full) => agg.reasoning.push(full),
            ProcessorEvent::ReasoningEnd => {}
            ProcessorEvent::Content(text) => agg.content.push(text),
            ProcessorEvent::Finish { reason, usage } => {
                agg.upstream_usage = usage;
                agg.finish_reason = reason;
                if agg.finish_reason == "content-filter" {
                    agg.content.push(CONTENT_FILTER_NOTE.to_string());
                }
            }
            ProcessorEvent::Error(message) => {
                state.monitoring.request_end(
                    &request_id,
                    RequestOutcome {
                        success: false,
                        error: Some(message.clone()),
                        response_content: Some(agg.full_content()),
                        reasoning_content: agg.full_reasoning(),
                        ..RequestOutcome::default()
                    },
                );
                let (status, kind) = if message.contains(ATTACHMENT_TOO_LARGE_MARKER) {
                    (413, "attachment_too_large")
                } else {
                    (500, "processing_error")
                };
                return BridgeResponse::json(status, &error_body(&message, kind));
            }
        }
    }

    let usage = resolve_usage(&state, &request_id, &model, &agg);
    let reasoning = agg.full_reasoning();
    let (content, reasoning_field) = if config.enable_reasoning_output {
        match (config.reasoning_output_mode, &reasoning) {
            (ReasoningMode::ThinkTag, Some(full)) => {
                (format!("<think>{full}</think>\n\n{}", agg.full_content()), None)
            }
            (ReasoningMode::Openai, Some(full)) => (agg.full_content(), Some(full.clone())),
            _ => (agg.full_content(), None),
        }
    } else {
        (agg.full_content(), None)
    };

    let response = ChatCompletionResponse::assistant(
        response_id,
        &model,
        content.clone(),
        reasoning_field,
        agg.finish_reason.clone(),
        Some(usage),
    );

    state.monitoring.request_end(
        &request_id,
        RequestOutcome {
            success: true,
            response_content: Some(content),
            reasoning_content: reasoning,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            ..RequestOutcome::default()
        },
    );

    let value = serde_json::to_value(&response).unwrap_or_else(|_| serde_json::json!({}));
    BridgeResponse::json(200, &value)
}

fn short(request_id: &str) -> &str {
    &request_id[..request_id.len().min(8)]
}
