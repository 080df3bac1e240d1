use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{info, warn};

use lmbridge_config::DirectBinding;
use lmbridge_core::http::{HttpBody, HttpResponse};
use lmbridge_core::monitoring::RequestOutcome;
use lmbridge_core::respond::{BridgeResponse, ResponseBody};
use lmbridge_core::state::AppState;
use lmbridge_core::tokens;
use lmbridge_protocol::openai::request::ChatCompletionRequest;

use crate::cost::calculate_cost;
use crate::thinking::ThinkingSplitter;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(1200);
const FIRST_CHUNK_TIMEOUT: Duration = Duration::from_secs(180);

/// Build the body POSTed upstream: target model id, merged custom params,
/// optional prefix flag on a trailing assistant message, optional thinking
/// budget.
pub fn prepare_passthrough_body(
    request: &ChatCompletionRequest,
    binding: &DirectBinding,
    model_name: &str,
) -> serde_json::Value {
    let mut body = serde_json::to_value(request).unwrap_or_else(|_| serde_json::json!({}));
    body["model"] = serde_json::Value::String(binding.target_model_id(model_name).to_string());

    if let Some(custom) = &binding.custom_params
        && let Some(obj) = body.as_object_mut()
    {
        for (key, value) in custom {
            obj.insert(key.clone(), value.clone());
        }
    }

    if binding.enable_prefix
        && let Some(messages) = body.get_mut("messages").and_then(|m| m.as_array_mut())
        && let Some(last) = messages.last_mut()
        && last.get("role").and_then(|r| r.as_str()) == Some("assistant")
    {
        last["prefix"] = serde_json::Value::Bool(true);
    }

    if binding.enable_thinking {
        body["thinkingConfig"] = serde_json::json!({"thinkingBudget": binding.thinking_budget});
    }

    body
}

/// OpenAI error-type → HTTP status mapping for upstream error objects.
pub fn error_status(error_json: &serde_json::Value) -> u16 {
    match error_json
        .get("error")
        .and_then(|e| e.get("type"))
        .and_then(|t| t.as_str())
    {
        Some("invalid_request_error") => 400,
        Some("authentication_error") => 401,
        Some("permission_error") => 403,
        _ => 500,
    }
}

pub async fn handle(
    state: Arc<AppState>,
    request_id: String,
    model_name: &str,
    binding: DirectBinding,
    request: ChatCompletionRequest,
) -> BridgeResponse {
    let Some(base_url) = binding.api_base_url.clone() else {
        return fail(
            &state,
            &request_id,
            500,
            "direct API binding is missing api_base_url",
        );
    };

    let display_name = binding.display_name(model_name).to_string();
    let body = prepare_passthrough_body(&request, &binding, model_name);
    let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
    let headers = vec![(
        "Authorization".to_string(),
        format!("Bearer {}", binding.api_key),
    )];
    let want_stream = request.is_stream();

    let response = match state
        .http
        .post_json(&url, &headers, &body, want_stream, UPSTREAM_TIMEOUT)
        .await
    {
        Ok(response) => response,
        Err(err) => return fail(&state, &request_id, 502, &format!("network error: {err}")),
    };

    if !want_stream {
        return relay_non_stream(state, request_id, display_name, binding, request, response).await;
    }

    let HttpResponse { status, body } = response;
    let mut upstream = match body {
        HttpBody::Stream(rx) => rx,
        HttpBody::Bytes(bytes) => {
            // Non-2xx bodies come back fully read; map the error type.
            if let Ok(error_json) = serde_json::from_slice::<serde_json::Value>(&bytes)
                && error_json.get("error").is_some()
            {
                let mapped = if status == 200 { error_status(&error_json) } else { status };
                end_failed(&state, &request_id, &error_json.to_string());
                return BridgeResponse::json(mapped, &error_json);
            }
            end_failed(&state, &request_id, "upstream returned a non-stream body");
            return BridgeResponse::json(502, &upstream_error("unexpected upstream body"));
        }
    };

    // Pre-read the first chunk: a JSON error object turns into a mapped
    // plain response instead of a broken stream.
    let first = match tokio::time::timeout(FIRST_CHUNK_TIMEOUT, upstream.recv()).await {
        Ok(Some(chunk)) => chunk,
        Ok(None) | Err(_) => {
            return fail(
                &state,
                &request_id,
                502,
                "upstream returned no data within 180 seconds",
            );
        }
    };
    if let Ok(error_json) = serde_json::from_slice::<serde_json::Value>(&first)
        && error_json.get("error").is_some()
    {
        let mapped = error_status(&error_json);
        end_failed(&state, &request_id, &error_json.to_string());
        return BridgeResponse::json(mapped, &error_json);
    }

    // Splice the pre-read chunk ahead of the remainder and relay.
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    let splitter = binding
        .thinking_separator
        .clone()
        .map(ThinkingSplitter::new);
    let pricing = binding.pricing.clone();

    tokio::spawn(async move {
        let mut relay = StreamRelay {
            splitter,
            accumulated_content: String::new(),
            accumulated_reasoning: String::new(),
            usage: None,
        };

        let mut ok = relay.forward(&tx, first).await;
        while ok {
            let Some(chunk) = upstream.recv().await else {
                break;
            };
            ok = relay.forward(&tx, chunk).await;
        }

        let config = state.config.config();
        let tag = tokens::tokenizer_tag(&display_name, &config);
        let mut input_tokens = relay.usage.map(|u| u.0).unwrap_or(0);
        let mut output_tokens = relay.usage.map(|u| u.1).unwrap_or(0);
        if input_tokens == 0 {
            input_tokens = state
                .monitoring
                .active_request(&request_id)
                .map(|info| tokens::estimate_message_tokens(&info.messages, &tag))
                .unwrap_or(0);
        }
        if output_tokens == 0 && !relay.accumulated_content.is_empty() {
            output_tokens = tokens::estimate_text_tokens(&relay.accumulated_content, &tag);
        }

        // Late separator application for streams that never split inline.
        let (mut final_reasoning, mut final_content) = (
            relay.accumulated_reasoning.clone(),
            relay.accumulated_content.clone(),
        );
        if let Some(separator) = &binding.thinking_separator
            && final_reasoning.is_empty()
        {
            let (reasoning, content) =
                ThinkingSplitter::split_final(&relay.accumulated_content, separator);
            if !reasoning.is_empty() {
                final_reasoning = reasoning;
                final_content = content;
            }
        }

        let cost = pricing
            .as_ref()
            .map(|p| calculate_cost(input_tokens, output_tokens, p))
            .and_then(|c| serde_json::to_value(c).ok());

        state.monitoring.request_end(
            &request_id,
            RequestOutcome {
                success: ok,
                error: (!ok).then(|| "client disconnected".to_string()),
                response_content: Some(final_content),
                reasoning_content: (!final_reasoning.is_empty()).then_some(final_reasoning),
                input_tokens,
                output_tokens,
                cost,
            },
        );
    });

    BridgeResponse::sse(rx)
}

struct StreamRelay {
    splitter: Option<ThinkingSplitter>,
    accumulated_content: String,
    accumulated_reasoning: String,
    usage: Option<(u64, u64)>,
}

impl StreamRelay {
    /// Track content/usage from a chunk, apply the separator rewrite, and
    /// forward. Returns false once the client went away.
    async fn forward(&mut self, tx: &mpsc::Sender<Bytes>, chunk: Bytes) -> bool {
        let text = String::from_utf8_lossy(&chunk).to_string();
        self.scan(&text);
        let out = match &mut self.splitter {
            Some(splitter) => Bytes::from(splitter.process_chunk(&text)),
            None => chunk,
        };
        tx.send(out).await.is_ok()
    }

    fn scan(&mut self, text: &str) {
        for line in text.lines() {
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
                continue;
            };
            if let Some(delta) = value
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("delta"))
            {
                if let Some(content) = delta.get("content").and_then(|c| c.as_str()) {
                    self.accumulated_content.push_str(content);
                }
                if let Some(reasoning) = delta.get("reasoning_content").and_then(|c| c.as_str()) {
                    self.accumulated_reasoning.push_str(reasoning);
                }
            }
            if let Some(usage) = value.get("usage") {
                let input = usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                let output = usage
                    .get("completion_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                if input > 0 || output > 0 {
                    self.usage = Some((input, output));
                }
            }
        }
    }
}

async fn relay_non_stream(
    state: Arc<AppState>,
    request_id: String,
    display_name: String,
    binding: DirectBinding,
    _request: ChatCompletionRequest,
    response: HttpResponse,
) -> BridgeResponse {
    let status = response.status;
    let bytes = response.into_bytes().await;
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
        end_failed(&state, &request_id, "upstream body is not JSON");
        return BridgeResponse::json(502, &upstream_error("upstream body is not JSON"));
    };

    if value.get("error").is_some() {
        let mapped = if status == 200 { error_status(&value) } else { status };
        end_failed(&state, &request_id, &value.to_string());
        return BridgeResponse::json(mapped, &value);
    }

    let mut content = value["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or("")
        .to_string();
    let mut reasoning = value["choices"][0]["message"]["reasoning_content"]
        .as_str()
        .unwrap_or("")
        .to_string();

    if let Some(separator) = &binding.thinking_separator
        && reasoning.is_empty()
    {
        let (split_reasoning, split_content) = ThinkingSplitter::split_final(&content, separator);
        if !split_reasoning.is_empty() {
            info!(request = %request_id, "thinking separator split applied to aggregated body");
            reasoning = split_reasoning;
            content = split_content;
            value["choices"][0]["message"]["content"] =
                serde_json::Value::String(content.clone());
            value["choices"][0]["message"]["reasoning_content"] =
                serde_json::Value::String(reasoning.clone());
        }
    }

    let config = state.config.config();
    let tag = tokens::tokenizer_tag(&display_name, &config);
    let mut input_tokens = value["usage"]["prompt_tokens"].as_u64().unwrap_or(0);
    let mut output_tokens = value["usage"]["completion_tokens"].as_u64().unwrap_or(0);
    if input_tokens == 0 {
        input_tokens = state
            .monitoring
            .active_request(&request_id)
            .map(|info| tokens::estimate_message_tokens(&info.messages, &tag))
            .unwrap_or(0);
    }
    if output_tokens == 0 && !content.is_empty() {
        output_tokens = tokens::estimate_text_tokens(&content, &tag);
    }

    let cost = binding
        .pricing
        .as_ref()
        .map(|p| calculate_cost(input_tokens, output_tokens, p))
        .and_then(|c| serde_json::to_value(c).ok());

    state.monitoring.request_end(
        &request_id,
        RequestOutcome {
            success: true,
            error: None,
            response_content: Some(content),
            reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
            input_tokens,
            output_tokens,
            cost,
        },
    );

    BridgeResponse::json(200, &value)
}

fn upstream_error(message: &str) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "message": message,
            "type": "api_error",
        }
    })
}

fn fail(state: &Arc<AppState>, request_id: &str, status: u16, message: &str) -> BridgeResponse {
    warn!(request = %request_id, %message, "direct passthrough failed");
    end_failed(state, request_id, message);
    BridgeResponse::json(status, &upstream_error(message))
}

fn end_failed(state: &Arc<AppState>, request_id: &str, message: &str) {
    state.monitoring.request_end(
        request_id,
        RequestOutcome {
            success: false,
            error: Some(message.to_string()),
            ..RequestOutcome::default()
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(value: serde_json::Value) -> DirectBinding {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn body_rewrites_model_and_merges_params() {
        let request: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "model": "alias",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        }))
        .unwrap();
        let b = binding(serde_json::json!({
            "api_type": "direct_api",
            "api_key": "k",
            "model_id": "real-model",
            "custom_params": {"top_k": 40},
            "enable_thinking": true,
            "thinking_budget": 512
        }));
        let body = prepare_passthrough_body(&request, &b, "alias");
        assert_eq!(body["model"], "real-model");
        assert_eq!(body["top_k"], 40);
        assert_eq!(body["thinkingConfig"]["thinkingBudget"], 512);
    }

    #[test]
    fn prefix_flag_lands_on_trailing_assistant() {
        let request: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "write"},
                {"role": "assistant", "content": "Once upon"}
            ]
        }))
        .unwrap();
        let b = binding(serde_json::json!({
            "api_type": "direct_api",
            "api_key": "k",
            "enable_prefix": true,
            "enable_thinking": false
        }));
        let body = prepare_passthrough_body(&request, &b, "m");
        assert_eq!(body["messages"][1]["prefix"], true);
        assert!(body.get("thinkingConfig").is_none());
    }

    #[test]
    fn error_types_map_to_statuses() {
        let err = |kind: &str| serde_json::json!({"error": {"type": kind, "message": "x"}});
        assert_eq!(error_status(&err("invalid_request_error")), 400);
        assert_eq!(error_status(&err("authentication_error")), 401);
        assert_eq!(error_status(&err("permission_error")), 403);
        assert_eq!(error_status(&err("server_error")), 500);
        assert_eq!(error_status(&serde_json::json!({"error": "plain"})), 500);
    }
}
