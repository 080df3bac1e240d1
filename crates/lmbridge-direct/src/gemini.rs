use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;

use lmbridge_config::DirectBinding;
use lmbridge_core::http::{HttpBody, HttpResponse};
use lmbridge_core::monitoring::RequestOutcome;
use lmbridge_core::respond::BridgeResponse;
use lmbridge_core::state::AppState;
use lmbridge_core::tokens;
use lmbridge_protocol::gemini::request::{GenerateContentRequest, SystemInstruction};
use lmbridge_protocol::gemini::response::GenerateContentResponse;
use lmbridge_protocol::gemini::types::{
    Content, FileData, GenerationConfig, InlineData, Part, map_finish_reason,
};
use lmbridge_protocol::openai::request::ChatCompletionRequest;
use lmbridge_protocol::openai::types::{ContentPart, MessageContent};
use lmbridge_protocol::sse;

use crate::cost::calculate_cost;
use crate::sse_lines::SseLineBuffer;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(1200);
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// `…/v1beta/models/<id>:(stream)generateContent?key=…[&alt=sse]`.
pub fn gemini_url(base_url: Option<&str>, model_id: &str, api_key: &str, stream: bool) -> String {
    let base = base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/');
    let method = if stream { "streamGenerateContent" } else { "generateContent" };
    let alt = if stream { "&alt=sse" } else { "" };
    format!("{base}/v1beta/models/{model_id}:{method}?key={api_key}{alt}")
}

/// OpenAI messages → Gemini `contents[]` with `systemInstruction` extracted.
pub fn openai_to_gemini_request(request: &ChatCompletionRequest) -> GenerateContentRequest {
    let mut contents = Vec::new();
    let mut system_instruction = None;

    for message in &request.messages {
        match message.role.as_str() {
            "system" | "developer" => {
                system_instruction = Some(SystemInstruction {
                    parts: vec![Part::text(message.text_content())],
                });
            }
            "assistant" => {
                let text = message.text_content();
                contents.push(Content {
                    role: Some("model".to_string()),
                    parts: vec![Part::text(if text.is_empty() { " ".to_string() } else { text })],
                });
            }
            _ => {
                let parts = user_parts(&message.content);
                contents.push(Content {
                    role: Some("user".to_string()),
                    parts,
                });
            }
        }
    }

    let generation_config = GenerationConfig {
        temperature: request.temperature,
        top_p: request.top_p,
        max_output_tokens: request.max_tokens,
    };
    let has_config = generation_config.temperature.is_some()
        || generation_config.top_p.is_some()
        || generation_config.max_output_tokens.is_some();

    GenerateContentRequest {
        contents,
        system_instruction,
        generation_config: has_config.then_some(generation_config),
        extra: serde_json::Map::new(),
    }
}

fn user_parts(content: &MessageContent) -> Vec<Part> {
    let mut parts = Vec::new();
    match content {
        MessageContent::Text(text) => {
            if !text.is_empty() {
                parts.push(Part::text(text.clone()));
            }
        }
        MessageContent::Parts(items) => {
            for item in items {
                match item {
                    ContentPart::Text { text } => {
                        if !text.is_empty() {
                            parts.push(Part::text(text.clone()));
                        }
                    }
                    ContentPart::ImageUrl { image_url } => {
                        let url = &image_url.url;
                        if let Some(rest) = url.strip_prefix("data:") {
                            let Some((header, data)) = rest.split_once(',') else {
                                warn!("malformed data URI in multimodal part");
                                continue;
                            };
                            let mime = header.split(';').next().unwrap_or("image/png");
                            parts.push(Part {
                                inline_data: Some(InlineData {
                                    mime_type: mime.to_string(),
                                    data: data.to_string(),
                                }),
                                ..Part::default()
                            });
                        } else if url.starts_with("http://") || url.starts_with("https://") {
                            parts.push(Part {
                                file_data: Some(FileData {
                                    mime_type: "image/jpeg".to_string(),
                                    file_uri: url.clone(),
                                }),
                                ..Part::default()
                            });
                        }
                    }
                }
            }
        }
    }
    if parts.is_empty() {
        parts.push(Part::text(" "));
    }
    parts
}

struct TranslatedChunk {
    content: String,
    reasoning: String,
    finish_reason: Option<String>,
    usage: Option<serde_json::Value>,
    input_tokens: u64,
    output_tokens: u64,
}

/// Candidates → OpenAI delta/message shape. Thought parts become
/// `reasoning_content`; `thoughtsTokenCount` is surfaced as
/// `reasoning_tokens` and counted into completion tokens.
fn translate(resp: &GenerateContentResponse, reasoning_so_far: usize) -> TranslatedChunk {
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut finish_reason = None;

    if let Some(candidate) = resp.candidates.first() {
        if let Some(body) = &candidate.content {
            for part in &body.parts {
                if let Some(text) = &part.text {
                    if part.thought == Some(true) {
                        reasoning.push_str(text);
                    } else {
                        content.push_str(text);
                    }
                }
            }
        }
        if let Some(reason) = &candidate.finish_reason {
            finish_reason = Some(map_finish_reason(reason).to_string());
        }
    }

    let mut usage = None;
    let mut input_tokens = 0;
    let mut output_tokens = 0;
    if let Some(meta) = &resp.usage_metadata {
        let mut thoughts = meta.thoughts_token_count;
        if thoughts == 0 && reasoning_so_far + reasoning.len() > 0 {
            thoughts = ((reasoning_so_far + reasoning.len()) / 4) as u64;
        }
        input_tokens = meta.prompt_token_count;
        output_tokens = meta.candidates_token_count + thoughts;
        let mut value = serde_json::json!({
            "prompt_tokens": input_tokens,
            "completion_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
        });
        if thoughts > 0 {
            value["reasoning_tokens"] = serde_json::json!(thoughts);
        }
        usage = Some(value);
    }

    TranslatedChunk {
        content,
        reasoning,
        finish_reason,
        usage,
        input_tokens,
        output_tokens,
    }
}

/// Build one OpenAI chunk/full response from a translated Gemini payload.
pub fn gemini_to_openai(
    resp: &GenerateContentResponse,
    model: &str,
    request_id: &str,
    stream_chunk: bool,
) -> serde_json::Value {
    let translated = translate(resp, 0);
    let created = time::OffsetDateTime::now_utc().unix_timestamp();

    if stream_chunk {
        let mut delta = serde_json::Map::new();
        if !translated.reasoning.is_empty() {
            delta.insert(
                "reasoning_content".to_string(),
                serde_json::Value::String(translated.reasoning.clone()),
            );
        }
        if !translated.content.is_empty() {
            delta.insert(
                "content".to_string(),
                serde_json::Value::String(translated.content.clone()),
            );
        }
        serde_json::json!({
            "id": request_id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": translated.finish_reason,
            }],
            "usage": translated.usage,
        })
    } else {
        let mut message = serde_json::Map::new();
        message.insert(
            "role".to_string(),
            serde_json::Value::String("assistant".to_string()),
        );
        if !translated.reasoning.is_empty() {
            message.insert(
                "reasoning_content".to_string(),
                serde_json::Value::String(translated.reasoning.clone()),
            );
        }
        message.insert(
            "content".to_string(),
            serde_json::Value::String(translated.content.clone()),
        );
        serde_json::json!({
            "id": request_id,
            "object": "chat.completion",
            "created": created,
            "model": model,
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": translated.finish_reason.unwrap_or_else(|| "stop".to_string()),
            }],
            "usage": translated.usage,
        })
    }
}

pub async fn handle(
    state: Arc<AppState>,
    request_id: String,
    model_name: &str,
    binding: DirectBinding,
    request: ChatCompletionRequest,
) -> BridgeResponse {
    let display_name = binding.display_name(model_name).to_string();
    let model_id = binding.target_model_id(model_name).to_string();
    let want_stream = request.is_stream();

    let mut gemini_request = openai_to_gemini_request(&request);
    if let Some(custom) = &binding.custom_params {
        for (key, value) in custom {
            gemini_request.extra.insert(key.clone(), value.clone());
        }
    }
    let body = match serde_json::to_value(&gemini_request) {
        Ok(body) => body,
        Err(err) => {
            return end_with_error(&state, &request_id, 500, &format!("encode failed: {err}"));
        }
    };

    let url = gemini_url(
        binding.api_base_url.as_deref(),
        &model_id,
        &binding.api_key,
        want_stream,
    );

    let response = match state
        .http
        .post_json(&url, &[], &body, want_stream, UPSTREAM_TIMEOUT)
        .await
    {
        Ok(response) => response,
        Err(err) => {
            return end_with_error(&state, &request_id, 502, &format!("network error: {err}"));
        }
    };

    if !want_stream {
        let status = response.status;
        let bytes = response.into_bytes().await;
        if status != 200 {
            let text = String::from_utf8_lossy(&bytes).to_string();
            return end_with_upstream_error(&state, &request_id, status, &text);
        }
        let parsed: GenerateContentResponse = match serde_json::from_slice(&bytes) {
            Ok(parsed) => parsed,
            Err(err) => {
                return end_with_error(&state, &request_id, 502, &format!("decode failed: {err}"));
            }
        };
        let translated = translate(&parsed, 0);
        let value = gemini_to_openai(&parsed, &display_name, &request_id, false);
        finish_accounting(&state, &request_id, &display_name, &binding, translated);
        return BridgeResponse::json(200, &value);
    }

    let HttpResponse { status, body } = response;
    let mut upstream = match body {
        HttpBody::Stream(rx) => rx,
        HttpBody::Bytes(bytes) => {
            let text = String::from_utf8_lossy(&bytes).to_string();
            return end_with_upstream_error(&state, &request_id, status, &text);
        }
    };

    let (tx, rx) = mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let mut lines = SseLineBuffer::new();
        let mut content = String::new();
        let mut reasoning = String::new();
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;
        let mut client_alive = true;

        let mut handle_line = |line: &str| -> Option<Bytes> {
            if line == "[DONE]" {
                return None;
            }
            let parsed: GenerateContentResponse = serde_json::from_str(line).ok()?;
            let translated = translate(&parsed, reasoning.len());
            content.push_str(&translated.content);
            reasoning.push_str(&translated.reasoning);
            if translated.input_tokens > 0 || translated.output_tokens > 0 {
                input_tokens = translated.input_tokens;
                output_tokens = translated.output_tokens;
            }
            let chunk = gemini_to_openai(&parsed, &display_name, &request_id, true);
            Some(sse::encode_data(&chunk))
        };

        'relay: while let Some(chunk) = upstream.recv().await {
            let text = String::from_utf8_lossy(&chunk).to_string();
            for line in lines.push(&text) {
                let Some(encoded) = handle_line(&line) else {
                    continue;
                };
                if tx.send(encoded).await.is_err() {
                    client_alive = false;
                    break 'relay;
                }
            }
        }
        if client_alive {
            if let Some(line) = lines.finish()
                && let Some(encoded) = handle_line(&line)
            {
                let _ = tx.send(encoded).await;
            }
            let _ = tx.send(sse::encode_done()).await;
        }
        drop(handle_line);

        finish_accounting(
            &state,
            &request_id,
            &display_name,
            &binding,
            TranslatedChunk {
                content,
                reasoning,
                finish_reason: None,
                usage: None,
                input_tokens,
                output_tokens,
            },
        );
    });

    BridgeResponse::sse(rx)
}

fn finish_accounting(
    state: &Arc<AppState>,
    request_id: &str,
    display_name: &str,
    binding: &DirectBinding,
    translated: TranslatedChunk,
) {
    let config = state.config.config();
    let tag = tokens::tokenizer_tag(display_name, &config);
    let mut input_tokens = translated.input_tokens;
    let mut output_tokens = translated.output_tokens;
    if input_tokens == 0 {
        input_tokens = state
            .monitoring
            .active_request(request_id)
            .map(|info| tokens::estimate_message_tokens(&info.messages, &tag))
            .unwrap_or(0);
    }
    if output_tokens == 0 && !translated.content.is_empty() {
        output_tokens = tokens::estimate_text_tokens(&translated.content, &tag);
    }

    let cost = binding
        .pricing
        .as_ref()
        .map(|p| calculate_cost(input_tokens, output_tokens, p))
        .and_then(|c| serde_json::to_value(c).ok());

    state.monitoring.request_end(
        request_id,
        RequestOutcome {
            success: true,
            error: None,
            response_content: Some(translated.content),
            reasoning_content: (!translated.reasoning.is_empty()).then_some(translated.reasoning),
            input_tokens,
            output_tokens,
            cost,
        },
    );
}

fn end_with_error(
    state: &Arc<AppState>,
    request_id: &str,
    status: u16,
    message: &str,
) -> BridgeResponse {
    warn!(request = %request_id, %message, "gemini-native request failed");
    state.monitoring.request_end(
        request_id,
        RequestOutcome {
            success: false,
            error: Some(message.to_string()),
            ..RequestOutcome::default()
        },
    );
    BridgeResponse::json(
        status,
        &serde_json::json!({
            "error": {"message": message, "type": "api_error"}
        }),
    )
}

fn end_with_upstream_error(
    state: &Arc<AppState>,
    request_id: &str,
    status: u16,
    body: &str,
) -> BridgeResponse {
    state.monitoring.request_end(
        request_id,
        RequestOutcome {
            success: false,
            error: Some(body.to_string()),
            ..RequestOutcome::default()
        },
    );
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => BridgeResponse::json(status, &value),
        Err(_) => BridgeResponse::json(
            status,
            &serde_json::json!({
                "error": {"message": body, "type": "api_error", "code": status}
            }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_shape_for_stream_and_not() {
        let url = gemini_url(None, "gemini-2.5-pro", "KEY", true);
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-pro:streamGenerateContent?key=KEY&alt=sse"
        );
        let url = gemini_url(Some("https://proxy.local/"), "m", "KEY", false);
        assert_eq!(url, "https://proxy.local/v1beta/models/m:generateContent?key=KEY");
    }

    #[test]
    fn roles_and_system_instruction_translate() {
        let request: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "model": "m",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": "hi"}
            ],
            "temperature": 0.4,
            "max_tokens": 100
        }))
        .unwrap();
        let gem = openai_to_gemini_request(&request);
        assert_eq!(gem.contents.len(), 2);
        assert_eq!(gem.contents[0].role.as_deref(), Some("user"));
        assert_eq!(gem.contents[1].role.as_deref(), Some("model"));
        assert_eq!(
            gem.system_instruction.unwrap().parts[0].text.as_deref(),
            Some("be terse")
        );
        let config = gem.generation_config.unwrap();
        assert_eq!(config.temperature, Some(0.4));
        assert_eq!(config.max_output_tokens, Some(100));
    }

    #[test]
    fn multimodal_parts_map_to_inline_and_file_data() {
        let request: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "what is this"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,QUJD"}},
                    {"type": "image_url", "image_url": {"url": "https://x/y.jpg"}}
                ]
            }]
        }))
        .unwrap();
        let gem = openai_to_gemini_request(&request);
        let parts = &gem.contents[0].parts;
        assert_eq!(parts.len(), 3);
        let inline = parts[1].inline_data.as_ref().unwrap();
        assert_eq!(inline.mime_type, "image/png");
        assert_eq!(inline.data, "QUJD");
        let file = parts[2].file_data.as_ref().unwrap();
        assert_eq!(file.file_uri, "https://x/y.jpg");
    }

    #[test]
    fn thought_parts_become_reasoning_with_token_carry() {
        let resp: GenerateContentResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "thinking...", "thought": true},
                    {"text": "the answer"}
                ]},
                "finishReason": "MAX_TOKENS"
            }],
            "usageMetadata": {
                "promptTokenCount": 10,
                "candidatesTokenCount": 20,
                "thoughtsTokenCount": 7
            }
        }))
        .unwrap();
        let value = gemini_to_openai(&resp, "m", "req", true);
        let delta = &value["choices"][0]["delta"];
        assert_eq!(delta["reasoning_content"], "thinking...");
        assert_eq!(delta["content"], "the answer");
        assert_eq!(value["choices"][0]["finish_reason"], "length");
        assert_eq!(value["usage"]["reasoning_tokens"], 7);
        assert_eq!(value["usage"]["completion_tokens"], 27);
    }
}
