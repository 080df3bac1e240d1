use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use tokio::sync::oneshot;
use tracing::{info, warn};

use lmbridge_common::{BridgeError, RequestId};
use lmbridge_config::{EndpointEntry, ImageCompression, ModelKind, SessionBinding};
use lmbridge_core::channels::PendingRequest;
use lmbridge_core::lifecycle::PendingItem;
use lmbridge_core::monitoring::RequestOutcome;
use lmbridge_core::respond::{self, BridgeResponse};
use lmbridge_core::state::AppState;
use lmbridge_core::stream::spawn_processor;
use lmbridge_core::translate::{TranslationInput, build_arena_payload};
use lmbridge_protocol::openai::request::ChatCompletionRequest;
use lmbridge_protocol::openai::types::{ContentPart, MessageContent};
use lmbridge_protocol::wire::RequestEnvelope;

use crate::convert::to_axum_response;

/// Extract every `![alt](data:...)` image from Markdown text.
fn markdown_data_uris(text: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("![") {
        let after = &rest[start..];
        let Some(close) = after.find(']') else { break };
        let alt = after[2..close].to_string();
        let Some(paren) = after[close..].strip_prefix("](") else {
            rest = &rest[start + 2..];
            continue;
        };
        let Some(end) = paren.find(')') else { break };
        let url = paren[..end].to_string();
        if url.starts_with("data:") {
            out.push((alt, url));
        }
        rest = &rest[start + close + 2 + end + 1..];
    }
    out
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    state.touch_activity();
    let bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string());
    to_axum_response(handle_chat_completion(state, bearer, request, false, None).await)
}

/// Full chat-completions orchestration, shared by the HTTP handler and the
/// pending-queue drain (which already passed auth at admission).
pub async fn handle_chat_completion(
    state: Arc<AppState>,
    bearer: Option<String>,
    mut request: ChatCompletionRequest,
    skip_auth: bool,
    retry_of: Option<String>,
) -> BridgeResponse {
    let config = state.config.config();
    let model_name = request.model.clone().unwrap_or_default();
    let entry = state.config.get_endpoint(&model_name);

    // Direct-API bindings bypass tab-path gating entirely.
    if let Some(EndpointEntry::Direct(binding)) = entry {
        let binding = *binding;
        if let Some(max) = binding.max_temperature
            && let Some(old) = request.cap_temperature(max)
        {
            info!(model = %model_name, old, capped = max, "temperature capped");
        }
        preprocess_images(&state, &mut request, binding.image_compression.as_ref()).await;
        return lmbridge_direct::handle_direct_request(state, &model_name, binding, request).await;
    }

    // Bearer auth, when a key is configured.
    if !skip_auth
        && let Some(expected) = config.api_key.as_deref().filter(|k| !k.is_empty())
        && bearer.as_deref() != Some(expected)
    {
        return error_json(&BridgeError::Unauthorized(
            "provide a valid API key as 'Authorization: Bearer <key>'".to_string(),
        ));
    }

    // Verification cool-down gates the whole tab path.
    if let Err(err) = state
        .verification
        .gate(config.verification.display_skew_seconds)
    {
        return error_json(&err);
    }

    // No tab connected: either park the request or fail fast.
    if state.tabs.connected_count().await == 0 {
        if config.enable_auto_retry {
            let (tx, rx) = oneshot::channel();
            state.pending.push(PendingItem {
                request,
                original_request_id: retry_of,
                responder: tx,
            });
            let deadline = Duration::from_secs(config.retry_timeout_seconds);
            return match tokio::time::timeout(deadline, rx).await {
                Ok(Ok(Ok(response))) => response,
                Ok(Ok(Err(err))) => error_json(&err),
                _ => BridgeResponse::json(
                    503,
                    &serde_json::json!({
                        "error": {
                            "message": format!(
                                "the browser connection did not recover within {} seconds",
                                deadline.as_secs()
                            ),
                            "type": "no_tab_connected",
                        }
                    }),
                ),
            };
        }
        return error_json(&BridgeError::NoTabConnected);
    }

    // Resolve the session binding (strict round-robin for pools).
    let resolved = match resolve_session(&state, &model_name) {
        Ok(resolved) => resolved,
        Err(err) => return error_json(&err),
    };
    if let Some(max) = resolved.binding.max_temperature
        && let Some(old) = request.cap_temperature(max)
    {
        info!(model = %model_name, old, capped = max, "temperature capped");
    }

    let session_id = resolved.binding.session_id.clone();
    if session_id.is_empty() || session_id.contains("YOUR_") {
        return error_json(&BridgeError::BadRequest(
            "the resolved session id is not configured".to_string(),
        ));
    }

    let request_id = RequestId::mint();
    let model_kind = resolved.kind;
    let mode_override = resolved.binding.mode;
    let battle_target_override = resolved.binding.battle_target.clone();
    let target_model_id = resolved.target_model_id.clone();

    state.monitoring.request_start(
        request_id.as_str(),
        if model_name.is_empty() { "unknown" } else { &model_name },
        Some(
            mode_override
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| config.default_mode.clone()),
        ),
        Some(tail(&session_id)),
        request.messages.clone(),
        serde_json::json!({
            "temperature": request.temperature,
            "top_p": request.top_p,
            "max_tokens": request.max_tokens,
            "streaming": request.is_stream(),
        }),
    );
    if let Some(original) = &retry_of {
        info!(request = %request_id.short(), original = %original, "re-issuing recovered request");
    }

    preprocess_images(&state, &mut request, resolved.binding.image_compression.as_ref()).await;

    let input = TranslationInput {
        request: &request,
        session_id: &session_id,
        mode_override,
        battle_target_override: battle_target_override.as_deref(),
        model_kind,
        target_model_id: target_model_id.clone(),
    };
    let mut payload = match build_arena_payload(&input, &config) {
        Ok(payload) => payload,
        Err(err) => {
            state.monitoring.request_end(
                request_id.as_str(),
                RequestOutcome {
                    success: false,
                    error: Some(err.to_string()),
                    ..RequestOutcome::default()
                },
            );
            return error_json(&err);
        }
    };
    if model_kind == ModelKind::Image {
        payload.is_image_request = Some(true);
    }

    // Admission: channel + metadata exist before the envelope leaves.
    let frames = state.channels.admit(PendingRequest {
        request_id: request_id.as_str().to_string(),
        openai_request: request.clone(),
        model_name: model_name.clone(),
        session_id: session_id.clone(),
        mode_override,
        battle_target_override: battle_target_override.clone(),
        model_kind,
        target_model_id,
        tab_id: None,
        original_tab_id: None,
        transfer_count: 0,
        transfer_allowed: true,
        created_at: time::OffsetDateTime::now_utc(),
    });

    let (tab_id, sender) = match state.tabs.select_best_tab().await {
        Ok(selected) => selected,
        Err(err) => {
            fail_admitted(&state, request_id.as_str(), &err).await;
            return error_json(&err);
        }
    };
    state.channels.with_metadata_mut(request_id.as_str(), |meta| {
        meta.tab_id = Some(tab_id.clone());
        meta.original_tab_id = Some(tab_id.clone());
    });

    let envelope = RequestEnvelope {
        request_id: request_id.as_str().to_string(),
        payload,
        retry_config: state.retry_config(&config),
        is_transfer: None,
        original_tab_id: None,
        transfer_count: None,
    };
    let frame = match serde_json::to_string(&envelope) {
        Ok(frame) => frame,
        Err(err) => {
            let err = BridgeError::Internal(format!("envelope encode failed: {err}"));
            state.tabs.release(&tab_id).await;
            fail_admitted(&state, request_id.as_str(), &err).await;
            return error_json(&err);
        }
    };
    if sender.send(frame).is_err() {
        let err = BridgeError::Internal("selected tab went away before send".to_string());
        state.tabs.release(&tab_id).await;
        fail_admitted(&state, request_id.as_str(), &err).await;
        return error_json(&err);
    }
    info!(request = %request_id.short(), tab = %tab_id, "envelope dispatched");

    // The cursor moves once the request is actually enqueued, so a stuck
    // binding cannot starve the rest of its pool.
    if resolved.from_pool {
        state.config.advance_round_robin(&model_name);
    }

    let events = spawn_processor(state.clone(), request_id.as_str().to_string(), frames);
    let model_for_wire = if model_name.is_empty() {
        "default_model".to_string()
    } else {
        model_name
    };
    if request.is_stream() {
        respond::stream_response(state, request_id.as_str().to_string(), model_for_wire, events)
    } else {
        respond::non_stream_response(state, request_id.as_str().to_string(), model_for_wire, events)
            .await
    }
}

struct ResolvedSession {
    binding: SessionBinding,
    kind: ModelKind,
    target_model_id: Option<String>,
    from_pool: bool,
}

fn resolve_session(state: &AppState, model_name: &str) -> Result<ResolvedSession, BridgeError> {
    let config = state.config.config();
    let fallback = state.config.fallback_models();
    let fallback_entry = fallback.get(model_name);

    match state.config.get_endpoint(model_name) {
        Some(EndpointEntry::Single(binding)) => Ok(ResolvedSession {
            kind: binding.kind,
            target_model_id: fallback_entry.and_then(|f| f.id.clone()),
            binding,
            from_pool: false,
        }),
        Some(EndpointEntry::Pool(bindings)) if !bindings.is_empty() => {
            let index = state.config.peek_round_robin(model_name, bindings.len());
            let binding = bindings[index].clone();
            info!(
                model = model_name,
                index,
                of = bindings.len(),
                "round-robin binding selected"
            );
            Ok(ResolvedSession {
                kind: binding.kind,
                target_model_id: fallback_entry.and_then(|f| f.id.clone()),
                binding,
                from_pool: true,
            })
        }
        Some(EndpointEntry::Direct(_)) => Err(BridgeError::Internal(
            "direct binding reached the tab path".to_string(),
        )),
        Some(EndpointEntry::Pool(_)) | None => {
            if config.use_default_ids_if_mapping_not_found
                && let Some(session_id) = config.session_id.clone().filter(|s| !s.is_empty())
            {
                return Ok(ResolvedSession {
                    binding: SessionBinding {
                        session_id,
                        mode: None,
                        battle_target: None,
                        kind: fallback_entry.map(|f| f.kind).unwrap_or_default(),
                        max_temperature: None,
                        image_compression: None,
                    },
                    kind: fallback_entry.map(|f| f.kind).unwrap_or_default(),
                    target_model_id: fallback_entry.and_then(|f| f.id.clone()),
                    from_pool: false,
                });
            }
            Err(BridgeError::BadRequest(format!(
                "model '{model_name}' has no configured session binding"
            )))
        }
    }
}

/// Rewrite base64 image payloads in the request through the image pipeline
/// (file-bed upload or optimized re-encode).
async fn preprocess_images(
    state: &Arc<AppState>,
    request: &mut ChatCompletionRequest,
    model_cfg: Option<&ImageCompression>,
) {
    let config = state.config.config();
    let optimization_on = config.image_optimization.enabled
        || model_cfg.and_then(|m| m.enabled).unwrap_or(false);
    if !config.file_bed_enabled && !optimization_on {
        return;
    }

    let request_tag = uuid::Uuid::new_v4().to_string();
    for (msg_index, message) in request.messages.iter_mut().enumerate() {
        match &mut message.content {
            MessageContent::Text(text) => {
                let found = markdown_data_uris(text);
                for (match_index, (alt, uri)) in found.into_iter().enumerate() {
                    let file_name = format!(
                        "{}_{msg_index}_{match_index}_{}.png",
                        message.role,
                        uuid::Uuid::new_v4()
                    );
                    let (processed, err) = state
                        .images
                        .process_image(&uri, &file_name, &request_tag, &config, model_cfg)
                        .await;
                    if let Some(err) = err {
                        warn!(%err, "image preprocessing warning");
                    }
                    let old = format!("![{alt}]({uri})");
                    let new = format!("![{alt}]({processed})");
                    *text = text.replace(&old, &new);
                }
            }
            MessageContent::Parts(parts) => {
                for (part_index, part) in parts.iter_mut().enumerate() {
                    let ContentPart::ImageUrl { image_url } = part else {
                        continue;
                    };
                    if !image_url.url.starts_with("data:") {
                        continue;
                    }
                    let file_name = format!(
                        "{}_{msg_index}_{part_index}_{}.png",
                        message.role,
                        uuid::Uuid::new_v4()
                    );
                    let (processed, err) = state
                        .images
                        .process_image(&image_url.url, &file_name, &request_tag, &config, model_cfg)
                        .await;
                    if let Some(err) = err {
                        warn!(%err, "image preprocessing warning");
                    }
                    image_url.url = processed;
                }
            }
        }
    }
}

async fn fail_admitted(state: &Arc<AppState>, request_id: &str, err: &BridgeError) {
    state.monitoring.request_end(
        request_id,
        RequestOutcome {
            success: false,
            error: Some(err.to_string()),
            ..RequestOutcome::default()
        },
    );
    state.channels.remove_channel(request_id);
    state.channels.remove_metadata(request_id);
}

fn error_json(err: &BridgeError) -> BridgeResponse {
    let mut body = serde_json::json!({
        "error": {
            "message": err.to_string(),
            "type": err.kind(),
        }
    });
    if let BridgeError::VerificationChallenge { remaining_seconds } = err {
        body["error"]["message"] = serde_json::Value::String(format!(
            "Waiting for the human verification cool-down to finish... ({remaining_seconds}s remaining)"
        ));
        body["error"]["retry_after"] = serde_json::json!(remaining_seconds);
    }
    BridgeResponse::json(err.http_status(), &body)
}

fn tail(session_id: &str) -> String {
    let start = session_id.len().saturating_sub(6);
    session_id[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::markdown_data_uris;

    #[test]
    fn finds_only_data_uri_images() {
        let text = "a ![one](data:image/png;base64,AA==) b ![two](https://x/y.png) c \
                    ![three](data:image/jpeg;base64,BB==)";
        let found = markdown_data_uris(text);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, "one");
        assert!(found[1].1.starts_with("data:image/jpeg"));
    }

    #[test]
    fn tolerates_unclosed_markup() {
        assert!(markdown_data_uris("![broken](data:").is_empty());
        assert!(markdown_data_uris("no images").is_empty());
    }
}
