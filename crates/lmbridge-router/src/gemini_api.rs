use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use lmbridge_config::{DirectApiType, EndpointEntry};
use lmbridge_core::AppState;
use lmbridge_core::http::HttpBody;
use lmbridge_core::respond::{BridgeResponse, ResponseBody};
use lmbridge_direct::gemini_url;

use crate::convert::{error_response, to_axum_response};

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(1200);

/// `GET /v1beta/models`: the models whose binding is Gemini-native.
pub async fn list_models(State(state): State<Arc<AppState>>) -> Response {
    let endpoints = state.config.endpoints();
    let mut models: Vec<serde_json::Value> = endpoints
        .iter()
        .filter_map(|(name, entry)| match entry {
            EndpointEntry::Direct(binding) if binding.api_type == DirectApiType::GeminiNative => {
                Some(serde_json::json!({
                    "name": format!("models/{name}"),
                    "displayName": binding.display_name(name),
                    "supportedGenerationMethods": ["generateContent", "streamGenerateContent"],
                }))
            }
            _ => None,
        })
        .collect();
    models.sort_by_key(|m| m["name"].as_str().unwrap_or("").to_string());
    Json(serde_json::json!({"models": models})).into_response()
}

/// `POST /v1beta/models/<model>:(generateContent|streamGenerateContent)` —
/// native passthrough: the caller already speaks Gemini, the bridge only
/// swaps in the configured upstream and key.
pub async fn generate(
    State(state): State<Arc<AppState>>,
    Path(model_action): Path<String>,
    body: Bytes,
) -> Response {
    state.touch_activity();

    let raw = model_action.trim_start_matches('/');
    let Some((model, action)) = raw.split_once(':') else {
        return error_response(400, "invalid_request", "expected <model>:<action>");
    };
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        _ => return error_response(404, "invalid_request", "unknown action"),
    };

    let Some(EndpointEntry::Direct(binding)) = state.config.get_endpoint(model) else {
        return error_response(404, "invalid_request", "model is not a gemini_native binding");
    };
    if binding.api_type != DirectApiType::GeminiNative {
        return error_response(404, "invalid_request", "model is not a gemini_native binding");
    }

    let body_json: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            return error_response(400, "invalid_request", format!("bad JSON body: {err}"));
        }
    };

    let url = gemini_url(
        binding.api_base_url.as_deref(),
        binding.target_model_id(model),
        &binding.api_key,
        stream,
    );
    match state
        .http
        .post_json(&url, &[], &body_json, stream, UPSTREAM_TIMEOUT)
        .await
    {
        Ok(response) => {
            let content_type = if stream && matches!(response.body, HttpBody::Stream(_)) {
                "text/event-stream"
            } else {
                "application/json"
            };
            let bridge = BridgeResponse {
                status: response.status,
                content_type,
                body: match response.body {
                    HttpBody::Bytes(bytes) => ResponseBody::Bytes(bytes),
                    HttpBody::Stream(rx) => ResponseBody::Stream(rx),
                },
            };
            to_axum_response(bridge)
        }
        Err(err) => error_response(502, "direct_api_error", err),
    }
}
