mod cost;
mod gemini;
mod passthrough;
mod sse_lines;
mod thinking;

pub use cost::{CostInfo, calculate_cost};
pub use gemini::{gemini_to_openai, gemini_url, openai_to_gemini_request};
pub use thinking::ThinkingSplitter;

use std::sync::Arc;

use tracing::info;

use lmbridge_config::{DirectApiType, DirectBinding};
use lmbridge_core::respond::BridgeResponse;
use lmbridge_core::state::AppState;
use lmbridge_protocol::openai::request::ChatCompletionRequest;

/// Entry point for direct-API bindings: route to the Gemini-native
/// translator or the OpenAI-compatible passthrough.
pub async fn handle_direct_request(
    state: Arc<AppState>,
    model_name: &str,
    binding: DirectBinding,
    request: ChatCompletionRequest,
) -> BridgeResponse {
    let request_id = uuid::Uuid::new_v4().to_string();
    let display_name = binding.display_name(model_name).to_string();
    let mode = match binding.api_type {
        DirectApiType::GeminiNative => "gemini_native",
        DirectApiType::OpenAiCompatible => "direct_api_passthrough",
    };
    info!(model = %display_name, mode, "direct upstream request");

    state.monitoring.request_start(
        &request_id,
        &display_name,
        Some(mode.to_string()),
        None,
        request.messages.clone(),
        serde_json::json!({
            "temperature": request.temperature,
            "top_p": request.top_p,
            "max_tokens": request.max_tokens,
            "streaming": request.is_stream(),
        }),
    );

    if binding.api_type == DirectApiType::GeminiNative || binding.use_native_format {
        return gemini::handle(state, request_id, model_name, binding, request).await;
    }
    if binding.passthrough {
        return passthrough::handle(state, request_id, model_name, binding, request).await;
    }

    state.monitoring.request_end(
        &request_id,
        lmbridge_core::monitoring::RequestOutcome {
            success: false,
            error: Some("conversion mode not supported".to_string()),
            ..Default::default()
        },
    );
    BridgeResponse::json(
        501,
        &serde_json::json!({
            "error": {
                "message": "Direct API conversion mode is not implemented; set passthrough: true.",
                "type": "unsupported_operation",
            }
        }),
    )
}
