use std::convert::Infallible;

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use lmbridge_core::respond::{BridgeResponse, ResponseBody};

/// Uniform conversion of core responses into axum responses. SSE bodies get
/// the no-buffering hints reverse proxies look for.
pub fn to_axum_response(resp: BridgeResponse) -> Response {
    let sse = matches!(resp.body, ResponseBody::Stream(_)) && resp.content_type == "text/event-stream";

    let mut builder = Response::builder()
        .status(resp.status)
        .header(header::CONTENT_TYPE, resp.content_type);
    if sse && let Some(headers) = builder.headers_mut() {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream; charset=utf-8"),
        );
    }

    let body = match resp.body {
        ResponseBody::Bytes(bytes) => Body::from(bytes),
        ResponseBody::Stream(rx) => {
            Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>))
        }
    };

    builder.body(body).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "response_build_failed").into_response()
    })
}

/// Plain JSON error in the bridge's error-body shape.
pub fn error_response(status: u16, kind: &str, message: impl Into<String>) -> Response {
    let value = serde_json::json!({
        "error": {
            "message": message.into(),
            "type": kind,
        }
    });
    to_axum_response(BridgeResponse::json(status, &value))
}
