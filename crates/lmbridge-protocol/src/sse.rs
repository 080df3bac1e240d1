use bytes::Bytes;
use serde::Serialize;

/// Encode one payload as a `data:` SSE event.
pub fn encode_data<T: Serialize>(payload: &T) -> Bytes {
    match serde_json::to_string(payload) {
        Ok(json) => Bytes::from(format!("data: {json}\n\n")),
        Err(_) => Bytes::from_static(b""),
    }
}

/// Terminal marker. Emitted exactly once per stream, always last.
pub fn encode_done() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

/// SSE comment line, ignored by compliant clients.
pub fn encode_comment(text: &str) -> Bytes {
    Bytes::from(format!(": {text}\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_event_is_framed() {
        let bytes = encode_data(&serde_json::json!({"a": 1}));
        assert_eq!(&bytes[..], b"data: {\"a\":1}\n\n");
    }

    #[test]
    fn done_is_terminal_shape() {
        assert_eq!(&encode_done()[..], b"data: [DONE]\n\n");
    }
}
