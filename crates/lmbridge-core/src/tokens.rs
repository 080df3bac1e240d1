use std::sync::LazyLock;

use tiktoken_rs::CoreBPE;
use tracing::warn;

use lmbridge_config::BridgeConfig;
use lmbridge_protocol::openai::types::ChatMessage;

static CL100K: LazyLock<Option<CoreBPE>> = LazyLock::new(|| match tiktoken_rs::cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(err) => {
        warn!(%err, "cl100k_base unavailable; falling back to length heuristic");
        None
    }
});

static O200K: LazyLock<Option<CoreBPE>> = LazyLock::new(|| match tiktoken_rs::o200k_base() {
    Ok(bpe) => Some(bpe),
    Err(err) => {
        warn!(%err, "o200k_base unavailable; falling back to length heuristic");
        None
    }
});

/// Tokenizer tag for a model, per the config map.
pub fn tokenizer_tag(model: &str, config: &BridgeConfig) -> String {
    config
        .tokenizers
        .get(model)
        .cloned()
        .unwrap_or_else(|| config.default_tokenizer.clone())
}

fn encoder_for(tag: &str) -> Option<&'static CoreBPE> {
    match tag {
        "o200k_base" => O200K.as_ref(),
        _ => CL100K.as_ref(),
    }
}

/// Token count of one text. `len/4` when the encoder is unavailable.
pub fn estimate_text_tokens(text: &str, tag: &str) -> u64 {
    match encoder_for(tag) {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
        None => (text.len() / 4) as u64,
    }
}

/// Input-token estimate over a message list: per-message framing overhead
/// plus the textual content.
pub fn estimate_message_tokens(messages: &[ChatMessage], tag: &str) -> u64 {
    let mut total = 2u64;
    for message in messages {
        total += 4;
        total += estimate_text_tokens(&message.text_content(), tag);
        total += estimate_text_tokens(&message.role, tag);
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_tokens_are_positive_for_nonempty_text() {
        assert!(estimate_text_tokens("hello world, how are you?", "cl100k_base") > 0);
    }

    #[test]
    fn message_estimate_exceeds_content_estimate() {
        let messages = vec![ChatMessage::text("user", "hi there")];
        let content_only = estimate_text_tokens("hi there", "cl100k_base");
        assert!(estimate_message_tokens(&messages, "cl100k_base") > content_only);
    }

    #[test]
    fn tag_resolution_prefers_model_entry() {
        let mut config = BridgeConfig::default();
        config
            .tokenizers
            .insert("gpt-x".to_string(), "o200k_base".to_string());
        assert_eq!(tokenizer_tag("gpt-x", &config), "o200k_base");
        assert_eq!(tokenizer_tag("other", &config), "cl100k_base");
    }
}
