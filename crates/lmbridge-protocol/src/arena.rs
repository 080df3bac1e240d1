//! Tokenizer for the concatenable byte stream the arena page relays through
//! a tab. Frames arrive as arbitrary fragments; a running buffer accumulates
//! them and complete tokens are cut out as they become recognizable, in the
//! same push/drain shape as [`crate::sse`].
//!
//! Grammar (one prefix per token, `a`/`b` distinguishing the two battle
//! sides):
//!
//! - `a0:"…"` / `b0:"…"`   JSON-escaped text fragment
//! - `ag:"…"`              JSON-escaped reasoning fragment
//! - `a2:[…]` / `b2:[…]`   image attachment list
//! - `ad:{…}` / `bd:{…}`   finish object carrying `finishReason` and usage
//! - `{"error": …}`        upstream error object
//! - `a3:` `ae:` `b3:` `be:` control markers, recognized and dropped

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

static TEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[ab]0:"((?:\\.|[^"\\])*)""#).expect("text pattern"));
static REASONING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"ag:"((?:\\.|[^"\\])*)""#).expect("reasoning pattern"));
static IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ab]2:(\[.*?\])").expect("image pattern"));
static FINISH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[ab]d:(\{.*?"finishReason".*?\})"#).expect("finish pattern"));
static ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)(\{\s*"error".*?\})"#).expect("error pattern"));
// Truncated text fragment, only used by the terminal drain.
static PARTIAL_TEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[ab]0:"([^"]*)"#).expect("partial text pattern"));

const CHALLENGE_MARKERS: [&str; 2] = [
    "<title>Just a moment...</title>",
    "Enable JavaScript and cookies to continue",
];

// `ad:`/`bd:` are finish-token prefixes, not control markers.
const CONTROL_PREFIXES: [&str; 4] = ["a3:", "ae:", "b3:", "be:"];

#[derive(Debug, Clone, PartialEq)]
pub enum ArenaToken {
    Text(String),
    Reasoning(String),
    Image(String),
    Finish {
        reason: String,
        usage: Option<serde_json::Value>,
    },
    Error(String),
}

/// Does this text look like a human-verification interstitial?
pub fn contains_challenge(text: &str) -> bool {
    CHALLENGE_MARKERS.iter().any(|marker| text.contains(marker))
}

#[derive(Debug, Default)]
pub struct ArenaScanner {
    buffer: String,
}

impl ArenaScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn challenge_pending(&self) -> bool {
        contains_challenge(&self.buffer)
    }

    /// Append a fragment and cut out every complete token. Reasoning tokens
    /// are extracted before text tokens, so within one returned batch a
    /// reasoning fragment always precedes the content that followed it.
    pub fn push(&mut self, chunk: &str) -> Vec<ArenaToken> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();

        if let Some(error) = self.extract_error() {
            out.push(error);
            return out;
        }

        self.extract_reasoning(&mut out);
        self.extract_text(&mut out, &TEXT_RE);
        self.extract_images(&mut out);
        self.extract_finish(&mut out);

        out
    }

    /// Terminal sweep after `[DONE]`: flush whatever the strict patterns can
    /// still cut out, then salvage a truncated trailing text fragment, then
    /// classify the residue (control markers are dropped; printable residue
    /// that is neither JSON-shaped nor control-marked becomes plain text).
    pub fn drain(&mut self) -> Vec<ArenaToken> {
        let mut out = Vec::new();

        self.extract_text(&mut out, &TEXT_RE);
        self.extract_reasoning(&mut out);
        self.extract_images(&mut out);
        self.extract_finish(&mut out);

        if let Some(m) = PARTIAL_TEXT_RE.captures(&self.buffer) {
            let (text, end) = (m.get(1).map(|g| g.as_str().to_string()), m.get(0).unwrap().end());
            if let Some(text) = text
                && !text.is_empty()
                && let Some(decoded) = decode_escaped(&text)
                && !decoded.is_empty()
            {
                out.push(ArenaToken::Text(decoded));
            }
            self.buffer.drain(..end);
        }

        let residue = std::mem::take(&mut self.buffer);
        let trimmed = residue.trim();
        if trimmed.is_empty() {
            return out;
        }
        if CONTROL_PREFIXES.iter().any(|p| residue.contains(p)) {
            // Corrupted control marker bytes; drop rather than guess.
            debug!(residue = %trimmed, "dropping control-prefix residue");
            return out;
        }
        if trimmed.starts_with('[') || trimmed.starts_with('{') {
            return out;
        }
        let salvage: String = residue
            .chars()
            .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
            .collect();
        if !salvage.trim().is_empty() {
            out.push(ArenaToken::Text(salvage));
        }
        out
    }

    fn extract_error(&mut self) -> Option<ArenaToken> {
        let captures = ERROR_RE.captures(&self.buffer)?;
        let raw = captures.get(1)?.as_str();
        let parsed: serde_json::Value = serde_json::from_str(raw).ok()?;
        let message = match parsed.get("error")? {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        self.buffer.clear();
        Some(ArenaToken::Error(message))
    }

    fn extract_reasoning(&mut self, out: &mut Vec<ArenaToken>) {
        while let Some(m) = REASONING_RE.captures(&self.buffer) {
            let span = m.get(0).unwrap().range();
            if let Some(decoded) = m.get(1).and_then(|g| decode_escaped(g.as_str()))
                && !decoded.is_empty()
            {
                out.push(ArenaToken::Reasoning(decoded));
            }
            // Cut only the matched span; text tokens around it stay intact.
            self.buffer.replace_range(span, "");
        }
    }

    fn extract_text(&mut self, out: &mut Vec<ArenaToken>, pattern: &Regex) {
        while let Some(m) = pattern.captures(&self.buffer) {
            let span = m.get(0).unwrap().range();
            // A fragment that fails to decode is still consumed so the
            // buffer cannot loop on it.
            if let Some(decoded) = m.get(1).and_then(|g| decode_escaped(g.as_str()))
                && !decoded.is_empty()
            {
                out.push(ArenaToken::Text(decoded));
            }
            self.buffer.replace_range(span, "");
        }
    }

    fn extract_images(&mut self, out: &mut Vec<ArenaToken>) {
        while let Some(m) = IMAGE_RE.captures(&self.buffer) {
            let span = m.get(0).unwrap().range();
            if let Some(raw) = m.get(1)
                && let Ok(serde_json::Value::Array(items)) =
                    serde_json::from_str::<serde_json::Value>(raw.as_str())
            {
                for item in items {
                    if item.get("type").and_then(|t| t.as_str()) == Some("image")
                        && let Some(url) = item.get("image").and_then(|u| u.as_str())
                    {
                        out.push(ArenaToken::Image(url.to_string()));
                    }
                }
            }
            self.buffer.replace_range(span, "");
        }
    }

    fn extract_finish(&mut self, out: &mut Vec<ArenaToken>) {
        while let Some(m) = FINISH_RE.captures(&self.buffer) {
            let span = m.get(0).unwrap().range();
            if let Some(raw) = m.get(1)
                && let Ok(parsed) = serde_json::from_str::<serde_json::Value>(raw.as_str())
            {
                let reason = parsed
                    .get("finishReason")
                    .and_then(|r| r.as_str())
                    .unwrap_or("stop")
                    .to_string();
                let usage = parsed
                    .get("usage")
                    .cloned()
                    .or_else(|| parsed.get("tokenUsage").cloned());
                out.push(ArenaToken::Finish { reason, usage });
            }
            self.buffer.replace_range(span, "");
        }
    }
}

fn decode_escaped(escaped: &str) -> Option<String> {
    serde_json::from_str::<String>(&format!("\"{escaped}\"")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_tokens_decode_escapes() {
        let mut scanner = ArenaScanner::new();
        let tokens = scanner.push(r#"a0:"Hello \"world\"\n""#);
        assert_eq!(tokens, vec![ArenaToken::Text("Hello \"world\"\n".to_string())]);
        assert!(scanner.buffer().is_empty());
    }

    #[test]
    fn fragment_split_across_pushes() {
        let mut scanner = ArenaScanner::new();
        assert!(scanner.push(r#"a0:"par"#).is_empty());
        let tokens = scanner.push(r#"tial""#);
        assert_eq!(tokens, vec![ArenaToken::Text("partial".to_string())]);
    }

    #[test]
    fn secondary_side_text_recognized() {
        let mut scanner = ArenaScanner::new();
        let tokens = scanner.push(r#"b0:"side b""#);
        assert_eq!(tokens, vec![ArenaToken::Text("side b".to_string())]);
    }

    #[test]
    fn reasoning_precedes_text_in_batch() {
        let mut scanner = ArenaScanner::new();
        let tokens = scanner.push(r#"a0:"answer"ag:"thinking""#);
        assert_eq!(
            tokens,
            vec![
                ArenaToken::Reasoning("thinking".to_string()),
                ArenaToken::Text("answer".to_string()),
            ]
        );
    }

    #[test]
    fn finish_carries_reason_and_usage() {
        let mut scanner = ArenaScanner::new();
        let tokens =
            scanner.push(r#"ad:{"finishReason":"stop","usage":{"inputTokens":3,"outputTokens":7}}"#);
        match &tokens[0] {
            ArenaToken::Finish { reason, usage } => {
                assert_eq!(reason, "stop");
                assert_eq!(usage.as_ref().unwrap()["inputTokens"], 3);
            }
            other => panic!("unexpected token: {other:?}"),
        }
    }

    #[test]
    fn image_list_yields_urls() {
        let mut scanner = ArenaScanner::new();
        let tokens =
            scanner.push(r#"a2:[{"type":"image","image":"https://img.example/x.png"}]"#);
        assert_eq!(
            tokens,
            vec![ArenaToken::Image("https://img.example/x.png".to_string())]
        );
    }

    #[test]
    fn error_object_wins() {
        let mut scanner = ArenaScanner::new();
        let tokens = scanner.push(r#"{"error": "rate limited"}"#);
        assert_eq!(tokens, vec![ArenaToken::Error("rate limited".to_string())]);
    }

    #[test]
    fn challenge_markers_detected() {
        assert!(contains_challenge("x<title>Just a moment...</title>y"));
        assert!(!contains_challenge(r#"a0:"just text""#));
    }

    #[test]
    fn drain_salvages_truncated_text() {
        let mut scanner = ArenaScanner::new();
        scanner.push(r#"a0:"cut of"#);
        let tokens = scanner.drain();
        assert_eq!(tokens, vec![ArenaToken::Text("cut of".to_string())]);
        assert!(scanner.buffer().is_empty());
    }

    #[test]
    fn drain_drops_control_residue() {
        let mut scanner = ArenaScanner::new();
        scanner.push("ae:12,");
        assert!(scanner.drain().is_empty());
    }

    #[test]
    fn drain_salvages_plain_residue() {
        let mut scanner = ArenaScanner::new();
        scanner.push("loose words");
        let tokens = scanner.drain();
        assert_eq!(tokens, vec![ArenaToken::Text("loose words".to_string())]);
    }

    #[test]
    fn empty_text_fragments_are_consumed_silently() {
        let mut scanner = ArenaScanner::new();
        let tokens = scanner.push(r#"a0:""a0:"next""#);
        assert_eq!(tokens, vec![ArenaToken::Text("next".to_string())]);
    }
}
