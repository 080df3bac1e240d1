/// Cross-chunk reasoning/content splitter for passthrough streams.
///
/// Content deltas accumulate until the configured separator shows up; bytes
/// before it are re-emitted as `reasoning_content`, bytes after it pass
/// through as `content`. An output cursor tracks what was already sent as
/// reasoning so no byte is ever duplicated between the two channels, and a
/// separator-length tail is held back until the split is decided.
#[derive(Debug)]
pub struct ThinkingSplitter {
    separator: String,
    accumulated: String,
    output_pos: usize,
    done: bool,
    separator_found: bool,
}

impl ThinkingSplitter {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
            accumulated: String::new(),
            output_pos: 0,
            done: false,
            separator_found: false,
        }
    }

    pub fn separator_found(&self) -> bool {
        self.separator_found
    }

    /// Rewrite one SSE chunk. Lines that are not content deltas pass through
    /// unchanged; once the split happened the whole stream passes through.
    pub fn process_chunk(&mut self, chunk: &str) -> String {
        if self.separator.is_empty() || self.done {
            return chunk.to_string();
        }

        let mut result_lines: Vec<String> = Vec::new();
        for line in chunk.split('\n') {
            if self.done {
                result_lines.push(line.to_string());
                continue;
            }
            match self.rewrite_line(line) {
                Some(rewritten) => result_lines.push(rewritten),
                None => {} // held back until more data decides the split
            }
        }
        result_lines.join("\n")
    }

    fn rewrite_line(&mut self, line: &str) -> Option<String> {
        let Some(data) = line.strip_prefix("data: ") else {
            return Some(line.to_string());
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return Some(line.to_string());
        }
        let Ok(mut value) = serde_json::from_str::<serde_json::Value>(data) else {
            return Some(line.to_string());
        };
        let Some(content) = value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str())
            .map(|c| c.to_string())
        else {
            return Some(line.to_string());
        };
        if content.is_empty() {
            return Some(line.to_string());
        }

        self.accumulated.push_str(&content);

        if let Some(found) = self.accumulated.find(&self.separator) {
            self.separator_found = true;
            self.done = true;

            let reasoning_tail = &self.accumulated[self.output_pos..found];
            let content_part = &self.accumulated[found + self.separator.len()..];

            let mut delta = serde_json::Map::new();
            if !reasoning_tail.is_empty() {
                delta.insert(
                    "reasoning_content".to_string(),
                    serde_json::Value::String(reasoning_tail.to_string()),
                );
            }
            if !content_part.is_empty() {
                delta.insert(
                    "content".to_string(),
                    serde_json::Value::String(content_part.to_string()),
                );
            }
            if delta.is_empty() {
                return None;
            }
            value["choices"][0]["delta"] = serde_json::Value::Object(delta);
            return Some(format!("data: {value}"));
        }

        // No separator yet: emit everything except a tail that could be the
        // start of one.
        let safe = floor_char_boundary(
            &self.accumulated,
            self.accumulated
                .len()
                .saturating_sub(self.separator.len())
                .max(self.output_pos),
        );
        if safe <= self.output_pos {
            return None;
        }
        let reasoning = self.accumulated[self.output_pos..safe].to_string();
        self.output_pos = safe;

        let mut delta = serde_json::Map::new();
        delta.insert(
            "reasoning_content".to_string(),
            serde_json::Value::String(reasoning),
        );
        value["choices"][0]["delta"] = serde_json::Value::Object(delta);
        Some(format!("data: {value}"))
    }

    /// Aggregated-body variant: split once on the first separator occurrence.
    pub fn split_final(content: &str, separator: &str) -> (String, String) {
        if separator.is_empty() {
            return (String::new(), content.to_string());
        }
        match content.find(separator) {
            Some(idx) => (
                content[..idx].trim().to_string(),
                content[idx + separator.len()..].trim().to_string(),
            ),
            None => (String::new(), content.to_string()),
        }
    }
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content_line(text: &str) -> String {
        format!(
            "data: {}",
            serde_json::json!({"choices": [{"index": 0, "delta": {"content": text}}]})
        )
    }

    fn extract_deltas(processed: &str) -> (String, String) {
        let mut reasoning = String::new();
        let mut content = String::new();
        for line in processed.lines() {
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
                continue;
            };
            let delta = &value["choices"][0]["delta"];
            if let Some(r) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
                reasoning.push_str(r);
            }
            if let Some(c) = delta.get("content").and_then(|v| v.as_str()) {
                content.push_str(c);
            }
        }
        (reasoning, content)
    }

    #[test]
    fn split_separates_without_duplication() {
        let mut splitter = ThinkingSplitter::new("\n---\n");
        let mut output = String::new();
        output.push_str(&splitter.process_chunk(&content_line("reasoning A\n")));
        output.push('\n');
        output.push_str(&splitter.process_chunk(&content_line("reasoning B\n---\nfinal answer")));

        let (reasoning, content) = extract_deltas(&output);
        // The newline before the separator belongs to the separator itself.
        assert_eq!(reasoning, "reasoning A\nreasoning B");
        assert_eq!(content, "final answer");
        assert!(splitter.separator_found());
    }

    #[test]
    fn separator_split_across_chunks() {
        let mut splitter = ThinkingSplitter::new("---");
        let mut output = String::new();
        output.push_str(&splitter.process_chunk(&content_line("think -")));
        output.push('\n');
        output.push_str(&splitter.process_chunk(&content_line("--done")));

        let (reasoning, content) = extract_deltas(&output);
        assert_eq!(reasoning, "think ");
        assert_eq!(content, "done");
    }

    #[test]
    fn post_split_chunks_pass_through_untouched() {
        let mut splitter = ThinkingSplitter::new("|");
        splitter.process_chunk(&content_line("a|b"));
        let line = content_line("later content");
        assert_eq!(splitter.process_chunk(&line), line);
    }

    #[test]
    fn no_separator_configured_is_identity() {
        let mut splitter = ThinkingSplitter::new("");
        let line = content_line("untouched");
        assert_eq!(splitter.process_chunk(&line), line);
    }

    #[test]
    fn non_content_lines_are_preserved() {
        let mut splitter = ThinkingSplitter::new("---");
        assert_eq!(splitter.process_chunk("data: [DONE]"), "data: [DONE]");
        assert_eq!(splitter.process_chunk(": keep-alive"), ": keep-alive");
    }

    #[test]
    fn multibyte_tail_never_splits_a_character() {
        let mut splitter = ThinkingSplitter::new("--");
        // The held-back tail boundary lands inside a multibyte char.
        let out = splitter.process_chunk(&content_line("héllo wörld"));
        let (reasoning, content) = extract_deltas(&out);
        assert!(content.is_empty());
        assert!("héllo wörld".starts_with(&reasoning));
    }

    #[test]
    fn final_split_trims_both_sides() {
        let (reasoning, content) = ThinkingSplitter::split_final("think\n---\nanswer", "\n---\n");
        assert_eq!(reasoning, "think");
        assert_eq!(content, "answer");

        let (reasoning, content) = ThinkingSplitter::split_final("plain", "---");
        assert_eq!(reasoning, "");
        assert_eq!(content, "plain");
    }
}
