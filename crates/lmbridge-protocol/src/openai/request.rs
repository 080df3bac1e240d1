use serde::{Deserialize, Serialize};

use super::types::ChatMessage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    /// Everything else is relayed verbatim in passthrough mode and ignored on
    /// the browser-tab path.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChatCompletionRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Clamp `temperature` to a per-binding ceiling.
    pub fn cap_temperature(&mut self, max_temperature: f64) -> Option<f64> {
        let current = self.temperature?;
        if current > max_temperature {
            self.temperature = Some(max_temperature);
            return Some(current);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_temperature_only_lowers() {
        let mut req: ChatCompletionRequest =
            serde_json::from_value(serde_json::json!({"model": "m", "temperature": 1.5})).unwrap();
        assert_eq!(req.cap_temperature(0.7), Some(1.5));
        assert_eq!(req.temperature, Some(0.7));
        assert_eq!(req.cap_temperature(0.9), None);
        assert_eq!(req.temperature, Some(0.7));
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let raw = serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "logit_bias": {"50256": -100}
        });
        let req: ChatCompletionRequest = serde_json::from_value(raw).unwrap();
        assert!(req.extra.contains_key("logit_bias"));
        let back = serde_json::to_value(&req).unwrap();
        assert_eq!(back["logit_bias"]["50256"], -100);
    }
}
