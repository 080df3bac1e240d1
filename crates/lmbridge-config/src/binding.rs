use serde::{Deserialize, Serialize};

use crate::types::ImageCompression;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    DirectChat,
    Battle,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::DirectChat => "direct_chat",
            SessionMode::Battle => "battle",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    #[default]
    Text,
    Image,
    Search,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Text => "text",
            ModelKind::Image => "image",
            ModelKind::Search => "search",
        }
    }
}

/// One arena session bound to a model name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionBinding {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SessionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battle_target: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: ModelKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_compression: Option<ImageCompression>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectApiType {
    #[serde(rename = "direct_api")]
    OpenAiCompatible,
    #[serde(rename = "gemini_native")]
    GeminiNative,
}

/// A model served by calling a third-party API instead of a browser tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectBinding {
    pub api_type: DirectApiType,
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub passthrough: bool,
    #[serde(default)]
    pub use_native_format: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_separator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_params: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub enable_prefix: bool,
    #[serde(default = "default_enable_thinking")]
    pub enable_thinking: bool,
    #[serde(default = "default_thinking_budget")]
    pub thinking_budget: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<Pricing>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_compression: Option<ImageCompression>,
    #[serde(rename = "type", default)]
    pub kind: ModelKind,
}

fn default_enable_thinking() -> bool {
    true
}

fn default_thinking_budget() -> i64 {
    20_000
}

impl DirectBinding {
    pub fn target_model_id<'a>(&'a self, model_name: &'a str) -> &'a str {
        self.model_id.as_deref().unwrap_or(model_name)
    }

    pub fn display_name<'a>(&'a self, model_name: &'a str) -> &'a str {
        self.display_name.as_deref().unwrap_or(model_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pricing {
    pub input: f64,
    pub output: f64,
    pub unit: f64,
    pub currency: String,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            input: 0.0,
            output: 0.0,
            unit: 1_000_000.0,
            currency: "USD".to_string(),
        }
    }
}

/// What one model name maps to. A one-element list stays a `Pool`; only a
/// bare object is a `Single`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EndpointEntry {
    Direct(Box<DirectBinding>),
    Single(SessionBinding),
    Pool(Vec<SessionBinding>),
}

impl EndpointEntry {
    /// Model kind advertised by this entry (first pool member for lists).
    pub fn kind(&self) -> ModelKind {
        match self {
            EndpointEntry::Direct(binding) => binding.kind,
            EndpointEntry::Single(binding) => binding.kind,
            EndpointEntry::Pool(bindings) => {
                bindings.first().map(|b| b.kind).unwrap_or_default()
            }
        }
    }

    /// Image-compression block used for preprocessing (pool: first member).
    pub fn image_compression(&self) -> Option<&ImageCompression> {
        match self {
            EndpointEntry::Direct(binding) => binding.image_compression.as_ref(),
            EndpointEntry::Single(binding) => binding.image_compression.as_ref(),
            EndpointEntry::Pool(bindings) => {
                bindings.first().and_then(|b| b.image_compression.as_ref())
            }
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, EndpointEntry::Direct(_))
    }

    pub fn pool_len(&self) -> Option<usize> {
        match self {
            EndpointEntry::Pool(bindings) => Some(bindings.len()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_binding_wins_over_session_shape() {
        let entry: EndpointEntry = serde_json::from_value(serde_json::json!({
            "api_type": "direct_api",
            "api_key": "sk-x",
            "api_base_url": "https://api.example.com/v1",
            "model_id": "real-model",
            "passthrough": true
        }))
        .unwrap();
        assert!(entry.is_direct());
    }

    #[test]
    fn single_session_binding_parses() {
        let entry: EndpointEntry = serde_json::from_value(serde_json::json!({
            "session_id": "abc",
            "mode": "battle",
            "battle_target": "b",
            "type": "image",
            "max_temperature": 0.7
        }))
        .unwrap();
        match entry {
            EndpointEntry::Single(binding) => {
                assert_eq!(binding.mode, Some(SessionMode::Battle));
                assert_eq!(binding.kind, ModelKind::Image);
                assert_eq!(binding.max_temperature, Some(0.7));
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn one_element_list_stays_a_pool() {
        let entry: EndpointEntry =
            serde_json::from_value(serde_json::json!([{"session_id": "only"}])).unwrap();
        assert_eq!(entry.pool_len(), Some(1));
    }

    #[test]
    fn gemini_native_defaults() {
        let entry: EndpointEntry = serde_json::from_value(serde_json::json!({
            "api_type": "gemini_native",
            "api_key": "k"
        }))
        .unwrap();
        match entry {
            EndpointEntry::Direct(binding) => {
                assert_eq!(binding.api_type, DirectApiType::GeminiNative);
                assert!(binding.enable_thinking);
                assert_eq!(binding.thinking_budget, 20_000);
                assert_eq!(binding.target_model_id("alias"), "alias");
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }
}
