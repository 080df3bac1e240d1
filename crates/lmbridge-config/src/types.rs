use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Global bridge configuration, loaded from `config.jsonc`. Unknown fields
/// are ignored so older/newer config files keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Optional bearer key required on the OpenAI surface (skipped for
    /// direct-API models).
    pub api_key: Option<String>,

    /// Global fallback session used when a model has no mapping.
    pub session_id: Option<String>,
    pub default_mode: String,
    pub default_battle_target: String,
    pub use_default_ids_if_mapping_not_found: bool,

    pub tavern_mode_enabled: bool,
    pub message_role_conversion_mode: RoleConversionMode,
    pub merge_preserve_role_labels: bool,

    pub bypass_enabled: bool,
    pub bypass_settings: HashMap<String, bool>,
    pub bypass_injection: BypassInjection,
    /// Per-model-kind toggle for the image/text split workaround.
    pub attachment_bypass_settings: HashMap<String, bool>,

    pub enable_reasoning_output: bool,
    pub reasoning_output_mode: ReasoningMode,
    pub preserve_streaming: bool,
    pub strip_reasoning_from_history: bool,

    pub enable_auto_retry: bool,
    pub retry_timeout_seconds: u64,
    pub stream_response_timeout_seconds: u64,
    pub active_request_timeout_seconds: u64,
    pub max_request_transfers: u32,

    pub enable_idle_restart: bool,
    /// -1 disables the check while keeping the watchdog task alive.
    pub idle_restart_timeout_seconds: i64,

    pub verification: VerificationConfig,

    pub file_bed_enabled: bool,
    pub file_bed_endpoints: Vec<FilebedEndpoint>,
    pub file_bed_selection_strategy: FilebedStrategy,
    pub filebed_recovery_seconds: u64,

    pub image_optimization: ImageOptimization,
    pub processed_image_cache: CacheConfig,
    pub image_return_format: ImageReturnFormat,
    pub save_images_locally: bool,
    pub local_save_format: LocalSaveFormat,

    pub empty_response_retry: EmptyResponseRetry,

    pub max_concurrent_downloads: usize,
    pub download_timeout: DownloadTimeouts,

    /// Model name → tokenizer tag (`cl100k_base`, `o200k_base`, ...).
    pub tokenizers: HashMap<String, String>,
    pub default_tokenizer: String,

    pub request_details_limit: usize,
    pub request_details_max_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            session_id: None,
            default_mode: "direct_chat".to_string(),
            default_battle_target: "A".to_string(),
            use_default_ids_if_mapping_not_found: true,
            tavern_mode_enabled: false,
            message_role_conversion_mode: RoleConversionMode::None,
            merge_preserve_role_labels: false,
            bypass_enabled: false,
            bypass_settings: HashMap::new(),
            bypass_injection: BypassInjection::default(),
            attachment_bypass_settings: HashMap::new(),
            enable_reasoning_output: false,
            reasoning_output_mode: ReasoningMode::Openai,
            preserve_streaming: true,
            strip_reasoning_from_history: true,
            enable_auto_retry: false,
            retry_timeout_seconds: 120,
            stream_response_timeout_seconds: 360,
            active_request_timeout_seconds: 600,
            max_request_transfers: 3,
            enable_idle_restart: false,
            idle_restart_timeout_seconds: 300,
            verification: VerificationConfig::default(),
            file_bed_enabled: false,
            file_bed_endpoints: Vec::new(),
            file_bed_selection_strategy: FilebedStrategy::Random,
            filebed_recovery_seconds: 300,
            image_optimization: ImageOptimization::default(),
            processed_image_cache: CacheConfig::default(),
            image_return_format: ImageReturnFormat::default(),
            save_images_locally: true,
            local_save_format: LocalSaveFormat::default(),
            empty_response_retry: EmptyResponseRetry::default(),
            max_concurrent_downloads: 50,
            download_timeout: DownloadTimeouts::default(),
            tokenizers: HashMap::new(),
            default_tokenizer: "cl100k_base".to_string(),
            request_details_limit: 10_000,
            request_details_max_bytes: 32 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleConversionMode {
    #[default]
    None,
    SystemToUser,
    SystemMerge,
    SystemSmartMerge,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningMode {
    #[default]
    Openai,
    ThinkTag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BypassInjection {
    pub presets: HashMap<String, InjectionSpec>,
    pub active_preset: String,
    pub custom: Option<InjectionSpec>,
}

impl Default for BypassInjection {
    fn default() -> Self {
        Self {
            presets: HashMap::new(),
            active_preset: "default".to_string(),
            custom: None,
        }
    }
}

impl BypassInjection {
    /// Messages of the active preset, falling back to the explicit `custom`
    /// object (or a blank user message) when the preset name is unknown.
    pub fn active_messages(&self) -> Vec<InjectionMessage> {
        if let Some(preset) = self.presets.get(&self.active_preset) {
            return preset.messages();
        }
        match &self.custom {
            Some(spec) => spec.messages(),
            None => vec![InjectionMessage::default()],
        }
    }
}

/// A preset is either one message or a list of messages to append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InjectionSpec {
    Many(Vec<InjectionMessage>),
    One(InjectionMessage),
}

impl InjectionSpec {
    pub fn messages(&self) -> Vec<InjectionMessage> {
        match self {
            InjectionSpec::One(message) => vec![message.clone()],
            InjectionSpec::Many(messages) => messages.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionMessage {
    pub role: String,
    pub content: String,
    #[serde(
        rename = "participantPosition",
        skip_serializing_if = "Option::is_none"
    )]
    pub participant_position: Option<String>,
}

impl Default for InjectionMessage {
    fn default() -> Self {
        Self {
            role: "user".to_string(),
            content: " ".to_string(),
            participant_position: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub cooldown_seconds: u64,
    /// Subtracted from the client-visible remaining time only; the actual
    /// timer is untouched.
    pub display_skew_seconds: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: 25,
            display_skew_seconds: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilebedEndpoint {
    pub name: String,
    pub url: String,
    pub api_key: Option<String>,
    pub enabled: bool,
}

impl Default for FilebedEndpoint {
    fn default() -> Self {
        Self {
            name: String::new(),
            url: String::new(),
            api_key: None,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilebedStrategy {
    #[default]
    Random,
    RoundRobin,
    Failover,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageOptimization {
    pub enabled: bool,
    pub strip_metadata: bool,
    pub max_width: u32,
    pub max_height: u32,
    pub convert_png_to_jpg: bool,
    pub convert_to_webp: bool,
    pub target_format: Option<String>,
    pub jpeg_quality: u8,
    pub webp_quality: u8,
    pub target_size_kb: Option<u32>,
    pub optimize_encoding: bool,
}

impl Default for ImageOptimization {
    fn default() -> Self {
        Self {
            enabled: false,
            strip_metadata: true,
            max_width: 1920,
            max_height: 1080,
            convert_png_to_jpg: false,
            convert_to_webp: false,
            target_format: None,
            jpeg_quality: 85,
            webp_quality: 85,
            target_size_kb: None,
            optimize_encoding: true,
        }
    }
}

impl ImageOptimization {
    /// Overlay a per-model compression block; the model values win, and an
    /// explicitly enabled model block turns optimization on.
    pub fn merged_with(&self, model: Option<&ImageCompression>) -> ImageOptimization {
        let mut merged = self.clone();
        let Some(model) = model else {
            return merged;
        };
        if model.enabled == Some(true) {
            merged.enabled = true;
        }
        if let Some(v) = model.strip_metadata {
            merged.strip_metadata = v;
        }
        if let Some(v) = model.max_width {
            merged.max_width = v;
        }
        if let Some(v) = model.max_height {
            merged.max_height = v;
        }
        if let Some(v) = model.convert_png_to_jpg {
            merged.convert_png_to_jpg = v;
        }
        if let Some(v) = model.convert_to_webp {
            merged.convert_to_webp = v;
        }
        if let Some(v) = &model.target_format {
            merged.target_format = Some(v.clone());
        }
        // `quality` is the shorthand that drives both encoders.
        if let Some(v) = model.quality {
            merged.jpeg_quality = v;
            merged.webp_quality = v;
        }
        if let Some(v) = model.jpeg_quality {
            merged.jpeg_quality = v;
        }
        if let Some(v) = model.webp_quality {
            merged.webp_quality = v;
        }
        if let Some(v) = model.target_size_kb {
            merged.target_size_kb = Some(v);
        }
        if let Some(v) = model.optimize_encoding {
            merged.optimize_encoding = v;
        }
        merged
    }
}

/// Per-model `image_compression` block carried by a binding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageCompression {
    pub enabled: Option<bool>,
    pub strip_metadata: Option<bool>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub convert_png_to_jpg: Option<bool>,
    pub convert_to_webp: Option<bool>,
    pub target_format: Option<String>,
    pub quality: Option<u8>,
    pub jpeg_quality: Option<u8>,
    pub webp_quality: Option<u8>,
    pub target_size_kb: Option<u32>,
    pub optimize_encoding: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 3600,
            max_size: 200,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageReturnFormat {
    pub mode: ImageReturnMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageReturnMode {
    #[default]
    Base64,
    Url,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSaveFormat {
    pub enabled: bool,
    pub format: String,
    pub jpeg_quality: u8,
}

impl Default for LocalSaveFormat {
    fn default() -> Self {
        Self {
            enabled: false,
            format: "original".to_string(),
            jpeg_quality: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmptyResponseRetry {
    pub enabled: bool,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub show_retry_info_to_client: bool,
}

impl Default for EmptyResponseRetry {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            show_retry_info_to_client: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadTimeouts {
    pub total: u64,
    pub connect: u64,
    pub sock_read: u64,
    pub max_retries: u32,
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            total: 30,
            connect: 5,
            sock_read: 10,
            max_retries: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service_expectations() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.stream_response_timeout_seconds, 360);
        assert_eq!(cfg.max_request_transfers, 3);
        assert_eq!(cfg.verification.cooldown_seconds, 25);
        assert_eq!(cfg.verification.display_skew_seconds, 3);
        assert!(cfg.use_default_ids_if_mapping_not_found);
        assert_eq!(cfg.image_optimization.max_width, 1920);
    }

    #[test]
    fn model_compression_overrides_global() {
        let global = ImageOptimization::default();
        let model = ImageCompression {
            enabled: Some(true),
            quality: Some(70),
            target_size_kb: Some(500),
            convert_png_to_jpg: Some(true),
            ..ImageCompression::default()
        };
        let merged = global.merged_with(Some(&model));
        assert!(merged.enabled);
        assert!(merged.convert_png_to_jpg);
        assert_eq!(merged.jpeg_quality, 70);
        assert_eq!(merged.webp_quality, 70);
        assert_eq!(merged.target_size_kb, Some(500));
    }

    #[test]
    fn injection_spec_accepts_single_or_list() {
        let one: InjectionSpec =
            serde_json::from_value(serde_json::json!({"role": "user", "content": "x"})).unwrap();
        assert_eq!(one.messages().len(), 1);

        let many: InjectionSpec = serde_json::from_value(serde_json::json!([
            {"role": "user", "content": "x"},
            {"role": "assistant", "content": "y", "participantPosition": "b"}
        ]))
        .unwrap();
        let messages = many.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].participant_position.as_deref(), Some("b"));
    }

    #[test]
    fn unknown_preset_falls_back_to_custom() {
        let injection = BypassInjection {
            presets: HashMap::new(),
            active_preset: "missing".to_string(),
            custom: Some(InjectionSpec::One(InjectionMessage {
                role: "user".to_string(),
                content: "fallback".to_string(),
                participant_position: Some("a".to_string()),
            })),
        };
        let messages = injection.active_messages();
        assert_eq!(messages[0].content, "fallback");
    }
}
