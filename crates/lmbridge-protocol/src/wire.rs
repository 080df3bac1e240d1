//! JSON envelope spoken between the server and the user-script tabs.

use serde::{Deserialize, Serialize};

/// One chat message as the arena page expects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(
        rename = "experimental_attachments",
        skip_serializing_if = "Option::is_none"
    )]
    pub experimental_attachments: Option<Vec<Attachment>>,
    #[serde(rename = "participantPosition", skip_serializing_if = "Option::is_none")]
    pub participant_position: Option<String>,
}

impl MessageTemplate {
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            attachments: Vec::new(),
            experimental_attachments: None,
            participant_position: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
    pub url: String,
}

/// Translated request payload pushed to a tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArenaPayload {
    pub message_templates: Vec<MessageTemplate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_model_id: Option<String>,
    pub session_id: String,
    pub battle_target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_image_request: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub show_retry_info: bool,
}

/// Full server→tab request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub request_id: String,
    pub payload: ArenaPayload,
    pub retry_config: RetryConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_transfer: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_tab_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_count: Option<u32>,
}

/// Server→tab control frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum TabCommand {
    #[serde(rename = "refresh")]
    Refresh,
    #[serde(rename = "cancel_request")]
    CancelRequest { request_id: String },
    #[serde(rename = "activate_id_capture")]
    ActivateIdCapture {
        #[serde(skip_serializing_if = "Option::is_none")]
        mode: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        battle_target: Option<String>,
    },
}

/// Any tab→server frame. The first frame of a connection may carry only
/// `tab_id`; regular frames carry `request_id` + `data`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TabFrame {
    #[serde(default)]
    pub tab_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Retry progress relayed by the user-script while it re-issues an empty
/// upstream response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryInfo {
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub delay: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_omits_transfer_fields_when_fresh() {
        let env = RequestEnvelope {
            request_id: "r1".to_string(),
            payload: ArenaPayload {
                message_templates: vec![MessageTemplate::text("user", "hi")],
                target_model_id: None,
                session_id: "s1".to_string(),
                battle_target: "a".to_string(),
                is_image_request: None,
            },
            retry_config: RetryConfig {
                enabled: true,
                max_retries: 5,
                base_delay_ms: 1000,
                max_delay_ms: 30000,
                show_retry_info: false,
            },
            is_transfer: None,
            original_tab_id: None,
            transfer_count: None,
        };
        let value = serde_json::to_value(&env).unwrap();
        assert!(value.get("is_transfer").is_none());
        assert_eq!(value["payload"]["battle_target"], "a");
    }

    #[test]
    fn command_serializes_with_tag() {
        let cmd = TabCommand::CancelRequest {
            request_id: "abc".to_string(),
        };
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["command"], "cancel_request");
        assert_eq!(value["request_id"], "abc");
    }

    #[test]
    fn participant_position_uses_camel_case() {
        let mut tpl = MessageTemplate::text("system", "x");
        tpl.participant_position = Some("b".to_string());
        let value = serde_json::to_value(&tpl).unwrap();
        assert_eq!(value["participantPosition"], "b");
    }
}
