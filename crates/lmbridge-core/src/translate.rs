use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use lmbridge_common::BridgeError;
use lmbridge_config::{
    BridgeConfig, ModelKind, ReasoningMode, RoleConversionMode, SessionMode,
};
use lmbridge_protocol::openai::request::ChatCompletionRequest;
use lmbridge_protocol::openai::types::{ContentPart, MessageContent};
use lmbridge_protocol::wire::{ArenaPayload, Attachment, MessageTemplate};

static MARKDOWN_IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]+)\)").expect("markdown image pattern"));
static THINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>\s*").expect("think pattern"));

pub struct TranslationInput<'a> {
    pub request: &'a ChatCompletionRequest,
    pub session_id: &'a str,
    pub mode_override: Option<SessionMode>,
    pub battle_target_override: Option<&'a str>,
    pub model_kind: ModelKind,
    pub target_model_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct ProcessedMessage {
    role: String,
    content: String,
    attachments: Vec<Attachment>,
    experimental_attachments: Vec<Attachment>,
    participant_position: Option<String>,
    already_labeled: bool,
}

/// Translate an OpenAI chat request into the envelope a tab can replay
/// against the arena page.
pub fn build_arena_payload(
    input: &TranslationInput<'_>,
    config: &BridgeConfig,
) -> Result<ArenaPayload, BridgeError> {
    let mut messages = input.request.messages.clone();

    // Role normalization: `developer` is an alias for `system`.
    for message in &mut messages {
        if message.role == "developer" {
            message.role = "system".to_string();
        }
    }

    // In think-tag mode prior assistant turns carry their reasoning inline;
    // strip it before replay so the history stays clean.
    if config.strip_reasoning_from_history
        && config.enable_reasoning_output
        && config.reasoning_output_mode == ReasoningMode::ThinkTag
    {
        for message in &mut messages {
            if message.role == "assistant"
                && let MessageContent::Text(text) = &message.content
                && THINK_RE.is_match(text)
            {
                message.content =
                    MessageContent::Text(THINK_RE.replace_all(text, "").trim().to_string());
            }
        }
    }

    let mut processed: Vec<ProcessedMessage> = Vec::with_capacity(messages.len());
    for message in &messages {
        processed.push(process_message(&message.role, &message.content)?);
    }

    apply_role_conversion(
        &mut processed,
        config.message_role_conversion_mode,
        config.merge_preserve_role_labels,
    );

    if config.tavern_mode_enabled {
        processed = tavern_merge(processed);
    }

    let mut templates: Vec<MessageTemplate> = processed
        .into_iter()
        .map(|msg| {
            let experimental = if msg.role == "user" && !msg.attachments.is_empty() {
                Some(msg.attachments.clone())
            } else if msg.role == "assistant" && !msg.experimental_attachments.is_empty() {
                Some(msg.experimental_attachments)
            } else {
                None
            };
            MessageTemplate {
                role: msg.role,
                content: msg.content,
                attachments: msg.attachments,
                experimental_attachments: experimental,
                participant_position: msg.participant_position,
            }
        })
        .collect();

    if bypass_attachments_enabled(input.model_kind, config) {
        split_trailing_image_message(&mut templates);
    }

    if bypass_injection_enabled(input.model_kind, config) {
        for inject in config.bypass_injection.active_messages() {
            templates.push(MessageTemplate {
                role: inject.role,
                content: inject.content,
                attachments: Vec::new(),
                experimental_attachments: None,
                participant_position: inject.participant_position,
            });
        }
    }

    let mode = input
        .mode_override
        .unwrap_or_else(|| parse_mode(&config.default_mode));
    let target = input
        .battle_target_override
        .map(|t| t.to_string())
        .unwrap_or_else(|| config.default_battle_target.clone())
        .to_lowercase();

    for template in &mut templates {
        // An explicit position from an injection preset wins.
        if template.participant_position.is_some() {
            continue;
        }
        let position = match (mode, template.role.as_str()) {
            (SessionMode::Battle, _) => target.clone(),
            (SessionMode::DirectChat, "system") => "b".to_string(),
            (SessionMode::DirectChat, _) => "a".to_string(),
        };
        template.participant_position = Some(position);
    }

    let battle_target = match mode {
        SessionMode::DirectChat => "a".to_string(),
        SessionMode::Battle => target,
    };

    Ok(ArenaPayload {
        message_templates: templates,
        target_model_id: input.target_model_id.clone(),
        session_id: input.session_id.to_string(),
        battle_target,
        is_image_request: None,
    })
}

fn parse_mode(raw: &str) -> SessionMode {
    match raw {
        "battle" => SessionMode::Battle,
        _ => SessionMode::DirectChat,
    }
}

/// Split one OpenAI message into text plus attachments. Assistant messages
/// carrying Markdown images have them moved into experimental attachments.
fn process_message(role: &str, content: &MessageContent) -> Result<ProcessedMessage, BridgeError> {
    let mut out = ProcessedMessage {
        role: role.to_string(),
        ..ProcessedMessage::default()
    };

    match content {
        MessageContent::Text(text) if role == "assistant" => {
            if MARKDOWN_IMAGE_RE.is_match(text) {
                for captures in MARKDOWN_IMAGE_RE.captures_iter(text) {
                    let url = captures.get(2).map(|m| m.as_str()).unwrap_or("");
                    out.experimental_attachments.push(build_attachment(url, None)?);
                }
                out.content = MARKDOWN_IMAGE_RE.replace_all(text, "").trim().to_string();
            } else {
                out.content = text.clone();
            }
        }
        MessageContent::Text(text) => {
            out.content = text.clone();
        }
        MessageContent::Parts(parts) => {
            let mut text_parts = Vec::new();
            for part in parts {
                match part {
                    ContentPart::Text { text } => text_parts.push(text.as_str()),
                    ContentPart::ImageUrl { image_url } => {
                        let attachment =
                            build_attachment(&image_url.url, image_url.detail.as_deref())?;
                        if role == "assistant" {
                            out.experimental_attachments.push(attachment);
                        } else {
                            out.attachments.push(attachment);
                        }
                    }
                }
            }
            out.content = text_parts.join("\n\n");
        }
    }

    // The arena rejects empty user turns.
    if role == "user" && out.content.trim().is_empty() {
        out.content = " ".to_string();
    }

    Ok(out)
}

fn build_attachment(url: &str, original_name: Option<&str>) -> Result<Attachment, BridgeError> {
    if url.is_empty() {
        return Err(BridgeError::Attachment("attachment with empty URL".to_string()));
    }
    let content_type = guess_content_type(url);
    let name = match original_name {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => file_name_for(url, &content_type),
    };
    Ok(Attachment {
        name,
        content_type,
        url: url.to_string(),
    })
}

fn guess_content_type(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("data:") {
        return rest
            .split(&[';', ','][..])
            .next()
            .filter(|mime| !mime.is_empty())
            .unwrap_or("image/png")
            .to_string();
    }
    let path = url.split(&['?', '#'][..]).next().unwrap_or(url);
    let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        _ => "image/jpeg",
    }
    .to_string()
}

fn file_name_for(url: &str, content_type: &str) -> String {
    if !url.starts_with("data:")
        && let Some(segment) = url.split('/').next_back()
    {
        let candidate = segment.split('?').next().unwrap_or("");
        if candidate.contains('.') {
            return candidate.to_string();
        }
    }
    let mut ext = content_type.rsplit('/').next().unwrap_or("png").to_string();
    if ext.is_empty() || ext.len() > 5 || ext == "plain" {
        ext = "png".to_string();
    }
    format!("image_{}.{ext}", uuid::Uuid::new_v4())
}

/// `"system": "<escaped content>"` fragment used when role labels are
/// preserved through a conversion.
fn labeled(role: &str, content: &str) -> String {
    let escaped = content.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{role}\": \"{escaped}\"")
}

fn merge_contents(
    messages: &[ProcessedMessage],
    preserve_labels: bool,
) -> ProcessedMessage {
    let content = if preserve_labels {
        messages
            .iter()
            .map(|msg| labeled(&msg.role, &msg.content))
            .collect::<Vec<_>>()
            .join(",")
    } else {
        messages
            .iter()
            .map(|msg| msg.content.clone())
            .collect::<Vec<_>>()
            .join("\n\n")
    };
    ProcessedMessage {
        role: "system".to_string(),
        content,
        already_labeled: preserve_labels,
        ..ProcessedMessage::default()
    }
}

fn to_user(msg: &mut ProcessedMessage, preserve_labels: bool) {
    if preserve_labels && !msg.already_labeled {
        msg.content = labeled("system", &msg.content);
    }
    msg.already_labeled = false;
    msg.role = "user".to_string();
}

fn apply_role_conversion(
    messages: &mut Vec<ProcessedMessage>,
    mode: RoleConversionMode,
    preserve_labels: bool,
) {
    match mode {
        RoleConversionMode::None => {}
        RoleConversionMode::SystemToUser => {
            for msg in messages.iter_mut() {
                if msg.role == "system" {
                    to_user(msg, preserve_labels);
                }
            }
        }
        RoleConversionMode::SystemMerge => {
            let first_non_system = messages
                .iter()
                .position(|msg| msg.role == "user" || msg.role == "assistant");
            match first_non_system {
                Some(idx) => {
                    let leading: Vec<ProcessedMessage> = messages
                        .iter()
                        .take(idx)
                        .filter(|msg| msg.role == "system")
                        .cloned()
                        .collect();
                    let mut rebuilt = Vec::with_capacity(messages.len());
                    if !leading.is_empty() {
                        rebuilt.push(merge_contents(&leading, preserve_labels));
                    }
                    rebuilt.extend(messages.drain(idx..));
                    // Systems after the merged head become user turns.
                    for msg in rebuilt.iter_mut().skip(1) {
                        if msg.role == "system" {
                            to_user(msg, preserve_labels);
                        }
                    }
                    *messages = rebuilt;
                }
                None => {
                    let systems: Vec<ProcessedMessage> = messages
                        .iter()
                        .filter(|msg| msg.role == "system")
                        .cloned()
                        .collect();
                    if !systems.is_empty() {
                        *messages = vec![merge_contents(&systems, preserve_labels)];
                    }
                }
            }
        }
        RoleConversionMode::SystemSmartMerge => {
            smart_merge(messages, preserve_labels);
            for msg in messages.iter_mut() {
                if msg.role == "system" {
                    to_user(msg, preserve_labels);
                }
            }
        }
    }
}

/// Walk back from the first user message to the second preceding system and
/// merge that system together with everything system-flavored before it.
fn smart_merge(messages: &mut Vec<ProcessedMessage>, preserve_labels: bool) {
    let Some(first_user) = messages.iter().position(|msg| msg.role == "user") else {
        debug!("smart merge: no user message, skipping merge step");
        return;
    };
    let Some(system1) = (0..first_user)
        .rev()
        .find(|&idx| messages[idx].role == "system")
    else {
        return;
    };
    let Some(system2) = (0..system1)
        .rev()
        .find(|&idx| messages[idx].role == "system")
    else {
        return;
    };

    let to_merge: Vec<ProcessedMessage> = messages
        .iter()
        .take(system2 + 1)
        .filter(|msg| msg.role == "system")
        .cloned()
        .collect();
    if to_merge.is_empty() {
        return;
    }
    let merged = merge_contents(&to_merge, preserve_labels);

    let mut rebuilt = Vec::with_capacity(messages.len());
    rebuilt.push(merged);
    for (idx, msg) in messages.drain(..).enumerate() {
        if idx > system2 || (idx < system2 && msg.role != "system") {
            rebuilt.push(msg);
        }
    }
    *messages = rebuilt;
}

fn tavern_merge(messages: Vec<ProcessedMessage>) -> Vec<ProcessedMessage> {
    let system_prompt = messages
        .iter()
        .filter(|msg| msg.role == "system")
        .map(|msg| msg.content.clone())
        .collect::<Vec<_>>()
        .join("\n\n");
    let mut merged = Vec::with_capacity(messages.len() + 1);
    if !system_prompt.is_empty() {
        merged.push(ProcessedMessage {
            role: "system".to_string(),
            content: system_prompt,
            ..ProcessedMessage::default()
        });
    }
    merged.extend(messages.into_iter().filter(|msg| msg.role != "system"));
    merged
}

fn bypass_injection_enabled(kind: ModelKind, config: &BridgeConfig) -> bool {
    if !config.bypass_enabled {
        return false;
    }
    if !config.bypass_settings.is_empty() {
        return config
            .bypass_settings
            .get(kind.as_str())
            .copied()
            .unwrap_or(false);
    }
    // No fine-grained table: image and search models stay off.
    !matches!(kind, ModelKind::Image | ModelKind::Search)
}

fn bypass_attachments_enabled(kind: ModelKind, config: &BridgeConfig) -> bool {
    config
        .attachment_bypass_settings
        .get(kind.as_str())
        .copied()
        .unwrap_or(false)
}

/// Image-model moderation workaround: the last user message carrying an
/// image becomes an image-only history entry followed by a text-only turn.
fn split_trailing_image_message(templates: &mut Vec<MessageTemplate>) {
    let Some(idx) = templates.iter().rposition(|tpl| tpl.role == "user") else {
        return;
    };
    let has_image = templates[idx]
        .attachments
        .iter()
        .any(|att| att.content_type.starts_with("image/"));
    if !has_image || templates[idx].content.trim().is_empty() {
        return;
    }

    let original = templates[idx].clone();
    templates[idx] = MessageTemplate {
        role: "user".to_string(),
        content: " ".to_string(),
        attachments: original.attachments.clone(),
        experimental_attachments: Some(original.attachments.clone()),
        participant_position: None,
    };
    templates.insert(
        idx + 1,
        MessageTemplate {
            role: "user".to_string(),
            content: original.content,
            attachments: Vec::new(),
            experimental_attachments: None,
            participant_position: None,
        },
    );
}
