use serde::{Deserialize, Serialize};

use super::types::Usage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<StreamChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl ChatCompletionChunk {
    fn base(response_id: &str, model: &str) -> Self {
        Self {
            id: response_id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created: time::OffsetDateTime::now_utc().unix_timestamp(),
            model: model.to_string(),
            choices: Vec::new(),
            usage: None,
        }
    }

    pub fn content(response_id: &str, model: &str, content: impl Into<String>) -> Self {
        let mut chunk = Self::base(response_id, model);
        chunk.choices.push(StreamChoice {
            index: 0,
            delta: Delta {
                content: Some(content.into()),
                ..Delta::default()
            },
            finish_reason: None,
        });
        chunk
    }

    pub fn reasoning(response_id: &str, model: &str, reasoning: impl Into<String>) -> Self {
        let mut chunk = Self::base(response_id, model);
        chunk.choices.push(StreamChoice {
            index: 0,
            delta: Delta {
                reasoning_content: Some(reasoning.into()),
                ..Delta::default()
            },
            finish_reason: None,
        });
        chunk
    }

    pub fn finish(
        response_id: &str,
        model: &str,
        finish_reason: impl Into<String>,
        usage: Option<Usage>,
    ) -> Self {
        let mut chunk = Self::base(response_id, model);
        chunk.choices.push(StreamChoice {
            index: 0,
            delta: Delta::default(),
            finish_reason: Some(finish_reason.into()),
        });
        chunk.usage = usage;
        chunk
    }
}
