use serde::de::DeserializeOwned;

#[derive(Debug, thiserror::Error)]
pub enum ConfigParseError {
    #[error("jsonc parse failed: {0}")]
    Jsonc(String),
    #[error("file is empty")]
    Empty,
    #[error("decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Parse a JSONC document (comments and trailing commas allowed) into any
/// deserializable type. An all-whitespace document is an error so callers can
/// distinguish "empty" from "defaults".
pub fn parse_jsonc<T: DeserializeOwned>(text: &str) -> Result<T, ConfigParseError> {
    let value = jsonc_parser::parse_to_serde_value::<serde_json::Value>(text, &Default::default())
        .map_err(|err| ConfigParseError::Jsonc(err.to_string()))?;
    if value.is_null() {
        return Err(ConfigParseError::Empty);
    }
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_trailing_commas_are_tolerated() {
        let text = r#"
        {
            // line comment
            "api_key": "secret", /* block comment */
            "tavern_mode_enabled": true,
        }
        "#;
        let cfg: crate::BridgeConfig = parse_jsonc(text).unwrap();
        assert_eq!(cfg.api_key.as_deref(), Some("secret"));
        assert!(cfg.tavern_mode_enabled);
    }

    #[test]
    fn slashes_inside_strings_survive() {
        let text = r#"{ "session_id": "https://host/path//x" }"#;
        let cfg: crate::BridgeConfig = parse_jsonc(text).unwrap();
        assert_eq!(cfg.session_id.as_deref(), Some("https://host/path//x"));
    }

    #[test]
    fn empty_document_is_an_error() {
        let err = parse_jsonc::<crate::BridgeConfig>("   \n").unwrap_err();
        assert!(matches!(err, ConfigParseError::Empty));
    }
}
