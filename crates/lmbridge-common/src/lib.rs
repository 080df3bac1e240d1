use serde::{Deserialize, Serialize};

/// Correlation key for one admitted request. Server-minted, unique for the
/// process lifetime; used as the channel key, the transfer tag, and the log
/// primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn mint() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// First eight characters, for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Id of one connected browser tab. Recurs across sessions; unique among
/// currently connected tabs. Legacy user-scripts that never announce one get
/// [`TabId::DEFAULT`].
pub type TabId = String;

pub const DEFAULT_TAB_ID: &str = "default";

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("attachment exceeds the upstream upload limit")]
    AttachmentTooLarge,
    #[error("verification challenge active, retry in {remaining_seconds}s")]
    VerificationChallenge { remaining_seconds: u64 },
    #[error("no browser tab connected")]
    NoTabConnected,
    #[error("tab registry lock timed out")]
    TabLockTimeout,
    #[error("no upstream frame within {timeout_seconds}s")]
    StreamTimeout { timeout_seconds: u64 },
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("request exhausted its transfer budget")]
    ReassignmentExhausted,
    #[error("could not build upstream envelope: {0}")]
    Attachment(String),
    #[error("direct upstream call failed: {0}")]
    DirectApi(String),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("{0}")]
    Internal(String),
}

impl BridgeError {
    /// Stable machine-readable kind, used in error bodies and log rows.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::AttachmentTooLarge => "attachment_too_large",
            BridgeError::VerificationChallenge { .. } => "verification_challenge",
            BridgeError::NoTabConnected => "no_tab_connected",
            BridgeError::TabLockTimeout => "tab_lock_timeout",
            BridgeError::StreamTimeout { .. } => "stream_timeout",
            BridgeError::Upstream(_) => "upstream_error",
            BridgeError::ReassignmentExhausted => "reassignment_exhausted",
            BridgeError::Attachment(_) => "attachment_error",
            BridgeError::DirectApi(_) => "direct_api_error",
            BridgeError::BadRequest(_) => "invalid_request",
            BridgeError::Unauthorized(_) => "unauthorized",
            BridgeError::Internal(_) => "internal_server_error",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            BridgeError::AttachmentTooLarge => 413,
            BridgeError::VerificationChallenge { .. } => 503,
            BridgeError::NoTabConnected => 503,
            BridgeError::TabLockTimeout => 503,
            BridgeError::StreamTimeout { .. } => 500,
            BridgeError::Upstream(_) => 502,
            BridgeError::ReassignmentExhausted => 502,
            BridgeError::Attachment(_) => 500,
            BridgeError::DirectApi(_) => 502,
            BridgeError::BadRequest(_) => 400,
            BridgeError::Unauthorized(_) => 401,
            BridgeError::Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_short_is_prefix() {
        let id = RequestId::mint();
        assert_eq!(id.short().len(), 8);
        assert!(id.as_str().starts_with(id.short()));
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        assert_eq!(BridgeError::AttachmentTooLarge.http_status(), 413);
        assert_eq!(
            BridgeError::VerificationChallenge {
                remaining_seconds: 10
            }
            .http_status(),
            503
        );
        assert_eq!(BridgeError::TabLockTimeout.kind(), "tab_lock_timeout");
    }
}
