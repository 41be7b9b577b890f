use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Persisted cache keys are this prefix followed by the mention token.
pub const STORE_KEY_PREFIX: &str = "OnCallMention-";

/// One team's mention token plus where its on-call people come from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TeamMentionConfig {
    #[serde(default)]
    pub team: String,
    #[serde(rename = "mention")]
    pub mention_token: String,
    #[serde(rename = "schedules", default)]
    pub schedule_names: Vec<String>,
    #[serde(rename = "escalation_manager")]
    pub escalation_identity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OnCallResult {
    pub identities: Vec<String>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("paging service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("paging service rejected credential: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("malformed payload: {0}")]
    Decode(String),
}

impl ResolveError {
    /// Transient failures may succeed on retry; the rest are configuration
    /// problems or expected per-item outcomes.
    pub fn is_transient(&self) -> bool {
        matches!(self, ResolveError::ServiceUnavailable(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            ResolveError::ServiceUnavailable(_) => "service_unavailable",
            ResolveError::Unauthorized(_) => "unauthorized",
            ResolveError::NotFound(_) => "not_found",
            ResolveError::Decode(_) => "decode_error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RewriteRequest {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RewriteResponse {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnCallView {
    pub mention: String,
    pub identities: Vec<String>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TeamsInstalled {
    pub teams: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

impl ErrorResponse {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }
}
