//! Errors from the storefront read APIs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// RFC 7807 body the storefront returns from failed `/api/*` calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProblemDetails {
    #[serde(rename = "type", default)]
    pub type_url: String,
    #[serde(default)]
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl ProblemDetails {
    /// The occurrence detail, else the title. `None` when both are blank.
    pub fn message(&self) -> Option<&str> {
        [self.detail.as_deref(), Some(self.title.as_str())]
            .into_iter()
            .flatten()
            .find(|text| !text.trim().is_empty())
    }
}

/// User-facing message from a problem+json body, if it is one.
pub fn try_problem_detail(body: &str) -> Option<String> {
    serde_json::from_str::<ProblemDetails>(body)
        .ok()?
        .message()
        .map(str::to_string)
}

/// API error type for client-side use
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Deserialization error: {0}")]
    Deserialize(String),
}

impl ApiError {
    /// Best user-facing description: the problem detail when the server sent one.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Http { body, .. } => {
                try_problem_detail(body).unwrap_or_else(|| self.to_string())
            }
            other => other.to_string(),
        }
    }
}
