// Error type shared by the HTTP clients and the jobs. Config loading and
// the UI layer use `anyhow`; the variants here let callers tell a rejected
// request apart from a transport failure or a response we could not read.

use reqwest::StatusCode;
use thiserror::Error;

/// Everything that can go wrong while talking to one of the remote APIs.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx (or otherwise unexpected) status. `body` is the raw text.
    #[error("HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },

    /// The API answered with `success: false` or an error message.
    #[error("API error: {0}")]
    Rejected(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("task {task_id} did not finish within {seconds}s")]
    Timeout { task_id: String, seconds: u64 },

    #[error("invalid value for header {0}")]
    InvalidHeader(&'static str),

    #[error("missing credential: set {0}")]
    MissingCredential(&'static str),

    #[error("spreadsheet error: {0}")]
    Sheet(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ApiError>;

impl ApiError {
    /// Whether the failure looks like an exhausted balance or quota.
    pub fn is_quota_error(&self) -> bool {
        match self {
            ApiError::Rejected(msg) => is_quota_message(msg),
            ApiError::Status { body, .. } => is_quota_message(body),
            _ => false,
        }
    }
}

const QUOTA_KEYWORDS: [&str; 6] = [
    "额度已用尽",
    "余额不足",
    "quota",
    "insufficient",
    "remainquota",
    "balance",
];

/// Case-insensitive keyword match used to flag quota errors.
pub fn is_quota_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    QUOTA_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_keywords_match_case_insensitively() {
        assert!(is_quota_message("Insufficient balance for request"));
        assert!(is_quota_message("token RemainQuota = 0"));
        assert!(is_quota_message("该令牌额度已用尽"));
        assert!(!is_quota_message("model not found"));
    }

    #[test]
    fn rejected_error_carries_quota_flag() {
        let err = ApiError::Rejected("user quota is not enough".into());
        assert!(err.is_quota_error());
        assert!(!ApiError::Malformed("no data".into()).is_quota_error());
    }
}
