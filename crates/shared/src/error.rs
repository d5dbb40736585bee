use serde::{Deserialize, Serialize};

/// Stable error kinds surfaced to the web layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    CredentialsRequired,
    ConnectionFailed,
    NoActiveConnection,
    VerificationRejected,
    InvalidInput,
    SendFailed,
    Internal,
}

impl ErrorCode {
    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCode::ConnectionFailed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
