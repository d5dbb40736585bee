use shared::{
    domain::{InvalidPhone, Phone},
    error::{ApiError, ErrorCode},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("api credentials are required to set up {phone}")]
    CredentialsRequired { phone: Phone },
    #[error("connection to the messaging service failed for {phone}: {source:#}")]
    ConnectionFailed { phone: Phone, source: anyhow::Error },
    #[error("no active connection for {phone}; start the sign-in flow again")]
    NoActiveConnection { phone: Phone },
    #[error("{0}")]
    VerificationRejected(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("message could not be sent: {source:#}")]
    SendFailed { source: anyhow::Error },
    #[error("session storage failed: {source:#}")]
    Storage { source: anyhow::Error },
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::CredentialsRequired { .. } => ErrorCode::CredentialsRequired,
            CoreError::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            CoreError::NoActiveConnection { .. } => ErrorCode::NoActiveConnection,
            CoreError::VerificationRejected(_) => ErrorCode::VerificationRejected,
            CoreError::InvalidInput(_) => ErrorCode::InvalidInput,
            CoreError::SendFailed { .. } => ErrorCode::SendFailed,
            CoreError::Storage { .. } => ErrorCode::Internal,
        }
    }

    pub(crate) fn connection(phone: &Phone, source: anyhow::Error) -> Self {
        CoreError::ConnectionFailed {
            phone: phone.clone(),
            source,
        }
    }

    pub(crate) fn storage(source: anyhow::Error) -> Self {
        CoreError::Storage { source }
    }

    pub(crate) fn no_connection(phone: &Phone) -> Self {
        CoreError::NoActiveConnection {
            phone: phone.clone(),
        }
    }
}

impl From<InvalidPhone> for CoreError {
    fn from(value: InvalidPhone) -> Self {
        CoreError::InvalidInput(value.to_string())
    }
}

impl From<CoreError> for ApiError {
    fn from(value: CoreError) -> Self {
        ApiError::new(value.code(), value.to_string())
    }
}
