use shared::{
    domain::{PublicId, SessionStatus},
    error::ErrorCode,
};
use thiserror::Error;

/// Shown when the generator refuses a new case without saying why.
pub const GENERATION_START_FALLBACK_MESSAGE: &str = "사건 생성 요청에 실패했습니다.";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("authorization failed after credential refresh")]
    Unauthorized,
    #[error("server rejected request ({status}): {message}")]
    Rejected {
        status: u16,
        code: Option<ErrorCode>,
        message: String,
    },
    #[error("session {public_id} is {status}; no further actions are accepted")]
    SessionClosed {
        public_id: PublicId,
        status: SessionStatus,
    },
    #[error("no session loaded for {0}")]
    NoActiveSession(PublicId),
    #[error("invalid server url: {0}")]
    InvalidServerUrl(String),
}

impl ClientError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ClientError::Unauthorized)
    }

    /// Text suitable for showing to the player.
    pub fn user_message(&self) -> String {
        match self {
            ClientError::Rejected { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Human-readable reason for a failed generation start: the provider's own
/// message when the server produced one, the fixed fallback otherwise.
pub fn generation_failure_message(err: &anyhow::Error) -> String {
    match err.downcast_ref::<ClientError>() {
        Some(ClientError::Rejected { message, .. }) if !message.trim().is_empty() => {
            message.clone()
        }
        _ => GENERATION_START_FALLBACK_MESSAGE.to_string(),
    }
}
