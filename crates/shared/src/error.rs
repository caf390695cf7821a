use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Timeout,
    FloodWait,
    RateLimited,
    PeerIdInvalid,
    MessageIdInvalid,
    ChatIdInvalid,
    UserBlocked,
    EncryptionDeclined,
    NotFound,
    Validation,
    AuthKeyInvalid,
    ConnectionLost,
    Internal,
}

/// How the reconciliation core reacts to a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Reissue the originating request, bounded.
    Transient,
    /// The server disagrees with local state; correct local state.
    Semantic,
    /// The connection is unusable; reinitialize the protocol client.
    Fatal,
}

impl ErrorCode {
    pub fn class(&self) -> ErrorClass {
        match self {
            ErrorCode::Timeout | ErrorCode::FloodWait | ErrorCode::RateLimited => {
                ErrorClass::Transient
            }
            ErrorCode::AuthKeyInvalid | ErrorCode::ConnectionLost => ErrorClass::Fatal,
            ErrorCode::PeerIdInvalid
            | ErrorCode::MessageIdInvalid
            | ErrorCode::ChatIdInvalid
            | ErrorCode::UserBlocked
            | ErrorCode::EncryptionDeclined
            | ErrorCode::NotFound
            | ErrorCode::Validation
            | ErrorCode::Internal => ErrorClass::Semantic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct ProtocolError {
    pub code: ErrorCode,
    pub message: String,
}

impl ProtocolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.code.class()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rate_limits_as_transient() {
        assert_eq!(
            ProtocolError::new(ErrorCode::FloodWait, "FLOOD_WAIT_3").class(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn classifies_missing_peer_as_semantic() {
        assert_eq!(ErrorCode::PeerIdInvalid.class(), ErrorClass::Semantic);
    }

    #[test]
    fn classifies_dead_auth_key_as_fatal() {
        assert_eq!(ErrorCode::AuthKeyInvalid.class(), ErrorClass::Fatal);
    }

    #[test]
    fn error_code_uses_snake_case_on_the_wire() {
        let raw = serde_json::to_string(&ErrorCode::PeerIdInvalid).expect("encode");
        assert_eq!(raw, "\"peer_id_invalid\"");
    }
}
