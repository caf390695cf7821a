use shared::{domain::EntityKind, error::ProtocolError};
use thiserror::Error;

use crate::entities::SessionState;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("unknown {kind} '{key}'")]
    UnknownEntity { kind: EntityKind, key: String },
    #[error("encrypted session {session} cannot move from {from:?} to {to:?}")]
    InvalidSessionTransition {
        session: i64,
        from: SessionState,
        to: SessionState,
    },
    #[error("no outstanding request with id {0}")]
    UnknownRequest(i64),
    #[error("protocol request failed: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("durable store failure: {0}")]
    Durable(String),
    #[error("media io failure for transfer {transfer}: {message}")]
    MediaIo { transfer: i64, message: String },
    #[error("mirror runtime is no longer running")]
    RuntimeClosed,
}

impl MirrorError {
    pub(crate) fn unknown(kind: EntityKind, key: impl ToString) -> Self {
        Self::UnknownEntity {
            kind,
            key: key.to_string(),
        }
    }
}

pub type Result<T, E = MirrorError> = std::result::Result<T, E>;
