use shared::{ProtocolError, SealError};
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Reasons a shard's session with the realm ends
#[derive(Error, Debug)]
pub enum ShardError {
    #[error("unable to connect to the realm at {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("realm did not answer within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("realm rejected authentication: {0}")]
    Rejected(String),
    #[error("realm message failed verification: {0}")]
    Untrusted(shared::CloseReason),
    #[error("connection closed: {0}")]
    Closed(String),
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Seal(#[from] SealError),
}

impl ShardError {
    /// Failures that mean the shared secret is wrong. Retrying with the same
    /// secret would only spin.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ShardError::Rejected(_) | ShardError::Untrusted(_))
    }
}
