//! Error types for the duet client core.
//!
//! The taxonomy follows how each failure is handled by callers:
//! storage failures abort the operation, `NotFound` and `Transport` are
//! recoverable, `InvalidOperation` is a caller bug, and `Authentication`
//! is scoped to a single message.

use thiserror::Error;

use duet_crypto::{CipherError, KeyError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Local key persistence is unavailable or holds unusable data.
    #[error("storage error: {0}")]
    Storage(String),

    /// Peer, key or conversation does not exist (yet).
    #[error("not found: {0}")]
    NotFound(String),

    /// Self-conversation, malformed request, wrong phase for an operation.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A message failed AEAD verification.
    #[error("message authentication failed")]
    Authentication,

    /// The connection to the relay dropped or could not be made.
    #[error("transport error: {0}")]
    Transport(String),

    /// The local session credential has expired.
    #[error("session expired")]
    SessionExpired,

    /// The relay refused the credential.
    #[error("unauthorized")]
    Unauthorized,

    /// The relay refused a message sent over the live channel.
    #[error("message rejected by relay: {0}")]
    Rejected(String),

    /// The relay reported an internal failure. No detail is available.
    #[error("relay error")]
    Relay,

    /// Key material failed validation.
    #[error("key error: {0}")]
    Key(#[from] KeyError),

    /// Local cryptographic failure other than authentication (RNG, KDF).
    #[error("crypto error: {0}")]
    Crypto(String),
}

impl CoreError {
    /// True for conditions that go away by waiting or reconnecting.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CoreError::NotFound(_) | CoreError::Transport(_))
    }
}

impl CoreError {
    /// Map an `{error, message}` body reported by the relay.
    pub fn from_relay(code: &str, message: &str) -> Self {
        match code {
            "unauthorized" => CoreError::Unauthorized,
            "not_found" => CoreError::NotFound(message.to_string()),
            "invalid_operation" => CoreError::InvalidOperation(message.to_string()),
            _ => CoreError::Relay,
        }
    }
}

impl From<CipherError> for CoreError {
    fn from(err: CipherError) -> Self {
        match err {
            CipherError::Authentication => CoreError::Authentication,
            other => CoreError::Crypto(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for CoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        CoreError::Storage(format!("background task failed: {err}"))
    }
}
