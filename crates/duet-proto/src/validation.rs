//! Field validation shared by the relay and its clients.

use thiserror::Error;

/// Field sizes.
pub mod sizes {
    /// XChaCha20-Poly1305 nonce length.
    pub const NONCE_SIZE: usize = 24;
    /// Poly1305 tag length; the smallest valid ciphertext.
    pub const TAG_SIZE: usize = 16;
    /// Default upper bound on a single ciphertext.
    pub const DEFAULT_MAX_CIPHERTEXT: usize = 64 * 1024;
    pub const USERNAME_MIN: usize = 3;
    pub const USERNAME_MAX: usize = 32;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("field '{field}' has invalid size: expected {expected}, got {actual}")]
    InvalidSize {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("field '{field}' size {actual} is out of range [{min}, {max}]")]
    SizeOutOfRange {
        field: &'static str,
        min: usize,
        max: usize,
        actual: usize,
    },
    #[error("field '{field}' contains invalid data: {reason}")]
    InvalidData {
        field: &'static str,
        reason: &'static str,
    },
}

pub type ValidationResult<T> = Result<T, ValidationError>;

/// Check the nonce/ciphertext pair of an outgoing or incoming message.
pub fn validate_payload(nonce: &[u8], ciphertext: &[u8], max_ciphertext: usize) -> ValidationResult<()> {
    if nonce.len() != sizes::NONCE_SIZE {
        return Err(ValidationError::InvalidSize {
            field: "nonce",
            expected: sizes::NONCE_SIZE,
            actual: nonce.len(),
        });
    }
    if ciphertext.len() < sizes::TAG_SIZE || ciphertext.len() > max_ciphertext {
        return Err(ValidationError::SizeOutOfRange {
            field: "ciphertext",
            min: sizes::TAG_SIZE,
            max: max_ciphertext,
            actual: ciphertext.len(),
        });
    }
    Ok(())
}

/// Usernames are 3 to 32 ASCII letters, digits, `_`, `-` or `.`.
pub fn validate_username(username: &str) -> ValidationResult<()> {
    let len = username.len();
    if !(sizes::USERNAME_MIN..=sizes::USERNAME_MAX).contains(&len) {
        return Err(ValidationError::SizeOutOfRange {
            field: "username",
            min: sizes::USERNAME_MIN,
            max: sizes::USERNAME_MAX,
            actual: len,
        });
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(ValidationError::InvalidData {
            field: "username",
            reason: "unsupported character",
        });
    }
    Ok(())
}
