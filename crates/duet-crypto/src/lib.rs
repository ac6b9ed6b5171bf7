//! Cryptography for duet.
//!
//! - `identity`: P-256 key-agreement keypairs and their portable form
//! - `session_key`: ECDH + HKDF-SHA256 shared key derivation
//! - `cipher`: XChaCha20-Poly1305 sealing with fresh random nonces
//! - `hash`: SHA-256 helpers and key fingerprints

#![forbid(unsafe_code)]

pub mod cipher;
pub mod hash;
pub mod identity;
pub mod session_key;

#[cfg(test)]
mod proptests;

pub use cipher::{CipherError, SealedMessage};
pub use identity::{IdentityKeypair, KeyError, PublicKeyMaterial};
pub use session_key::SessionKey;
