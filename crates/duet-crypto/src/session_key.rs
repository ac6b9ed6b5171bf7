//! Session key derivation.
//!
//! key = HKDF-SHA256(ikm = ECDH(local, peer), info = label || lo || hi)
//! where lo/hi are the two uncompressed public points sorted bytewise, so
//! both parties compute the same key without further communication.

use std::fmt;

use chacha20poly1305::{KeyInit, XChaCha20Poly1305};
use hkdf::Hkdf;
use p256::ecdh::diffie_hellman;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::cipher::CipherError;
use crate::identity::{IdentityKeypair, PublicKeyMaterial};

const SESSION_KEY_LABEL: &[u8] = b"duet_session_key_v1";
pub const SESSION_KEY_LEN: usize = 32;

/// Symmetric key shared by exactly two identities.
///
/// Only usable through `seal`/`open`; the key bytes are not exposed.
#[derive(Clone)]
pub struct SessionKey {
    aead: XChaCha20Poly1305,
}

impl SessionKey {
    /// Derive the session key for `local` talking to `peer`.
    pub fn derive(local: &IdentityKeypair, peer: &PublicKeyMaterial) -> Result<Self, CipherError> {
        let key = derive_key_bytes(local, peer)?;
        let aead = XChaCha20Poly1305::new_from_slice(key.as_slice())
            .map_err(|_| CipherError::KeyDerivation)?;
        Ok(Self { aead })
    }

    pub(crate) fn aead(&self) -> &XChaCha20Poly1305 {
        &self.aead
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

fn derive_key_bytes(
    local: &IdentityKeypair,
    peer: &PublicKeyMaterial,
) -> Result<Zeroizing<[u8; SESSION_KEY_LEN]>, CipherError> {
    let shared = diffie_hellman(local.secret().to_nonzero_scalar(), peer.as_public_key().as_affine());
    let hk = Hkdf::<Sha256>::new(None, shared.raw_secret_bytes().as_slice());

    let ours = local.public().sec1_bytes();
    let theirs = peer.sec1_bytes();
    let (lo, hi) = if ours <= theirs { (ours, theirs) } else { (theirs, ours) };

    let mut info = Vec::with_capacity(SESSION_KEY_LABEL.len() + lo.len() + hi.len());
    info.extend_from_slice(SESSION_KEY_LABEL);
    info.extend_from_slice(&lo);
    info.extend_from_slice(&hi);

    let mut okm = Zeroizing::new([0u8; SESSION_KEY_LEN]);
    hk.expand(&info, okm.as_mut_slice())
        .map_err(|_| CipherError::KeyDerivation)?;
    Ok(okm)
}
