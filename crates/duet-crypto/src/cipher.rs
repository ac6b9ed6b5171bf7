//! Message sealing.
//!
//! XChaCha20-Poly1305 under a [`SessionKey`]. Every `seal` draws a fresh
//! 24-byte nonce from the OS RNG.

use chacha20poly1305::{aead::Aead, XNonce};

use duet_proto::validation::sizes::{NONCE_SIZE, TAG_SIZE};

use crate::session_key::SessionKey;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    /// Tag did not verify: wrong key, wrong nonce, tampered or malformed input.
    #[error("message authentication failed")]
    Authentication,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("RNG failed")]
    RngError,
}

/// Output of one `seal` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMessage {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl SessionKey {
    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedMessage, CipherError> {
        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce).map_err(|_| CipherError::RngError)?;

        let ciphertext = self
            .aead()
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| CipherError::EncryptionFailed)?;

        Ok(SealedMessage {
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    /// Decrypt and verify. Nothing is returned unless the tag verifies.
    pub fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if nonce.len() != NONCE_SIZE || ciphertext.len() < TAG_SIZE {
            return Err(CipherError::Authentication);
        }
        self.aead()
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Authentication)
    }

    pub fn seal_text(&self, text: &str) -> Result<SealedMessage, CipherError> {
        self.seal(text.as_bytes())
    }

    /// Like `open`, but a plaintext that is not UTF-8 counts as unauthenticated.
    pub fn open_text(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<String, CipherError> {
        let plain = self.open(nonce, ciphertext)?;
        String::from_utf8(plain).map_err(|_| CipherError::Authentication)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeypair;

    fn pair() -> (SessionKey, SessionKey) {
        let a = IdentityKeypair::generate();
        let b = IdentityKeypair::generate();
        (
            SessionKey::derive(&a, b.public()).unwrap(),
            SessionKey::derive(&b, a.public()).unwrap(),
        )
    }

    #[test]
    fn seal_shape() {
        let (k, _) = pair();
        let sealed = k.seal(b"abc").unwrap();
        assert_eq!(sealed.nonce.len(), NONCE_SIZE);
        assert_eq!(sealed.ciphertext.len(), 3 + TAG_SIZE);
    }

    #[test]
    fn empty_plaintext_round_trips() {
        let (k, peer) = pair();
        let sealed = k.seal(b"").unwrap();
        assert_eq!(peer.open(&sealed.nonce, &sealed.ciphertext).unwrap(), b"");
    }

    #[test]
    fn wrong_key_fails() {
        let (k, _) = pair();
        let (other, _) = pair();
        let sealed = k.seal(b"secret").unwrap();
        assert_eq!(
            other.open(&sealed.nonce, &sealed.ciphertext),
            Err(CipherError::Authentication)
        );
    }

    #[test]
    fn malformed_inputs_fail_as_authentication() {
        let (k, _) = pair();
        let sealed = k.seal(b"secret").unwrap();
        assert_eq!(
            k.open(&sealed.nonce[..12], &sealed.ciphertext),
            Err(CipherError::Authentication)
        );
        assert_eq!(
            k.open(&sealed.nonce, &sealed.ciphertext[..TAG_SIZE - 1]),
            Err(CipherError::Authentication)
        );
    }

    #[test]
    fn non_utf8_plaintext_is_rejected_by_open_text() {
        let (k, peer) = pair();
        let sealed = k.seal(&[0xff, 0xfe, 0x00]).unwrap();
        assert_eq!(
            peer.open_text(&sealed.nonce, &sealed.ciphertext),
            Err(CipherError::Authentication)
        );
        let sealed = k.seal_text("héllo").unwrap();
        assert_eq!(peer.open_text(&sealed.nonce, &sealed.ciphertext).unwrap(), "héllo");
    }
}
