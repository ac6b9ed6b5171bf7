//! Device identity keys.
//!
//! An identity is a NIST P-256 keypair used only for key agreement. Both
//! halves convert to and from the JWK-shaped [`PortableKey`]; parsing checks
//! the curve, coordinate lengths, that the point lies on the curve and, for
//! private material, that `d` actually produces `x`/`y`.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{FieldBytes, PublicKey, SecretKey};
use rand_core::OsRng;
use zeroize::Zeroizing;

use duet_proto::keys::{PortableKey, CRV_P256, KTY_EC};

use crate::hash::fingerprint;

/// Length of a P-256 coordinate or scalar.
const FIELD_LEN: usize = 32;
/// Length of an uncompressed SEC1 point.
const SEC1_LEN: usize = 1 + 2 * FIELD_LEN;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),
    #[error("unsupported curve: {0}")]
    UnsupportedCurve(String),
    #[error("field '{0}' is not valid base64url")]
    InvalidEncoding(&'static str),
    #[error("field '{field}' has invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("point is not on the curve")]
    InvalidPoint,
    #[error("private scalar is out of range")]
    InvalidScalar,
    #[error("private scalar does not match the public coordinates")]
    KeyMismatch,
    #[error("public key material carries a private scalar")]
    UnexpectedPrivate,
    #[error("private scalar missing")]
    MissingPrivate,
}

fn decode_field(field: &'static str, value: &str) -> Result<Zeroizing<Vec<u8>>, KeyError> {
    let bytes = Zeroizing::new(
        URL_SAFE_NO_PAD
            .decode(value)
            .map_err(|_| KeyError::InvalidEncoding(field))?,
    );
    if bytes.len() != FIELD_LEN {
        return Err(KeyError::InvalidLength {
            field,
            expected: FIELD_LEN,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

fn check_header(key: &PortableKey) -> Result<(), KeyError> {
    if key.kty != KTY_EC {
        return Err(KeyError::UnsupportedKeyType(key.kty.clone()));
    }
    if key.crv != CRV_P256 {
        return Err(KeyError::UnsupportedCurve(key.crv.clone()));
    }
    Ok(())
}

fn public_from_coords(key: &PortableKey) -> Result<PublicKey, KeyError> {
    check_header(key)?;
    let x = decode_field("x", &key.x)?;
    let y = decode_field("y", &key.y)?;
    let mut sec1 = Vec::with_capacity(SEC1_LEN);
    sec1.push(0x04);
    sec1.extend_from_slice(&x);
    sec1.extend_from_slice(&y);
    PublicKey::from_sec1_bytes(&sec1).map_err(|_| KeyError::InvalidPoint)
}

fn sec1_uncompressed(public: &PublicKey) -> Vec<u8> {
    public.to_encoded_point(false).as_bytes().to_vec()
}

fn encode_public(public: &PublicKey) -> PortableKey {
    let sec1 = sec1_uncompressed(public);
    PortableKey {
        kty: KTY_EC.to_string(),
        crv: CRV_P256.to_string(),
        x: URL_SAFE_NO_PAD.encode(&sec1[1..1 + FIELD_LEN]),
        y: URL_SAFE_NO_PAD.encode(&sec1[1 + FIELD_LEN..]),
        d: None,
    }
}

/// Validated public key material of some identity (ours or a peer's).
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKeyMaterial {
    key: PublicKey,
}

impl PublicKeyMaterial {
    /// Parse public material. Material carrying `d` is rejected.
    pub fn from_portable(key: &PortableKey) -> Result<Self, KeyError> {
        if key.is_private() {
            return Err(KeyError::UnexpectedPrivate);
        }
        Ok(Self {
            key: public_from_coords(key)?,
        })
    }

    pub fn to_portable(&self) -> PortableKey {
        encode_public(&self.key)
    }

    /// Uncompressed SEC1 encoding (65 bytes).
    pub fn sec1_bytes(&self) -> Vec<u8> {
        sec1_uncompressed(&self.key)
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.sec1_bytes())
    }

    pub(crate) fn as_public_key(&self) -> &PublicKey {
        &self.key
    }
}

impl fmt::Debug for PublicKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKeyMaterial").field(&self.fingerprint()).finish()
    }
}

/// A device's key-agreement keypair.
///
/// The secret scalar is zeroized on drop.
#[derive(Clone)]
pub struct IdentityKeypair {
    secret: SecretKey,
    public: PublicKeyMaterial,
}

impl IdentityKeypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let public = PublicKeyMaterial {
            key: secret.public_key(),
        };
        Self { secret, public }
    }

    /// Rebuild a keypair from private portable material.
    pub fn from_portable(key: &PortableKey) -> Result<Self, KeyError> {
        let claimed = public_from_coords(key)?;
        let d = key.d.as_deref().ok_or(KeyError::MissingPrivate)?;
        let d = decode_field("d", d)?;
        let secret =
            SecretKey::from_bytes(FieldBytes::from_slice(&d)).map_err(|_| KeyError::InvalidScalar)?;
        if secret.public_key() != claimed {
            return Err(KeyError::KeyMismatch);
        }
        Ok(Self {
            secret,
            public: PublicKeyMaterial { key: claimed },
        })
    }

    /// Export both halves. The result contains the private scalar and must
    /// only ever be written to local storage.
    pub fn to_portable(&self) -> PortableKey {
        let mut d = Zeroizing::new([0u8; FIELD_LEN]);
        d.copy_from_slice(&self.secret.to_bytes());
        PortableKey {
            d: Some(URL_SAFE_NO_PAD.encode(d.as_slice())),
            ..encode_public(self.public.as_public_key())
        }
    }

    pub fn public(&self) -> &PublicKeyMaterial {
        &self.public
    }

    pub fn public_portable(&self) -> PortableKey {
        self.public.to_portable()
    }

    pub fn fingerprint(&self) -> String {
        self.public.fingerprint()
    }

    pub(crate) fn secret(&self) -> &SecretKey {
        &self.secret
    }
}

impl fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeypair")
            .field("public", &self.public.fingerprint())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7515 appendix A.3 example key.
    const RFC_X: &str = "f83OJ3D2xF1Bg8vub9tLe1gHMzV76e8Tus9uPHvRVEU";
    const RFC_Y: &str = "x_FEzRu9m36HLN_tue659LNpXW6pCyStikYjKIWI5a0";
    const RFC_D: &str = "jpsQnnGQmL-YBIffH1136cspYG6-0iY7X1fCE9-E9LI";

    fn rfc_key(d: Option<&str>) -> PortableKey {
        PortableKey {
            kty: KTY_EC.into(),
            crv: CRV_P256.into(),
            x: RFC_X.into(),
            y: RFC_Y.into(),
            d: d.map(str::to_string),
        }
    }

    #[test]
    fn imports_rfc_jwk() {
        let kp = IdentityKeypair::from_portable(&rfc_key(Some(RFC_D))).unwrap();
        assert_eq!(kp.public_portable(), rfc_key(None));
        assert_eq!(kp.to_portable(), rfc_key(Some(RFC_D)));
    }

    #[test]
    fn private_round_trip_keeps_both_halves() {
        let kp = IdentityKeypair::generate();
        let portable = kp.to_portable();
        assert!(portable.is_private());
        let back = IdentityKeypair::from_portable(&portable).unwrap();
        assert_eq!(back.public(), kp.public());
        assert_eq!(back.to_portable(), portable);
    }

    #[test]
    fn mismatched_scalar_is_rejected() {
        let a = IdentityKeypair::generate().to_portable();
        let b = IdentityKeypair::generate().to_portable();
        let franken = PortableKey { d: b.d, ..a };
        assert_eq!(
            IdentityKeypair::from_portable(&franken).unwrap_err(),
            KeyError::KeyMismatch
        );
    }

    #[test]
    fn public_material_rejects_scalar() {
        assert_eq!(
            PublicKeyMaterial::from_portable(&rfc_key(Some(RFC_D))).unwrap_err(),
            KeyError::UnexpectedPrivate
        );
        assert!(PublicKeyMaterial::from_portable(&rfc_key(None)).is_ok());
    }

    #[test]
    fn wrong_curve_and_type_are_rejected() {
        let mut key = rfc_key(None);
        key.crv = "P-384".into();
        assert!(matches!(
            PublicKeyMaterial::from_portable(&key),
            Err(KeyError::UnsupportedCurve(_))
        ));
        let mut key = rfc_key(None);
        key.kty = "OKP".into();
        assert!(matches!(
            PublicKeyMaterial::from_portable(&key),
            Err(KeyError::UnsupportedKeyType(_))
        ));
    }

    #[test]
    fn off_curve_point_is_rejected() {
        let mut key = rfc_key(None);
        key.y = URL_SAFE_NO_PAD.encode([1u8; 32]);
        assert_eq!(
            PublicKeyMaterial::from_portable(&key).unwrap_err(),
            KeyError::InvalidPoint
        );
    }

    #[test]
    fn bad_lengths_and_encodings_are_rejected() {
        let mut key = rfc_key(None);
        key.x = URL_SAFE_NO_PAD.encode([7u8; 31]);
        assert!(matches!(
            PublicKeyMaterial::from_portable(&key),
            Err(KeyError::InvalidLength { field: "x", actual: 31, .. })
        ));
        let mut key = rfc_key(None);
        key.y = "***".into();
        assert_eq!(
            PublicKeyMaterial::from_portable(&key).unwrap_err(),
            KeyError::InvalidEncoding("y")
        );
    }

    #[test]
    fn debug_does_not_leak_scalar() {
        let kp = IdentityKeypair::from_portable(&rfc_key(Some(RFC_D))).unwrap();
        let shown = format!("{kp:?}");
        assert!(!shown.contains(RFC_D));
    }
}
