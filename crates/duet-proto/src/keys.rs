//! Portable key material.
//!
//! Keys travel as a JWK-shaped object `{kty, crv, x, y, d?}` where the
//! coordinates and the private scalar are unpadded base64url strings.
//! This module only models the shape; curve-level validation lives in
//! `duet-crypto`.

use serde::{Deserialize, Serialize};

/// Key type tag for elliptic-curve keys.
pub const KTY_EC: &str = "EC";
/// Curve identifier for NIST P-256.
pub const CRV_P256: &str = "P-256";

/// An elliptic-curve key in portable form.
///
/// Unknown members such as `ext` or `key_ops` are ignored on input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortableKey {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
}

impl PortableKey {
    /// True when the private scalar is present.
    pub fn is_private(&self) -> bool {
        self.d.is_some()
    }

    /// Copy of this key without the private scalar.
    pub fn public_only(&self) -> PortableKey {
        PortableKey {
            d: None,
            ..self.clone()
        }
    }
}
