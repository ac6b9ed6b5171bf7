//! Client session.
//!
//! A [`Session`] is built once at startup from the relay URL and the
//! credential handed out by the login service, then passed explicitly to
//! every component that talks to the relay.

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};

use duet_proto::{SessionClaims, UserId};

use crate::errors::CoreError;

/// A bearer credential and the identity it is bound to.
#[derive(Clone)]
pub struct SessionCredential {
    token: String,
    user_id: UserId,
    expires_at: DateTime<Utc>,
}

impl SessionCredential {
    /// Read subject and expiry from a JWT. The signature is the relay's
    /// business; the client only needs to know who it is and until when.
    pub fn from_token(token: impl Into<String>) -> Result<Self, CoreError> {
        let token = token.into();
        let claims = jsonwebtoken::decode::<SessionClaims>(
            &token,
            &DecodingKey::from_secret(&[]),
            &claims_only(),
        )
        .map_err(|e| CoreError::InvalidOperation(format!("credential unreadable: {e}")))?
        .claims;
        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or_else(|| CoreError::InvalidOperation("credential expiry out of range".to_string()))?;
        Ok(Self {
            token,
            user_id: claims.sub,
            expires_at,
        })
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Structure checks only. Expiry is tracked by the session itself so an
/// expired credential still decodes.
fn claims_only() -> Validation {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.set_required_spec_claims(&["exp", "sub"]);
    validation
}

impl std::fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCredential")
            .field("user_id", &self.user_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Relay location plus the caller's credential.
#[derive(Debug, Clone)]
pub struct Session {
    base_url: String,
    credential: SessionCredential,
}

impl Session {
    pub fn new(base_url: impl Into<String>, credential: SessionCredential) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.credential.user_id
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Bearer token, or `SessionExpired` once the credential has lapsed.
    pub fn token(&self) -> Result<&str, CoreError> {
        self.ensure_valid()?;
        Ok(&self.credential.token)
    }

    pub fn ensure_valid(&self) -> Result<(), CoreError> {
        if self.credential.is_expired() {
            return Err(CoreError::SessionExpired);
        }
        Ok(())
    }

    /// `ws://` or `wss://` URL of the live channel endpoint.
    pub fn ws_url(&self) -> Result<String, CoreError> {
        let rest = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(CoreError::InvalidOperation(format!(
                "unsupported relay url: {}",
                self.base_url
            )));
        };
        Ok(format!("{rest}/ws"))
    }
}
