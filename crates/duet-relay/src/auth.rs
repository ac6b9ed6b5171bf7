//! Session credential issue and verification.

use std::time::Duration;

use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use jsonwebtoken::{errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::Deserialize;
use tracing::debug;

use duet_proto::{SessionClaims, UserId, UserSummary};

use crate::api::AppState;
use crate::error::RelayError;
use crate::store::Store;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    Expired,
    #[error("unknown user")]
    UnknownUser,
    #[error("token encoding failed: {0}")]
    Encode(jsonwebtoken::errors::Error),
}

/// HS256 signer and verifier for session credentials.
pub struct TokenVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Credential for `user` valid for `ttl` from now.
    pub fn issue(&self, user: UserId, ttl: Duration) -> Result<String, AuthError> {
        let iat = Utc::now().timestamp();
        let ttl = i64::try_from(ttl.as_secs()).map_err(|_| AuthError::InvalidToken)?;
        self.sign(&SessionClaims {
            sub: user,
            iat,
            exp: iat.saturating_add(ttl),
        })
    }

    pub fn sign(&self, claims: &SessionClaims) -> Result<String, AuthError> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(AuthError::Encode)
    }

    pub fn verify(&self, token: &str) -> Result<SessionClaims, AuthError> {
        jsonwebtoken::decode::<SessionClaims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken,
            })
    }
}

/// The authenticated caller, placed in request extensions.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: UserSummary,
    /// Credential expiry, unix seconds.
    pub expires_at: i64,
}

impl AuthUser {
    pub fn id(&self) -> UserId {
        self.user.id
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now().timestamp()
    }

    /// Time left on the credential, zero once expired.
    pub fn remaining(&self) -> Duration {
        let left = self.expires_at.saturating_sub(Utc::now().timestamp());
        Duration::from_secs(u64::try_from(left).unwrap_or(0))
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Bearer header first, then `?token=` for clients that cannot set headers
/// on a WebSocket handshake.
fn request_token(req: &Request) -> Option<String> {
    if let Some(token) = extract_bearer_token(req.headers()) {
        return Some(token.to_string());
    }
    Query::<TokenQuery>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(q)| q.token)
}

/// Resolve the caller from a credential.
pub async fn authenticate(state: &AppState, token: Option<&str>) -> Result<AuthUser, AuthError> {
    let claims = state.auth.verify(token.ok_or(AuthError::MissingToken)?)?;
    match state.store.get_user(claims.sub).await {
        Ok(Some(user)) => Ok(AuthUser {
            user,
            expires_at: claims.exp,
        }),
        Ok(None) => Err(AuthError::UnknownUser),
        Err(e) => {
            tracing::error!(error = %e, "user lookup during auth failed");
            Err(AuthError::InvalidToken)
        }
    }
}

/// Rejects the request with 401 before any handler runs unless it carries a
/// valid credential for a known user.
pub async fn auth_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let token = request_token(&req);
    match authenticate(&state, token.as_deref()).await {
        Ok(user) => {
            req.extensions_mut().insert(user);
            next.run(req).await
        }
        Err(e) => {
            debug!(reason = %e, path = %req.uri().path(), "request rejected");
            RelayError::Unauthorized.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret-test-secret";

    #[test]
    fn issued_token_verifies() {
        let verifier = TokenVerifier::new(SECRET);
        let user = UserId::new();
        let token = verifier.issue(user, Duration::from_secs(60)).unwrap();
        let claims = verifier.verify(&token).unwrap();
        assert_eq!(claims.sub, user);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn expired_token_is_rejected() {
        let verifier = TokenVerifier::new(SECRET);
        let now = Utc::now().timestamp();
        let token = verifier
            .sign(&SessionClaims {
                sub: UserId::new(),
                iat: now - 120,
                exp: now - 60,
            })
            .unwrap();
        assert!(matches!(verifier.verify(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let ours = TokenVerifier::new(SECRET);
        let theirs = TokenVerifier::new(b"another-secret-entirely");
        let token = theirs.issue(UserId::new(), Duration::from_secs(60)).unwrap();
        assert!(matches!(ours.verify(&token), Err(AuthError::InvalidToken)));
        assert!(matches!(ours.verify("not.a.jwt"), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn auth_user_tracks_expiry() {
        let user = UserSummary {
            id: UserId::new(),
            username: "alice".into(),
        };
        let now = Utc::now().timestamp();
        let live = AuthUser {
            user: user.clone(),
            expires_at: now + 60,
        };
        assert!(!live.is_expired());
        assert!(live.remaining() > Duration::from_secs(50));

        let stale = AuthUser {
            user,
            expires_at: now - 1,
        };
        assert!(stale.is_expired());
        assert_eq!(stale.remaining(), Duration::ZERO);
    }

    #[test]
    fn bearer_prefix_is_required() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), Some("abc"));
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), None);
    }
}
