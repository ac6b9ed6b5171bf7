//! Claims carried by a session credential.

use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// JWT claims: subject user, issued-at and expiry in unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: UserId,
    pub iat: i64,
    pub exp: i64,
}

impl SessionClaims {
    pub fn is_expired_at(&self, now_unix: i64) -> bool {
        self.exp <= now_unix
    }
}
