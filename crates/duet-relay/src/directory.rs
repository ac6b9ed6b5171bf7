//! Key Directory: one public key per user.

use std::sync::Arc;

use tracing::{info, warn};

use duet_crypto::PublicKeyMaterial;
use duet_proto::{PortableKey, UserId};

use crate::error::RelayError;
use crate::metrics::RelayMetrics;
use crate::store::Store;

pub struct KeyDirectory {
    store: Arc<dyn Store>,
    metrics: Arc<RelayMetrics>,
}

impl KeyDirectory {
    pub fn new(store: Arc<dyn Store>, metrics: Arc<RelayMetrics>) -> Self {
        Self { store, metrics }
    }

    /// Upsert the caller's public key. Last write wins.
    ///
    /// Replacing an existing key is logged with both fingerprints but not
    /// signalled to anyone; peers keep whatever they derived earlier.
    pub async fn publish(&self, owner: UserId, material: &PortableKey) -> Result<(), RelayError> {
        let key = PublicKeyMaterial::from_portable(material)
            .map_err(|e| RelayError::InvalidOperation(format!("invalid public key: {}", e)))?;

        let previous = self.store.upsert_key(owner, &key.to_portable()).await?;
        self.metrics.keys_published.inc();

        match previous.map(|p| PublicKeyMaterial::from_portable(&p)) {
            None => info!(user = %owner, fingerprint = %key.fingerprint(), "public key published"),
            Some(Ok(old)) if old == key => {}
            Some(Ok(old)) => warn!(
                user = %owner,
                old = %old.fingerprint(),
                new = %key.fingerprint(),
                "public key replaced"
            ),
            Some(Err(e)) => warn!(user = %owner, error = %e, "replaced an unreadable public key"),
        }
        Ok(())
    }

    pub async fn lookup(&self, user: UserId) -> Result<PortableKey, RelayError> {
        self.store.get_key(user).await?.ok_or(RelayError::NotFound)
    }
}
