//! Identity bootstrap run once per login.

use std::sync::Arc;

use tracing::info;

use duet_crypto::IdentityKeypair;

use crate::api::RelayApi;
use crate::errors::CoreError;
use crate::keystore::KeyStore;

/// Load (or create) the device identity and publish its public half.
///
/// Publishing is an upsert, so calling this on every login is harmless. A
/// cleared keystore means a new identity silently replaces the old one in
/// the directory; peers holding keys derived from the old one get no signal.
pub async fn bootstrap_identity(
    keystore: Arc<KeyStore>,
    api: &dyn RelayApi,
) -> Result<IdentityKeypair, CoreError> {
    let identity = tokio::task::spawn_blocking(move || keystore.load_or_generate()).await??;
    api.publish_key(&identity.public_portable()).await?;
    info!(fingerprint = %identity.fingerprint(), "identity published");
    Ok(identity)
}
