//! Identity KeyStore.
//!
//! One long-lived key-agreement keypair per device, persisted as a
//! versioned JSON document holding both halves in portable form. The file
//! backend writes atomically through a temp file and restricts permissions
//! to the owner on Unix.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use duet_crypto::IdentityKeypair;
use duet_proto::PortableKey;

use crate::errors::CoreError;

/// Persisted identity document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredIdentity {
    pub version: u32,
    pub private_key: PortableKey,
    pub public_key: PortableKey,
    pub created_at: DateTime<Utc>,
}

impl StoredIdentity {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(identity: &IdentityKeypair) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            private_key: identity.to_portable(),
            public_key: identity.public_portable(),
            created_at: Utc::now(),
        }
    }

    /// Rebuild the keypair, checking that both stored halves agree.
    pub fn to_keypair(&self) -> Result<IdentityKeypair, CoreError> {
        if self.version != Self::CURRENT_VERSION {
            return Err(CoreError::Storage(format!(
                "unsupported identity version {}",
                self.version
            )));
        }
        let identity = IdentityKeypair::from_portable(&self.private_key)
            .map_err(|e| CoreError::Storage(format!("stored private key unusable: {e}")))?;
        if identity.public_portable() != self.public_key.public_only() {
            return Err(CoreError::Storage(
                "stored public key does not match private key".to_string(),
            ));
        }
        Ok(identity)
    }
}

/// Storage backend for the identity document.
pub trait IdentityStore: Send + Sync {
    fn load(&self) -> Result<Option<StoredIdentity>, CoreError>;
    fn store(&self, identity: &StoredIdentity) -> Result<(), CoreError>;
    fn delete(&self) -> Result<(), CoreError>;
}

fn io_err(context: &str, err: std::io::Error) -> CoreError {
    CoreError::Storage(format!("{context}: {err}"))
}

/// JSON file backend.
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/duet/identity.json` for the current platform.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("chat", "duet", "duet")
            .map(|dirs| dirs.data_dir().join("identity.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentityStore for FileKeyStore {
    fn load(&self) -> Result<Option<StoredIdentity>, CoreError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err("read identity", e)),
        };
        let stored = serde_json::from_str(&contents)
            .map_err(|e| CoreError::Storage(format!("identity file corrupt: {e}")))?;
        Ok(Some(stored))
    }

    fn store(&self, identity: &StoredIdentity) -> Result<(), CoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| io_err("create identity dir", e))?;
            }
        }

        let json = serde_json::to_string_pretty(identity)
            .map_err(|e| CoreError::Storage(e.to_string()))?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).map_err(|e| io_err("create temp file", e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&temp_path, fs::Permissions::from_mode(0o600))
                .map_err(|e| io_err("restrict permissions", e))?;
        }

        file.write_all(json.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| io_err("write identity", e))?;
        drop(file);

        fs::rename(&temp_path, &self.path).map_err(|e| io_err("replace identity", e))?;
        Ok(())
    }

    fn delete(&self) -> Result<(), CoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("delete identity", e)),
        }
    }
}

/// In-memory backend.
#[derive(Default)]
pub struct MemoryKeyStore {
    slot: Mutex<Option<StoredIdentity>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<StoredIdentity>>, CoreError> {
        self.slot
            .lock()
            .map_err(|_| CoreError::Storage("identity slot poisoned".to_string()))
    }
}

impl IdentityStore for MemoryKeyStore {
    fn load(&self) -> Result<Option<StoredIdentity>, CoreError> {
        Ok(self.slot()?.clone())
    }

    fn store(&self, identity: &StoredIdentity) -> Result<(), CoreError> {
        *self.slot()? = Some(identity.clone());
        Ok(())
    }

    fn delete(&self) -> Result<(), CoreError> {
        *self.slot()? = None;
        Ok(())
    }
}

/// The device's identity keystore.
pub struct KeyStore {
    backend: Box<dyn IdentityStore>,
}

impl KeyStore {
    pub fn new(backend: impl IdentityStore + 'static) -> Self {
        Self {
            backend: Box::new(backend),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryKeyStore::new())
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(FileKeyStore::new(path))
    }

    /// Return the stored keypair, generating and persisting one on first use.
    ///
    /// A stored document that cannot be read back is an error, never a
    /// reason to regenerate.
    pub fn load_or_generate(&self) -> Result<IdentityKeypair, CoreError> {
        if let Some(stored) = self.backend.load()? {
            let identity = stored.to_keypair()?;
            debug!(fingerprint = %identity.fingerprint(), "loaded identity");
            return Ok(identity);
        }

        let identity = IdentityKeypair::generate();
        self.backend.store(&StoredIdentity::new(&identity))?;
        info!(fingerprint = %identity.fingerprint(), "generated new identity");
        Ok(identity)
    }

    /// Forget the stored identity. The next `load_or_generate` creates a new one.
    pub fn clear(&self) -> Result<(), CoreError> {
        self.backend.delete()
    }
}
