//! Durable credential persistence.
//!
//! Credential material is opaque to this crate: the transport hands out
//! rotated credentials via [`ConnectionUpdate::CredsUpdated`](crate::ConnectionUpdate)
//! and the session layer stores them. The only structure the session layer
//! relies on is whether the material is *registered*, i.e. whether a pairing
//! has completed with it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// File name used inside the credential directory
pub const CREDENTIALS_FILE: &str = "creds.json";

/// Credential store errors
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// Reading or writing the credential directory failed
    #[error("credential I/O error: {0}")]
    Io(#[from] io::Error),

    /// Stored material could not be decoded
    #[error("corrupt credential file: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Result type for credential store operations
pub type CredentialResult<T> = Result<T, CredentialError>;

/// Protocol credentials for one linked device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Pairing completed with this material
    pub registered: bool,
    /// Opaque key material owned by the transport
    #[serde(default)]
    pub material: Vec<u8>,
}

impl Credentials {
    /// Unregistered credentials wrapping `material`
    #[must_use]
    pub fn unregistered(material: Vec<u8>) -> Self {
        Self {
            registered: false,
            material,
        }
    }
}

/// Durable key/value persistence of protocol credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load stored credentials, `None` if nothing has been stored.
    ///
    /// # Errors
    /// Returns `CredentialError` if the store cannot be read
    async fn load(&self) -> CredentialResult<Option<Credentials>>;

    /// Replace stored credentials.
    ///
    /// # Errors
    /// Returns `CredentialError` if the store cannot be written
    async fn save(&self, credentials: &Credentials) -> CredentialResult<()>;

    /// Delete all stored credentials. Succeeds when nothing is stored.
    ///
    /// # Errors
    /// Returns `CredentialError` if the store cannot be cleared
    async fn purge(&self) -> CredentialResult<()>;

    /// Whether stored credentials have completed pairing.
    ///
    /// # Errors
    /// Returns `CredentialError` if the store cannot be read
    async fn is_registered(&self) -> CredentialResult<bool> {
        Ok(self.load().await?.is_some_and(|c| c.registered))
    }
}

/// Credential store backed by a directory on disk
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    /// Open the store rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    /// Returns `CredentialError::Io` if the directory cannot be created
    pub async fn open(dir: impl Into<PathBuf>) -> CredentialResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Directory holding the credential files
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self) -> PathBuf {
        self.dir.join(CREDENTIALS_FILE)
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> CredentialResult<Option<Credentials>> {
        match tokio::fs::read(self.file()).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, credentials: &Credentials) -> CredentialResult<()> {
        let bytes = serde_json::to_vec_pretty(credentials)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        // Write-then-rename so a crash never leaves a half-written file
        let tmp = self.dir.join(format!("{CREDENTIALS_FILE}.tmp"));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, self.file()).await?;
        Ok(())
    }

    async fn purge(&self) -> CredentialResult<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        tracing::debug!(dir = %self.dir.display(), "Credential directory purged");
        Ok(())
    }
}

/// In-memory credential store, for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    slot: RwLock<Option<Credentials>>,
}

impl MemoryCredentialStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `credentials`
    #[must_use]
    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            slot: RwLock::new(Some(credentials)),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> CredentialResult<Option<Credentials>> {
        Ok(self.slot.read().await.clone())
    }

    async fn save(&self, credentials: &Credentials) -> CredentialResult<()> {
        *self.slot.write().await = Some(credentials.clone());
        Ok(())
    }

    async fn purge(&self) -> CredentialResult<()> {
        *self.slot.write().await = None;
        Ok(())
    }
}
