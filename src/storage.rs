use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Longest stored name the registry column accepts.
const MAX_STORED_NAME_CHARS: usize = 255;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Location of one persisted upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub stored_name: String,
    pub path: String,
}

#[async_trait]
pub trait ContentStore: Send + Sync + 'static {
    /// Persists `bytes` durably under a fresh collision-resistant name.
    async fn store(&self, original_name: &str, bytes: &[u8]) -> StorageResult<StoredObject>;

    /// Removing an object that is already gone is not an error.
    async fn remove(&self, path: &str) -> StorageResult<()>;
}

/// Lowercase hex SHA-256 of the content.
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub struct LocalContentStore {
    root: PathBuf,
}

impl LocalContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn store(&self, original_name: &str, bytes: &[u8]) -> StorageResult<StoredObject> {
        let stored_name = stored_name_for(original_name);
        let path = self.root.join(&stored_name);
        let write_err = |source| StorageError::Write {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.root).await.map_err(write_err)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(write_err)?;
        file.write_all(bytes).await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;

        Ok(StoredObject {
            stored_name,
            path: path.to_string_lossy().into_owned(),
        })
    }

    async fn remove(&self, path: &str) -> StorageResult<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Remove {
                path: PathBuf::from(path),
                source,
            }),
        }
    }
}

/// `<uuid>_<sanitized original name>`, keeping the extension that format
/// dispatch relies on.
fn stored_name_for(original_name: &str) -> String {
    let base = Path::new(original_name)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("upload");
    let sanitized: String = base
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | '\0' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect();
    let prefix = Uuid::new_v4().simple().to_string();
    let budget = MAX_STORED_NAME_CHARS - prefix.len() - 1;
    let char_count = sanitized.chars().count();
    // Keep the tail so the extension survives truncation.
    let tail: String = sanitized
        .chars()
        .skip(char_count.saturating_sub(budget))
        .collect();
    format!("{prefix}_{tail}")
}
