//! Raw message file storage

use async_trait::async_trait;
use courier_common::config::StorageConfig;
use courier_common::types::{MessageId, ServerId};
use courier_common::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

/// File storage trait
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Store a file and return its path
    async fn store(&self, path: &str, data: &[u8]) -> Result<String>;

    /// Read a file
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Delete a file
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if a file exists
    async fn exists(&self, path: &str) -> Result<bool>;
}

/// Local filesystem storage
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    /// Create a new local storage instance from config
    pub fn new(config: &StorageConfig) -> Result<Self> {
        Self::from_path(&config.path)
    }

    /// Create a new local storage instance from a path
    pub fn from_path(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .map_err(|e| Error::Storage(format!("Failed to create storage directory: {}", e)))?;

        info!(path = %path.display(), "Initialized raw message storage");

        Ok(Self {
            base_path: path.to_path_buf(),
        })
    }

    /// Resolve a relative path below the base directory
    fn full_path(&self, path: &str) -> Result<PathBuf> {
        if path.split(['/', '\\']).any(|part| part == "..") {
            return Err(Error::Storage(
                "Path traversal detected: '..' is not allowed".to_string(),
            ));
        }

        if path.starts_with('/') || path.starts_with('\\') {
            return Err(Error::Storage("Absolute paths are not allowed".to_string()));
        }

        Ok(self.base_path.join(path))
    }

    async fn ensure_parent_exists(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage(format!("Failed to create directory: {}", e)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl FileStorage for LocalStorage {
    async fn store(&self, path: &str, data: &[u8]) -> Result<String> {
        let full_path = self.full_path(path)?;
        self.ensure_parent_exists(&full_path).await?;

        // Write to a sibling file and rename so readers never see a partial message
        let tmp_path = full_path.with_extension("tmp");
        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to create file: {}", e)))?;

        file.write_all(data)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write file: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| Error::Storage(format!("Failed to flush file: {}", e)))?;

        fs::rename(&tmp_path, &full_path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to move file into place: {}", e)))?;

        debug!(path = %path, size = data.len(), "Stored file");

        Ok(path.to_string())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path)?;

        let mut file = fs::File::open(&full_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("File {}", path))
            } else {
                Error::Storage(format!("Failed to open file: {}", e))
            }
        })?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .await
            .map_err(|e| Error::Storage(format!("Failed to read file: {}", e)))?;

        debug!(path = %path, size = data.len(), "Read file");

        Ok(data)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path)?;

        fs::remove_file(&full_path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to delete file: {}", e)))?;

        debug!(path = %path, "Deleted file");

        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.full_path(path)?;
        Ok(fs::try_exists(&full_path).await.unwrap_or(false))
    }
}

/// Raw message storage helper
#[derive(Clone)]
pub struct MessageStorage {
    storage: Arc<dyn FileStorage>,
}

impl MessageStorage {
    /// Create a new message storage
    pub fn new(storage: Arc<dyn FileStorage>) -> Self {
        Self { storage }
    }

    /// Generate storage path for a raw message
    pub fn generate_path(server_id: &ServerId, message_id: &MessageId) -> String {
        format!("{}/{}.eml", server_id, message_id)
    }

    /// Store a raw message
    pub async fn store_raw(
        &self,
        server_id: &ServerId,
        message_id: &MessageId,
        data: &[u8],
    ) -> Result<String> {
        let path = Self::generate_path(server_id, message_id);
        self.storage.store(&path, data).await
    }

    /// Replace the raw message at an existing path
    pub async fn replace_raw(&self, path: &str, data: &[u8]) -> Result<()> {
        self.storage.store(path, data).await.map(|_| ())
    }

    /// Read a raw message, `None` when it has been removed
    pub async fn read_raw(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.storage.read(path).await {
            Ok(data) => Ok(Some(data)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete a raw message
    pub async fn delete_raw(&self, path: &str) -> Result<()> {
        self.storage.delete(path).await
    }
}
