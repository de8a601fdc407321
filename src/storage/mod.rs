use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub mod filesystem;
#[cfg(test)]
pub(crate) mod flaky;

pub use filesystem::FilesystemStorage;

/// Error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Path error: {0}")]
    Path(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Insufficient disk space: {available} bytes available, {required} required")]
    InsufficientSpace { available: u64, required: u64 },
}

impl StorageError {
    /// Whether the failure is expected to clear up on a later attempt
    /// (file locked or briefly missing, space freed by another process)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Io(_) | StorageError::InsufficientSpace { .. }
        )
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Disk accessor used by the queues.
///
/// Relative paths resolve against the storage root (the agent's temp path);
/// absolute paths are used as given, which lets the queue hand over files
/// that transports wrote elsewhere.
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Get the base path for this storage backend
    fn base_path(&self) -> &Path;

    /// Resolve a path against the storage root
    fn subpath(&self, path: &Path) -> PathBuf {
        self.base_path().join(path)
    }

    /// Bytes available to unprivileged writers on the storage volume
    fn available_space(&self) -> StorageResult<u64>;

    /// Fail unless at least `floor` bytes are free
    fn check_free_space(&self, floor: u64) -> StorageResult<()> {
        let available = self.available_space()?;
        if available < floor {
            return Err(StorageError::InsufficientSpace {
                available,
                required: floor,
            });
        }
        Ok(())
    }

    /// Write bytes to a file, creating parent directories
    async fn write_file(&self, path: &Path, contents: &[u8]) -> StorageResult<PathBuf> {
        let full_path = self.subpath(path);

        // Ensure parent directory exists
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::write(&full_path, contents).await?;
        Ok(full_path)
    }

    /// Read bytes from a file
    async fn read_file(&self, path: &Path) -> StorageResult<Vec<u8>> {
        let full_path = self.subpath(path);
        tokio::fs::read(&full_path)
            .await
            .map_err(StorageError::from)
    }

    /// Check if a file exists
    fn exists(&self, path: &Path) -> bool {
        self.subpath(path).exists()
    }

    /// Move a file, falling back to copy + remove when a rename is not
    /// possible (e.g. across devices)
    async fn move_file(&self, from: &Path, to: &Path) -> StorageResult<PathBuf> {
        let from = self.subpath(from);
        let to = self.subpath(to);
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::rename(&from, &to).await {
            Ok(()) => Ok(to),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(e.into()),
            Err(_) => {
                tokio::fs::copy(&from, &to).await?;
                tokio::fs::remove_file(&from).await?;
                Ok(to)
            }
        }
    }

    /// Copy a file, creating the destination's parent directories
    async fn copy_file(&self, from: &Path, to: &Path) -> StorageResult<PathBuf> {
        let from = self.subpath(from);
        let to = self.subpath(to);
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&from, &to).await?;
        Ok(to)
    }

    /// Remove a file. A file that is already gone is not an error.
    async fn remove_file(&self, path: &Path) -> StorageResult<()> {
        match tokio::fs::remove_file(self.subpath(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Regular files directly inside a directory; a missing directory is empty
    async fn list_files(&self, dir: &Path) -> StorageResult<Vec<PathBuf>> {
        let dir = self.subpath(dir);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Configuration for storage backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub options: std::collections::HashMap<String, serde_json::Value>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let mut options = std::collections::HashMap::new();
        options.insert(
            "path".to_string(),
            serde_json::Value::String(default_path().to_string()),
        );

        Self {
            backend: default_backend(),
            options,
        }
    }
}

impl StorageConfig {
    /// Root directory configured through the `path` option
    pub fn root_path(&self) -> PathBuf {
        PathBuf::from(
            self.options
                .get("path")
                .and_then(|v| v.as_str())
                .unwrap_or(default_path()),
        )
    }
}

fn default_backend() -> String {
    "filesystem".to_string()
}

fn default_path() -> &'static str {
    "./tmp"
}

/// Create a storage backend from configuration
pub fn create_storage_backend(config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
    match config.backend.as_str() {
        "filesystem" => {
            let storage = FilesystemStorage::new(config.root_path())?;
            Ok(Arc::new(storage))
        }
        _ => Err(StorageError::Config(format!(
            "Unknown storage backend: {}",
            config.backend
        ))),
    }
}
