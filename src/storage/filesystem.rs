use crate::storage::{StorageBackend, StorageError, StorageResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Filesystem-based storage backend
///
/// Stores queue payloads and metadata in a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root_path: PathBuf,
}

impl FilesystemStorage {
    /// Create a new filesystem storage backend with the given root path
    pub fn new<P: AsRef<Path>>(root_path: P) -> StorageResult<Self> {
        let root_path = root_path.as_ref().to_path_buf();

        // Validate that the path can be created if it doesn't exist
        if !root_path.exists() {
            std::fs::create_dir_all(&root_path).map_err(|e| {
                StorageError::Config(format!(
                    "Failed to create storage root directory '{}': {}",
                    root_path.display(),
                    e
                ))
            })?;
        }

        // Do NOT canonicalize: on macOS /var resolves to /private/var and the
        // metadata paths recorded in items would no longer match the
        // configured temp path.
        Ok(Self { root_path })
    }
}

#[async_trait]
impl StorageBackend for FilesystemStorage {
    fn base_path(&self) -> &Path {
        &self.root_path
    }

    fn available_space(&self) -> StorageResult<u64> {
        fs2::available_space(&self.root_path).map_err(StorageError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_filesystem_storage_creation() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path().join("nested/root");
        let storage = FilesystemStorage::new(&root).expect("Failed to create storage");

        assert_eq!(storage.base_path(), root.as_path());
        assert!(root.is_dir());
    }

    #[test]
    fn test_relative_and_absolute_subpaths() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let storage = FilesystemStorage::new(temp_dir.path()).expect("Failed to create storage");

        let relative = storage.subpath(Path::new("conn/toCloud"));
        assert!(relative.starts_with(storage.base_path()));

        let absolute = storage.subpath(Path::new("/elsewhere/file.dcm"));
        assert_eq!(absolute, PathBuf::from("/elsewhere/file.dcm"));
    }

    #[test]
    fn test_free_space_floor() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let storage = FilesystemStorage::new(temp_dir.path()).expect("Failed to create storage");

        assert!(storage.available_space().expect("statvfs") > 0);
        assert!(storage.check_free_space(0).is_ok());
        match storage.check_free_space(u64::MAX) {
            Err(StorageError::InsufficientSpace { required, .. }) => assert_eq!(required, u64::MAX),
            other => panic!("Expected InsufficientSpace, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_file_operations() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let storage = FilesystemStorage::new(temp_dir.path()).expect("Failed to create storage");

        let written = storage
            .write_file(Path::new("a/data.txt"), b"payload")
            .await
            .expect("Failed to write file");
        assert!(written.exists());

        let copied = storage
            .copy_file(Path::new("a/data.txt"), Path::new("b/copy.txt"))
            .await
            .expect("Failed to copy file");
        assert!(written.exists());
        assert_eq!(storage.read_file(&copied).await.unwrap(), b"payload");

        let moved = storage
            .move_file(Path::new("a/data.txt"), Path::new("c/moved.txt"))
            .await
            .expect("Failed to move file");
        assert!(!written.exists());
        assert!(moved.exists());

        let listed = storage.list_files(Path::new("c")).await.unwrap();
        assert_eq!(listed, vec![moved.clone()]);
        assert!(storage.list_files(Path::new("missing")).await.unwrap().is_empty());

        storage.remove_file(&moved).await.expect("Failed to remove file");
        storage
            .remove_file(&moved)
            .await
            .expect("Removing a missing file is not an error");
        assert!(!storage.exists(&moved));
    }

    #[tokio::test]
    async fn test_move_missing_file_fails() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let storage = FilesystemStorage::new(temp_dir.path()).expect("Failed to create storage");

        let result = storage
            .move_file(Path::new("nope.dcm"), Path::new("q/nope.dcm"))
            .await;
        assert!(matches!(result, Err(StorageError::Io(_))));
    }
}
