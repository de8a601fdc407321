use courier::config::Config;
use courier::storage::{create_storage_backend, StorageConfig, StorageError};
use std::path::Path;
use tempfile::TempDir;

fn storage_config(path: &Path) -> StorageConfig {
    StorageConfig {
        backend: "filesystem".to_string(),
        options: {
            let mut options = std::collections::HashMap::new();
            options.insert(
                "path".to_string(),
                serde_json::Value::String(path.to_string_lossy().to_string()),
            );
            options
        },
    }
}

#[test]
fn test_storage_configuration_parsing() {
    let toml = r#"
        [storage]
        backend = "filesystem"

        [storage.options]
        path = "./tmp/test"
    "#;

    let config = Config::from_toml_str(toml).expect("Config validation failed");

    assert_eq!(config.storage.backend, "filesystem");
    assert_eq!(config.temp_path(), Path::new("./tmp/test"));

    let storage =
        create_storage_backend(&config.storage).expect("Failed to create storage backend");
    assert!(storage.base_path().ends_with("test"));
}

#[tokio::test]
async fn test_filesystem_storage_operations() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let storage =
        create_storage_backend(&storage_config(temp_dir.path())).expect("Failed to create storage");

    let meta = Path::new("modality/inbound/meta/item.meta.json");
    let written = storage
        .write_file(meta, b"{}")
        .await
        .expect("Failed to write file");
    assert!(written.starts_with(storage.base_path()));
    assert!(storage.exists(meta));

    // moves create the target directory
    let moved = storage
        .move_file(meta, Path::new("modality/inbound/errors/meta/item.meta.json"))
        .await
        .expect("Failed to move file");
    assert!(moved.exists());
    assert!(!storage.exists(meta));

    let listed = storage
        .list_files(Path::new("modality/inbound/errors/meta"))
        .await
        .expect("Failed to list files");
    assert_eq!(listed, vec![moved.clone()]);

    // a missing directory lists as empty, a missing file removes cleanly
    assert!(storage
        .list_files(Path::new("nowhere"))
        .await
        .expect("list missing dir")
        .is_empty());
    storage
        .remove_file(Path::new("nowhere/file"))
        .await
        .expect("remove missing file");
}

#[test]
fn test_free_space_floor() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let storage =
        create_storage_backend(&storage_config(temp_dir.path())).expect("Failed to create storage");

    storage.check_free_space(0).expect("no floor");
    let err = storage.check_free_space(u64::MAX).unwrap_err();
    assert!(matches!(err, StorageError::InsufficientSpace { .. }));
}

#[test]
fn test_unknown_backend_is_rejected() {
    let invalid_config = StorageConfig {
        backend: "invalid_backend".to_string(),
        options: std::collections::HashMap::new(),
    };

    let result = create_storage_backend(&invalid_config);
    assert!(result.is_err());
    let error_msg = result.unwrap_err().to_string();
    assert!(error_msg.contains("Unknown storage backend"));
}

#[test]
fn test_storage_error_messages_and_source() {
    use std::error::Error as _;

    let err = StorageError::InsufficientSpace {
        available: 10,
        required: 20,
    };
    assert_eq!(
        err.to_string(),
        "Insufficient disk space: 10 bytes available, 20 required"
    );
    assert!(err.is_transient());
    assert!(err.source().is_none());

    let err = StorageError::from(std::io::Error::new(
        std::io::ErrorKind::PermissionDenied,
        "read-only volume",
    ));
    assert_eq!(err.to_string(), "IO error: read-only volume");
    assert!(err.source().is_some());

    let err = StorageError::Config("no root".to_string());
    assert_eq!(err.to_string(), "Configuration error: no root");
    assert!(!err.is_transient());
}
