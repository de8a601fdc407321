use std::path::Path;

use crate::models::item::RoutedItem;
use crate::queue::error::{QueueError, QueueResult};

/// JSON snapshot written to an item's metadata file
pub fn encode(item: &RoutedItem) -> QueueResult<Vec<u8>> {
    let bytes = serde_json::to_vec_pretty(item).map_err(|err| QueueError::Serialization {
        id: item.id.clone(),
        reason: err.to_string(),
    })?;
    if bytes.is_empty() {
        return Err(QueueError::Serialization {
            id: item.id.clone(),
            reason: "empty snapshot".to_string(),
        });
    }
    Ok(bytes)
}

pub fn decode(bytes: &[u8], path: &Path) -> QueueResult<RoutedItem> {
    let mut item: RoutedItem =
        serde_json::from_slice(bytes).map_err(|source| QueueError::Metadata {
            path: path.to_path_buf(),
            source,
        })?;
    // the file on disk is authoritative for where the snapshot lives
    item.metadata_file_path = Some(path.to_path_buf());
    Ok(item)
}
