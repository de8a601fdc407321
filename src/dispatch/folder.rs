use async_trait::async_trait;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dispatch::transport::{Transport, TransportError};
use crate::models::connections::Connection;
use crate::models::item::RoutedItem;

/// Delivers items into one directory per destination connection.
///
/// The payload keeps its file name and a JSON description of the item is
/// written next to it, for pickup by systems that poll a folder.
#[derive(Debug, Clone)]
pub struct FolderTransport {
    root: PathBuf,
}

impl FolderTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn outbox(&self, connection: &str) -> PathBuf {
        self.root.join(connection)
    }
}

#[async_trait]
impl Transport for FolderTransport {
    async fn send(
        &self,
        item: &RoutedItem,
        destination: &Connection,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Canceled);
        }

        let outbox = self.outbox(&destination.name);
        tokio::fs::create_dir_all(&outbox).await?;

        if let Some(source) = &item.source_file_name {
            let name = source
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(Uuid::new_v4().to_string()));
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Canceled),
                copied = tokio::fs::copy(source, outbox.join(name)) => {
                    copied?;
                }
            }
        }

        let description = serde_json::to_vec_pretty(item).map_err(|err| {
            TransportError::Rejected {
                connection: destination.name.clone(),
                reason: err.to_string(),
            }
        })?;
        tokio::fs::write(outbox.join(format!("{}.json", Uuid::new_v4())), description).await?;

        tracing::debug!(
            "Delivered item '{}' to outbox '{}'",
            item.id,
            outbox.display()
        );
        Ok(())
    }

    fn summary(&self) -> String {
        format!("FolderTransport at '{}'", self.root.display())
    }
}
