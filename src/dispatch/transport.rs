use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::connections::Connection;
use crate::models::item::RoutedItem;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection '{connection}' is unavailable: {reason}")]
    Unavailable { connection: String, reason: String },

    #[error("connection '{connection}' rejected the item: {reason}")]
    Rejected { connection: String, reason: String },

    #[error("no transport handles connection '{0}'")]
    NotConfigured(String),

    #[error("send canceled")]
    Canceled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Retrying cannot help; the item goes straight to the error archive
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TransportError::Rejected { .. } | TransportError::NotConfigured(_)
        )
    }
}

/// Protocol side of a send.
///
/// Each protocol (cloud upload, DICOM store, HL7 over MLLP, ...) implements
/// this trait; the dispatcher handles queueing, retries and admission
/// around it. Implementations should return `Canceled` promptly once
/// `cancel` fires.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        item: &RoutedItem,
        destination: &Connection,
        cancel: CancellationToken,
    ) -> Result<(), TransportError>;

    /// Returns a human-readable summary of the transport, used for logging
    fn summary(&self) -> String;
}
