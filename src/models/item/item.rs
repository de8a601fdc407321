use chrono::{DateTime, Utc};
use courier_dataset::{DicomDataset, Hl7Message, ProtocolDataset};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Kind of payload an item carries; selects the transport that handles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ItemType {
    Dicom,
    Hl7,
    File,
    Rpc,
    Completion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ItemStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }
}

/// Coarse queue priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// A destination connection, optionally addressed to share destinations
/// (sub-recipients inside a multi-tenant connection).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSet {
    pub connection_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub share_destinations: Vec<String>,
}

impl ConnectionSet {
    pub fn new(connection_name: impl Into<String>) -> Self {
        Self {
            connection_name: connection_name.into(),
            share_destinations: Vec::new(),
        }
    }

    pub fn with_share_destinations<I, S>(mut self, shares: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for share in shares {
            push_unique(&mut self.share_destinations, share.into());
        }
        self
    }

    /// Union the share destinations of `other` into this set
    pub fn absorb(&mut self, other: &ConnectionSet) {
        for share in &other.share_destinations {
            push_unique(&mut self.share_destinations, share.clone());
        }
    }
}

/// Outcome reported by one responder for a correlated request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub connection: String,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// The durable unit of work moved between connections.
///
/// Everything in here is plain data and serializes to the item's metadata
/// file. Open file handles and parsed documents live in the queue's
/// resource table, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedItem {
    /// Business correlation key, stable across retries and responders
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    #[serde(default)]
    pub status: ItemStatus,
    pub from_connection: String,
    #[serde(default)]
    pub to_connections: Vec<ConnectionSet>,
    /// Destinations this item was already placed on while being routed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routed_to: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file_name: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_file_name: Option<PathBuf>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub response: Vec<String>,
    #[serde(default)]
    pub results: Vec<ResultRecord>,
    #[serde(default)]
    pub tag_data: Option<ProtocolDataset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl RoutedItem {
    pub fn new(id: impl Into<String>, item_type: ItemType, from_connection: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            item_type,
            status: ItemStatus::Pending,
            from_connection: from_connection.into(),
            to_connections: Vec::new(),
            routed_to: Vec::new(),
            source_file_name: None,
            dest_file_name: None,
            attempts: 0,
            last_attempt: None,
            priority: Priority::Medium,
            response: Vec::new(),
            results: Vec::new(),
            tag_data: None,
            metadata_file_path: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// A received DICOM instance. The id comes from the study identifiers,
    /// so every instance of one study correlates; without them the item gets
    /// a random id of its own.
    pub fn from_dicom(
        from_connection: impl Into<String>,
        dataset: DicomDataset,
        file: impl Into<PathBuf>,
    ) -> Self {
        let id = dataset
            .correlation_key()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self::new(id, ItemType::Dicom, from_connection)
            .with_source_file(file)
            .with_tag_data(dataset)
    }

    /// A received HL7 message, correlated by patient and order number
    pub fn from_hl7(from_connection: impl Into<String>, message: Hl7Message) -> Self {
        let id = message
            .correlation_key()
            .or_else(|| message.control_id().map(str::to_string))
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self::new(id, ItemType::Hl7, from_connection).with_tag_data(message)
    }

    /// A remote-procedure request identified by an externally supplied id
    pub fn request(from_connection: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self::new(request_id, ItemType::Rpc, from_connection)
    }

    pub fn with_source_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.source_file_name = Some(file.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tag_data(mut self, dataset: impl Into<ProtocolDataset>) -> Self {
        self.tag_data = Some(dataset.into());
        self
    }

    pub fn with_destination(mut self, destination: ConnectionSet) -> Self {
        self.add_destination(destination);
        self
    }

    /// Add a destination; an existing entry for the same connection gains the
    /// new share destinations instead of being duplicated.
    pub fn add_destination(&mut self, destination: ConnectionSet) {
        merge_destination(&mut self.to_connections, destination);
    }

    pub fn add_response(&mut self, payload: impl Into<String>) {
        push_unique(&mut self.response, payload.into());
    }

    pub fn add_result(&mut self, record: ResultRecord) {
        push_unique(&mut self.results, record);
    }

    pub fn has_file(&self) -> bool {
        self.source_file_name.is_some()
    }

    /// Idempotent union of a later arrival of the same (id, from_connection).
    /// A terminal status replaces a pending one; collections are unioned.
    pub fn merge_from(&mut self, other: &RoutedItem) {
        for destination in &other.to_connections {
            self.add_destination(destination.clone());
        }
        if other.status.is_terminal() || !self.status.is_terminal() {
            self.status = other.status;
        }
        for payload in &other.response {
            self.add_response(payload.clone());
        }
        for record in &other.results {
            self.add_result(record.clone());
        }
        match (&mut self.tag_data, &other.tag_data) {
            (Some(ours), Some(theirs)) => ours.merge(theirs),
            (None, Some(theirs)) => self.tag_data = Some(theirs.clone()),
            _ => {}
        }
        if other.last_error.is_some() {
            self.last_error = other.last_error.clone();
        }
    }
}

/// Add `destination` to `list`, folding it into an existing entry for the
/// same connection
pub fn merge_destination(list: &mut Vec<ConnectionSet>, destination: ConnectionSet) {
    match list
        .iter_mut()
        .find(|c| c.connection_name == destination.connection_name)
    {
        Some(existing) => existing.absorb(&destination),
        None => list.push(destination),
    }
}

/// Sentinel `last_attempt` for items that must not be picked up again
pub fn far_future() -> DateTime<Utc> {
    DateTime::from_timestamp(253_402_300_799, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn push_unique<T: PartialEq>(values: &mut Vec<T>, value: T) {
    if !values.contains(&value) {
        values.push(value);
    }
}
