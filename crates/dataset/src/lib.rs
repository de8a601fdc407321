//! Typed protocol datasets for courier routing
//!
//! Routing rules address protocol fields by string (`0008,0060`, `PID,3`).
//! This crate turns those strings into [`TagAddress`] values and resolves them
//! against either a DICOM attribute snapshot or a parsed HL7 v2 message, so
//! rule matching never has to coerce loosely-typed dictionaries itself.

pub mod address;
pub mod dicom;
pub mod error;
pub mod hl7;

pub use address::{parse_dicom_tag, tag_key, TagAddress};
pub use dicom::DicomDataset;
pub use error::{DatasetError, Result};
pub use hl7::Hl7Message;

use serde::{Deserialize, Serialize};

/// Protocol fields extracted from a routed item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", content = "data", rename_all = "snake_case")]
pub enum ProtocolDataset {
    Dicom(DicomDataset),
    Hl7(Hl7Message),
}

impl ProtocolDataset {
    /// Parse a rule tag string for this dataset's protocol
    pub fn address(&self, raw: &str) -> Result<TagAddress> {
        match self {
            ProtocolDataset::Dicom(_) => TagAddress::parse_dicom(raw),
            ProtocolDataset::Hl7(_) => TagAddress::parse_hl7(raw),
        }
    }

    /// Resolve an address. Addresses of the other protocol never resolve.
    pub fn value(&self, address: &TagAddress) -> Option<&str> {
        match (self, address) {
            (ProtocolDataset::Dicom(ds), TagAddress::Dicom(tag)) => ds.get(*tag),
            (ProtocolDataset::Hl7(msg), TagAddress::Hl7 { segment, field }) => {
                msg.field(segment, *field)
            }
            _ => None,
        }
    }

    pub fn modality(&self) -> Option<&str> {
        match self {
            ProtocolDataset::Dicom(ds) => ds.modality(),
            ProtocolDataset::Hl7(msg) => msg.modality(),
        }
    }

    pub fn referring_physician(&self) -> Option<&str> {
        match self {
            ProtocolDataset::Dicom(ds) => ds.referring_physician(),
            ProtocolDataset::Hl7(msg) => msg.referring_physician(),
        }
    }

    pub fn correlation_key(&self) -> Option<String> {
        match self {
            ProtocolDataset::Dicom(ds) => ds.correlation_key(),
            ProtocolDataset::Hl7(msg) => msg.correlation_key(),
        }
    }

    /// Union another dataset into this one. DICOM snapshots gain missing
    /// elements; an HL7 message is immutable and keeps its own text.
    pub fn merge(&mut self, other: &ProtocolDataset) {
        if let (ProtocolDataset::Dicom(ours), ProtocolDataset::Dicom(theirs)) = (self, other) {
            ours.merge(theirs);
        }
    }
}

impl From<DicomDataset> for ProtocolDataset {
    fn from(ds: DicomDataset) -> Self {
        ProtocolDataset::Dicom(ds)
    }
}

impl From<Hl7Message> for ProtocolDataset {
    fn from(msg: Hl7Message) -> Self {
        ProtocolDataset::Hl7(msg)
    }
}
