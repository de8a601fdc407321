//! DICOM attribute snapshot

use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::address::{parse_dicom_tag, tag_key};

/// String values of the data elements extracted from a DICOM object.
///
/// Only elements with a textual representation are kept; sequences and
/// binary payloads (pixel data) are skipped. Keys are stored in canonical
/// `GGGG,EEEE` form so the snapshot serializes to a flat JSON object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DicomDataset {
    elements: BTreeMap<String, String>,
}

impl DicomDataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extract every textual element of a parsed DICOM object
    pub fn from_object(object: &InMemDicomObject) -> Self {
        let mut dataset = Self::new();
        for element in object {
            let tag = element.header().tag;
            if tag == tags::PIXEL_DATA {
                continue;
            }
            if let Ok(value) = element.to_str() {
                dataset.insert(tag, value.trim());
            }
        }
        dataset
    }

    pub fn insert(&mut self, tag: Tag, value: impl Into<String>) {
        self.elements.insert(tag_key(tag), value.into());
    }

    /// Value of an element. Empty values count as absent.
    pub fn get(&self, tag: Tag) -> Option<&str> {
        self.elements
            .get(&tag_key(tag))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.get(tag).is_some()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Tag, &str)> {
        self.elements
            .iter()
            .filter_map(|(k, v)| parse_dicom_tag(k).ok().map(|t| (t, v.as_str())))
    }

    /// Add elements from `other` that are not present here
    pub fn merge(&mut self, other: &DicomDataset) {
        for (key, value) in &other.elements {
            self.elements
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }

    pub fn modality(&self) -> Option<&str> {
        self.get(tags::MODALITY)
    }

    pub fn referring_physician(&self) -> Option<&str> {
        self.get(tags::REFERRING_PHYSICIAN_NAME)
    }

    /// Business key shared by every copy of the same study:
    /// `PatientID|AccessionNumber|StudyInstanceUID`.
    pub fn correlation_key(&self) -> Option<String> {
        let parts = [
            self.get(tags::PATIENT_ID),
            self.get(tags::ACCESSION_NUMBER),
            self.get(tags::STUDY_INSTANCE_UID),
        ];
        if parts.iter().all(Option::is_none) {
            return None;
        }
        Some(
            parts
                .iter()
                .map(|p| p.unwrap_or_default())
                .collect::<Vec<_>>()
                .join("|"),
        )
    }
}
