//! HL7 v2 message access by `segment,field`

use serde::{Deserialize, Serialize};

use crate::error::{DatasetError, Result};

/// A parsed HL7 v2 message.
///
/// The raw text is what gets persisted; segments are re-derived on load, so a
/// message survives a metadata round trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Hl7Message {
    raw: String,
    separator: char,
    segments: Vec<Vec<String>>,
}

impl Hl7Message {
    /// Parse a message, requiring an MSH header segment
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let message = Self::from(raw.into());
        if message.segment("MSH").is_none() {
            return Err(DatasetError::MissingHeader);
        }
        Ok(message)
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Fields of the first segment with the given id (index 0 is the id itself)
    pub fn segment(&self, id: &str) -> Option<&[String]> {
        self.segments
            .iter()
            .find(|s| s.first().is_some_and(|name| name.eq_ignore_ascii_case(id)))
            .map(Vec::as_slice)
    }

    /// Value of `segment-field`, using HL7 numbering. In MSH, field 1 is the
    /// field separator itself, so the remaining fields shift by one.
    pub fn field(&self, segment: &str, field: usize) -> Option<&str> {
        if field == 0 {
            return None;
        }
        let fields = self.segment(segment)?;
        let index = if segment.eq_ignore_ascii_case("MSH") {
            if field == 1 {
                return None;
            }
            field - 1
        } else {
            field
        };
        fields
            .get(index)
            .map(String::as_str)
            .filter(|v| !v.is_empty() && *v != "\"\"")
    }

    pub fn separator(&self) -> char {
        self.separator
    }

    pub fn message_type(&self) -> Option<&str> {
        self.field("MSH", 9)
    }

    pub fn control_id(&self) -> Option<&str> {
        self.field("MSH", 10)
    }

    /// Diagnostic service section (OBR-24), the HL7 counterpart of Modality
    pub fn modality(&self) -> Option<&str> {
        self.field("OBR", 24)
    }

    pub fn referring_physician(&self) -> Option<&str> {
        self.field("PV1", 8)
    }

    /// `PID-3|ORC-2` (falling back to OBR-2 for the placer order number)
    pub fn correlation_key(&self) -> Option<String> {
        let patient = self.field("PID", 3);
        let order = self.field("ORC", 2).or_else(|| self.field("OBR", 2));
        if patient.is_none() && order.is_none() {
            return None;
        }
        Some(format!(
            "{}|{}",
            patient.unwrap_or_default(),
            order.unwrap_or_default()
        ))
    }
}

impl From<String> for Hl7Message {
    fn from(raw: String) -> Self {
        let separator = raw
            .trim_start()
            .strip_prefix("MSH")
            .and_then(|rest| rest.chars().next())
            .unwrap_or('|');

        let segments = raw
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| line.split(separator).map(str::to_string).collect())
            .collect();

        Self {
            raw,
            separator,
            segments,
        }
    }
}

impl From<Hl7Message> for String {
    fn from(message: Hl7Message) -> Self {
        message.raw
    }
}
