//! Rule tag addresses
//!
//! A rule tag is written as a string in configuration. Its meaning depends on
//! the protocol of the item being evaluated: for DICOM it names a data element
//! (`0008,0060`, `(0008,0060)` or `00080060`), for HL7 it names a
//! `segment,field` pair (`PID,3`).

use dicom_core::Tag;
use std::fmt;

use crate::error::{DatasetError, Result};

/// A resolved location inside a protocol dataset
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TagAddress {
    /// DICOM data element
    Dicom(Tag),
    /// HL7 segment id and 1-based field index
    Hl7 { segment: String, field: usize },
}

impl TagAddress {
    /// Parse a DICOM data element reference
    pub fn parse_dicom(raw: &str) -> Result<Self> {
        parse_dicom_tag(raw).map(TagAddress::Dicom)
    }

    /// Parse an HL7 `segment,field` reference
    pub fn parse_hl7(raw: &str) -> Result<Self> {
        let invalid = || DatasetError::InvalidHl7Address(raw.to_string());
        let (segment, field) = raw.trim().split_once([',', '-', '.']).ok_or_else(invalid)?;
        let segment = segment.trim().to_ascii_uppercase();
        if segment.len() != 3 || !segment.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }
        let field: usize = field.trim().parse().map_err(|_| invalid())?;
        if field == 0 {
            return Err(invalid());
        }
        Ok(TagAddress::Hl7 { segment, field })
    }
}

impl fmt::Display for TagAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagAddress::Dicom(tag) => write!(f, "{}", tag_key(*tag)),
            TagAddress::Hl7 { segment, field } => write!(f, "{},{}", segment, field),
        }
    }
}

/// Canonical `GGGG,EEEE` key for a tag
pub fn tag_key(tag: Tag) -> String {
    format!("{:04X},{:04X}", tag.group(), tag.element())
}

/// Parse `GGGG,EEEE`, `(GGGG,EEEE)` or `GGGGEEEE` into a tag
pub fn parse_dicom_tag(raw: &str) -> Result<Tag> {
    let invalid = || DatasetError::InvalidTag(raw.to_string());
    let trimmed = raw
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .trim();

    let (group, element) = match trimmed.split_once(',') {
        Some((g, e)) => (g.trim(), e.trim()),
        None if trimmed.len() == 8 => trimmed.split_at(4),
        None => return Err(invalid()),
    };

    if group.len() != 4 || element.len() != 4 {
        return Err(invalid());
    }
    let group = u16::from_str_radix(group, 16).map_err(|_| invalid())?;
    let element = u16::from_str_radix(element, 16).map_err(|_| invalid())?;
    Ok(Tag(group, element))
}
