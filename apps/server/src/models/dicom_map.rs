//! Flat map of DICOM tags to string values.

use dicom_core::dictionary::{DataDictionary, VirtualVr};
use dicom_core::{Tag, VR};
use dicom_dictionary_std::StandardDataDictionary;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

use crate::{Error, Result};

/// Value of one tag. `Null` means the tag is present without a value,
/// which is distinct from the tag being absent from the map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DicomValue {
    String(String),
    Null,
}

impl DicomValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DicomValue::String(s) => Some(s),
            DicomValue::Null => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DicomValue::Null)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DicomMap {
    values: BTreeMap<Tag, DicomValue>,
}

impl DicomMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_value(&mut self, tag: Tag, value: impl Into<String>) {
        self.values.insert(tag, DicomValue::String(value.into()));
    }

    pub fn set_null(&mut self, tag: Tag) {
        self.values.insert(tag, DicomValue::Null);
    }

    pub fn set(&mut self, tag: Tag, value: DicomValue) {
        self.values.insert(tag, value);
    }

    pub fn get(&self, tag: Tag) -> Option<&DicomValue> {
        self.values.get(&tag)
    }

    /// String content of `tag`, or `None` if absent or null.
    pub fn lookup_string(&self, tag: Tag) -> Option<&str> {
        self.values.get(&tag).and_then(DicomValue::as_str)
    }

    pub fn has_tag(&self, tag: Tag) -> bool {
        self.values.contains_key(&tag)
    }

    pub fn remove(&mut self, tag: Tag) -> Option<DicomValue> {
        self.values.remove(&tag)
    }

    /// Adds the tags of `other` that are not already present.
    pub fn merge(&mut self, other: &DicomMap) {
        for (tag, value) in &other.values {
            self.values.entry(*tag).or_insert_with(|| value.clone());
        }
    }

    /// Copy restricted to the given tags.
    pub fn extract<'a>(&self, tags: impl IntoIterator<Item = &'a Tag>) -> DicomMap {
        let mut target = DicomMap::new();
        for tag in tags {
            if let Some(value) = self.values.get(tag) {
                target.values.insert(*tag, value.clone());
            }
        }
        target
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Tag, &DicomValue)> {
        self.values.iter()
    }

    pub fn tags(&self) -> impl Iterator<Item = Tag> + '_ {
        self.values.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// JSON object keyed by tag keyword (`PatientID`), or by `gggg,eeee`
    /// for tags outside the standard dictionary.
    pub fn to_json(&self) -> JsonValue {
        let mut object = Map::new();
        for (tag, value) in &self.values {
            let json = match value {
                DicomValue::String(s) => JsonValue::String(s.clone()),
                DicomValue::Null => JsonValue::Null,
            };
            object.insert(tag_name(*tag), json);
        }
        JsonValue::Object(object)
    }
}

impl FromIterator<(Tag, DicomValue)> for DicomMap {
    fn from_iter<I: IntoIterator<Item = (Tag, DicomValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// `gggg,eeee` in lowercase hexadecimal.
pub fn format_tag(tag: Tag) -> String {
    format!("{:04x},{:04x}", tag.group(), tag.element())
}

pub fn tag_name(tag: Tag) -> String {
    StandardDataDictionary
        .by_tag(tag)
        .map(|entry| entry.alias.to_string())
        .unwrap_or_else(|| format_tag(tag))
}

/// Accepts `gggg,eeee`, `(gggg,eeee)`, `ggggeeee` or a dictionary keyword.
pub fn parse_tag(text: &str) -> Result<Tag> {
    let trimmed = text.trim().trim_start_matches('(').trim_end_matches(')');
    let hex: String = trimmed.chars().filter(|c| *c != ',').collect();

    if hex.len() == 8 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        let group = u16::from_str_radix(&hex[0..4], 16)
            .map_err(|e| Error::BadParameterType(format!("Invalid tag {text}: {e}")))?;
        let element = u16::from_str_radix(&hex[4..8], 16)
            .map_err(|e| Error::BadParameterType(format!("Invalid tag {text}: {e}")))?;
        return Ok(Tag(group, element));
    }

    StandardDataDictionary
        .by_name(trimmed)
        .map(|entry| entry.tag.inner())
        .ok_or_else(|| Error::BadParameterType(format!("Unknown DICOM tag: {text}")))
}

/// Value representation of a standard tag, if it has a single one.
pub fn tag_vr(tag: Tag) -> Option<VR> {
    match StandardDataDictionary.by_tag(tag)?.vr {
        VirtualVr::Exact(vr) => Some(vr),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_dictionary_std::tags;

    #[test]
    fn null_is_distinct_from_absent() {
        let mut map = DicomMap::new();
        map.set_null(tags::PATIENT_NAME);
        assert!(map.has_tag(tags::PATIENT_NAME));
        assert_eq!(map.lookup_string(tags::PATIENT_NAME), None);
        assert!(!map.has_tag(tags::PATIENT_ID));
    }

    #[test]
    fn merge_keeps_existing_values() {
        let mut a = DicomMap::new();
        a.set_value(tags::PATIENT_ID, "A");
        let mut b = DicomMap::new();
        b.set_value(tags::PATIENT_ID, "B");
        b.set_value(tags::MODALITY, "CT");
        a.merge(&b);
        assert_eq!(a.lookup_string(tags::PATIENT_ID), Some("A"));
        assert_eq!(a.lookup_string(tags::MODALITY), Some("CT"));
    }

    #[test]
    fn parses_tags() {
        assert_eq!(parse_tag("0010,0020").unwrap(), tags::PATIENT_ID);
        assert_eq!(parse_tag("(0008,0060)").unwrap(), tags::MODALITY);
        assert_eq!(parse_tag("0020000D").unwrap(), tags::STUDY_INSTANCE_UID);
        assert_eq!(parse_tag("PatientName").unwrap(), tags::PATIENT_NAME);
        assert!(parse_tag("NotATag").is_err());
        assert_eq!(format_tag(Tag(0x0009, 0x1001)), "0009,1001");
    }

    #[test]
    fn json_uses_keywords() {
        let mut map = DicomMap::new();
        map.set_value(tags::PATIENT_ID, "P1");
        map.set_null(Tag(0x0009, 0x1001));
        let json = map.to_json();
        assert_eq!(json["PatientID"], "P1");
        assert!(json["0009,1001"].is_null());
    }
}
