//! JSON representation of the finder answers.

use chrono::{NaiveDateTime, Utc};
use serde_json::{json, Map, Value as JsonValue};

use super::{series_status, DicomFileReader, ResourceFinder};
use crate::db::operations::LAST_UPDATE_FORMAT;
use crate::db::IndexOperations;
use crate::find::FindResource;
use crate::models::{
    parse_tag, tag_name, FileContentType, MetadataType, ResourceType, SeriesStatus,
};
use crate::{Error, Result};

const MAIN_DICOM_SEQUENCES_VERSION: i64 = 1;

impl ResourceFinder {
    /// Array of public ids, or of expanded resources if the finder expands.
    pub async fn execute_json(
        &self,
        index: &IndexOperations,
        reader: &dyn DicomFileReader,
    ) -> Result<JsonValue> {
        let has_requested_tags =
            !self.requested_tags.is_empty() || !self.lookup_requested_tags(index).is_empty();
        let answer = self.execute(index, reader).await?;

        let mut items = Vec::with_capacity(answer.matches.len());
        for (resource, requested_tags) in &answer.matches {
            if self.expand {
                let mut item = self.expand_resource(index, resource)?;
                if has_requested_tags {
                    item["RequestedTags"] = requested_tags.to_json();
                }
                items.push(item);
            } else {
                items.push(JsonValue::String(resource.public_id().to_string()));
            }
        }
        Ok(JsonValue::Array(items))
    }

    /// The single answer, if any. Several answers mean the index is
    /// corrupted, as this is meant for lookups by public id.
    pub async fn execute_one_resource(
        &self,
        index: &IndexOperations,
        reader: &dyn DicomFileReader,
    ) -> Result<Option<JsonValue>> {
        match self.execute_json(index, reader).await? {
            JsonValue::Array(mut items) => match items.len() {
                0 => Ok(None),
                1 => Ok(items.pop()),
                n => Err(Error::DatabasePlugin(format!(
                    "{n} resources match a single-resource lookup"
                ))),
            },
            _ => Err(Error::Internal("Finder answer is not an array".to_string())),
        }
    }

    fn expand_resource(&self, index: &IndexOperations, resource: &FindResource) -> Result<JsonValue> {
        let level = resource.level();
        if level != self.level() {
            return Err(Error::Internal(format!(
                "Expanding a {level} in a {} finder",
                self.level()
            )));
        }

        let mut target = Map::new();
        target.insert("Type".into(), json!(level.as_str()));
        target.insert("ID".into(), json!(resource.public_id()));

        if let Some(parent) = level.parent() {
            target.insert(
                format!("Parent{}", parent.as_str()),
                json!(resource.parent_identifier()),
            );
        }

        if let Some(child) = level.child() {
            let children: Vec<&str> = resource
                .children_identifiers(child)?
                .iter()
                .map(String::as_str)
                .collect();
            target.insert(child.plural().into(), json!(children));
        }

        match level {
            ResourceType::Series => {
                let (status, expected) = series_status(resource);
                target.insert("Status".into(), json!(status.as_str()));
                target.insert(
                    "ExpectedNumberOfInstances".into(),
                    match status {
                        SeriesStatus::Unknown => JsonValue::Null,
                        _ => json!(expected),
                    },
                );
            }
            ResourceType::Instance => {
                let (dicom, _) = resource
                    .lookup_attachment(FileContentType::Dicom)
                    .ok_or_else(|| {
                        Error::Internal(format!(
                            "Instance {} has no DICOM attachment",
                            resource.public_id()
                        ))
                    })?;
                target.insert("FileSize".into(), json!(dicom.uncompressed_size));
                target.insert("FileUuid".into(), json!(dicom.uuid));

                let index_in_series = resource
                    .lookup_metadata(level, MetadataType::IndexInSeries)
                    .and_then(|s| s.trim().parse::<u32>().ok());
                target.insert("IndexInSeries".into(), json!(index_in_series));
            }
            ResourceType::Patient | ResourceType::Study => {}
        }

        for metadata in [MetadataType::AnonymizedFrom, MetadataType::ModifiedFrom] {
            if let Some(value) = resource.lookup_metadata(level, metadata) {
                target.insert(metadata.name(), json!(value));
            }
        }

        if level != ResourceType::Instance {
            let last_update = resource.lookup_metadata(level, MetadataType::LastUpdate);
            target.insert(
                "IsStable".into(),
                json!(is_stable(last_update, self.stable_age_seconds)),
            );
            if let Some(last_update) = last_update {
                target.insert("LastUpdate".into(), json!(last_update));
            }
        }

        let mut main_tags = resource.main_dicom_tags(level)?.clone();
        let mut sequences = Map::new();
        if let Some(serialized) = resource.lookup_metadata(level, MetadataType::MainDicomSequences) {
            sequences = main_dicom_sequences(serialized)?;
        }

        let registry = index.registry();
        main_tags = if level == ResourceType::Study {
            let patient = main_tags.extract(registry.main_tags(ResourceType::Patient));
            target.insert("PatientMainDicomTags".into(), patient.to_json());
            main_tags.extract(registry.main_tags(ResourceType::Study))
        } else {
            main_tags.extract(registry.main_tags(level))
        };

        let mut main_json = match main_tags.to_json() {
            JsonValue::Object(object) => object,
            _ => Map::new(),
        };
        main_json.extend(sequences);
        target.insert("MainDicomTags".into(), JsonValue::Object(main_json));

        target.insert("Labels".into(), json!(resource.labels()));

        if self.include_all_metadata {
            let metadata: Map<String, JsonValue> = resource
                .metadata(level)?
                .into_iter()
                .map(|(kind, value)| (kind.name(), json!(value)))
                .collect();
            target.insert("Metadata".into(), JsonValue::Object(metadata));
        }

        Ok(JsonValue::Object(target))
    }
}

/// Stable once no change happened for `stable_age_seconds`.
fn is_stable(last_update: Option<&str>, stable_age_seconds: u64) -> bool {
    let Some(last_update) = last_update else {
        return true;
    };
    match NaiveDateTime::parse_from_str(last_update, LAST_UPDATE_FORMAT) {
        Ok(at) => {
            let age = (Utc::now().naive_utc() - at).num_seconds();
            age >= i64::try_from(stable_age_seconds).unwrap_or(i64::MAX)
        }
        Err(_) => true,
    }
}

/// Main sequences stored as `{"Version": 1, "Sequences": {tag: value}}`.
fn main_dicom_sequences(serialized: &str) -> Result<Map<String, JsonValue>> {
    let parsed: JsonValue = serde_json::from_str(serialized)
        .map_err(|e| Error::Internal(format!("Invalid main DICOM sequences: {e}")))?;

    if parsed.get("Version").and_then(JsonValue::as_i64) != Some(MAIN_DICOM_SEQUENCES_VERSION) {
        return Err(Error::NotImplemented(
            "Unsupported version of the main DICOM sequences".to_string(),
        ));
    }

    let mut sequences = Map::new();
    if let Some(JsonValue::Object(object)) = parsed.get("Sequences") {
        for (key, value) in object {
            let name = parse_tag(key).map(tag_name).unwrap_or_else(|_| key.clone());
            let value = value.get("Value").cloned().unwrap_or_else(|| value.clone());
            sequences.insert(name, value);
        }
    }
    Ok(sequences)
}
