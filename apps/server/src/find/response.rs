//! Materialized results of a find.

use dicom_core::Tag;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::models::{format_tag, DicomMap, FileContentType, FileInfo, MetadataType, ResourceType};
use crate::{Error, Result};

/// One matched resource, with whatever the request asked to retrieve.
#[derive(Debug, Clone)]
pub struct FindResource {
    level: ResourceType,
    internal_id: i64,
    public_id: String,
    parent_id: Option<String>,
    main_dicom_tags: [DicomMap; 4],
    metadata: [BTreeMap<MetadataType, (String, i64)>; 4],
    children_identifiers: [BTreeSet<String>; 4],
    children_metadata: [BTreeMap<MetadataType, Vec<String>>; 4],
    children_main_dicom_tags: [BTreeMap<Tag, BTreeSet<String>>; 4],
    children_count: [Option<u64>; 4],
    labels: BTreeSet<String>,
    attachments: BTreeMap<FileContentType, (FileInfo, i64)>,
    one_instance_id: Option<String>,
    one_instance_metadata: BTreeMap<MetadataType, String>,
    one_instance_attachments: BTreeMap<FileContentType, FileInfo>,
}

impl FindResource {
    pub fn new(level: ResourceType, internal_id: i64, public_id: impl Into<String>) -> Self {
        Self {
            level,
            internal_id,
            public_id: public_id.into(),
            parent_id: None,
            main_dicom_tags: Default::default(),
            metadata: Default::default(),
            children_identifiers: Default::default(),
            children_metadata: Default::default(),
            children_main_dicom_tags: Default::default(),
            children_count: Default::default(),
            labels: BTreeSet::new(),
            attachments: BTreeMap::new(),
            one_instance_id: None,
            one_instance_metadata: BTreeMap::new(),
            one_instance_attachments: BTreeMap::new(),
        }
    }

    pub fn level(&self) -> ResourceType {
        self.level
    }

    pub fn internal_id(&self) -> i64 {
        self.internal_id
    }

    pub fn public_id(&self) -> &str {
        &self.public_id
    }

    /// Levels at or above the resource (own data and ancestors).
    fn check_own_or_parent(&self, level: ResourceType) -> Result<()> {
        if level <= self.level {
            Ok(())
        } else {
            Err(Error::ParameterOutOfRange(format!(
                "{level} is below a {} resource",
                self.level
            )))
        }
    }

    fn check_children(&self, level: ResourceType) -> Result<()> {
        if level > self.level {
            Ok(())
        } else {
            Err(Error::ParameterOutOfRange(format!(
                "{level} is not below a {} resource",
                self.level
            )))
        }
    }

    pub fn set_parent_identifier(&mut self, id: impl Into<String>) -> Result<()> {
        if self.level == ResourceType::Patient {
            return Err(Error::BadParameterType(
                "Patients have no parent".to_string(),
            ));
        }
        if self.parent_id.is_some() {
            return Err(Error::BadSequenceOfCalls(
                "Parent identifier already set".to_string(),
            ));
        }
        self.parent_id = Some(id.into());
        Ok(())
    }

    pub fn parent_identifier(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    fn add_main_dicom_tag(
        &mut self,
        level: ResourceType,
        tag: Tag,
        value: Option<String>,
    ) -> Result<()> {
        self.check_own_or_parent(level)?;
        let tags = &mut self.main_dicom_tags[level.index()];
        if tags.has_tag(tag) {
            return Err(Error::BadSequenceOfCalls(format!(
                "Main DICOM tag {} already set",
                format_tag(tag)
            )));
        }
        match value {
            Some(value) => tags.set_value(tag, value),
            None => tags.set_null(tag),
        }
        Ok(())
    }

    pub fn add_string_main_dicom_tag(
        &mut self,
        level: ResourceType,
        tag: Tag,
        value: impl Into<String>,
    ) -> Result<()> {
        self.add_main_dicom_tag(level, tag, Some(value.into()))
    }

    pub fn add_null_main_dicom_tag(&mut self, level: ResourceType, tag: Tag) -> Result<()> {
        self.add_main_dicom_tag(level, tag, None)
    }

    pub fn main_dicom_tags(&self, level: ResourceType) -> Result<&DicomMap> {
        self.check_own_or_parent(level)?;
        Ok(&self.main_dicom_tags[level.index()])
    }

    pub fn add_metadata(
        &mut self,
        level: ResourceType,
        metadata: MetadataType,
        value: impl Into<String>,
        revision: i64,
    ) -> Result<()> {
        self.check_own_or_parent(level)?;
        let target = &mut self.metadata[level.index()];
        if target.contains_key(&metadata) {
            return Err(Error::BadSequenceOfCalls(format!(
                "Metadata {metadata} already set"
            )));
        }
        target.insert(metadata, (value.into(), revision));
        Ok(())
    }

    pub fn metadata(&self, level: ResourceType) -> Result<BTreeMap<MetadataType, &str>> {
        self.check_own_or_parent(level)?;
        Ok(self.metadata[level.index()]
            .iter()
            .map(|(k, (v, _))| (*k, v.as_str()))
            .collect())
    }

    pub fn lookup_metadata(&self, level: ResourceType, metadata: MetadataType) -> Option<&str> {
        if level > self.level {
            return None;
        }
        self.metadata[level.index()]
            .get(&metadata)
            .map(|(value, _)| value.as_str())
    }

    pub fn lookup_metadata_revision(
        &self,
        level: ResourceType,
        metadata: MetadataType,
    ) -> Option<i64> {
        if level > self.level {
            return None;
        }
        self.metadata[level.index()]
            .get(&metadata)
            .map(|(_, revision)| *revision)
    }

    pub fn add_child_identifier(&mut self, level: ResourceType, id: impl Into<String>) -> Result<()> {
        self.check_children(level)?;
        let id = id.into();
        if !self.children_identifiers[level.index()].insert(id.clone()) {
            return Err(Error::BadSequenceOfCalls(format!(
                "Child {id} already added"
            )));
        }
        Ok(())
    }

    pub fn children_identifiers(&self, level: ResourceType) -> Result<&BTreeSet<String>> {
        self.check_children(level)?;
        Ok(&self.children_identifiers[level.index()])
    }

    pub fn add_children_metadata_value(
        &mut self,
        level: ResourceType,
        metadata: MetadataType,
        value: impl Into<String>,
    ) -> Result<()> {
        self.check_children(level)?;
        self.children_metadata[level.index()]
            .entry(metadata)
            .or_default()
            .push(value.into());
        Ok(())
    }

    /// Values of `metadata` over the children at `level`; `None` if that
    /// metadata was not retrieved.
    pub fn children_metadata_values(
        &self,
        level: ResourceType,
        metadata: MetadataType,
    ) -> Option<&[String]> {
        if level <= self.level {
            return None;
        }
        self.children_metadata[level.index()]
            .get(&metadata)
            .map(Vec::as_slice)
    }

    /// Marks `metadata` as retrieved even if no child carries it.
    pub fn touch_children_metadata(&mut self, level: ResourceType, metadata: MetadataType) -> Result<()> {
        self.check_children(level)?;
        self.children_metadata[level.index()]
            .entry(metadata)
            .or_default();
        Ok(())
    }

    pub fn add_children_main_dicom_tag_value(
        &mut self,
        level: ResourceType,
        tag: Tag,
        value: impl Into<String>,
    ) -> Result<()> {
        self.check_children(level)?;
        self.children_main_dicom_tags[level.index()]
            .entry(tag)
            .or_default()
            .insert(value.into());
        Ok(())
    }

    pub fn touch_children_main_dicom_tag(&mut self, level: ResourceType, tag: Tag) -> Result<()> {
        self.check_children(level)?;
        self.children_main_dicom_tags[level.index()]
            .entry(tag)
            .or_default();
        Ok(())
    }

    /// Distinct values of `tag` over the children at `level`.
    pub fn children_main_dicom_tag_values(
        &self,
        level: ResourceType,
        tag: Tag,
    ) -> Option<&BTreeSet<String>> {
        if level <= self.level {
            return None;
        }
        self.children_main_dicom_tags[level.index()].get(&tag)
    }

    pub fn set_children_count(&mut self, level: ResourceType, count: u64) -> Result<()> {
        self.check_children(level)?;
        self.children_count[level.index()] = Some(count);
        Ok(())
    }

    pub fn children_count(&self, level: ResourceType) -> Option<u64> {
        if level <= self.level {
            return None;
        }
        self.children_count[level.index()]
    }

    pub fn add_label(&mut self, label: impl Into<String>) -> Result<()> {
        let label = label.into();
        if !self.labels.insert(label.clone()) {
            return Err(Error::BadSequenceOfCalls(format!(
                "Label {label} already added"
            )));
        }
        Ok(())
    }

    pub fn labels(&self) -> &BTreeSet<String> {
        &self.labels
    }

    pub fn add_attachment(&mut self, attachment: FileInfo, revision: i64) -> Result<()> {
        if self.attachments.contains_key(&attachment.content_type) {
            return Err(Error::BadSequenceOfCalls(format!(
                "Attachment {} already added",
                attachment.content_type.code()
            )));
        }
        self.attachments
            .insert(attachment.content_type, (attachment, revision));
        Ok(())
    }

    pub fn lookup_attachment(&self, content_type: FileContentType) -> Option<(&FileInfo, i64)> {
        self.attachments
            .get(&content_type)
            .map(|(info, revision)| (info, *revision))
    }

    pub fn attachments(&self) -> impl Iterator<Item = &FileInfo> {
        self.attachments.values().map(|(info, _)| info)
    }

    pub fn set_one_instance_identifier(&mut self, id: impl Into<String>) -> Result<()> {
        if self.level == ResourceType::Instance {
            return Err(Error::BadSequenceOfCalls(
                "An instance is its own representative".to_string(),
            ));
        }
        self.one_instance_id = Some(id.into());
        Ok(())
    }

    /// Representative instance: the one recorded explicitly, else the
    /// first retrieved child instance.
    pub fn one_instance_identifier(&self) -> Option<&str> {
        if self.level == ResourceType::Instance {
            return None;
        }
        self.one_instance_id.as_deref().or_else(|| {
            self.children_identifiers[ResourceType::Instance.index()]
                .iter()
                .next()
                .map(String::as_str)
        })
    }

    pub fn add_one_instance_metadata(
        &mut self,
        metadata: MetadataType,
        value: impl Into<String>,
    ) -> Result<()> {
        if self.one_instance_metadata.contains_key(&metadata) {
            return Err(Error::BadSequenceOfCalls(format!(
                "Metadata {metadata} of the representative instance already set"
            )));
        }
        self.one_instance_metadata.insert(metadata, value.into());
        Ok(())
    }

    pub fn one_instance_metadata(&self) -> &BTreeMap<MetadataType, String> {
        &self.one_instance_metadata
    }

    pub fn add_one_instance_attachment(&mut self, attachment: FileInfo) -> Result<()> {
        if self
            .one_instance_attachments
            .contains_key(&attachment.content_type)
        {
            return Err(Error::BadSequenceOfCalls(
                "Attachment of the representative instance already set".to_string(),
            ));
        }
        self.one_instance_attachments
            .insert(attachment.content_type, attachment);
        Ok(())
    }

    pub fn one_instance_attachments(&self) -> &BTreeMap<FileContentType, FileInfo> {
        &self.one_instance_attachments
    }

    /// Main tags of the resource and its retrieved ancestors, flattened.
    pub fn all_main_dicom_tags(&self) -> DicomMap {
        let mut all = DicomMap::new();
        for level in ResourceType::ALL.iter().filter(|l| **l <= self.level).rev() {
            all.merge(&self.main_dicom_tags[level.index()]);
        }
        all
    }
}

/// Ordered set of results, all at the same level, unique by public and
/// by internal id.
#[derive(Debug, Clone)]
pub struct FindResponse {
    level: ResourceType,
    items: Vec<FindResource>,
    by_public_id: HashMap<String, usize>,
    internal_ids: HashSet<i64>,
}

impl FindResponse {
    pub fn new(level: ResourceType) -> Self {
        Self {
            level,
            items: Vec::new(),
            by_public_id: HashMap::new(),
            internal_ids: HashSet::new(),
        }
    }

    pub fn level(&self) -> ResourceType {
        self.level
    }

    pub fn add(&mut self, resource: FindResource) -> Result<()> {
        if resource.level != self.level {
            return Err(Error::BadParameterType(
                "A find response must only contain resources of the same type".to_string(),
            ));
        }
        if self.by_public_id.contains_key(&resource.public_id) {
            return Err(Error::BadSequenceOfCalls(format!(
                "This resource has already been added: {}",
                resource.public_id
            )));
        }
        if !self.internal_ids.insert(resource.internal_id) {
            return Err(Error::BadSequenceOfCalls(format!(
                "This internal id has already been added: {}",
                resource.internal_id
            )));
        }
        self.by_public_id
            .insert(resource.public_id.clone(), self.items.len());
        self.items.push(resource);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&FindResource> {
        self.items.get(index).ok_or_else(|| {
            Error::ParameterOutOfRange(format!("No resource at index {index}"))
        })
    }

    pub fn by_public_id(&self, public_id: &str) -> Result<&FindResource> {
        self.by_public_id
            .get(public_id)
            .map(|index| &self.items[*index])
            .ok_or_else(|| Error::InexistentItem(public_id.to_string()))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FindResource> {
        self.items.iter()
    }
}

impl IntoIterator for FindResponse {
    type Item = FindResource;
    type IntoIter = std::vec::IntoIter<FindResource>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a> IntoIterator for &'a FindResponse {
    type Item = &'a FindResource;
    type IntoIter = std::slice::Iter<'a, FindResource>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_dictionary_std::tags;

    #[test]
    fn response_keeps_a_single_level() {
        let mut response = FindResponse::new(ResourceType::Study);
        response
            .add(FindResource::new(ResourceType::Study, 1, "a"))
            .unwrap();
        assert!(matches!(
            response.add(FindResource::new(ResourceType::Series, 2, "b")),
            Err(Error::BadParameterType(_))
        ));
        assert_eq!(response.len(), 1);
    }

    #[test]
    fn response_rejects_duplicates() {
        let mut response = FindResponse::new(ResourceType::Patient);
        response
            .add(FindResource::new(ResourceType::Patient, 1, "a"))
            .unwrap();
        assert!(response
            .add(FindResource::new(ResourceType::Patient, 2, "a"))
            .is_err());
        assert!(response
            .add(FindResource::new(ResourceType::Patient, 1, "b"))
            .is_err());
        response
            .add(FindResource::new(ResourceType::Patient, 3, "c"))
            .unwrap();
        assert_eq!(response.by_public_id("c").unwrap().internal_id(), 3);
        assert!(matches!(
            response.by_public_id("zz"),
            Err(Error::InexistentItem(_))
        ));
    }

    #[test]
    fn resource_rejects_repeated_and_misplaced_data() {
        let mut study = FindResource::new(ResourceType::Study, 1, "s");
        study
            .add_string_main_dicom_tag(ResourceType::Study, tags::STUDY_DATE, "20200101")
            .unwrap();
        assert!(study
            .add_null_main_dicom_tag(ResourceType::Study, tags::STUDY_DATE)
            .is_err());
        assert!(study
            .add_null_main_dicom_tag(ResourceType::Series, tags::MODALITY)
            .is_err());

        study.set_parent_identifier("p").unwrap();
        assert!(study.set_parent_identifier("p").is_err());

        study.add_label("x").unwrap();
        assert!(study.add_label("x").is_err());

        study
            .add_metadata(ResourceType::Study, MetadataType::LastUpdate, "t", 1)
            .unwrap();
        assert!(study
            .add_metadata(ResourceType::Study, MetadataType::LastUpdate, "u", 2)
            .is_err());
        assert_eq!(
            study.lookup_metadata_revision(ResourceType::Study, MetadataType::LastUpdate),
            Some(1)
        );

        let info = FileInfo::uncompressed("u", FileContentType::Dicom, 10, "h");
        study.add_attachment(info.clone(), 0).unwrap();
        assert!(study.add_attachment(info, 1).is_err());

        let mut patient = FindResource::new(ResourceType::Patient, 2, "p");
        assert!(matches!(
            patient.set_parent_identifier("x"),
            Err(Error::BadParameterType(_))
        ));
    }

    #[test]
    fn one_instance_defaults_to_first_child() {
        let mut series = FindResource::new(ResourceType::Series, 1, "s");
        assert_eq!(series.one_instance_identifier(), None);
        series
            .add_child_identifier(ResourceType::Instance, "i2")
            .unwrap();
        series
            .add_child_identifier(ResourceType::Instance, "i1")
            .unwrap();
        assert_eq!(series.one_instance_identifier(), Some("i1"));
        assert!(series
            .add_child_identifier(ResourceType::Study, "x")
            .is_err());
    }
}
