//! Declarative description of a find.

use dicom_core::Tag;
use std::collections::BTreeSet;

use super::identifiers::OrthancIdentifiers;
use crate::db::search::{DatabaseDicomTagConstraints, DatabaseMetadataConstraint, OrderBy};
use crate::models::{LabelsConstraint, MetadataType, ResourceType};
use crate::{Error, Result};

/// What to fetch from one ancestor of each match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParentSpecification {
    main_dicom_tags: bool,
    metadata: bool,
}

impl ParentSpecification {
    pub fn set_retrieve_main_dicom_tags(&mut self, retrieve: bool) {
        self.main_dicom_tags = retrieve;
    }

    pub fn is_retrieve_main_dicom_tags(&self) -> bool {
        self.main_dicom_tags
    }

    pub fn set_retrieve_metadata(&mut self, retrieve: bool) {
        self.metadata = retrieve;
    }

    pub fn is_retrieve_metadata(&self) -> bool {
        self.metadata
    }

    pub fn is_of_interest(&self) -> bool {
        self.main_dicom_tags || self.metadata
    }
}

/// What to fetch from the descendants of each match at one level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildrenSpecification {
    identifiers: bool,
    metadata: BTreeSet<MetadataType>,
    main_dicom_tags: BTreeSet<Tag>,
    count: bool,
}

impl ChildrenSpecification {
    pub fn set_retrieve_identifiers(&mut self, retrieve: bool) {
        self.identifiers = retrieve;
    }

    pub fn is_retrieve_identifiers(&self) -> bool {
        self.identifiers
    }

    pub fn add_metadata(&mut self, metadata: MetadataType) {
        self.metadata.insert(metadata);
    }

    pub fn metadata(&self) -> &BTreeSet<MetadataType> {
        &self.metadata
    }

    pub fn add_main_dicom_tag(&mut self, tag: Tag) {
        self.main_dicom_tags.insert(tag);
    }

    pub fn main_dicom_tags(&self) -> &BTreeSet<Tag> {
        &self.main_dicom_tags
    }

    pub fn set_retrieve_count(&mut self, retrieve: bool) {
        self.count = retrieve;
    }

    pub fn is_retrieve_count(&self) -> bool {
        self.count
    }

    pub fn is_of_interest(&self) -> bool {
        self.identifiers
            || self.count
            || !self.metadata.is_empty()
            || !self.main_dicom_tags.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct FindRequest {
    level: ResourceType,
    orthanc_identifiers: OrthancIdentifiers,
    dicom_tag_constraints: DatabaseDicomTagConstraints,
    metadata_constraints: Vec<DatabaseMetadataConstraint>,
    ordering: Vec<OrderBy>,
    labels: BTreeSet<String>,
    labels_constraint: LabelsConstraint,
    limits: Option<(u64, u64)>,

    retrieve_main_dicom_tags: bool,
    retrieve_metadata: bool,
    retrieve_metadata_revisions: bool,
    retrieve_labels: bool,
    retrieve_attachments: bool,
    retrieve_parent_identifier: bool,
    parents: [ParentSpecification; 4],
    children: [ChildrenSpecification; 4],
    retrieve_one_instance_identifier: bool,
    retrieve_one_instance_metadata_and_attachments: bool,
}

impl FindRequest {
    pub fn new(level: ResourceType) -> Self {
        Self {
            level,
            orthanc_identifiers: OrthancIdentifiers::new(),
            dicom_tag_constraints: DatabaseDicomTagConstraints::new(),
            metadata_constraints: Vec::new(),
            ordering: Vec::new(),
            labels: BTreeSet::new(),
            labels_constraint: LabelsConstraint::All,
            limits: None,
            retrieve_main_dicom_tags: false,
            retrieve_metadata: false,
            retrieve_metadata_revisions: false,
            retrieve_labels: false,
            retrieve_attachments: false,
            retrieve_parent_identifier: false,
            parents: Default::default(),
            children: Default::default(),
            retrieve_one_instance_identifier: false,
            retrieve_one_instance_metadata_and_attachments: false,
        }
    }

    pub fn level(&self) -> ResourceType {
        self.level
    }

    /// Restricts the find to the descendants of `id` (or to `id` itself at
    /// the query level). Levels below the query level are refused.
    pub fn set_orthanc_id(&mut self, level: ResourceType, id: impl Into<String>) -> Result<()> {
        if level > self.level {
            return Err(Error::BadSequenceOfCalls(format!(
                "Cannot restrict a {} find by a {level} id",
                self.level
            )));
        }
        self.orthanc_identifiers.set(level, id);
        Ok(())
    }

    pub fn orthanc_identifiers(&self) -> &OrthancIdentifiers {
        &self.orthanc_identifiers
    }

    pub fn dicom_tag_constraints(&self) -> &DatabaseDicomTagConstraints {
        &self.dicom_tag_constraints
    }

    pub fn dicom_tag_constraints_mut(&mut self) -> &mut DatabaseDicomTagConstraints {
        &mut self.dicom_tag_constraints
    }

    pub fn add_metadata_constraint(&mut self, constraint: DatabaseMetadataConstraint) {
        self.metadata_constraints.push(constraint);
    }

    pub fn metadata_constraints(&self) -> &[DatabaseMetadataConstraint] {
        &self.metadata_constraints
    }

    pub fn add_ordering(&mut self, ordering: OrderBy) {
        self.ordering.push(ordering);
    }

    pub fn ordering(&self) -> &[OrderBy] {
        &self.ordering
    }

    pub fn add_label(&mut self, label: impl Into<String>) {
        self.labels.insert(label.into());
    }

    pub fn labels(&self) -> &BTreeSet<String> {
        &self.labels
    }

    pub fn set_labels_constraint(&mut self, constraint: LabelsConstraint) {
        self.labels_constraint = constraint;
    }

    pub fn labels_constraint(&self) -> LabelsConstraint {
        self.labels_constraint
    }

    /// `count == 0` leaves the number of results unbounded.
    pub fn set_limits(&mut self, since: u64, count: u64) {
        self.limits = Some((since, count));
    }

    pub fn clear_limits(&mut self) {
        self.limits = None;
    }

    pub fn has_limits(&self) -> bool {
        self.limits.is_some()
    }

    pub fn limits_since(&self) -> Result<u64> {
        self.limits
            .map(|(since, _)| since)
            .ok_or_else(|| Error::BadSequenceOfCalls("No limits were set".to_string()))
    }

    pub fn limits_count(&self) -> Result<u64> {
        self.limits
            .map(|(_, count)| count)
            .ok_or_else(|| Error::BadSequenceOfCalls("No limits were set".to_string()))
    }

    pub fn set_retrieve_main_dicom_tags(&mut self, retrieve: bool) {
        self.retrieve_main_dicom_tags = retrieve;
    }

    pub fn is_retrieve_main_dicom_tags(&self) -> bool {
        self.retrieve_main_dicom_tags
    }

    pub fn set_retrieve_metadata(&mut self, retrieve: bool) {
        self.retrieve_metadata = retrieve;
    }

    pub fn is_retrieve_metadata(&self) -> bool {
        self.retrieve_metadata
    }

    pub fn set_retrieve_metadata_revisions(&mut self, retrieve: bool) {
        self.retrieve_metadata_revisions = retrieve;
    }

    pub fn is_retrieve_metadata_revisions(&self) -> bool {
        self.retrieve_metadata_revisions
    }

    pub fn set_retrieve_labels(&mut self, retrieve: bool) {
        self.retrieve_labels = retrieve;
    }

    pub fn is_retrieve_labels(&self) -> bool {
        self.retrieve_labels
    }

    pub fn set_retrieve_attachments(&mut self, retrieve: bool) {
        self.retrieve_attachments = retrieve;
    }

    pub fn is_retrieve_attachments(&self) -> bool {
        self.retrieve_attachments
    }

    pub fn set_retrieve_parent_identifier(&mut self, retrieve: bool) -> Result<()> {
        if self.level == ResourceType::Patient {
            return Err(Error::BadParameterType(
                "Patients have no parent".to_string(),
            ));
        }
        self.retrieve_parent_identifier = retrieve;
        Ok(())
    }

    pub fn is_retrieve_parent_identifier(&self) -> bool {
        self.retrieve_parent_identifier
    }

    fn check_parent_level(&self, level: ResourceType) -> Result<()> {
        if level < self.level {
            Ok(())
        } else {
            Err(Error::ParameterOutOfRange(format!(
                "{level} is not a parent level of {}",
                self.level
            )))
        }
    }

    fn check_children_level(&self, level: ResourceType) -> Result<()> {
        if level > self.level {
            Ok(())
        } else {
            Err(Error::ParameterOutOfRange(format!(
                "{level} is not a children level of {}",
                self.level
            )))
        }
    }

    pub fn parent_specification(&self, level: ResourceType) -> Result<&ParentSpecification> {
        self.check_parent_level(level)?;
        Ok(&self.parents[level.index()])
    }

    pub fn parent_specification_mut(
        &mut self,
        level: ResourceType,
    ) -> Result<&mut ParentSpecification> {
        self.check_parent_level(level)?;
        Ok(&mut self.parents[level.index()])
    }

    pub fn children_specification(&self, level: ResourceType) -> Result<&ChildrenSpecification> {
        self.check_children_level(level)?;
        Ok(&self.children[level.index()])
    }

    pub fn children_specification_mut(
        &mut self,
        level: ResourceType,
    ) -> Result<&mut ChildrenSpecification> {
        self.check_children_level(level)?;
        Ok(&mut self.children[level.index()])
    }

    /// Public id of one instance below each match, used to read tags that
    /// are not in the index.
    pub fn set_retrieve_one_instance_identifier(&mut self, retrieve: bool) -> Result<()> {
        if self.level == ResourceType::Instance {
            return Err(Error::BadSequenceOfCalls(
                "An instance is its own representative".to_string(),
            ));
        }
        self.retrieve_one_instance_identifier = retrieve;
        Ok(())
    }

    pub fn is_retrieve_one_instance_identifier(&self) -> bool {
        self.retrieve_one_instance_identifier
    }

    pub fn set_retrieve_one_instance_metadata_and_attachments(
        &mut self,
        retrieve: bool,
    ) -> Result<()> {
        if self.level == ResourceType::Instance {
            return Err(Error::BadSequenceOfCalls(
                "An instance is its own representative".to_string(),
            ));
        }
        self.retrieve_one_instance_metadata_and_attachments = retrieve;
        Ok(())
    }

    pub fn is_retrieve_one_instance_metadata_and_attachments(&self) -> bool {
        self.retrieve_one_instance_metadata_and_attachments
    }

    pub fn has_constraints(&self) -> bool {
        !self.dicom_tag_constraints.is_empty()
            || !self.metadata_constraints.is_empty()
            || !self.labels.is_empty()
            || !self.ordering.is_empty()
    }

    /// The id the find resolves to without any lookup: no constraints,
    /// and only the query level is restricted.
    pub fn is_trivial_find(&self) -> Option<&str> {
        if self.has_constraints() {
            return None;
        }
        match self.orthanc_identifiers.single() {
            Some((level, id)) if level == self.level => Some(id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::search::{OrderingCast, OrderingDirection};

    #[test]
    fn identifiers_below_the_level_are_refused() {
        let mut request = FindRequest::new(ResourceType::Study);
        assert!(request.set_orthanc_id(ResourceType::Patient, "p").is_ok());
        assert!(matches!(
            request.set_orthanc_id(ResourceType::Series, "s"),
            Err(Error::BadSequenceOfCalls(_))
        ));
    }

    #[test]
    fn limits_must_be_set_before_read() {
        let mut request = FindRequest::new(ResourceType::Series);
        assert!(matches!(
            request.limits_since(),
            Err(Error::BadSequenceOfCalls(_))
        ));
        request.set_limits(2, 5);
        assert_eq!(request.limits_since().unwrap(), 2);
        assert_eq!(request.limits_count().unwrap(), 5);
    }

    #[test]
    fn level_dependent_flags() {
        let mut patient = FindRequest::new(ResourceType::Patient);
        assert!(matches!(
            patient.set_retrieve_parent_identifier(true),
            Err(Error::BadParameterType(_))
        ));

        let mut instance = FindRequest::new(ResourceType::Instance);
        assert!(instance.set_retrieve_one_instance_identifier(true).is_err());
        assert!(instance
            .set_retrieve_one_instance_metadata_and_attachments(true)
            .is_err());
        assert!(instance.set_retrieve_parent_identifier(true).is_ok());
    }

    #[test]
    fn specifications_follow_the_tree() {
        let mut request = FindRequest::new(ResourceType::Study);
        assert!(request
            .parent_specification_mut(ResourceType::Patient)
            .is_ok());
        assert!(matches!(
            request.parent_specification(ResourceType::Study),
            Err(Error::ParameterOutOfRange(_))
        ));
        assert!(request
            .children_specification_mut(ResourceType::Instance)
            .is_ok());
        assert!(request
            .children_specification(ResourceType::Patient)
            .is_err());

        request
            .children_specification_mut(ResourceType::Series)
            .unwrap()
            .set_retrieve_count(true);
        assert!(request
            .children_specification(ResourceType::Series)
            .unwrap()
            .is_of_interest());
    }

    #[test]
    fn trivial_find() {
        let mut request = FindRequest::new(ResourceType::Series);
        request.set_orthanc_id(ResourceType::Series, "s1").unwrap();
        assert_eq!(request.is_trivial_find(), Some("s1"));

        request.add_ordering(OrderBy::metadata(
            MetadataType::LastUpdate,
            OrderingCast::String,
            OrderingDirection::Ascending,
        ));
        assert!(request.has_constraints());
        assert_eq!(request.is_trivial_find(), None);

        let mut scoped = FindRequest::new(ResourceType::Series);
        scoped.set_orthanc_id(ResourceType::Study, "st").unwrap();
        assert_eq!(scoped.is_trivial_find(), None);
    }
}
