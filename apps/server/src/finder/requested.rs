//! Where each requested tag is read from: the index at some level, a
//! computation over the tree, or the DICOM file.

use dicom_core::Tag;
use std::collections::BTreeSet;

use super::computed;
use crate::find::{FindRequest, FindResource};
use crate::models::{format_tag, DicomMap, ResourceType};
use crate::registry::{DicomTagType, MainDicomTagsRegistry};
use crate::Result;

#[derive(Debug, Clone, Default)]
pub(super) struct RequestedTags {
    pub computed: BTreeSet<Tag>,
    /// Main tags read from the index, by the level storing them.
    pub by_level: [BTreeSet<Tag>; 4],
    pub from_storage: BTreeSet<Tag>,
}

impl RequestedTags {
    pub fn is_empty(&self) -> bool {
        self.computed.is_empty()
            && self.by_level.iter().all(BTreeSet::is_empty)
            && self.from_storage.is_empty()
    }

    /// Classifies `tag` and extends `request` to retrieve it.
    pub fn add(
        &mut self,
        request: &mut FindRequest,
        registry: &MainDicomTagsRegistry,
        tag: Tag,
    ) -> Result<()> {
        if computed::is_computed_tag(tag) {
            if computed::configure(request, tag)? {
                self.computed.insert(tag);
            }
            return Ok(());
        }

        let level = request.level();
        let (main_level, tag_type) = registry.lookup_tag(tag);

        if tag_type == DicomTagType::Generic {
            return self.add_from_storage(request, tag);
        }

        match main_level {
            ResourceType::Patient if level == ResourceType::Patient => {
                self.add_from_index(request, ResourceType::Patient, tag)
            }
            // Studies carry a copy of the patient tags.
            ResourceType::Patient | ResourceType::Study => {
                if level == ResourceType::Patient {
                    tracing::warn!(
                        tag = %format_tag(tag),
                        "Requested study tag at patient level will be read from a DICOM file"
                    );
                    self.add_from_storage(request, tag)
                } else {
                    self.add_from_index(request, ResourceType::Study, tag)
                }
            }
            ResourceType::Series | ResourceType::Instance if main_level > level => {
                self.add_from_storage(request, tag)
            }
            _ => self.add_from_index(request, main_level, tag),
        }
    }

    fn add_from_index(
        &mut self,
        request: &mut FindRequest,
        level: ResourceType,
        tag: Tag,
    ) -> Result<()> {
        if level == request.level() {
            request.set_retrieve_main_dicom_tags(true);
            request.set_retrieve_metadata(true);
        } else {
            let parent = request.parent_specification_mut(level)?;
            parent.set_retrieve_main_dicom_tags(true);
            parent.set_retrieve_metadata(true);
        }
        self.by_level[level.index()].insert(tag);
        Ok(())
    }

    fn add_from_storage(&mut self, request: &mut FindRequest, tag: Tag) -> Result<()> {
        self.from_storage.insert(tag);
        if request.level() != ResourceType::Instance {
            request.set_retrieve_one_instance_identifier(true)?;
        }
        Ok(())
    }

    /// Copies into `target` the requested tags found in the index for
    /// `resource`, and returns those that must be read from its file.
    pub fn inject(&self, target: &mut DicomMap, resource: &FindResource) -> Result<BTreeSet<Tag>> {
        computed::inject(target, resource, &self.computed);

        let mut missing = self.from_storage.clone();
        for level in ResourceType::ALL {
            let requested = &self.by_level[level.index()];
            if requested.is_empty() || level > resource.level() {
                continue;
            }
            let stored = resource.main_dicom_tags(level)?;
            for tag in requested {
                match stored.get(*tag) {
                    Some(value) => target.set(*tag, value.clone()),
                    None => {
                        missing.insert(*tag);
                    }
                }
            }
        }
        Ok(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_dictionary_std::tags;

    #[test]
    fn patient_tags_below_patient_level_come_from_the_study() {
        let registry = MainDicomTagsRegistry::new();
        let mut request = FindRequest::new(ResourceType::Series);
        let mut requested = RequestedTags::default();

        requested
            .add(&mut request, &registry, tags::PATIENT_NAME)
            .unwrap();

        assert!(requested.by_level[ResourceType::Study.index()].contains(&tags::PATIENT_NAME));
        assert!(request
            .parent_specification(ResourceType::Study)
            .unwrap()
            .is_retrieve_main_dicom_tags());
        assert!(requested.from_storage.is_empty());
    }

    #[test]
    fn lower_level_and_generic_tags_are_read_from_files() {
        let registry = MainDicomTagsRegistry::new();
        let mut request = FindRequest::new(ResourceType::Study);
        let mut requested = RequestedTags::default();

        requested
            .add(&mut request, &registry, tags::INSTANCE_NUMBER)
            .unwrap();
        requested
            .add(&mut request, &registry, tags::PATIENT_WEIGHT)
            .unwrap();

        assert_eq!(requested.from_storage.len(), 2);
        assert!(request.is_retrieve_one_instance_identifier());
    }

    #[test]
    fn missing_stored_tags_fall_back_to_files() {
        let registry = MainDicomTagsRegistry::new();
        let mut request = FindRequest::new(ResourceType::Instance);
        let mut requested = RequestedTags::default();
        requested
            .add(&mut request, &registry, tags::INSTANCE_NUMBER)
            .unwrap();
        requested
            .add(&mut request, &registry, tags::SOP_INSTANCE_UID)
            .unwrap();

        let mut resource = FindResource::new(ResourceType::Instance, 1, "i");
        resource
            .add_string_main_dicom_tag(ResourceType::Instance, tags::SOP_INSTANCE_UID, "1.2")
            .unwrap();

        let mut target = DicomMap::new();
        let missing = requested.inject(&mut target, &resource).unwrap();

        assert_eq!(target.lookup_string(tags::SOP_INSTANCE_UID), Some("1.2"));
        assert!(missing.contains(&tags::INSTANCE_NUMBER));
    }
}
