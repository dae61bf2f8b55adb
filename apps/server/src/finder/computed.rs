//! Tags computed at query time from the resource tree.

use dicom_core::Tag;
use dicom_dictionary_std::tags;
use std::collections::BTreeSet;

use crate::find::{FindRequest, FindResource};
use crate::models::{DicomMap, MetadataType, ResourceType, SeriesStatus};
use crate::Result;

/// Children counts: (tag, level of the counted resource, level of its children).
const CHILDREN_COUNTS: [(Tag, ResourceType, ResourceType); 6] = [
    (
        tags::NUMBER_OF_PATIENT_RELATED_STUDIES,
        ResourceType::Patient,
        ResourceType::Study,
    ),
    (
        tags::NUMBER_OF_PATIENT_RELATED_SERIES,
        ResourceType::Patient,
        ResourceType::Series,
    ),
    (
        tags::NUMBER_OF_PATIENT_RELATED_INSTANCES,
        ResourceType::Patient,
        ResourceType::Instance,
    ),
    (
        tags::NUMBER_OF_STUDY_RELATED_SERIES,
        ResourceType::Study,
        ResourceType::Series,
    ),
    (
        tags::NUMBER_OF_STUDY_RELATED_INSTANCES,
        ResourceType::Study,
        ResourceType::Instance,
    ),
    (
        tags::NUMBER_OF_SERIES_RELATED_INSTANCES,
        ResourceType::Series,
        ResourceType::Instance,
    ),
];

const INSTANCE_AVAILABILITY_ONLINE: &str = "ONLINE";

/// Whether `tag` is derived from the index rather than stored.
pub fn is_computed_tag(tag: Tag) -> bool {
    CHILDREN_COUNTS.iter().any(|(t, _, _)| *t == tag)
        || tag == tags::SOP_CLASSES_IN_STUDY
        || tag == tags::MODALITIES_IN_STUDY
        || tag == tags::INSTANCE_AVAILABILITY
}

/// Adds to `request` what computing `tag` needs. Returns false when the
/// tag cannot be computed at the level of the request.
pub(super) fn configure(request: &mut FindRequest, tag: Tag) -> Result<bool> {
    let level = request.level();

    if let Some((_, parent, child)) = CHILDREN_COUNTS.iter().find(|(t, _, _)| *t == tag) {
        if level != *parent {
            return Ok(false);
        }
        request
            .children_specification_mut(*child)?
            .set_retrieve_count(true);
        return Ok(true);
    }

    if tag == tags::SOP_CLASSES_IN_STUDY {
        if level != ResourceType::Study {
            return Ok(false);
        }
        request
            .children_specification_mut(ResourceType::Instance)?
            .add_metadata(MetadataType::SopClassUid);
        return Ok(true);
    }

    if tag == tags::MODALITIES_IN_STUDY {
        if level != ResourceType::Study {
            return Ok(false);
        }
        request
            .children_specification_mut(ResourceType::Series)?
            .add_main_dicom_tag(tags::MODALITY);
        return Ok(true);
    }

    Ok(tag == tags::INSTANCE_AVAILABILITY && level == ResourceType::Instance)
}

/// Writes the values of the requested computed tags into `target`.
pub(super) fn inject(target: &mut DicomMap, resource: &FindResource, requested: &BTreeSet<Tag>) {
    for (tag, parent, child) in CHILDREN_COUNTS {
        if requested.contains(&tag) && resource.level() == parent {
            let count = resource.children_count(child).unwrap_or_else(|| {
                resource
                    .children_identifiers(child)
                    .map(|ids| ids.len() as u64)
                    .unwrap_or_default()
            });
            target.set_value(tag, count.to_string());
        }
    }

    if resource.level() == ResourceType::Study {
        if requested.contains(&tags::SOP_CLASSES_IN_STUDY) {
            if let Some(values) =
                resource.children_metadata_values(ResourceType::Instance, MetadataType::SopClassUid)
            {
                let distinct: BTreeSet<&str> = values.iter().map(String::as_str).collect();
                target.set_value(tags::SOP_CLASSES_IN_STUDY, join(distinct));
            }
        }

        if requested.contains(&tags::MODALITIES_IN_STUDY) {
            if let Some(values) =
                resource.children_main_dicom_tag_values(ResourceType::Series, tags::MODALITY)
            {
                target.set_value(
                    tags::MODALITIES_IN_STUDY,
                    join(values.iter().map(String::as_str)),
                );
            }
        }
    }

    if resource.level() == ResourceType::Instance
        && requested.contains(&tags::INSTANCE_AVAILABILITY)
    {
        target.set_value(tags::INSTANCE_AVAILABILITY, INSTANCE_AVAILABILITY_ONLINE);
    }
}

fn join<'a>(values: impl IntoIterator<Item = &'a str>) -> String {
    values.into_iter().collect::<Vec<_>>().join("\\")
}

/// Completeness of a series from its expected size and the
/// `IndexInSeries` of its instances. Also returns the expected size,
/// unless the status is unknown.
pub fn series_status(resource: &FindResource) -> (SeriesStatus, Option<u32>) {
    let expected = match resource
        .lookup_metadata(ResourceType::Series, MetadataType::ExpectedNumberOfInstances)
        .and_then(|s| s.trim().parse::<u32>().ok())
    {
        Some(expected) => expected,
        None => return (SeriesStatus::Unknown, None),
    };

    let values: BTreeSet<&str> = resource
        .children_metadata_values(ResourceType::Instance, MetadataType::IndexInSeries)
        .unwrap_or_default()
        .iter()
        .map(String::as_str)
        .collect();

    let mut indexes = BTreeSet::new();
    for value in values {
        let index = match value.trim().parse::<i64>() {
            Ok(index) => index,
            Err(_) => return (SeriesStatus::Unknown, None),
        };
        if index <= 0 || index > i64::from(expected) || !indexes.insert(index) {
            return (SeriesStatus::Inconsistent, Some(expected));
        }
    }

    if indexes.len() == expected as usize {
        (SeriesStatus::Complete, Some(expected))
    } else {
        (SeriesStatus::Missing, Some(expected))
    }
}
