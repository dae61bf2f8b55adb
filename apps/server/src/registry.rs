//! Registry of the DICOM tags denormalized into the index.
//!
//! Every stored tag has a home level. Identifier tags are kept upper-cased
//! in `DicomIdentifiers` for case-insensitive search; the other main tags
//! are kept verbatim in `MainDicomTags`. Patient-level tags are also copied
//! on each study, so a lookup above the patient level reads them there.
//!
//! The registry is built once at startup and passed by reference to the
//! planner and the ingestion helpers.

use dicom_core::Tag;
use dicom_dictionary_std::tags;
use std::collections::{BTreeSet, HashMap};

use crate::db::search::{
    ConstraintType, DatabaseDicomTagConstraint, DatabaseDicomTagConstraints, DatabaseLookup,
};
use crate::models::ResourceType;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DicomTagType {
    Identifier,
    Main,
    Generic,
}

const OTHER_PATIENT_IDS: Tag = Tag(0x0010, 0x1000);

const PATIENT_IDENTIFIERS: &[Tag] = &[tags::PATIENT_ID, tags::PATIENT_NAME, tags::PATIENT_BIRTH_DATE];

const STUDY_IDENTIFIERS: &[Tag] = &[
    tags::PATIENT_ID,
    tags::PATIENT_NAME,
    tags::PATIENT_BIRTH_DATE,
    tags::STUDY_INSTANCE_UID,
    tags::ACCESSION_NUMBER,
    tags::STUDY_DESCRIPTION,
    tags::STUDY_DATE,
];

const SERIES_IDENTIFIERS: &[Tag] = &[tags::SERIES_INSTANCE_UID];

const INSTANCE_IDENTIFIERS: &[Tag] = &[tags::SOP_INSTANCE_UID];

const PATIENT_MAIN_TAGS: &[Tag] = &[
    tags::PATIENT_NAME,
    tags::PATIENT_ID,
    tags::PATIENT_BIRTH_DATE,
    tags::PATIENT_SEX,
    OTHER_PATIENT_IDS,
];

const STUDY_MAIN_TAGS: &[Tag] = &[
    tags::STUDY_DATE,
    tags::STUDY_TIME,
    tags::STUDY_ID,
    tags::STUDY_DESCRIPTION,
    tags::ACCESSION_NUMBER,
    tags::STUDY_INSTANCE_UID,
    tags::REQUESTED_PROCEDURE_DESCRIPTION,
    tags::INSTITUTION_NAME,
    tags::REQUESTING_PHYSICIAN,
    tags::REFERRING_PHYSICIAN_NAME,
];

const SERIES_MAIN_TAGS: &[Tag] = &[
    tags::SERIES_DATE,
    tags::SERIES_TIME,
    tags::MODALITY,
    tags::MANUFACTURER,
    tags::STATION_NAME,
    tags::SERIES_DESCRIPTION,
    tags::BODY_PART_EXAMINED,
    tags::SEQUENCE_NAME,
    tags::PROTOCOL_NAME,
    tags::SERIES_NUMBER,
    tags::CARDIAC_NUMBER_OF_IMAGES,
    tags::IMAGES_IN_ACQUISITION,
    tags::NUMBER_OF_TEMPORAL_POSITIONS,
    tags::NUMBER_OF_SLICES,
    tags::NUMBER_OF_TIME_SLICES,
    tags::SERIES_INSTANCE_UID,
    tags::IMAGE_ORIENTATION_PATIENT,
    tags::SERIES_TYPE,
    tags::OPERATORS_NAME,
    tags::PERFORMED_PROCEDURE_STEP_DESCRIPTION,
    tags::ACQUISITION_DEVICE_PROCESSING_DESCRIPTION,
    tags::CONTRAST_BOLUS_AGENT,
];

const INSTANCE_MAIN_TAGS: &[Tag] = &[
    tags::INSTANCE_CREATION_DATE,
    tags::INSTANCE_CREATION_TIME,
    tags::ACQUISITION_NUMBER,
    tags::IMAGE_INDEX,
    tags::INSTANCE_NUMBER,
    tags::NUMBER_OF_FRAMES,
    tags::TEMPORAL_POSITION_IDENTIFIER,
    tags::SOP_INSTANCE_UID,
    tags::IMAGE_POSITION_PATIENT,
    tags::IMAGE_COMMENTS,
    // Also stored per instance, as it may vary within a series.
    tags::IMAGE_ORIENTATION_PATIENT,
];

fn builtin_identifiers(level: ResourceType) -> &'static [Tag] {
    match level {
        ResourceType::Patient => PATIENT_IDENTIFIERS,
        ResourceType::Study => STUDY_IDENTIFIERS,
        ResourceType::Series => SERIES_IDENTIFIERS,
        ResourceType::Instance => INSTANCE_IDENTIFIERS,
    }
}

fn builtin_main_tags(level: ResourceType) -> &'static [Tag] {
    match level {
        ResourceType::Patient => PATIENT_MAIN_TAGS,
        ResourceType::Study => STUDY_MAIN_TAGS,
        ResourceType::Series => SERIES_MAIN_TAGS,
        ResourceType::Instance => INSTANCE_MAIN_TAGS,
    }
}

/// Result of mapping a client lookup onto storable constraints.
#[derive(Debug, Clone, Default)]
pub struct NormalizedLookup {
    /// The constraints select exactly the resources the lookup selects.
    pub is_equivalent: bool,
    /// No in-memory re-check can discard a database row.
    pub can_be_fully_performed_in_db: bool,
    pub constraints: DatabaseDicomTagConstraints,
}

impl NormalizedLookup {
    pub fn is_simple(&self) -> bool {
        self.is_equivalent && self.can_be_fully_performed_in_db
    }
}

#[derive(Debug, Clone)]
pub struct MainDicomTagsRegistry {
    registry: HashMap<Tag, (ResourceType, DicomTagType)>,
    main_tags: [BTreeSet<Tag>; 4],
    identifiers: [Vec<Tag>; 4],
}

impl Default for MainDicomTagsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MainDicomTagsRegistry {
    pub fn new() -> Self {
        Self::with_extra_tags(std::iter::empty())
    }

    /// Built-in tags plus additional main tags per level. An extra tag that
    /// is already registered keeps its first registration.
    pub fn with_extra_tags(extra: impl IntoIterator<Item = (ResourceType, Tag)>) -> Self {
        let mut registry = HashMap::new();
        let mut main_tags: [BTreeSet<Tag>; 4] = Default::default();
        let mut identifiers: [Vec<Tag>; 4] = Default::default();

        // Identifiers first, so patient tags stay registered at the patient
        // level even though studies list them too.
        for level in ResourceType::ALL {
            for tag in builtin_identifiers(level) {
                registry
                    .entry(*tag)
                    .or_insert((level, DicomTagType::Identifier));
                identifiers[level.index()].push(*tag);
            }
        }

        for level in ResourceType::ALL {
            for tag in builtin_main_tags(level) {
                registry.entry(*tag).or_insert((level, DicomTagType::Main));
                main_tags[level.index()].insert(*tag);
            }
        }

        for (level, tag) in extra {
            if registry.contains_key(&tag) {
                tracing::debug!(tag = %crate::models::format_tag(tag), "Extra main tag already registered");
                continue;
            }
            registry.insert(tag, (level, DicomTagType::Main));
            main_tags[level.index()].insert(tag);
        }

        Self {
            registry,
            main_tags,
            identifiers,
        }
    }

    /// Home level and kind of a tag; unknown tags are generic instance tags.
    pub fn lookup_tag(&self, tag: Tag) -> (ResourceType, DicomTagType) {
        self.registry
            .get(&tag)
            .copied()
            .unwrap_or((ResourceType::Instance, DicomTagType::Generic))
    }

    /// Main tags whose home is `level`, identifiers included.
    pub fn main_tags(&self, level: ResourceType) -> &BTreeSet<Tag> {
        &self.main_tags[level.index()]
    }

    pub fn is_main_dicom_tag(&self, tag: Tag, level: ResourceType) -> bool {
        self.main_tags[level.index()].contains(&tag)
    }

    pub fn is_any_main_dicom_tag(&self, tag: Tag) -> bool {
        self.main_tags.iter().any(|set| set.contains(&tag))
    }

    /// Identifier tags stored on resources of `level`. Studies include the
    /// patient identifiers they carry a copy of.
    pub fn identifiers(&self, level: ResourceType) -> &[Tag] {
        &self.identifiers[level.index()]
    }

    /// Rewrites a client lookup into storable constraints.
    ///
    /// `allow_children_exists` tells whether the backend can evaluate a
    /// constraint on the children of the queried resources, which lets
    /// `ModalitiesInStudy` become a series-level `Modality` constraint.
    pub fn normalize_lookup(
        &self,
        lookup: &DatabaseLookup,
        query_level: ResourceType,
        allow_children_exists: bool,
    ) -> Result<NormalizedLookup> {
        let mut normalized = NormalizedLookup {
            is_equivalent: true,
            can_be_fully_performed_in_db: true,
            constraints: DatabaseDicomTagConstraints::new(),
        };

        for constraint in lookup.iter() {
            let (level, tag_type) = self.lookup_tag(constraint.tag());

            match tag_type {
                DicomTagType::Identifier | DicomTagType::Main => {
                    let level = if level == ResourceType::Patient
                        && query_level != ResourceType::Patient
                    {
                        ResourceType::Study
                    } else {
                        level
                    };

                    normalized
                        .constraints
                        .add(constraint.to_database_constraint(level, tag_type)?);

                    if tag_type == DicomTagType::Identifier && constraint.is_case_sensitive() {
                        normalized.can_be_fully_performed_in_db = false;
                    }
                }
                DicomTagType::Generic
                    if constraint.tag() == tags::MODALITIES_IN_STUDY
                        && query_level == ResourceType::Study
                        && allow_children_exists
                        && matches!(
                            constraint.constraint_type(),
                            ConstraintType::Equal | ConstraintType::List
                        ) =>
                {
                    normalized.constraints.add(DatabaseDicomTagConstraint::new(
                        ResourceType::Series,
                        tags::MODALITY,
                        false,
                        ConstraintType::List,
                        constraint.values().to_vec(),
                        constraint.is_case_sensitive(),
                        constraint.is_mandatory(),
                    )?);
                }
                DicomTagType::Generic => {
                    normalized.is_equivalent = false;
                    normalized.can_be_fully_performed_in_db = false;
                }
            }
        }

        Ok(normalized)
    }
}

/// Form under which identifier values are stored and searched: SQL
/// wildcards become spaces, only printable ASCII is kept, upper-cased
/// and trimmed.
pub fn normalize_identifier(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' | '_' => out.push(' '),
            ' '..='~' => out.push(c),
            _ => {}
        }
    }
    out.to_ascii_uppercase().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::search::DicomTagConstraint;

    #[test]
    fn first_registration_wins() {
        let registry = MainDicomTagsRegistry::new();
        assert_eq!(
            registry.lookup_tag(tags::PATIENT_ID),
            (ResourceType::Patient, DicomTagType::Identifier)
        );
        assert_eq!(
            registry.lookup_tag(tags::STUDY_DATE),
            (ResourceType::Study, DicomTagType::Identifier)
        );
        assert_eq!(
            registry.lookup_tag(tags::MODALITY),
            (ResourceType::Series, DicomTagType::Main)
        );
        assert_eq!(
            registry.lookup_tag(tags::IMAGE_ORIENTATION_PATIENT),
            (ResourceType::Series, DicomTagType::Main)
        );
        assert_eq!(
            registry.lookup_tag(Tag(0x0009, 0x1001)),
            (ResourceType::Instance, DicomTagType::Generic)
        );
        assert!(registry.is_main_dicom_tag(tags::PATIENT_SEX, ResourceType::Patient));
        assert!(!registry.is_main_dicom_tag(tags::PATIENT_ID, ResourceType::Study));
    }

    #[test]
    fn extra_tags_are_main_tags() {
        let registry =
            MainDicomTagsRegistry::with_extra_tags([(ResourceType::Series, Tag(0x0018, 0x0050))]);
        assert_eq!(
            registry.lookup_tag(Tag(0x0018, 0x0050)),
            (ResourceType::Series, DicomTagType::Main)
        );
    }

    fn lookup(constraints: Vec<DicomTagConstraint>) -> DatabaseLookup {
        let mut lookup = DatabaseLookup::new();
        for c in constraints {
            lookup.add_constraint(c);
        }
        lookup
    }

    #[test]
    fn patient_tags_move_to_study_level() {
        let registry = MainDicomTagsRegistry::new();
        let l = lookup(vec![DicomTagConstraint::single(
            tags::PATIENT_NAME,
            ConstraintType::Wildcard,
            "doe*",
            false,
            true,
        )
        .unwrap()]);

        let at_series = registry
            .normalize_lookup(&l, ResourceType::Series, true)
            .unwrap();
        assert!(at_series.is_simple());
        let c = at_series.constraints.get(0).unwrap();
        assert_eq!(c.level(), ResourceType::Study);
        assert_eq!(c.value(0).unwrap(), "DOE*");

        let at_patient = registry
            .normalize_lookup(&l, ResourceType::Patient, true)
            .unwrap();
        assert_eq!(
            at_patient.constraints.get(0).unwrap().level(),
            ResourceType::Patient
        );
    }

    #[test]
    fn case_sensitive_identifier_is_not_fully_in_db() {
        let registry = MainDicomTagsRegistry::new();
        let l = lookup(vec![DicomTagConstraint::single(
            tags::PATIENT_ID,
            ConstraintType::Equal,
            "abc",
            true,
            true,
        )
        .unwrap()]);
        let n = registry
            .normalize_lookup(&l, ResourceType::Patient, true)
            .unwrap();
        assert!(n.is_equivalent);
        assert!(!n.can_be_fully_performed_in_db);
    }

    #[test]
    fn generic_tags_are_not_equivalent() {
        let registry = MainDicomTagsRegistry::new();
        let l = lookup(vec![DicomTagConstraint::single(
            Tag(0x0009, 0x1001),
            ConstraintType::Equal,
            "x",
            true,
            true,
        )
        .unwrap()]);
        let n = registry
            .normalize_lookup(&l, ResourceType::Instance, true)
            .unwrap();
        assert!(!n.is_equivalent);
        assert!(!n.can_be_fully_performed_in_db);
        assert!(n.constraints.is_empty());
    }

    #[test]
    fn modalities_in_study_becomes_series_constraint() {
        let registry = MainDicomTagsRegistry::new();
        let l = lookup(vec![DicomTagConstraint::single(
            tags::MODALITIES_IN_STUDY,
            ConstraintType::Equal,
            "CT",
            true,
            true,
        )
        .unwrap()]);

        let n = registry
            .normalize_lookup(&l, ResourceType::Study, true)
            .unwrap();
        assert!(n.is_simple());
        let c = n.constraints.get(0).unwrap();
        assert_eq!(c.level(), ResourceType::Series);
        assert_eq!(c.tag(), tags::MODALITY);

        let without = registry
            .normalize_lookup(&l, ResourceType::Study, false)
            .unwrap();
        assert!(!without.is_equivalent);
    }

    #[test]
    fn identifier_normalization() {
        assert_eq!(normalize_identifier("  abc_d%e  "), "ABC D E");
        assert_eq!(normalize_identifier("Jürgen"), "JRGEN");
    }
}
