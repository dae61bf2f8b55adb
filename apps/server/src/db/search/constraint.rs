//! Storable constraints and ordering keys.
//!
//! These are the normalized forms the query planner hands to a backend:
//! each constraint is already bound to the level where its tag is
//! stored, and identifier values are already normalized.

use dicom_core::Tag;

use crate::models::{MetadataType, ResourceType};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintType {
    Equal,
    SmallerOrEqual,
    GreaterOrEqual,
    Wildcard,
    List,
}

/// Behaviour shared by tag and metadata constraints, used by the SQL
/// formatter to render one comparison regardless of the key kind.
pub trait ValueConstraint {
    fn constraint_type(&self) -> ConstraintType;
    fn values(&self) -> &[String];
    fn is_case_sensitive(&self) -> bool;
    fn is_mandatory(&self) -> bool;

    fn single_value(&self) -> Result<&str> {
        match self.values() {
            [value] => Ok(value),
            _ => Err(Error::BadSequenceOfCalls(
                "Constraint does not have a single value".to_string(),
            )),
        }
    }
}

fn check_values(constraint_type: ConstraintType, values: &[String]) -> Result<()> {
    let valid = match constraint_type {
        ConstraintType::List => !values.is_empty(),
        _ => values.len() == 1,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::ParameterOutOfRange(format!(
            "{constraint_type:?} constraint with {} values",
            values.len()
        )))
    }
}

/// Constraint on a main DICOM tag, as stored in the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseDicomTagConstraint {
    level: ResourceType,
    tag: Tag,
    is_identifier: bool,
    constraint_type: ConstraintType,
    values: Vec<String>,
    case_sensitive: bool,
    mandatory: bool,
}

impl DatabaseDicomTagConstraint {
    pub fn new(
        level: ResourceType,
        tag: Tag,
        is_identifier: bool,
        constraint_type: ConstraintType,
        values: Vec<String>,
        case_sensitive: bool,
        mandatory: bool,
    ) -> Result<Self> {
        check_values(constraint_type, &values)?;
        Ok(Self {
            level,
            tag,
            is_identifier,
            constraint_type,
            values,
            case_sensitive,
            mandatory,
        })
    }

    pub fn level(&self) -> ResourceType {
        self.level
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Identifier tags live in the `DicomIdentifiers` table, upper-cased.
    pub fn is_identifier(&self) -> bool {
        self.is_identifier
    }

    pub fn value(&self, index: usize) -> Result<&str> {
        self.values.get(index).map(String::as_str).ok_or_else(|| {
            Error::ParameterOutOfRange(format!("No value at index {index}"))
        })
    }
}

impl ValueConstraint for DatabaseDicomTagConstraint {
    fn constraint_type(&self) -> ConstraintType {
        self.constraint_type
    }

    fn values(&self) -> &[String] {
        &self.values
    }

    fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    fn is_mandatory(&self) -> bool {
        self.mandatory
    }
}

/// Ordered set of tag constraints; all of them must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseDicomTagConstraints {
    items: Vec<DatabaseDicomTagConstraint>,
}

impl DatabaseDicomTagConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, constraint: DatabaseDicomTagConstraint) {
        self.items.push(constraint);
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&DatabaseDicomTagConstraint> {
        self.items.get(index).ok_or_else(|| {
            Error::ParameterOutOfRange(format!("No constraint at index {index}"))
        })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DatabaseDicomTagConstraint> {
        self.items.iter()
    }

    /// Shallowest and deepest levels touched by the constraints, starting
    /// from the query level.
    pub fn lookup_levels(&self, query_level: ResourceType) -> (ResourceType, ResourceType) {
        let mut upper = query_level;
        let mut lower = query_level;
        for constraint in &self.items {
            upper = upper.min(constraint.level);
            lower = lower.max(constraint.level);
        }
        (upper, lower)
    }
}

impl<'a> IntoIterator for &'a DatabaseDicomTagConstraints {
    type Item = &'a DatabaseDicomTagConstraint;
    type IntoIter = std::slice::Iter<'a, DatabaseDicomTagConstraint>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Constraint on a metadata value of the queried resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseMetadataConstraint {
    metadata: MetadataType,
    constraint_type: ConstraintType,
    values: Vec<String>,
    case_sensitive: bool,
    mandatory: bool,
}

impl DatabaseMetadataConstraint {
    pub fn new(
        metadata: MetadataType,
        constraint_type: ConstraintType,
        values: Vec<String>,
        case_sensitive: bool,
        mandatory: bool,
    ) -> Result<Self> {
        check_values(constraint_type, &values)?;
        Ok(Self {
            metadata,
            constraint_type,
            values,
            case_sensitive,
            mandatory,
        })
    }

    pub fn metadata(&self) -> MetadataType {
        self.metadata
    }
}

impl ValueConstraint for DatabaseMetadataConstraint {
    fn constraint_type(&self) -> ConstraintType {
        self.constraint_type
    }

    fn values(&self) -> &[String] {
        &self.values
    }

    fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    fn is_mandatory(&self) -> bool {
        self.mandatory
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingKey {
    DicomTag(Tag),
    Metadata(MetadataType),
}

/// How the stored text is compared when sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingCast {
    Int,
    Float,
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingDirection {
    Ascending,
    Descending,
}

/// One ordering key; keys are applied in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy {
    pub key: OrderingKey,
    pub cast: OrderingCast,
    pub direction: OrderingDirection,
}

impl OrderBy {
    pub fn tag(tag: Tag, cast: OrderingCast, direction: OrderingDirection) -> Self {
        Self {
            key: OrderingKey::DicomTag(tag),
            cast,
            direction,
        }
    }

    pub fn metadata(
        metadata: MetadataType,
        cast: OrderingCast,
        direction: OrderingDirection,
    ) -> Self {
        Self {
            key: OrderingKey::Metadata(metadata),
            cast,
            direction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_dictionary_std::tags;

    #[test]
    fn single_value_kinds_require_one_value() {
        let err = DatabaseDicomTagConstraint::new(
            ResourceType::Study,
            tags::STUDY_DATE,
            false,
            ConstraintType::Equal,
            vec!["a".into(), "b".into()],
            true,
            true,
        );
        assert!(matches!(err, Err(Error::ParameterOutOfRange(_))));

        let list = DatabaseDicomTagConstraint::new(
            ResourceType::Series,
            tags::MODALITY,
            false,
            ConstraintType::List,
            vec!["CT".into(), "MR".into()],
            true,
            true,
        )
        .unwrap();
        assert!(list.single_value().is_err());
        assert_eq!(list.value(1).unwrap(), "MR");
        assert!(list.value(2).is_err());
    }

    #[test]
    fn empty_list_is_rejected() {
        assert!(DatabaseMetadataConstraint::new(
            MetadataType::LastUpdate,
            ConstraintType::List,
            vec![],
            true,
            true
        )
        .is_err());
    }

    #[test]
    fn lookup_levels_span_the_constraints() {
        let mut constraints = DatabaseDicomTagConstraints::new();
        for level in [ResourceType::Patient, ResourceType::Instance] {
            constraints.add(
                DatabaseDicomTagConstraint::new(
                    level,
                    tags::PATIENT_ID,
                    true,
                    ConstraintType::Equal,
                    vec!["X".into()],
                    true,
                    true,
                )
                .unwrap(),
            );
        }
        assert_eq!(
            constraints.lookup_levels(ResourceType::Series),
            (ResourceType::Patient, ResourceType::Instance)
        );
        assert_eq!(
            DatabaseDicomTagConstraints::new().lookup_levels(ResourceType::Study),
            (ResourceType::Study, ResourceType::Study)
        );
    }
}
