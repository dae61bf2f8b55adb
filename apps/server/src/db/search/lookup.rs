//! Client-side lookup: constraints evaluated against a tag map.
//!
//! A `DatabaseLookup` is what callers build from a C-FIND style query.
//! The registry turns it into storable constraints; whatever cannot be
//! stored is re-checked here with `is_match` once tags are assembled.

use dicom_core::{Tag, VR};
use regex::Regex;

use super::constraint::{ConstraintType, DatabaseDicomTagConstraint};
use super::escape::wildcard_to_regex;
use crate::models::{tag_vr, DicomMap, DicomValue, ResourceType};
use crate::registry::{normalize_identifier, DicomTagType};
use crate::{Error, Result};

const MULTI_VALUED: [Tag; 2] = [
    dicom_dictionary_std::tags::MODALITIES_IN_STUDY,
    dicom_dictionary_std::tags::SOP_CLASSES_IN_STUDY,
];

#[derive(Debug, Clone)]
pub struct DicomTagConstraint {
    tag: Tag,
    constraint_type: ConstraintType,
    values: Vec<String>,
    case_sensitive: bool,
    mandatory: bool,
    pattern: Option<Regex>,
}

impl DicomTagConstraint {
    pub fn new(
        tag: Tag,
        constraint_type: ConstraintType,
        values: Vec<String>,
        case_sensitive: bool,
        mandatory: bool,
    ) -> Result<Self> {
        let valid = match constraint_type {
            ConstraintType::List => !values.is_empty(),
            _ => values.len() == 1,
        };
        if !valid {
            return Err(Error::ParameterOutOfRange(format!(
                "{constraint_type:?} constraint with {} values",
                values.len()
            )));
        }

        let pattern = if constraint_type == ConstraintType::Wildcard {
            let source = wildcard_to_regex(&values[0], case_sensitive);
            Some(Regex::new(&source).map_err(|e| {
                Error::BadParameterType(format!("Invalid wildcard {}: {e}", values[0]))
            })?)
        } else {
            None
        };

        Ok(Self {
            tag,
            constraint_type,
            values,
            case_sensitive,
            mandatory,
            pattern,
        })
    }

    pub fn single(
        tag: Tag,
        constraint_type: ConstraintType,
        value: impl Into<String>,
        case_sensitive: bool,
        mandatory: bool,
    ) -> Result<Self> {
        Self::new(
            tag,
            constraint_type,
            vec![value.into()],
            case_sensitive,
            mandatory,
        )
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn constraint_type(&self) -> ConstraintType {
        self.constraint_type
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    pub fn is_mandatory(&self) -> bool {
        self.mandatory
    }

    /// Same constraint bound to another tag.
    pub fn with_tag(&self, tag: Tag) -> Self {
        Self {
            tag,
            ..self.clone()
        }
    }

    fn fold(&self, value: &str) -> String {
        if self.case_sensitive {
            value.to_string()
        } else {
            value.to_uppercase()
        }
    }

    pub fn is_match_value(&self, value: &str) -> bool {
        let value = self.fold(value);
        match self.constraint_type {
            ConstraintType::Equal => value == self.fold(&self.values[0]),
            ConstraintType::SmallerOrEqual => value <= self.fold(&self.values[0]),
            ConstraintType::GreaterOrEqual => value >= self.fold(&self.values[0]),
            ConstraintType::Wildcard => self
                .pattern
                .as_ref()
                .map(|re| re.is_match(&value))
                .unwrap_or(false),
            ConstraintType::List => self.values.iter().any(|v| self.fold(v) == value),
        }
    }

    /// An absent or null tag never matches. Values of the computed
    /// multi-valued study tags match if any component does.
    pub fn is_match(&self, tags: &DicomMap) -> bool {
        match tags.get(self.tag) {
            Some(DicomValue::String(value)) if MULTI_VALUED.contains(&self.tag) => {
                value.split('\\').any(|v| self.is_match_value(v))
            }
            Some(DicomValue::String(value)) => self.is_match_value(value),
            Some(DicomValue::Null) | None => false,
        }
    }

    /// Storable form at `level`. Identifier values are normalized the way
    /// the `DicomIdentifiers` table stores them.
    pub fn to_database_constraint(
        &self,
        level: ResourceType,
        tag_type: DicomTagType,
    ) -> Result<DatabaseDicomTagConstraint> {
        let is_identifier = tag_type == DicomTagType::Identifier;
        let (values, case_sensitive) = if is_identifier {
            let values = self
                .values
                .iter()
                .map(|v| normalize_identifier(v))
                .collect();
            (values, true)
        } else {
            (self.values.clone(), self.case_sensitive)
        };

        DatabaseDicomTagConstraint::new(
            level,
            self.tag,
            is_identifier,
            self.constraint_type,
            values,
            case_sensitive,
            self.mandatory,
        )
    }
}

/// Conjunction of client-side constraints.
#[derive(Debug, Clone, Default)]
pub struct DatabaseLookup {
    constraints: Vec<DicomTagConstraint>,
}

impl DatabaseLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_constraint(&mut self, constraint: DicomTagConstraint) {
        self.constraints.push(constraint);
    }

    /// Parses a C-FIND style value: `lo-hi` ranges on dates and times,
    /// `\` separated lists, `*`/`?` wildcards, otherwise an exact match.
    pub fn add_dicom_constraint(
        &mut self,
        tag: Tag,
        query: &str,
        case_sensitive_pn: bool,
        mandatory: bool,
    ) -> Result<()> {
        let vr = tag_vr(tag);
        if vr == Some(VR::SQ) {
            return Err(Error::ParameterOutOfRange(format!(
                "Cannot search on sequence {}",
                crate::models::format_tag(tag)
            )));
        }

        let case_sensitive = if vr == Some(VR::PN) {
            case_sensitive_pn
        } else {
            true
        };

        let is_temporal = matches!(vr, Some(VR::DA | VR::DT | VR::TM));
        if is_temporal {
            if let Some((lower, upper)) = query.split_once('-') {
                if !lower.is_empty() {
                    self.add_constraint(DicomTagConstraint::single(
                        tag,
                        ConstraintType::GreaterOrEqual,
                        lower,
                        true,
                        mandatory,
                    )?);
                }
                if !upper.is_empty() {
                    self.add_constraint(DicomTagConstraint::single(
                        tag,
                        ConstraintType::SmallerOrEqual,
                        upper,
                        true,
                        mandatory,
                    )?);
                }
                return Ok(());
            }
        }

        let constraint = if query.contains('\\') {
            let values = query.split('\\').map(str::to_string).collect();
            DicomTagConstraint::new(
                tag,
                ConstraintType::List,
                values,
                case_sensitive,
                mandatory,
            )?
        } else if query.contains('*') || query.contains('?') {
            DicomTagConstraint::single(
                tag,
                ConstraintType::Wildcard,
                query,
                case_sensitive,
                mandatory,
            )?
        } else {
            DicomTagConstraint::single(tag, ConstraintType::Equal, query, case_sensitive, mandatory)?
        };
        self.add_constraint(constraint);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DicomTagConstraint> {
        self.constraints.iter()
    }

    pub fn has_tag(&self, tag: Tag) -> bool {
        self.constraints.iter().any(|c| c.tag == tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = Tag> + '_ {
        self.constraints.iter().map(|c| c.tag)
    }

    pub fn is_match(&self, tags: &DicomMap) -> bool {
        self.constraints.iter().all(|c| c.is_match(tags))
    }
}
