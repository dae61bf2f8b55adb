//! Client-facing finder: turns a C-FIND style lookup into a find request,
//! pages the answers and fills the requested tags.
//!
//! The database only sees what it can evaluate. Whatever it cannot is
//! re-checked in memory, which also decides how paging is done:
//!
//! - `FullDatabase`: the database pages, every row it returns is an answer.
//! - `ManualSkip`: the database returns `since + count` rows and the first
//!   `since` are skipped here.
//! - `FullManual`: the database returns at most `database_limit + 1` rows
//!   and both bounds are applied here, after in-memory filtering.

mod computed;
mod execute;
mod expand;
mod reader;
mod requested;

use dicom_core::Tag;
use std::collections::BTreeSet;

use crate::config::FindConfig;
use crate::db::search::{DatabaseLookup, DatabaseMetadataConstraint, OrderBy};
use crate::db::IndexOperations;
use crate::find::FindRequest;
use crate::models::{format_tag, LabelsConstraint, MetadataType, ResourceType};
use crate::registry::DicomTagType;
use crate::{Error, Result};

pub use computed::{is_computed_tag, series_status};
pub use execute::FinderAnswer;
pub use reader::{DicomFileReader, NoStorageArea};

use requested::RequestedTags;

/// Where `since` and `count` are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// The database evaluates the whole lookup and pages the answers.
    FullDatabase,
    /// The database evaluates the lookup but returns `since + count` rows,
    /// and the first `since` are skipped in memory.
    ManualSkip,
    /// The lookup is finished in memory, so paging is too.
    FullManual,
}

/// Plans a find against the index, then completes it in memory: computed
/// tags, tags read from storage, matching of the remaining constraints and
/// paging.
pub struct ResourceFinder {
    request: FindRequest,
    expand: bool,
    lookup: Option<DatabaseLookup>,
    requested_tags: BTreeSet<Tag>,
    database_limits: u64,
    limits_since: Option<u64>,
    limits_count: Option<u64>,
    allow_storage_access: bool,
    include_all_metadata: bool,
    stable_age_seconds: u64,
}

/// A finder resolved against one index: the request to run and how to
/// post-process its answers.
struct Plan<'a> {
    request: FindRequest,
    requested: RequestedTags,
    has_requested_tags: bool,
    lookup: Option<&'a DatabaseLookup>,
    is_simple_lookup: bool,
    paging: PagingMode,
}

impl ResourceFinder {
    /// Finder answering `level` resources. With `expand`, the request also
    /// retrieves what the expanded JSON needs: main tags, metadata, labels,
    /// child identifiers and the parent identifier.
    pub fn new(level: ResourceType, expand: bool) -> Result<Self> {
        let mut request = FindRequest::new(level);

        if expand {
            request.set_retrieve_main_dicom_tags(true);
            request.set_retrieve_metadata(true);
            request.set_retrieve_labels(true);

            if let Some(child) = level.child() {
                let children = request.children_specification_mut(child)?;
                children.set_retrieve_identifiers(true);
                if level == ResourceType::Series {
                    children.add_metadata(MetadataType::IndexInSeries);
                }
            }
            if level == ResourceType::Instance {
                request.set_retrieve_attachments(true);
            }
            if level != ResourceType::Patient {
                request.set_retrieve_parent_identifier(true)?;
            }
        }

        let defaults = FindConfig::default();
        Ok(Self {
            request,
            expand,
            lookup: None,
            requested_tags: BTreeSet::new(),
            database_limits: defaults.database_limit,
            limits_since: None,
            limits_count: None,
            allow_storage_access: defaults.allow_storage_access,
            include_all_metadata: false,
            stable_age_seconds: defaults.stable_age_seconds,
        })
    }

    /// Applies the `[find]` configuration section.
    pub fn with_config(mut self, config: &FindConfig) -> Self {
        self.database_limits = config.database_limit;
        self.allow_storage_access = config.allow_storage_access;
        self.stable_age_seconds = config.stable_age_seconds;
        self
    }

    pub fn level(&self) -> ResourceType {
        self.request.level()
    }

    pub fn is_expand(&self) -> bool {
        self.expand
    }

    /// Rows fetched at most when paging in memory; 0 means no limit.
    pub fn set_database_limits(&mut self, limit: u64) {
        self.database_limits = limit;
    }

    /// Number of answers to skip. Can only be set once.
    pub fn set_limits_since(&mut self, since: u64) -> Result<()> {
        if self.limits_since.is_some() {
            return Err(Error::BadSequenceOfCalls(
                "The \"since\" limit has already been set".to_string(),
            ));
        }
        self.limits_since = Some(since);
        Ok(())
    }

    /// Maximum number of answers; 0 means no limit. Can only be set once.
    pub fn set_limits_count(&mut self, count: u64) -> Result<()> {
        if self.limits_count.is_some() {
            return Err(Error::BadSequenceOfCalls(
                "The \"count\" limit has already been set".to_string(),
            ));
        }
        self.limits_count = Some(count);
        Ok(())
    }

    /// Sets the C-FIND style lookup. It is normalized against the registry
    /// when the finder runs, so the database evaluates what it can and the
    /// rest is matched in memory. Can only be set once.
    pub fn set_database_lookup(&mut self, lookup: DatabaseLookup) -> Result<()> {
        if self.lookup.is_some() {
            return Err(Error::BadSequenceOfCalls(
                "The lookup has already been set".to_string(),
            ));
        }
        self.lookup = Some(lookup);
        Ok(())
    }

    /// Adds a tag to the answers. Its value is taken from the index when
    /// indexed, computed when it is a computed tag, and read from the
    /// stored file otherwise.
    pub fn add_requested_tag(&mut self, tag: Tag) {
        self.requested_tags.insert(tag);
    }

    pub fn add_requested_tags(&mut self, tags: impl IntoIterator<Item = Tag>) {
        self.requested_tags.extend(tags);
    }

    pub fn set_orthanc_id(&mut self, level: ResourceType, id: impl Into<String>) -> Result<()> {
        self.request.set_orthanc_id(level, id)
    }

    pub fn add_label(&mut self, label: impl Into<String>) {
        self.request.add_label(label);
    }

    pub fn set_labels_constraint(&mut self, constraint: LabelsConstraint) {
        self.request.set_labels_constraint(constraint);
    }

    pub fn add_ordering(&mut self, ordering: OrderBy) {
        self.request.add_ordering(ordering);
    }

    pub fn add_metadata_constraint(&mut self, constraint: DatabaseMetadataConstraint) {
        self.request.add_metadata_constraint(constraint);
    }

    /// When disallowed, a find that would read a stored file fails with
    /// `BadSequenceOfCalls`.
    pub fn set_allow_storage_access(&mut self, allow: bool) {
        self.allow_storage_access = allow;
    }

    pub fn set_include_all_metadata(&mut self, include: bool) {
        if include {
            self.request.set_retrieve_metadata(true);
        }
        self.include_all_metadata = include;
    }

    /// Tags of the lookup that the index cannot evaluate, and so must be
    /// computed or read before the in-memory match.
    fn lookup_requested_tags(&self, index: &IndexOperations) -> Vec<Tag> {
        let Some(lookup) = &self.lookup else {
            return Vec::new();
        };
        lookup
            .tags()
            .filter(|tag| {
                is_computed_tag(*tag)
                    || index.registry().lookup_tag(*tag).1 == DicomTagType::Generic
            })
            .collect()
    }

    fn plan(&self, index: &IndexOperations, with_limits: bool) -> Result<Plan<'_>> {
        let registry = index.registry();
        let has_find_support = index.capabilities().has_find_support;
        let level = self.level();
        let mut request = self.request.clone();
        let mut requested = RequestedTags::default();

        let mut all_requested = self.requested_tags.clone();
        all_requested.extend(self.lookup_requested_tags(index));
        for tag in &all_requested {
            requested.add(&mut request, registry, *tag)?;
        }

        let mut is_simple_lookup = true;
        if let Some(lookup) = &self.lookup {
            let normalized = registry.normalize_lookup(lookup, level, has_find_support)?;
            is_simple_lookup = normalized.is_simple();

            for constraint in &normalized.constraints {
                let constraint_level = constraint.level();
                if constraint_level == level {
                    request.set_retrieve_main_dicom_tags(true);
                } else if constraint_level < level {
                    request
                        .parent_specification_mut(constraint_level)?
                        .set_retrieve_main_dicom_tags(true);
                } else if lookup.has_tag(constraint.tag()) {
                    tracing::warn!(
                        level = %level,
                        tag = %format_tag(constraint.tag()),
                        constraint_level = %constraint_level,
                        "Lookup on a main DICOM tag from an inferior level will return no result"
                    );
                }
            }

            *request.dicom_tag_constraints_mut() = normalized.constraints;
        }

        let paging = if with_limits {
            self.apply_paging(&mut request, is_simple_lookup, has_find_support)?
        } else {
            request.clear_limits();
            PagingMode::FullDatabase
        };

        Ok(Plan {
            request,
            requested,
            has_requested_tags: !all_requested.is_empty(),
            lookup: self.lookup.as_ref(),
            is_simple_lookup,
            paging,
        })
    }

    fn apply_paging(
        &self,
        request: &mut FindRequest,
        is_simple_lookup: bool,
        has_find_support: bool,
    ) -> Result<PagingMode> {
        let has_paging = self.limits_since.is_some() || self.limits_count.is_some();
        let since = self.limits_since.unwrap_or(0);
        let count = self.limits_count.unwrap_or(0);

        if has_paging && (self.lookup.is_none() || (is_simple_lookup && has_find_support)) {
            request.set_limits(since, count);
            return Ok(PagingMode::FullDatabase);
        }

        if has_paging && is_simple_lookup {
            if since == 0 {
                request.set_limits(0, count);
                return Ok(PagingMode::FullDatabase);
            }
            if count == 0 {
                request.clear_limits();
            } else {
                request.set_limits(0, since.saturating_add(count));
            }
            return Ok(PagingMode::ManualSkip);
        }

        if since > 0 {
            return Err(Error::BadRequest(
                "Cannot skip answers of a lookup that the database cannot fully evaluate"
                    .to_string(),
            ));
        }

        if self.database_limits != 0 {
            request.set_limits(0, self.database_limits.saturating_add(1));
        } else {
            request.clear_limits();
        }
        Ok(PagingMode::FullManual)
    }

    /// Paging mode the finder would use against `index`.
    pub fn paging_mode(&self, index: &IndexOperations) -> Result<PagingMode> {
        Ok(self.plan(index, true)?.paging)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_are_set_once() {
        let mut finder = ResourceFinder::new(ResourceType::Study, false).unwrap();
        finder.set_limits_since(2).unwrap();
        assert!(matches!(
            finder.set_limits_since(3),
            Err(Error::BadSequenceOfCalls(_))
        ));
        finder.set_limits_count(5).unwrap();
        assert!(matches!(
            finder.set_limits_count(5),
            Err(Error::BadSequenceOfCalls(_))
        ));
    }

    #[test]
    fn expansion_retrieves_children_and_parent() {
        let finder = ResourceFinder::new(ResourceType::Series, true).unwrap();
        let instances = finder
            .request
            .children_specification(ResourceType::Instance)
            .unwrap();
        assert!(instances.is_retrieve_identifiers());
        assert!(instances.metadata().contains(&MetadataType::IndexInSeries));
        assert!(finder.request.is_retrieve_parent_identifier());
        assert!(finder.request.is_retrieve_labels());
    }

    #[test]
    fn expanded_patients_retrieve_no_parent() {
        let finder = ResourceFinder::new(ResourceType::Patient, true).unwrap();
        assert!(!finder.request.is_retrieve_parent_identifier());
        assert!(finder
            .request
            .children_specification(ResourceType::Study)
            .unwrap()
            .is_retrieve_identifiers());

        let finder = ResourceFinder::new(ResourceType::Instance, true).unwrap();
        assert!(finder.request.is_retrieve_parent_identifier());
        assert!(finder.request.is_retrieve_attachments());
    }
}
