use dicom_core::Tag;
use std::collections::BTreeSet;

use super::{DicomFileReader, PagingMode, ResourceFinder};
use crate::db::IndexOperations;
use crate::find::{FindRequest, FindResource};
use crate::models::{format_tag, DicomMap, DicomValue, ResourceType};
use crate::{Error, Result};

/// Matches in database order, each with the values of its requested tags.
#[derive(Debug, Clone)]
pub struct FinderAnswer {
    pub matches: Vec<(FindResource, DicomMap)>,
    /// False when answers were left out because of a limit.
    pub complete: bool,
}

impl ResourceFinder {
    /// Runs the find. The database answers first; then each candidate gets
    /// its computed and stored tags, is matched against the constraints the
    /// database could not evaluate, and the answers are paged as the paging
    /// mode requires. At most one file is read per candidate.
    pub async fn execute(
        &self,
        index: &IndexOperations,
        reader: &dyn DicomFileReader,
    ) -> Result<FinderAnswer> {
        let plan = self.plan(index, true)?;
        let response = index.execute_find(&plan.request).await?;

        let mut complete = match plan.paging {
            PagingMode::FullDatabase | PagingMode::ManualSkip => true,
            PagingMode::FullManual => {
                self.database_limits == 0 || response.len() as u64 <= self.database_limits
            }
        };

        tracing::info!(
            level = %self.level(),
            candidates = response.len(),
            paging = ?plan.paging,
            "Candidate resources after database filtering"
        );

        let since = match plan.paging {
            PagingMode::FullDatabase => 0,
            _ => self.limits_since.unwrap_or(0),
        };
        let count = match plan.paging {
            PagingMode::FullDatabase => None,
            _ => self.limits_count,
        };

        let mut matches = Vec::new();
        let mut skipped = 0;
        let mut storage_warned = false;

        for resource in response {
            let mut requested_tags = DicomMap::new();

            if plan.has_requested_tags {
                let missing = plan.requested.inject(&mut requested_tags, &resource)?;

                if !missing.is_empty() {
                    if !self.allow_storage_access {
                        return Err(Error::BadSequenceOfCalls(
                            "Cannot add missing requested tags, as access to file storage is disallowed"
                                .to_string(),
                        ));
                    }

                    if !storage_warned {
                        tracing::warn!(
                            level = %self.level(),
                            tags = %missing.iter().map(|t| format_tag(*t)).collect::<Vec<_>>().join(";"),
                            "Requested tags are not stored in the index and will be read from DICOM files"
                        );
                        storage_warned = true;
                    }

                    match self
                        .read_missing_tags(index, reader, &resource, &missing)
                        .await?
                    {
                        Some(values) => {
                            for tag in &missing {
                                let value = values.get(*tag).cloned().unwrap_or(DicomValue::Null);
                                requested_tags.set(*tag, value);
                            }
                        }
                        None => {
                            tracing::debug!(
                                resource = %resource.public_id(),
                                "Resource vanished while reading its DICOM file, skipping"
                            );
                            continue;
                        }
                    }
                }
            }

            if let Some(lookup) = plan.lookup {
                let mut tags = resource.all_main_dicom_tags();
                tags.merge(&requested_tags);
                if !lookup.is_match(&tags) {
                    continue;
                }
            }

            if skipped < since {
                skipped += 1;
                continue;
            }
            if let Some(count) = count {
                if count != 0 && matches.len() as u64 >= count {
                    complete = false;
                    break;
                }
            }
            matches.push((resource, requested_tags));
        }

        Ok(FinderAnswer { matches, complete })
    }

    /// Reads `missing` from one DICOM file below `resource`, in a single
    /// read. `None` if no file is available any more.
    async fn read_missing_tags(
        &self,
        index: &IndexOperations,
        reader: &dyn DicomFileReader,
        resource: &FindResource,
        missing: &BTreeSet<Tag>,
    ) -> Result<Option<DicomMap>> {
        let instance_id = if resource.level() == ResourceType::Instance {
            Some(resource.public_id().to_string())
        } else if let Some(id) = resource.one_instance_identifier() {
            Some(id.to_string())
        } else {
            let mut request = FindRequest::new(resource.level());
            request.set_orthanc_id(resource.level(), resource.public_id())?;
            request.set_retrieve_one_instance_identifier(true)?;
            index
                .execute_find(&request)
                .await?
                .iter()
                .next()
                .and_then(|found| found.one_instance_identifier().map(str::to_string))
        };

        match instance_id {
            Some(instance_id) => reader.read(&instance_id, missing).await,
            None => Ok(None),
        }
    }

    /// Number of matches, which the database must be able to compute alone.
    pub async fn count(&self, index: &IndexOperations) -> Result<u64> {
        let plan = self.plan(index, false)?;
        if plan.lookup.is_some() && !plan.is_simple_lookup {
            return Err(Error::BadRequest(
                "Cannot count the answers of a lookup that the database cannot fully evaluate"
                    .to_string(),
            ));
        }
        index.execute_count(&plan.request).await
    }
}
