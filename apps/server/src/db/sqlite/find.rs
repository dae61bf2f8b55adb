//! Native find: one lookup, then one query per requested expansion.
//!
//! Every expansion query reuses the lookup as a `Lookup` CTE with the same
//! bound parameters, so the matched set is computed by the database each
//! time instead of being shipped back as a list of ids.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;

use super::rows::{bind_all, file_info_from_row, non_negative, tag_from_row};
use super::transaction::SqliteTransaction;
use crate::db::search::{BindValue, FindQueryBuilder};
use crate::find::{FindRequest, FindResource, FindResponse};
use crate::models::{MetadataType, ResourceType};
use crate::{Error, Result};

/// Matched resources, addressable by internal id while they are filled.
struct Matches {
    level: ResourceType,
    resources: Vec<FindResource>,
    by_internal_id: HashMap<i64, usize>,
}

impl Matches {
    fn get_mut(&mut self, row: &SqliteRow) -> Result<&mut FindResource> {
        let id: i64 = row.try_get("lookupId")?;
        let index = self.by_internal_id.get(&id).copied().ok_or_else(|| {
            Error::DatabasePlugin(format!("Expansion returned unknown resource {id}"))
        })?;
        Ok(&mut self.resources[index])
    }

    fn into_response(self) -> Result<FindResponse> {
        let mut response = FindResponse::new(self.level);
        for resource in self.resources {
            response.add(resource)?;
        }
        Ok(response)
    }
}

/// `r0` is the match itself, `r{depth}` its ancestor `depth` levels up.
fn ancestor_joins(depth: usize) -> String {
    let mut sql = " INNER JOIN Resources r0 ON r0.internalId = Lookup.internalId".to_string();
    for i in 1..=depth {
        sql.push_str(&format!(
            " INNER JOIN Resources r{i} ON r{i}.internalId = r{}.parentId",
            i - 1
        ));
    }
    sql
}

/// `c{depth}` is a descendant of the match `depth` levels down.
fn descendant_joins(depth: usize) -> String {
    let mut sql = " INNER JOIN Resources c1 ON c1.parentId = Lookup.internalId".to_string();
    for i in 2..=depth {
        sql.push_str(&format!(
            " INNER JOIN Resources c{i} ON c{i}.parentId = c{}.internalId",
            i - 1
        ));
    }
    sql
}

fn depth_between(upper: ResourceType, lower: ResourceType) -> usize {
    lower.index() - upper.index()
}

impl SqliteTransaction {
    async fn expand(
        &mut self,
        lookup_sql: &str,
        bind_params: &[BindValue],
        extra_ctes: &str,
        select: &str,
    ) -> Result<Vec<SqliteRow>> {
        let sql = format!("WITH Lookup AS ({lookup_sql}){extra_ctes} {select}");
        tracing::trace!(sql = %sql, "Find expansion");

        let tx = self.tx_mut()?;
        let rows = bind_all(sqlx::query(&sql), bind_params)
            .fetch_all(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(rows)
    }

    pub(super) async fn find(&mut self, request: &FindRequest) -> Result<FindResponse> {
        let registry = Arc::clone(&self.registry);
        let (lookup_sql, bind_params) =
            FindQueryBuilder::new(request, &registry).build_sql(&self.dialect)?;
        tracing::debug!(level = %request.level(), sql = %lookup_sql, "Native find");

        let rows = {
            let tx = self.tx_mut()?;
            bind_all(sqlx::query(&lookup_sql), &bind_params)
                .fetch_all(&mut **tx)
                .await
                .map_err(Error::Database)?
        };

        let level = request.level();
        let mut matches = Matches {
            level,
            resources: Vec::with_capacity(rows.len()),
            by_internal_id: HashMap::with_capacity(rows.len()),
        };
        for row in &rows {
            let internal_id: i64 = row.try_get("internalId")?;
            let public_id: String = row.try_get("publicId")?;
            matches
                .by_internal_id
                .insert(internal_id, matches.resources.len());
            matches
                .resources
                .push(FindResource::new(level, internal_id, public_id));
        }

        if matches.resources.is_empty() {
            return matches.into_response();
        }

        let lookup = (lookup_sql.as_str(), bind_params.as_slice());

        if request.is_retrieve_main_dicom_tags() {
            self.expand_main_dicom_tags(lookup, &mut matches, level, 0)
                .await?;
        }
        if request.is_retrieve_metadata() {
            self.expand_metadata(lookup, &mut matches, level, 0).await?;
        }
        if request.is_retrieve_labels() {
            self.expand_labels(lookup, &mut matches).await?;
        }
        if request.is_retrieve_attachments() {
            self.expand_attachments(lookup, &mut matches).await?;
        }

        for ancestor in ResourceType::ALL.iter().copied().filter(|l| *l < level) {
            let spec = request.parent_specification(ancestor)?;
            let depth = depth_between(ancestor, level);
            if spec.is_retrieve_main_dicom_tags() {
                self.expand_main_dicom_tags(lookup, &mut matches, ancestor, depth)
                    .await?;
            }
            if spec.is_retrieve_metadata() {
                self.expand_metadata(lookup, &mut matches, ancestor, depth)
                    .await?;
            }
        }

        if level != ResourceType::Patient && request.is_retrieve_parent_identifier() {
            let select = format!(
                "SELECT Lookup.internalId AS lookupId, r1.publicId AS parentPublicId FROM Lookup{}",
                ancestor_joins(1)
            );
            for row in self.expand(lookup.0, lookup.1, "", &select).await? {
                let parent: String = row.try_get("parentPublicId")?;
                matches.get_mut(&row)?.set_parent_identifier(parent)?;
            }
        }

        for child in ResourceType::ALL.iter().copied().filter(|l| *l > level) {
            self.expand_children(lookup, &mut matches, request, child)
                .await?;
        }

        if level != ResourceType::Instance
            && (request.is_retrieve_one_instance_identifier()
                || request.is_retrieve_one_instance_metadata_and_attachments())
        {
            self.expand_one_instance(lookup, &mut matches, request)
                .await?;
        }

        matches.into_response()
    }

    pub(super) async fn count(&mut self, request: &FindRequest) -> Result<u64> {
        let registry = Arc::clone(&self.registry);
        let (sql, bind_params) =
            FindQueryBuilder::new(request, &registry).build_count_sql(&self.dialect)?;
        tracing::debug!(level = %request.level(), sql = %sql, "Native count");

        let tx = self.tx_mut()?;
        let count: i64 = bind_all(sqlx::query(&sql), &bind_params)
            .fetch_one(&mut **tx)
            .await
            .map_err(Error::Database)?
            .try_get(0)?;
        Ok(non_negative(count))
    }

    /// Main tags of the match (`depth` 0) or of one of its ancestors.
    async fn expand_main_dicom_tags(
        &mut self,
        lookup: (&str, &[BindValue]),
        matches: &mut Matches,
        level: ResourceType,
        depth: usize,
    ) -> Result<()> {
        let select = format!(
            "SELECT Lookup.internalId AS lookupId, t.tagGroup, t.tagElement, t.value FROM Lookup{}
             INNER JOIN MainDicomTags t ON t.id = r{depth}.internalId",
            ancestor_joins(depth)
        );
        for row in self.expand(lookup.0, lookup.1, "", &select).await? {
            let tag = tag_from_row(&row)?;
            let value: Option<String> = row.try_get("value")?;
            let resource = matches.get_mut(&row)?;
            match value {
                Some(value) => resource.add_string_main_dicom_tag(level, tag, value)?,
                None => resource.add_null_main_dicom_tag(level, tag)?,
            }
        }
        Ok(())
    }

    async fn expand_metadata(
        &mut self,
        lookup: (&str, &[BindValue]),
        matches: &mut Matches,
        level: ResourceType,
        depth: usize,
    ) -> Result<()> {
        let select = format!(
            "SELECT Lookup.internalId AS lookupId, m.type, m.value, m.revision FROM Lookup{}
             INNER JOIN Metadata m ON m.id = r{depth}.internalId",
            ancestor_joins(depth)
        );
        for row in self.expand(lookup.0, lookup.1, "", &select).await? {
            let metadata = MetadataType::from_code(row.try_get("type")?)?;
            let value: Option<String> = row.try_get("value")?;
            let revision: i64 = row.try_get("revision")?;
            matches.get_mut(&row)?.add_metadata(
                level,
                metadata,
                value.unwrap_or_default(),
                revision,
            )?;
        }
        Ok(())
    }

    async fn expand_labels(
        &mut self,
        lookup: (&str, &[BindValue]),
        matches: &mut Matches,
    ) -> Result<()> {
        let select = "SELECT Lookup.internalId AS lookupId, l.label FROM Lookup
                      INNER JOIN Labels l ON l.id = Lookup.internalId";
        for row in self.expand(lookup.0, lookup.1, "", select).await? {
            let label: String = row.try_get("label")?;
            matches.get_mut(&row)?.add_label(label)?;
        }
        Ok(())
    }

    async fn expand_attachments(
        &mut self,
        lookup: (&str, &[BindValue]),
        matches: &mut Matches,
    ) -> Result<()> {
        let select = "SELECT Lookup.internalId AS lookupId, f.* FROM Lookup
                      INNER JOIN AttachedFiles f ON f.id = Lookup.internalId";
        for row in self.expand(lookup.0, lookup.1, "", select).await? {
            let (info, revision) = file_info_from_row(&row)?;
            matches.get_mut(&row)?.add_attachment(info, revision)?;
        }
        Ok(())
    }

    async fn expand_children(
        &mut self,
        lookup: (&str, &[BindValue]),
        matches: &mut Matches,
        request: &FindRequest,
        child: ResourceType,
    ) -> Result<()> {
        let spec = request.children_specification(child)?;
        if !spec.is_of_interest() {
            return Ok(());
        }
        let depth = depth_between(request.level(), child);
        let joins = descendant_joins(depth);

        if spec.is_retrieve_count() {
            for resource in &mut matches.resources {
                resource.set_children_count(child, 0)?;
            }
        }

        if spec.is_retrieve_identifiers() {
            let select = format!(
                "SELECT Lookup.internalId AS lookupId, c{depth}.publicId AS childPublicId
                 FROM Lookup{joins} ORDER BY c{depth}.internalId"
            );
            let mut counts: HashMap<i64, u64> = HashMap::new();
            for row in self.expand(lookup.0, lookup.1, "", &select).await? {
                let id: String = row.try_get("childPublicId")?;
                let resource = matches.get_mut(&row)?;
                *counts.entry(resource.internal_id()).or_default() += 1;
                resource.add_child_identifier(child, id)?;
            }
            if spec.is_retrieve_count() {
                for resource in &mut matches.resources {
                    let count = counts.get(&resource.internal_id()).copied().unwrap_or(0);
                    resource.set_children_count(child, count)?;
                }
            }
        } else if spec.is_retrieve_count() {
            let select = format!(
                "SELECT Lookup.internalId AS lookupId, COUNT(*) AS childrenCount
                 FROM Lookup{joins} GROUP BY Lookup.internalId"
            );
            for row in self.expand(lookup.0, lookup.1, "", &select).await? {
                let count: i64 = row.try_get("childrenCount")?;
                matches
                    .get_mut(&row)?
                    .set_children_count(child, non_negative(count))?;
            }
        }

        if !spec.metadata().is_empty() {
            for resource in &mut matches.resources {
                for metadata in spec.metadata() {
                    resource.touch_children_metadata(child, *metadata)?;
                }
            }
            let codes: Vec<String> = spec
                .metadata()
                .iter()
                .map(|m| m.code().to_string())
                .collect();
            let select = format!(
                "SELECT Lookup.internalId AS lookupId, m.type, m.value FROM Lookup{joins}
                 INNER JOIN Metadata m ON m.id = c{depth}.internalId
                 WHERE m.type IN ({}) ORDER BY c{depth}.internalId",
                codes.join(", ")
            );
            for row in self.expand(lookup.0, lookup.1, "", &select).await? {
                let metadata = MetadataType::from_code(row.try_get("type")?)?;
                let value: Option<String> = row.try_get("value")?;
                matches.get_mut(&row)?.add_children_metadata_value(
                    child,
                    metadata,
                    value.unwrap_or_default(),
                )?;
            }
        }

        if !spec.main_dicom_tags().is_empty() {
            for resource in &mut matches.resources {
                for tag in spec.main_dicom_tags() {
                    resource.touch_children_main_dicom_tag(child, *tag)?;
                }
            }
            let filter: Vec<String> = spec
                .main_dicom_tags()
                .iter()
                .map(|tag| {
                    format!(
                        "(t.tagGroup = {} AND t.tagElement = {})",
                        tag.group(),
                        tag.element()
                    )
                })
                .collect();
            let select = format!(
                "SELECT Lookup.internalId AS lookupId, t.tagGroup, t.tagElement, t.value FROM Lookup{joins}
                 INNER JOIN MainDicomTags t ON t.id = c{depth}.internalId
                 WHERE t.value IS NOT NULL AND ({})",
                filter.join(" OR ")
            );
            for row in self.expand(lookup.0, lookup.1, "", &select).await? {
                let tag = tag_from_row(&row)?;
                let value: String = row.try_get("value")?;
                matches
                    .get_mut(&row)?
                    .add_children_main_dicom_tag_value(child, tag, value)?;
            }
        }

        Ok(())
    }

    /// The instance with the smallest internal id below each match.
    async fn expand_one_instance(
        &mut self,
        lookup: (&str, &[BindValue]),
        matches: &mut Matches,
        request: &FindRequest,
    ) -> Result<()> {
        let depth = depth_between(request.level(), ResourceType::Instance);
        let one_instance = format!(
            ", OneInstance AS (SELECT Lookup.internalId AS parentInternalId, MIN(c{depth}.internalId) AS instanceInternalId
                 FROM Lookup{} GROUP BY Lookup.internalId)",
            descendant_joins(depth)
        );

        let select = "SELECT OneInstance.parentInternalId AS lookupId, r.publicId AS instancePublicId
                      FROM OneInstance INNER JOIN Resources r ON r.internalId = OneInstance.instanceInternalId";
        for row in self
            .expand(lookup.0, lookup.1, &one_instance, select)
            .await?
        {
            let id: String = row.try_get("instancePublicId")?;
            matches.get_mut(&row)?.set_one_instance_identifier(id)?;
        }

        if !request.is_retrieve_one_instance_metadata_and_attachments() {
            return Ok(());
        }

        let select = "SELECT OneInstance.parentInternalId AS lookupId, m.type, m.value
                      FROM OneInstance INNER JOIN Metadata m ON m.id = OneInstance.instanceInternalId";
        for row in self
            .expand(lookup.0, lookup.1, &one_instance, select)
            .await?
        {
            let metadata = MetadataType::from_code(row.try_get("type")?)?;
            let value: Option<String> = row.try_get("value")?;
            matches
                .get_mut(&row)?
                .add_one_instance_metadata(metadata, value.unwrap_or_default())?;
        }

        let select = "SELECT OneInstance.parentInternalId AS lookupId, f.*
                      FROM OneInstance INNER JOIN AttachedFiles f ON f.id = OneInstance.instanceInternalId";
        for row in self
            .expand(lookup.0, lookup.1, &one_instance, select)
            .await?
        {
            let (info, _) = file_info_from_row(&row)?;
            matches.get_mut(&row)?.add_one_instance_attachment(info)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestor_chain_aliases() {
        assert_eq!(
            ancestor_joins(0),
            " INNER JOIN Resources r0 ON r0.internalId = Lookup.internalId"
        );
        assert!(ancestor_joins(2).ends_with("INNER JOIN Resources r2 ON r2.internalId = r1.parentId"));
    }

    #[test]
    fn descendant_chain_aliases() {
        assert_eq!(
            descendant_joins(1),
            " INNER JOIN Resources c1 ON c1.parentId = Lookup.internalId"
        );
        assert!(descendant_joins(3).ends_with("INNER JOIN Resources c3 ON c3.parentId = c2.internalId"));
        assert_eq!(depth_between(ResourceType::Patient, ResourceType::Instance), 3);
    }
}
