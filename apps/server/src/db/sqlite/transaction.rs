//! SQLite implementation of the transaction contract

use async_trait::async_trait;
use dicom_core::Tag;
use sqlx::{Row, Sqlite};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::rows::{bind_all, file_info_from_row, non_negative, resource_type_from_row, tag_from_row};
use crate::db::search::{ApplyLookupBuilder, DatabaseDicomTagConstraints, SqliteDialect};
use crate::db::traits::{ResourceRow, Transaction};
use crate::find::{FindRequest, FindResponse};
use crate::models::{
    ChangeType, ChangesPage, DeletedResources, DicomMap, FileContentType, FileInfo,
    GlobalProperty, LabelsConstraint, MetadataType, QueueOrigin, ResourceType, ServerChange,
    Statistics, TransactionType,
};
use crate::registry::MainDicomTagsRegistry;
use crate::{Error, Result};

pub struct SqliteTransaction {
    tx: Option<sqlx::Transaction<'static, Sqlite>>,
    kind: TransactionType,
    pub(super) registry: Arc<MainDicomTagsRegistry>,
    pub(super) dialect: SqliteDialect,
    find_enabled: bool,
}

impl SqliteTransaction {
    pub(super) fn new(
        tx: sqlx::Transaction<'static, Sqlite>,
        kind: TransactionType,
        registry: Arc<MainDicomTagsRegistry>,
        dialect: SqliteDialect,
        find_enabled: bool,
    ) -> Self {
        Self {
            tx: Some(tx),
            kind,
            registry,
            dialect,
            find_enabled,
        }
    }

    pub(crate) fn tx_mut(&mut self) -> Result<&mut sqlx::Transaction<'static, Sqlite>> {
        self.tx.as_mut().ok_or_else(|| {
            Error::Internal("Transaction already committed or rolled back".to_string())
        })
    }

    fn take_tx(&mut self) -> Result<sqlx::Transaction<'static, Sqlite>> {
        self.tx.take().ok_or_else(|| {
            Error::Internal("Transaction already committed or rolled back".to_string())
        })
    }

    fn check_find_enabled(&self) -> Result<()> {
        if self.find_enabled {
            Ok(())
        } else {
            Err(Error::NotImplemented(
                "Native find is disabled for this database".to_string(),
            ))
        }
    }

    async fn lookup_identity(&mut self, id: i64) -> Result<Option<(ResourceType, String)>> {
        let tx = self.tx_mut()?;
        let row = sqlx::query("SELECT resourceType, publicId FROM Resources WHERE internalId = $1")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(Error::Database)?;

        match row {
            Some(row) => Ok(Some((
                resource_type_from_row(&row, "resourceType")?,
                row.try_get("publicId")?,
            ))),
            None => Ok(None),
        }
    }

    async fn attachments_of_subtree(&mut self, id: i64) -> Result<Vec<FileInfo>> {
        let tx = self.tx_mut()?;
        let rows = sqlx::query(
            "WITH RECURSIVE Subtree(internalId) AS (
                 SELECT $1
                 UNION ALL
                 SELECT r.internalId FROM Resources r
                 INNER JOIN Subtree s ON r.parentId = s.internalId
             )
             SELECT f.* FROM AttachedFiles f
             INNER JOIN Subtree s ON f.id = s.internalId",
        )
        .bind(id)
        .fetch_all(&mut **tx)
        .await
        .map_err(Error::Database)?;

        rows.iter()
            .map(|row| file_info_from_row(row).map(|(info, _)| info))
            .collect()
    }

    async fn subtree(&mut self, id: i64) -> Result<Vec<(ResourceType, String)>> {
        let tx = self.tx_mut()?;
        let rows = sqlx::query(
            "WITH RECURSIVE Subtree(internalId) AS (
                 SELECT $1
                 UNION ALL
                 SELECT r.internalId FROM Resources r
                 INNER JOIN Subtree s ON r.parentId = s.internalId
             )
             SELECT r.resourceType, r.publicId FROM Resources r
             INNER JOIN Subtree s ON r.internalId = s.internalId
             ORDER BY r.resourceType, r.internalId",
        )
        .bind(id)
        .fetch_all(&mut **tx)
        .await
        .map_err(Error::Database)?;

        rows.iter()
            .map(|row| {
                Ok((
                    resource_type_from_row(row, "resourceType")?,
                    row.try_get("publicId")?,
                ))
            })
            .collect()
    }

    async fn delete_row(&mut self, id: i64) -> Result<()> {
        let tx = self.tx_mut()?;
        sqlx::query("DELETE FROM Resources WHERE internalId = $1")
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn children_count(&mut self, id: i64) -> Result<i64> {
        let tx = self.tx_mut()?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM Resources WHERE parentId = $1")
            .bind(id)
            .fetch_one(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(count)
    }

    async fn insert_tag(&mut self, table: &str, id: i64, tag: Tag, value: &str) -> Result<()> {
        let tx = self.tx_mut()?;
        let sql = format!(
            "INSERT OR REPLACE INTO {table} (id, tagGroup, tagElement, value) VALUES ($1, $2, $3, $4)"
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(i64::from(tag.group()))
            .bind(i64::from(tag.element()))
            .bind(value)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn sum_sizes(&mut self, column: &str) -> Result<u64> {
        let tx = self.tx_mut()?;
        let sql = format!("SELECT COALESCE(SUM({column}), 0) FROM AttachedFiles");
        let total: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(non_negative(total))
    }

    async fn read_changes(
        &mut self,
        sql: &str,
        bind_params: &[i64],
        limit: u32,
        keep_first: bool,
    ) -> Result<ChangesPage> {
        let tx = self.tx_mut()?;
        let mut query = sqlx::query(sql);
        for param in bind_params {
            query = query.bind(*param);
        }
        let rows = query
            .bind(i64::from(limit) + 1)
            .fetch_all(&mut **tx)
            .await
            .map_err(Error::Database)?;

        let mut changes = rows
            .iter()
            .map(change_from_row)
            .collect::<Result<Vec<_>>>()?;

        // One extra row is fetched to know whether more changes follow.
        let done = changes.len() <= limit as usize;
        if !done {
            if keep_first {
                changes.pop();
            } else {
                changes.remove(0);
            }
        }
        Ok(ChangesPage { changes, done })
    }
}

fn change_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ServerChange> {
    Ok(ServerChange {
        seq: row.try_get("seq")?,
        change_type: ChangeType::from_code(row.try_get("changeType")?)?,
        resource_type: resource_type_from_row(row, "resourceType")?,
        public_id: row.try_get("publicId")?,
        date: row.try_get("date")?,
    })
}

fn limit_or_unbounded(limit: u64) -> i64 {
    if limit == 0 {
        -1
    } else {
        i64::try_from(limit).unwrap_or(i64::MAX)
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn commit(mut self: Box<Self>, file_size_delta: i64) -> Result<()> {
        if self.kind == TransactionType::ReadOnly && file_size_delta != 0 {
            return Err(Error::Internal(
                "A read-only transaction cannot change the size of the storage area".to_string(),
            ));
        }
        let tx = self.take_tx()?;
        tx.commit().await.map_err(Error::Database)?;
        tracing::trace!(file_size_delta, "Committed transaction");
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        let tx = self.take_tx()?;
        tx.rollback().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn create_resource(&mut self, public_id: &str, level: ResourceType) -> Result<i64> {
        let tx = self.tx_mut()?;
        let id = sqlx::query(
            "INSERT INTO Resources (internalId, resourceType, publicId, parentId)
             VALUES (NULL, $1, $2, NULL)",
        )
        .bind(level.code())
        .bind(public_id)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?
        .last_insert_rowid();

        if level == ResourceType::Patient {
            sqlx::query("INSERT INTO PatientRecyclingOrder (seq, patientId) VALUES (NULL, $1)")
                .bind(id)
                .execute(&mut **tx)
                .await
                .map_err(Error::Database)?;
        }

        Ok(id)
    }

    async fn attach_child(&mut self, parent: i64, child: i64) -> Result<()> {
        let tx = self.tx_mut()?;
        sqlx::query("UPDATE Resources SET parentId = $1 WHERE internalId = $2")
            .bind(parent)
            .bind(child)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn set_main_dicom_tag(&mut self, id: i64, tag: Tag, value: &str) -> Result<()> {
        self.insert_tag("MainDicomTags", id, tag, value).await
    }

    async fn set_identifier_tag(&mut self, id: i64, tag: Tag, value: &str) -> Result<()> {
        self.insert_tag("DicomIdentifiers", id, tag, value).await
    }

    async fn clear_main_dicom_tags(&mut self, id: i64) -> Result<()> {
        let tx = self.tx_mut()?;
        for sql in [
            "DELETE FROM DicomIdentifiers WHERE id = $1",
            "DELETE FROM MainDicomTags WHERE id = $1",
        ] {
            sqlx::query(sql)
                .bind(id)
                .execute(&mut **tx)
                .await
                .map_err(Error::Database)?;
        }
        Ok(())
    }

    async fn lookup_resource(&mut self, public_id: &str) -> Result<Option<(i64, ResourceType)>> {
        let tx = self.tx_mut()?;
        let row = sqlx::query("SELECT internalId, resourceType FROM Resources WHERE publicId = $1")
            .bind(public_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(Error::Database)?;

        match row {
            Some(row) => Ok(Some((
                row.try_get("internalId")?,
                resource_type_from_row(&row, "resourceType")?,
            ))),
            None => Ok(None),
        }
    }

    async fn lookup_resource_and_parent(
        &mut self,
        public_id: &str,
    ) -> Result<Option<ResourceRow>> {
        let tx = self.tx_mut()?;
        let row = sqlx::query(
            "SELECT r.internalId, r.resourceType, p.publicId AS parentPublicId
             FROM Resources r
             LEFT JOIN Resources p ON r.parentId = p.internalId
             WHERE r.publicId = $1",
        )
        .bind(public_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(Error::Database)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let level = resource_type_from_row(&row, "resourceType")?;
        let parent_public_id: Option<String> = row.try_get("parentPublicId")?;
        if (level == ResourceType::Patient) != parent_public_id.is_none() {
            return Err(Error::DatabasePlugin(format!(
                "Inconsistent parent for {level} {public_id}"
            )));
        }

        Ok(Some(ResourceRow {
            internal_id: row.try_get("internalId")?,
            level,
            parent_public_id,
        }))
    }

    async fn lookup_parent(&mut self, id: i64) -> Result<Option<i64>> {
        let tx = self.tx_mut()?;
        let parent: Option<Option<i64>> =
            sqlx::query_scalar("SELECT parentId FROM Resources WHERE internalId = $1")
                .bind(id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(Error::Database)?;

        match parent {
            Some(parent) => Ok(parent),
            None => Err(Error::UnknownResource(id.to_string())),
        }
    }

    async fn get_public_id(&mut self, id: i64) -> Result<String> {
        self.lookup_identity(id)
            .await?
            .map(|(_, public_id)| public_id)
            .ok_or_else(|| Error::UnknownResource(id.to_string()))
    }

    async fn get_resource_type(&mut self, id: i64) -> Result<ResourceType> {
        self.lookup_identity(id)
            .await?
            .map(|(level, _)| level)
            .ok_or_else(|| Error::UnknownResource(id.to_string()))
    }

    async fn get_all_public_ids(&mut self, level: ResourceType) -> Result<Vec<String>> {
        let tx = self.tx_mut()?;
        let ids = sqlx::query_scalar(
            "SELECT publicId FROM Resources WHERE resourceType = $1 ORDER BY internalId",
        )
        .bind(level.code())
        .fetch_all(&mut **tx)
        .await
        .map_err(Error::Database)?;
        Ok(ids)
    }

    async fn get_all_public_ids_with_limits(
        &mut self,
        level: ResourceType,
        since: u64,
        limit: u64,
    ) -> Result<Vec<String>> {
        let tx = self.tx_mut()?;
        let ids = sqlx::query_scalar(
            "SELECT publicId FROM Resources WHERE resourceType = $1
             ORDER BY internalId LIMIT $2 OFFSET $3",
        )
        .bind(level.code())
        .bind(limit_or_unbounded(limit))
        .bind(i64::try_from(since).unwrap_or(i64::MAX))
        .fetch_all(&mut **tx)
        .await
        .map_err(Error::Database)?;
        Ok(ids)
    }

    async fn get_all_internal_ids(&mut self, level: ResourceType) -> Result<Vec<i64>> {
        let tx = self.tx_mut()?;
        let ids = sqlx::query_scalar(
            "SELECT internalId FROM Resources WHERE resourceType = $1 ORDER BY internalId",
        )
        .bind(level.code())
        .fetch_all(&mut **tx)
        .await
        .map_err(Error::Database)?;
        Ok(ids)
    }

    async fn get_children_public_id(&mut self, id: i64) -> Result<Vec<String>> {
        let tx = self.tx_mut()?;
        let ids = sqlx::query_scalar(
            "SELECT publicId FROM Resources WHERE parentId = $1 ORDER BY internalId",
        )
        .bind(id)
        .fetch_all(&mut **tx)
        .await
        .map_err(Error::Database)?;
        Ok(ids)
    }

    async fn get_children_internal_id(&mut self, id: i64) -> Result<Vec<i64>> {
        let tx = self.tx_mut()?;
        let ids = sqlx::query_scalar(
            "SELECT internalId FROM Resources WHERE parentId = $1 ORDER BY internalId",
        )
        .bind(id)
        .fetch_all(&mut **tx)
        .await
        .map_err(Error::Database)?;
        Ok(ids)
    }

    async fn get_children_metadata(
        &mut self,
        id: i64,
        metadata: MetadataType,
    ) -> Result<Vec<String>> {
        let tx = self.tx_mut()?;
        let values: Vec<Option<String>> = sqlx::query_scalar(
            "SELECT m.value FROM Metadata m
             INNER JOIN Resources r ON m.id = r.internalId
             WHERE r.parentId = $1 AND m.type = $2
             ORDER BY r.internalId",
        )
        .bind(id)
        .bind(metadata.code())
        .fetch_all(&mut **tx)
        .await
        .map_err(Error::Database)?;
        Ok(values.into_iter().map(Option::unwrap_or_default).collect())
    }

    async fn get_main_dicom_tags(&mut self, id: i64) -> Result<DicomMap> {
        let tx = self.tx_mut()?;
        let rows = sqlx::query("SELECT tagGroup, tagElement, value FROM MainDicomTags WHERE id = $1")
            .bind(id)
            .fetch_all(&mut **tx)
            .await
            .map_err(Error::Database)?;

        let mut tags = DicomMap::new();
        for row in &rows {
            let tag = tag_from_row(row)?;
            match row.try_get::<Option<String>, _>("value")? {
                Some(value) => tags.set_value(tag, value),
                None => tags.set_null(tag),
            }
        }
        Ok(tags)
    }

    async fn get_resources_count(&mut self, level: ResourceType) -> Result<u64> {
        let tx = self.tx_mut()?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM Resources WHERE resourceType = $1")
            .bind(level.code())
            .fetch_one(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(non_negative(count))
    }

    async fn delete_resource(&mut self, id: i64) -> Result<DeletedResources> {
        if self.lookup_identity(id).await?.is_none() {
            return Err(Error::UnknownResource(id.to_string()));
        }

        let mut deleted = DeletedResources {
            attachments: self.attachments_of_subtree(id).await?,
            resources: self.subtree(id).await?,
            remaining_ancestor: None,
        };

        let mut parent = self.lookup_parent(id).await?;
        self.delete_row(id).await?;

        // Ancestors left without children go too; the first survivor is
        // reported.
        while let Some(ancestor) = parent {
            let (level, public_id) = self
                .lookup_identity(ancestor)
                .await?
                .ok_or_else(|| Error::DatabasePlugin(format!("Dangling parent {ancestor}")))?;

            if self.children_count(ancestor).await? > 0 {
                deleted.remaining_ancestor = Some((level, public_id));
                break;
            }

            deleted
                .attachments
                .extend(self.attachments_of_subtree(ancestor).await?);
            deleted.resources.push((level, public_id));
            parent = self.lookup_parent(ancestor).await?;
            self.delete_row(ancestor).await?;
        }

        tracing::debug!(
            resources = deleted.resources.len(),
            attachments = deleted.attachments.len(),
            "Deleted resources"
        );
        Ok(deleted)
    }

    async fn set_metadata(
        &mut self,
        id: i64,
        metadata: MetadataType,
        value: &str,
        revision: i64,
    ) -> Result<()> {
        let tx = self.tx_mut()?;
        sqlx::query(
            "INSERT OR REPLACE INTO Metadata (id, type, value, revision) VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(metadata.code())
        .bind(value)
        .bind(revision)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn delete_metadata(&mut self, id: i64, metadata: MetadataType) -> Result<()> {
        let tx = self.tx_mut()?;
        sqlx::query("DELETE FROM Metadata WHERE id = $1 AND type = $2")
            .bind(id)
            .bind(metadata.code())
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn lookup_metadata(
        &mut self,
        id: i64,
        metadata: MetadataType,
    ) -> Result<Option<(String, i64)>> {
        let tx = self.tx_mut()?;
        let row = sqlx::query("SELECT value, revision FROM Metadata WHERE id = $1 AND type = $2")
            .bind(id)
            .bind(metadata.code())
            .fetch_optional(&mut **tx)
            .await
            .map_err(Error::Database)?;

        match row {
            Some(row) => Ok(Some((
                row.try_get::<Option<String>, _>("value")?.unwrap_or_default(),
                row.try_get("revision")?,
            ))),
            None => Ok(None),
        }
    }

    async fn get_all_metadata(&mut self, id: i64) -> Result<BTreeMap<MetadataType, String>> {
        let tx = self.tx_mut()?;
        let rows = sqlx::query("SELECT type, value FROM Metadata WHERE id = $1")
            .bind(id)
            .fetch_all(&mut **tx)
            .await
            .map_err(Error::Database)?;

        let mut metadata = BTreeMap::new();
        for row in &rows {
            let key = MetadataType::from_code(row.try_get("type")?)?;
            let value: Option<String> = row.try_get("value")?;
            metadata.insert(key, value.unwrap_or_default());
        }
        Ok(metadata)
    }

    async fn add_attachment(
        &mut self,
        id: i64,
        attachment: &FileInfo,
        revision: i64,
    ) -> Result<()> {
        let tx = self.tx_mut()?;
        sqlx::query(
            "INSERT INTO AttachedFiles (id, fileType, uuid, compressedSize, uncompressedSize,
                                        compressionType, uncompressedMD5, compressedMD5,
                                        revision, customData)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(id)
        .bind(attachment.content_type.code())
        .bind(&attachment.uuid)
        .bind(i64::try_from(attachment.compressed_size).unwrap_or(i64::MAX))
        .bind(i64::try_from(attachment.uncompressed_size).unwrap_or(i64::MAX))
        .bind(attachment.compression.code())
        .bind(&attachment.uncompressed_hash)
        .bind(&attachment.compressed_hash)
        .bind(revision)
        .bind(attachment.custom_data.as_deref())
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn delete_attachment(&mut self, id: i64, content_type: FileContentType) -> Result<()> {
        let tx = self.tx_mut()?;
        sqlx::query("DELETE FROM AttachedFiles WHERE id = $1 AND fileType = $2")
            .bind(id)
            .bind(content_type.code())
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn list_available_attachments(&mut self, id: i64) -> Result<BTreeSet<FileContentType>> {
        let tx = self.tx_mut()?;
        let codes: Vec<i64> = sqlx::query_scalar("SELECT fileType FROM AttachedFiles WHERE id = $1")
            .bind(id)
            .fetch_all(&mut **tx)
            .await
            .map_err(Error::Database)?;
        codes.into_iter().map(FileContentType::from_code).collect()
    }

    async fn lookup_attachment(
        &mut self,
        id: i64,
        content_type: FileContentType,
    ) -> Result<Option<(FileInfo, i64)>> {
        let tx = self.tx_mut()?;
        let row = sqlx::query("SELECT * FROM AttachedFiles WHERE id = $1 AND fileType = $2")
            .bind(id)
            .bind(content_type.code())
            .fetch_optional(&mut **tx)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(file_info_from_row).transpose()
    }

    async fn set_attachment_custom_data(&mut self, uuid: &str, data: &str) -> Result<()> {
        let tx = self.tx_mut()?;
        let updated = sqlx::query("UPDATE AttachedFiles SET customData = $1 WHERE uuid = $2")
            .bind(data)
            .bind(uuid)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?
            .rows_affected();
        if updated == 0 {
            return Err(Error::InexistentFile(uuid.to_string()));
        }
        Ok(())
    }

    async fn add_label(&mut self, id: i64, label: &str) -> Result<()> {
        if label.is_empty() {
            return Err(Error::ParameterOutOfRange("Empty label".to_string()));
        }
        let tx = self.tx_mut()?;
        sqlx::query("INSERT OR IGNORE INTO Labels (id, label) VALUES ($1, $2)")
            .bind(id)
            .bind(label)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn remove_label(&mut self, id: i64, label: &str) -> Result<()> {
        let tx = self.tx_mut()?;
        sqlx::query("DELETE FROM Labels WHERE id = $1 AND label = $2")
            .bind(id)
            .bind(label)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn list_labels(&mut self, id: i64) -> Result<BTreeSet<String>> {
        let tx = self.tx_mut()?;
        let labels: Vec<String> = sqlx::query_scalar("SELECT label FROM Labels WHERE id = $1")
            .bind(id)
            .fetch_all(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(labels.into_iter().collect())
    }

    async fn list_all_labels(&mut self) -> Result<BTreeSet<String>> {
        let tx = self.tx_mut()?;
        let labels: Vec<String> = sqlx::query_scalar("SELECT DISTINCT label FROM Labels")
            .fetch_all(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(labels.into_iter().collect())
    }

    async fn lookup_global_property(
        &mut self,
        property: GlobalProperty,
    ) -> Result<Option<String>> {
        let tx = self.tx_mut()?;
        let value: Option<Option<String>> =
            sqlx::query_scalar("SELECT value FROM GlobalProperties WHERE property = $1")
                .bind(property.code())
                .fetch_optional(&mut **tx)
                .await
                .map_err(Error::Database)?;
        Ok(value.flatten())
    }

    async fn set_global_property(&mut self, property: GlobalProperty, value: &str) -> Result<()> {
        let tx = self.tx_mut()?;
        sqlx::query("INSERT OR REPLACE INTO GlobalProperties (property, value) VALUES ($1, $2)")
            .bind(property.code())
            .bind(value)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn increment_global_property(
        &mut self,
        property: GlobalProperty,
        increment: i64,
    ) -> Result<i64> {
        let tx = self.tx_mut()?;
        let value: i64 = sqlx::query_scalar(
            "INSERT INTO GlobalProperties (property, value) VALUES ($1, CAST($2 AS TEXT))
             ON CONFLICT(property) DO UPDATE
                 SET value = CAST(CAST(value AS INTEGER) + $2 AS TEXT)
             RETURNING CAST(value AS INTEGER)",
        )
        .bind(property.code())
        .bind(increment)
        .fetch_one(&mut **tx)
        .await
        .map_err(Error::Database)?;
        Ok(value)
    }

    async fn log_change(
        &mut self,
        change_type: ChangeType,
        level: ResourceType,
        id: i64,
        public_id: &str,
        date: &str,
    ) -> Result<i64> {
        let tx = self.tx_mut()?;
        let seq = sqlx::query(
            "INSERT INTO Changes (seq, changeType, internalId, resourceType, publicId, date)
             VALUES (NULL, $1, $2, $3, $4, $5)",
        )
        .bind(change_type.code())
        .bind(id)
        .bind(level.code())
        .bind(public_id)
        .bind(date)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?
        .last_insert_rowid();
        Ok(seq)
    }

    async fn get_changes(&mut self, since: i64, limit: u32) -> Result<ChangesPage> {
        self.get_changes_extended(since, None, &BTreeSet::new(), limit)
            .await
    }

    async fn get_changes_extended(
        &mut self,
        since: i64,
        to: Option<i64>,
        types: &BTreeSet<ChangeType>,
        limit: u32,
    ) -> Result<ChangesPage> {
        let mut filters = Vec::new();
        let mut bind_params = Vec::new();

        if since > 0 {
            bind_params.push(since);
            filters.push(format!("seq > ${}", bind_params.len()));
        }
        if let Some(to) = to {
            bind_params.push(to);
            filters.push(format!("seq <= ${}", bind_params.len()));
        }
        if !types.is_empty() {
            let codes: Vec<String> = types.iter().map(|t| t.code().to_string()).collect();
            filters.push(format!("changeType IN ({})", codes.join(", ")));
        }

        let where_clause = if filters.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", filters.join(" AND "))
        };
        let limit_param = bind_params.len() + 1;

        // Only an upper bound: keep the newest changes, still in ascending order.
        let (sql, keep_first) = if to.is_some() && since <= 0 {
            (
                format!(
                    "SELECT * FROM (SELECT * FROM Changes{where_clause} ORDER BY seq DESC LIMIT ${limit_param}) ORDER BY seq ASC"
                ),
                false,
            )
        } else {
            (
                format!("SELECT * FROM Changes{where_clause} ORDER BY seq ASC LIMIT ${limit_param}"),
                true,
            )
        };

        self.read_changes(&sql, &bind_params, limit, keep_first).await
    }

    async fn get_last_change(&mut self) -> Result<Option<ServerChange>> {
        let tx = self.tx_mut()?;
        let row = sqlx::query("SELECT * FROM Changes ORDER BY seq DESC LIMIT 1")
            .fetch_optional(&mut **tx)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(change_from_row).transpose()
    }

    async fn get_last_change_index(&mut self) -> Result<i64> {
        let tx = self.tx_mut()?;
        let seq: Option<i64> =
            sqlx::query_scalar("SELECT seq FROM sqlite_sequence WHERE name = 'Changes'")
                .fetch_optional(&mut **tx)
                .await
                .map_err(Error::Database)?;
        Ok(seq.unwrap_or(0))
    }

    async fn clear_changes(&mut self) -> Result<()> {
        let tx = self.tx_mut()?;
        sqlx::query("DELETE FROM Changes")
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn store_key_value(&mut self, store: &str, key: &str, value: &[u8]) -> Result<()> {
        let tx = self.tx_mut()?;
        sqlx::query("INSERT OR REPLACE INTO KeyValueStores (storeId, key, value) VALUES ($1, $2, $3)")
            .bind(store)
            .bind(key)
            .bind(value)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn get_key_value(&mut self, store: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let tx = self.tx_mut()?;
        let value = sqlx::query_scalar("SELECT value FROM KeyValueStores WHERE storeId = $1 AND key = $2")
            .bind(store)
            .bind(key)
            .fetch_optional(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(value)
    }

    async fn delete_key_value(&mut self, store: &str, key: &str) -> Result<()> {
        let tx = self.tx_mut()?;
        sqlx::query("DELETE FROM KeyValueStores WHERE storeId = $1 AND key = $2")
            .bind(store)
            .bind(key)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn list_keys(
        &mut self,
        store: &str,
        from: Option<&str>,
        limit: u64,
    ) -> Result<Vec<String>> {
        let tx = self.tx_mut()?;
        let keys = match from {
            Some(from) => {
                sqlx::query_scalar(
                    "SELECT key FROM KeyValueStores WHERE storeId = $1 AND key > $2
                     ORDER BY key ASC LIMIT $3",
                )
                .bind(store)
                .bind(from)
                .bind(limit_or_unbounded(limit))
                .fetch_all(&mut **tx)
                .await
            }
            None => {
                sqlx::query_scalar(
                    "SELECT key FROM KeyValueStores WHERE storeId = $1 ORDER BY key ASC LIMIT $2",
                )
                .bind(store)
                .bind(limit_or_unbounded(limit))
                .fetch_all(&mut **tx)
                .await
            }
        }
        .map_err(Error::Database)?;
        Ok(keys)
    }

    async fn enqueue_value(&mut self, queue: &str, value: &[u8]) -> Result<()> {
        let tx = self.tx_mut()?;
        sqlx::query("INSERT INTO Queues (queueId, value) VALUES ($1, $2)")
            .bind(queue)
            .bind(value)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn dequeue_value(&mut self, queue: &str, origin: QueueOrigin) -> Result<Option<Vec<u8>>> {
        let tx = self.tx_mut()?;
        let sql = match origin {
            QueueOrigin::Front => {
                "SELECT id, value FROM Queues WHERE queueId = $1 ORDER BY id ASC LIMIT 1"
            }
            QueueOrigin::Back => {
                "SELECT id, value FROM Queues WHERE queueId = $1 ORDER BY id DESC LIMIT 1"
            }
        };
        let row = sqlx::query(sql)
            .bind(queue)
            .fetch_optional(&mut **tx)
            .await
            .map_err(Error::Database)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let row_id: i64 = row.try_get("id")?;
        let value: Vec<u8> = row.try_get("value")?;

        sqlx::query("DELETE FROM Queues WHERE id = $1")
            .bind(row_id)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(Some(value))
    }

    async fn get_queue_size(&mut self, queue: &str) -> Result<u64> {
        let tx = self.tx_mut()?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM Queues WHERE queueId = $1")
            .bind(queue)
            .fetch_one(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(non_negative(count))
    }

    async fn set_protected_patient(&mut self, id: i64, protected: bool) -> Result<()> {
        let tx = self.tx_mut()?;
        sqlx::query("DELETE FROM PatientRecyclingOrder WHERE patientId = $1")
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;

        if !protected {
            // Unprotecting moves the patient to the end of the recycling order.
            sqlx::query("INSERT INTO PatientRecyclingOrder (seq, patientId) VALUES (NULL, $1)")
                .bind(id)
                .execute(&mut **tx)
                .await
                .map_err(Error::Database)?;
        }
        Ok(())
    }

    async fn is_protected_patient(&mut self, id: i64) -> Result<bool> {
        let tx = self.tx_mut()?;
        let row = sqlx::query("SELECT 1 FROM PatientRecyclingOrder WHERE patientId = $1")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(row.is_none())
    }

    async fn select_patient_to_recycle(&mut self, avoid: Option<i64>) -> Result<Option<i64>> {
        let tx = self.tx_mut()?;
        let patient = match avoid {
            Some(avoid) => {
                sqlx::query_scalar(
                    "SELECT patientId FROM PatientRecyclingOrder
                     WHERE patientId != $1 ORDER BY seq ASC LIMIT 1",
                )
                .bind(avoid)
                .fetch_optional(&mut **tx)
                .await
            }
            None => {
                sqlx::query_scalar(
                    "SELECT patientId FROM PatientRecyclingOrder ORDER BY seq ASC LIMIT 1",
                )
                .fetch_optional(&mut **tx)
                .await
            }
        }
        .map_err(Error::Database)?;
        Ok(patient)
    }

    async fn get_total_compressed_size(&mut self) -> Result<u64> {
        self.sum_sizes("compressedSize").await
    }

    async fn get_total_uncompressed_size(&mut self) -> Result<u64> {
        self.sum_sizes("uncompressedSize").await
    }

    async fn update_and_get_statistics(&mut self) -> Result<Statistics> {
        Ok(Statistics {
            patients: self.get_resources_count(ResourceType::Patient).await?,
            studies: self.get_resources_count(ResourceType::Study).await?,
            series: self.get_resources_count(ResourceType::Series).await?,
            instances: self.get_resources_count(ResourceType::Instance).await?,
            compressed_size: self.get_total_compressed_size().await?,
            uncompressed_size: self.get_total_uncompressed_size().await?,
        })
    }

    async fn apply_lookup_resources(
        &mut self,
        constraints: &DatabaseDicomTagConstraints,
        level: ResourceType,
        labels: &BTreeSet<String>,
        labels_constraint: LabelsConstraint,
        limit: u64,
    ) -> Result<Vec<(String, i64)>> {
        let (sql, bind_params) =
            ApplyLookupBuilder::new(constraints, level, labels, labels_constraint, limit)
                .build_sql(&self.dialect)?;
        tracing::trace!(sql = %sql, "Applying lookup");

        let tx = self.tx_mut()?;
        let rows = bind_all(sqlx::query(&sql), &bind_params)
            .fetch_all(&mut **tx)
            .await
            .map_err(Error::Database)?;

        rows.iter()
            .map(|row| Ok((row.try_get("publicId")?, row.try_get("internalId")?)))
            .collect()
    }

    async fn execute_find(&mut self, request: &FindRequest) -> Result<FindResponse> {
        self.check_find_enabled()?;
        self.find(request).await
    }

    async fn execute_count(&mut self, request: &FindRequest) -> Result<u64> {
        self.check_find_enabled()?;
        self.count(request).await
    }
}
