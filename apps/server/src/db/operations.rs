//! Index operations, each run in its own transaction.

use chrono::Utc;
use dicom_dictionary_std::tags;
use serde::Serialize;
use std::sync::Arc;

use crate::db::compat::GenericFind;
use crate::db::traits::{Capabilities, DatabaseWrapper, Transaction};
use crate::find::{FindRequest, FindResponse};
use crate::models::{
    ChangeType, ChangesPage, DeletedResources, DicomMap, DicomValue, FileInfo, MetadataType,
    ResourceType, Statistics, TransactionType,
};
use crate::registry::{normalize_identifier, MainDicomTagsRegistry};
use crate::{Error, Result};

/// Timestamp format of the change log and of the date metadata.
pub const LAST_UPDATE_FORMAT: &str = "%Y%m%dT%H%M%S";

pub fn now_iso() -> String {
    Utc::now().format(LAST_UPDATE_FORMAT).to_string()
}

/// One instance to index, with the public ids of its whole chain.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub patient_id: String,
    pub study_id: String,
    pub series_id: String,
    pub instance_id: String,
    /// Every tag of the instance; the index keeps the main ones.
    pub tags: DicomMap,
    pub attachments: Vec<FileInfo>,
    pub index_in_series: Option<i64>,
    pub expected_number_of_instances: Option<u32>,
}

impl InstanceRecord {
    pub fn new(
        patient_id: impl Into<String>,
        study_id: impl Into<String>,
        series_id: impl Into<String>,
        instance_id: impl Into<String>,
        tags: DicomMap,
    ) -> Self {
        Self {
            patient_id: patient_id.into(),
            study_id: study_id.into(),
            series_id: series_id.into(),
            instance_id: instance_id.into(),
            tags,
            attachments: Vec::new(),
            index_in_series: None,
            expected_number_of_instances: None,
        }
    }

    fn public_id(&self, level: ResourceType) -> &str {
        match level {
            ResourceType::Patient => &self.patient_id,
            ResourceType::Study => &self.study_id,
            ResourceType::Series => &self.series_id,
            ResourceType::Instance => &self.instance_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
/// Outcome of `IndexOperations::store_instance`.
pub enum StoreStatus {
    Success,
    AlreadyStored,
}

/// Index operations that each run in their own transaction.
pub struct IndexOperations {
    database: Arc<dyn DatabaseWrapper>,
    registry: Arc<MainDicomTagsRegistry>,
    capabilities: Capabilities,
}

impl IndexOperations {
    /// `database` must already be open: capabilities are read once here.
    pub fn new(database: Arc<dyn DatabaseWrapper>, registry: Arc<MainDicomTagsRegistry>) -> Self {
        let capabilities = database.capabilities();
        Self {
            database,
            registry,
            capabilities,
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn registry(&self) -> &MainDicomTagsRegistry {
        &self.registry
    }

    async fn read_only(&self) -> Result<Box<dyn Transaction>> {
        self.database
            .start_transaction(TransactionType::ReadOnly)
            .await
    }

    async fn read_write(&self) -> Result<Box<dyn Transaction>> {
        self.database
            .start_transaction(TransactionType::ReadWrite)
            .await
    }

    /// Answers `request` with the backend's native find when it has one.
    /// Otherwise the matching ids come from `GenericFind`, and each one is
    /// expanded in a transaction of its own.
    pub async fn execute_find(&self, request: &FindRequest) -> Result<FindResponse> {
        if self.capabilities.has_find_support {
            let mut tx = self.read_only().await?;
            let response = tx.execute_find(request).await?;
            tx.commit(0).await?;
            return Ok(response);
        }

        let identifiers = match request.is_trivial_find() {
            Some(id) => vec![id.to_string()],
            None => {
                let mut tx = self.read_only().await?;
                let identifiers = GenericFind::new(tx.as_mut())
                    .execute_find(request, &self.capabilities)
                    .await?;
                tx.commit(0).await?;
                identifiers
            }
        };

        tracing::debug!(
            level = %request.level(),
            count = identifiers.len(),
            "Expanding resources through primitive calls"
        );

        let mut response = FindResponse::new(request.level());
        for identifier in &identifiers {
            let mut tx = self.read_only().await?;
            GenericFind::new(tx.as_mut())
                .execute_expand(&mut response, request, identifier)
                .await?;
            tx.commit(0).await?;
        }
        Ok(response)
    }

    /// Number of resources matching `request`.
    pub async fn execute_count(&self, request: &FindRequest) -> Result<u64> {
        let mut tx = self.read_only().await?;
        let count = if self.capabilities.has_find_support {
            tx.execute_count(request).await?
        } else {
            GenericFind::new(tx.as_mut())
                .execute_find(request, &self.capabilities)
                .await?
                .len() as u64
        };
        tx.commit(0).await?;
        Ok(count)
    }

    /// Indexes one instance, creating whatever part of its chain is missing.
    pub async fn store_instance(&self, record: &InstanceRecord) -> Result<StoreStatus> {
        let mut tx = self.read_write().await?;

        if tx.lookup_resource(&record.instance_id).await?.is_some() {
            tx.rollback().await?;
            return Ok(StoreStatus::AlreadyStored);
        }

        let now = now_iso();
        let mut parent: Option<i64> = None;
        let mut ids = [0i64; 4];

        for level in ResourceType::ALL {
            let public_id = record.public_id(level);
            let id = match tx.lookup_resource(public_id).await? {
                Some((id, existing)) if existing == level => id,
                Some((_, existing)) => {
                    return Err(Error::BadRequest(format!(
                        "{public_id} is already indexed as a {existing}"
                    )));
                }
                None => {
                    let id = tx.create_resource(public_id, level).await?;
                    if let Some(parent) = parent {
                        tx.attach_child(parent, id).await?;
                    }
                    self.store_main_dicom_tags(tx.as_mut(), id, level, &record.tags)
                        .await?;
                    tx.log_change(ChangeType::new_resource(level), level, id, public_id, &now)
                        .await?;
                    id
                }
            };
            ids[level.index()] = id;
            parent = Some(id);
        }

        let instance = ids[ResourceType::Instance.index()];
        let mut file_size_delta = 0i64;
        for attachment in &record.attachments {
            tx.add_attachment(instance, attachment, 0).await?;
            file_size_delta += i64::try_from(attachment.compressed_size).unwrap_or(i64::MAX);
        }

        tx.set_metadata(instance, MetadataType::ReceptionDate, &now, 0)
            .await?;
        if let Some(index) = record.index_in_series {
            tx.set_metadata(instance, MetadataType::IndexInSeries, &index.to_string(), 0)
                .await?;
        }
        if let Some(sop_class) = record.tags.lookup_string(tags::SOP_CLASS_UID) {
            tx.set_metadata(instance, MetadataType::SopClassUid, sop_class, 0)
                .await?;
        }
        if let Some(expected) = record.expected_number_of_instances {
            tx.set_metadata(
                ids[ResourceType::Series.index()],
                MetadataType::ExpectedNumberOfInstances,
                &expected.to_string(),
                0,
            )
            .await?;
        }
        for id in ids {
            tx.set_metadata(id, MetadataType::LastUpdate, &now, 0).await?;
        }

        tx.commit(file_size_delta).await?;
        tracing::debug!(instance = %record.instance_id, "Stored instance");
        Ok(StoreStatus::Success)
    }

    /// Studies also receive the patient tags.
    async fn store_main_dicom_tags(
        &self,
        tx: &mut dyn Transaction,
        id: i64,
        level: ResourceType,
        tags: &DicomMap,
    ) -> Result<()> {
        let mut levels = vec![level];
        if level == ResourceType::Study {
            levels.push(ResourceType::Patient);
        }

        for source in levels {
            for tag in self.registry.main_tags(source) {
                if let Some(value) = tags.get(*tag) {
                    tx.set_main_dicom_tag(id, *tag, value.as_str().unwrap_or_default())
                        .await?;
                }
            }
        }

        for tag in self.registry.identifiers(level) {
            if let Some(DicomValue::String(value)) = tags.get(*tag) {
                tx.set_identifier_tag(id, *tag, &normalize_identifier(value))
                    .await?;
            }
        }
        Ok(())
    }

    /// Deletes a resource, logging one `Deleted` change per removed resource.
    pub async fn delete_resource(&self, public_id: &str) -> Result<DeletedResources> {
        let mut tx = self.read_write().await?;
        let (id, _) = tx
            .lookup_resource(public_id)
            .await?
            .ok_or_else(|| Error::UnknownResource(public_id.to_string()))?;

        let deleted = tx.delete_resource(id).await?;

        // Deleted rows keep the internal id of the resource whose deletion
        // triggered them.
        let now = now_iso();
        for (level, deleted_id) in &deleted.resources {
            tx.log_change(ChangeType::Deleted, *level, id, deleted_id, &now)
                .await?;
        }

        let freed: u64 = deleted.attachments.iter().map(|a| a.compressed_size).sum();
        tx.commit(-i64::try_from(freed).unwrap_or(i64::MAX)).await?;

        tracing::info!(
            resource = %public_id,
            removed = deleted.resources.len(),
            "Deleted resource"
        );
        Ok(deleted)
    }

    async fn require_resource(tx: &mut dyn Transaction, public_id: &str) -> Result<i64> {
        tx.lookup_resource(public_id)
            .await?
            .map(|(id, _)| id)
            .ok_or_else(|| Error::UnknownResource(public_id.to_string()))
    }

    fn check_labels_support(&self) -> Result<()> {
        if self.capabilities.has_labels_support {
            Ok(())
        } else {
            Err(Error::NotImplemented(
                "The database backend doesn't support labels".to_string(),
            ))
        }
    }

    pub async fn add_label(&self, public_id: &str, label: &str) -> Result<()> {
        self.check_labels_support()?;
        let mut tx = self.read_write().await?;
        let id = Self::require_resource(tx.as_mut(), public_id).await?;
        tx.add_label(id, label).await?;
        tx.commit(0).await
    }

    pub async fn remove_label(&self, public_id: &str, label: &str) -> Result<()> {
        self.check_labels_support()?;
        let mut tx = self.read_write().await?;
        let id = Self::require_resource(tx.as_mut(), public_id).await?;
        tx.remove_label(id, label).await?;
        tx.commit(0).await
    }

    /// Writes `metadata` and returns its new revision.
    pub async fn set_metadata(
        &self,
        public_id: &str,
        metadata: MetadataType,
        value: &str,
    ) -> Result<i64> {
        let mut tx = self.read_write().await?;
        let (id, level) = tx
            .lookup_resource(public_id)
            .await?
            .ok_or_else(|| Error::UnknownResource(public_id.to_string()))?;

        let revision = if self.capabilities.has_revisions_support {
            tx.lookup_metadata(id, metadata)
                .await?
                .map(|(_, revision)| revision + 1)
                .unwrap_or(0)
        } else {
            0
        };

        tx.set_metadata(id, metadata, value, revision).await?;
        tx.log_change(ChangeType::UpdatedMetadata, level, id, public_id, &now_iso())
            .await?;
        tx.commit(0).await?;
        Ok(revision)
    }

    /// Changes with a sequence number above `since`, at most `limit` of them.
    pub async fn get_changes(&self, since: i64, limit: u32) -> Result<ChangesPage> {
        let mut tx = self.read_only().await?;
        let page = tx.get_changes(since, limit).await?;
        tx.commit(0).await?;
        Ok(page)
    }

    pub async fn get_statistics(&self) -> Result<Statistics> {
        let mut tx = self.read_only().await?;
        let statistics = tx.update_and_get_statistics().await?;
        tx.commit(0).await?;
        Ok(statistics)
    }

    /// Public id of the parent; `None` for patients and unknown resources.
    pub async fn lookup_parent(&self, public_id: &str) -> Result<Option<String>> {
        let mut tx = self.read_only().await?;
        let parent = tx
            .lookup_resource_and_parent(public_id)
            .await?
            .and_then(|row| row.parent_public_id);
        tx.commit(0).await?;
        Ok(parent)
    }

    pub async fn lookup_resource_type(&self, public_id: &str) -> Result<Option<ResourceType>> {
        let mut tx = self.read_only().await?;
        let level = tx.lookup_resource(public_id).await?.map(|(_, level)| level);
        tx.commit(0).await?;
        Ok(level)
    }
}
