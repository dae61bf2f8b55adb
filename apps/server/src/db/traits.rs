//! The contract every index backend implements.
//!
//! A backend is opened once and advertises its `Capabilities`. All reads
//! and writes then go through a `Transaction`. Optional operations have
//! default bodies returning `NotImplemented`; callers check the matching
//! capability before invoking them and never rely on the backend to do it.

use async_trait::async_trait;
use dicom_core::Tag;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::db::search::DatabaseDicomTagConstraints;
use crate::find::{FindRequest, FindResponse};
use crate::models::{
    ChangeType, ChangesPage, DeletedResources, DicomMap, FileContentType, FileInfo,
    GlobalProperty, LabelsConstraint, MetadataType, QueueOrigin, ResourceType, ServerChange,
    Statistics, TransactionType,
};
use crate::{Error, Result};

/// Schema version this crate reads and writes.
pub const DATABASE_SCHEMA_VERSION: u32 = 6;

fn not_implemented<T>(operation: &str) -> Result<T> {
    Err(Error::NotImplemented(format!(
        "The database backend doesn't support {operation}"
    )))
}

/// Features fixed when the database is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub has_revisions_support: bool,
    pub has_labels_support: bool,
    /// `execute_find` and `execute_count` are implemented natively.
    pub has_find_support: bool,
    pub has_atomic_increment_global_property: bool,
    pub has_key_value_stores_support: bool,
    pub has_queues_support: bool,
    pub has_flush_to_disk: bool,
    pub has_measure_latency: bool,
    pub has_attachment_custom_data_support: bool,
    pub has_extended_changes: bool,
}

/// A resource as the index knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRow {
    pub internal_id: i64,
    pub level: ResourceType,
    pub parent_public_id: Option<String>,
}

#[async_trait]
pub trait DatabaseWrapper: Send + Sync {
    /// Fails with `BadSequenceOfCalls` if already open.
    async fn open(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn capabilities(&self) -> Capabilities;

    fn database_version(&self) -> u32 {
        DATABASE_SCHEMA_VERSION
    }

    async fn start_transaction(&self, kind: TransactionType) -> Result<Box<dyn Transaction>>;

    async fn flush_to_disk(&self) -> Result<()> {
        not_implemented("flushing to disk")
    }

    /// Round-trip time of a trivial query, in microseconds.
    async fn measure_latency(&self) -> Result<u64> {
        not_implemented("latency measurement")
    }
}

#[async_trait]
pub trait Transaction: Send {
    /// Commits, recording how many bytes the storage area gained.
    async fn commit(self: Box<Self>, file_size_delta: i64) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;

    // Resources

    async fn create_resource(&mut self, public_id: &str, level: ResourceType) -> Result<i64>;

    async fn attach_child(&mut self, parent: i64, child: i64) -> Result<()>;

    async fn set_main_dicom_tag(&mut self, id: i64, tag: Tag, value: &str) -> Result<()>;

    async fn set_identifier_tag(&mut self, id: i64, tag: Tag, value: &str) -> Result<()>;

    async fn clear_main_dicom_tags(&mut self, id: i64) -> Result<()>;

    async fn lookup_resource(&mut self, public_id: &str) -> Result<Option<(i64, ResourceType)>>;

    async fn lookup_resource_and_parent(&mut self, public_id: &str)
        -> Result<Option<ResourceRow>>;

    async fn lookup_parent(&mut self, id: i64) -> Result<Option<i64>>;

    /// `UnknownResource` if `id` does not exist.
    async fn get_public_id(&mut self, id: i64) -> Result<String>;

    async fn get_resource_type(&mut self, id: i64) -> Result<ResourceType>;

    async fn get_all_public_ids(&mut self, level: ResourceType) -> Result<Vec<String>>;

    /// Page of public ids in storage order; `limit == 0` is unbounded.
    async fn get_all_public_ids_with_limits(
        &mut self,
        level: ResourceType,
        since: u64,
        limit: u64,
    ) -> Result<Vec<String>>;

    async fn get_all_internal_ids(&mut self, level: ResourceType) -> Result<Vec<i64>>;

    async fn get_children_public_id(&mut self, id: i64) -> Result<Vec<String>>;

    async fn get_children_internal_id(&mut self, id: i64) -> Result<Vec<i64>>;

    /// Values of `metadata` over the direct children of `id`.
    async fn get_children_metadata(
        &mut self,
        id: i64,
        metadata: MetadataType,
    ) -> Result<Vec<String>>;

    async fn get_main_dicom_tags(&mut self, id: i64) -> Result<DicomMap>;

    async fn get_resources_count(&mut self, level: ResourceType) -> Result<u64>;

    /// Deletes `id`, its descendants, and the ancestors left childless.
    async fn delete_resource(&mut self, id: i64) -> Result<DeletedResources>;

    // Metadata

    async fn set_metadata(
        &mut self,
        id: i64,
        metadata: MetadataType,
        value: &str,
        revision: i64,
    ) -> Result<()>;

    async fn delete_metadata(&mut self, id: i64, metadata: MetadataType) -> Result<()>;

    /// Value and revision.
    async fn lookup_metadata(
        &mut self,
        id: i64,
        metadata: MetadataType,
    ) -> Result<Option<(String, i64)>>;

    async fn get_all_metadata(&mut self, id: i64) -> Result<BTreeMap<MetadataType, String>>;

    // Attachments

    async fn add_attachment(&mut self, id: i64, attachment: &FileInfo, revision: i64)
        -> Result<()>;

    async fn delete_attachment(&mut self, id: i64, content_type: FileContentType) -> Result<()>;

    async fn list_available_attachments(&mut self, id: i64) -> Result<BTreeSet<FileContentType>>;

    async fn lookup_attachment(
        &mut self,
        id: i64,
        content_type: FileContentType,
    ) -> Result<Option<(FileInfo, i64)>>;

    async fn set_attachment_custom_data(&mut self, _uuid: &str, _data: &str) -> Result<()> {
        not_implemented("custom data on attachments")
    }

    // Labels

    async fn add_label(&mut self, _id: i64, _label: &str) -> Result<()> {
        not_implemented("labels")
    }

    async fn remove_label(&mut self, _id: i64, _label: &str) -> Result<()> {
        not_implemented("labels")
    }

    async fn list_labels(&mut self, _id: i64) -> Result<BTreeSet<String>> {
        not_implemented("labels")
    }

    async fn list_all_labels(&mut self) -> Result<BTreeSet<String>> {
        not_implemented("labels")
    }

    // Global properties

    async fn lookup_global_property(&mut self, property: GlobalProperty)
        -> Result<Option<String>>;

    async fn set_global_property(&mut self, property: GlobalProperty, value: &str) -> Result<()>;

    async fn increment_global_property(
        &mut self,
        _property: GlobalProperty,
        _increment: i64,
    ) -> Result<i64> {
        not_implemented("atomic increments of global properties")
    }

    // Changes

    /// The public id is stored with the change so that `Deleted` entries
    /// outlive their resource.
    async fn log_change(
        &mut self,
        change_type: ChangeType,
        level: ResourceType,
        id: i64,
        public_id: &str,
        date: &str,
    ) -> Result<i64>;

    /// Changes after `since`, oldest first; `done` once nothing follows.
    async fn get_changes(&mut self, since: i64, limit: u32) -> Result<ChangesPage>;

    /// Like `get_changes`, bounded by `to` and restricted to `types` when
    /// non-empty. With `to` and no `since`, the newest changes are kept.

    async fn get_changes_extended(
        &mut self,
        _since: i64,
        _to: Option<i64>,
        _types: &BTreeSet<ChangeType>,
        _limit: u32,
    ) -> Result<ChangesPage> {
        not_implemented("extended changes")
    }

    async fn get_last_change(&mut self) -> Result<Option<ServerChange>>;

    async fn get_last_change_index(&mut self) -> Result<i64>;

    async fn clear_changes(&mut self) -> Result<()>;

    // Key-value stores

    async fn store_key_value(&mut self, _store: &str, _key: &str, _value: &[u8]) -> Result<()> {
        not_implemented("key-value stores")
    }

    async fn get_key_value(&mut self, _store: &str, _key: &str) -> Result<Option<Vec<u8>>> {
        not_implemented("key-value stores")
    }

    async fn delete_key_value(&mut self, _store: &str, _key: &str) -> Result<()> {
        not_implemented("key-value stores")
    }

    /// Keys strictly after `from`, in order.
    async fn list_keys(
        &mut self,
        _store: &str,
        _from: Option<&str>,
        _limit: u64,
    ) -> Result<Vec<String>> {
        not_implemented("key-value stores")
    }

    // Queues

    async fn enqueue_value(&mut self, _queue: &str, _value: &[u8]) -> Result<()> {
        not_implemented("queues")
    }

    async fn dequeue_value(
        &mut self,
        _queue: &str,
        _origin: QueueOrigin,
    ) -> Result<Option<Vec<u8>>> {
        not_implemented("queues")
    }

    async fn get_queue_size(&mut self, _queue: &str) -> Result<u64> {
        not_implemented("queues")
    }

    // Recycling

    async fn set_protected_patient(&mut self, id: i64, protected: bool) -> Result<()>;

    async fn is_protected_patient(&mut self, id: i64) -> Result<bool>;

    /// Oldest unprotected patient other than `avoid`.
    async fn select_patient_to_recycle(&mut self, avoid: Option<i64>) -> Result<Option<i64>>;

    // Sizes

    async fn get_total_compressed_size(&mut self) -> Result<u64>;

    async fn get_total_uncompressed_size(&mut self) -> Result<u64>;

    async fn update_and_get_statistics(&mut self) -> Result<Statistics>;

    // Lookups

    /// Public ids of the resources at `level` matching every constraint,
    /// with their internal ids. `limit == 0` is unbounded.
    async fn apply_lookup_resources(
        &mut self,
        constraints: &DatabaseDicomTagConstraints,
        level: ResourceType,
        labels: &BTreeSet<String>,
        labels_constraint: LabelsConstraint,
        limit: u64,
    ) -> Result<Vec<(String, i64)>>;

    async fn execute_find(&mut self, _request: &FindRequest) -> Result<FindResponse> {
        not_implemented("find")
    }

    async fn execute_count(&mut self, _request: &FindRequest) -> Result<u64> {
        not_implemented("find")
    }
}
