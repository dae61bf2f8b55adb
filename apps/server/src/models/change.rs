//! Change log and deletion reports

use serde::Serialize;

use super::attachment::FileInfo;
use super::enums::{ChangeType, ResourceType};

/// One row of the change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerChange {
    pub seq: i64,
    pub change_type: ChangeType,
    pub resource_type: ResourceType,
    pub public_id: String,
    /// `YYYYMMDDTHHMMSS`, UTC
    pub date: String,
}

/// Page of the change log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChangesPage {
    pub changes: Vec<ServerChange>,
    /// No further change exists after this page.
    pub done: bool,
}

/// What a resource deletion removed.
#[derive(Debug, Clone, Default)]
pub struct DeletedResources {
    /// Files to remove from the storage area.
    pub attachments: Vec<FileInfo>,
    /// Every removed resource, the target and its descendants first,
    /// then the ancestors left without children.
    pub resources: Vec<(ResourceType, String)>,
    /// Closest ancestor that survived the deletion.
    pub remaining_ancestor: Option<(ResourceType, String)>,
}

/// Counters over the whole index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub patients: u64,
    pub studies: u64,
    pub series: u64,
    pub instances: u64,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}
