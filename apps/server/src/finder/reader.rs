//! Access to the stored DICOM files, for tags the index does not keep.

use async_trait::async_trait;
use dicom_core::Tag;
use std::collections::BTreeSet;

use crate::models::DicomMap;
use crate::Result;

#[async_trait]
pub trait DicomFileReader: Send + Sync {
    /// Reads `tags` from the file of instance `instance_id`.
    ///
    /// Tags absent from the file are simply missing from the map. `None`
    /// means the instance or its file has disappeared since it was found.
    async fn read(&self, instance_id: &str, tags: &BTreeSet<Tag>) -> Result<Option<DicomMap>>;
}

/// Reader for setups without a storage area: every file is gone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStorageArea;

#[async_trait]
impl DicomFileReader for NoStorageArea {
    async fn read(&self, _instance_id: &str, _tags: &BTreeSet<Tag>) -> Result<Option<DicomMap>> {
        Ok(None)
    }
}
