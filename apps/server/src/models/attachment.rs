//! Attachment descriptors

use serde::Serialize;

use super::enums::{CompressionType, FileContentType};

/// A file attached to a resource. The bytes live in the storage area;
/// the index only keeps this descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub uuid: String,
    pub content_type: FileContentType,
    pub uncompressed_size: u64,
    pub uncompressed_hash: String,
    pub compression: CompressionType,
    pub compressed_size: u64,
    pub compressed_hash: String,
    /// Opaque data owned by the storage area, if the backend keeps it.
    pub custom_data: Option<String>,
}

impl FileInfo {
    /// Uncompressed attachment, where both sizes and hashes coincide.
    pub fn uncompressed(
        uuid: impl Into<String>,
        content_type: FileContentType,
        size: u64,
        hash: impl Into<String>,
    ) -> Self {
        let hash = hash.into();
        Self {
            uuid: uuid.into(),
            content_type,
            uncompressed_size: size,
            uncompressed_hash: hash.clone(),
            compression: CompressionType::None,
            compressed_size: size,
            compressed_hash: hash,
            custom_data: None,
        }
    }
}

/// Summary written to the JSON answers for deleted files.
#[derive(Debug, Clone, Serialize)]
pub struct DeletedAttachment {
    pub uuid: String,
    pub content_type: i64,
    pub compressed_size: u64,
}

impl From<&FileInfo> for DeletedAttachment {
    fn from(info: &FileInfo) -> Self {
        Self {
            uuid: info.uuid.clone(),
            content_type: info.content_type.code(),
            compressed_size: info.compressed_size,
        }
    }
}
