//! Domain models for the DICOM index

pub mod attachment;
pub mod change;
pub mod dicom_map;
pub mod enums;

pub use attachment::{DeletedAttachment, FileInfo};
pub use change::{ChangesPage, DeletedResources, ServerChange, Statistics};
pub use dicom_map::{format_tag, parse_tag, tag_name, tag_vr, DicomMap, DicomValue};
pub use enums::{
    ChangeType, CompressionType, FileContentType, GlobalProperty, LabelsConstraint,
    MetadataType, QueueOrigin, ResourceType, SeriesStatus, TransactionType,
};
