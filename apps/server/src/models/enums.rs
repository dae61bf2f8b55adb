//! Enumerations shared by the index, the planner and the storage backends.
//!
//! Every enumeration that reaches the database carries a stable integer
//! code; conversions from codes are checked and reject unknown values.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// First code of the user-defined ranges (metadata, attachments, properties).
pub const USER_RANGE_START: i64 = 1024;
/// Last code of the user-defined ranges.
pub const USER_RANGE_END: i64 = 65535;

fn out_of_range(what: &str, code: i64) -> Error {
    Error::ParameterOutOfRange(format!("Unknown {what}: {code}"))
}

fn user_code(what: &str, code: i64) -> Result<u16> {
    if (USER_RANGE_START..=USER_RANGE_END).contains(&code) {
        Ok(code as u16)
    } else {
        Err(out_of_range(what, code))
    }
}

/// Level of a resource in the Patient/Study/Series/Instance tree.
///
/// The derived ordering follows the tree: `Patient < Study < Series < Instance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Patient,
    Study,
    Series,
    Instance,
}

impl ResourceType {
    pub const ALL: [ResourceType; 4] = [
        ResourceType::Patient,
        ResourceType::Study,
        ResourceType::Series,
        ResourceType::Instance,
    ];

    pub fn code(self) -> i64 {
        match self {
            ResourceType::Patient => 1,
            ResourceType::Study => 2,
            ResourceType::Series => 3,
            ResourceType::Instance => 4,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(ResourceType::Patient),
            2 => Ok(ResourceType::Study),
            3 => Ok(ResourceType::Series),
            4 => Ok(ResourceType::Instance),
            _ => Err(out_of_range("resource type", code)),
        }
    }

    /// Zero-based slot, used to index per-level arrays.
    pub fn index(self) -> usize {
        match self {
            ResourceType::Patient => 0,
            ResourceType::Study => 1,
            ResourceType::Series => 2,
            ResourceType::Instance => 3,
        }
    }

    pub fn parent(self) -> Option<Self> {
        match self {
            ResourceType::Patient => None,
            ResourceType::Study => Some(ResourceType::Patient),
            ResourceType::Series => Some(ResourceType::Study),
            ResourceType::Instance => Some(ResourceType::Series),
        }
    }

    pub fn child(self) -> Option<Self> {
        match self {
            ResourceType::Patient => Some(ResourceType::Study),
            ResourceType::Study => Some(ResourceType::Series),
            ResourceType::Series => Some(ResourceType::Instance),
            ResourceType::Instance => None,
        }
    }

    pub fn parent_or_err(self) -> Result<Self> {
        self.parent()
            .ok_or_else(|| Error::ParameterOutOfRange("Patients have no parent level".to_string()))
    }

    pub fn child_or_err(self) -> Result<Self> {
        self.child()
            .ok_or_else(|| Error::ParameterOutOfRange("Instances have no child level".to_string()))
    }

    /// True if `self` is `other` or one of its ancestors.
    pub fn is_above_or_equal(self, other: ResourceType) -> bool {
        self <= other
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Patient => "Patient",
            ResourceType::Study => "Study",
            ResourceType::Series => "Series",
            ResourceType::Instance => "Instance",
        }
    }

    pub fn plural(self) -> &'static str {
        match self {
            ResourceType::Patient => "Patients",
            ResourceType::Study => "Studies",
            ResourceType::Series => "Series",
            ResourceType::Instance => "Instances",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "patient" | "patients" => Ok(ResourceType::Patient),
            "study" | "studies" => Ok(ResourceType::Study),
            "series" => Ok(ResourceType::Series),
            "instance" | "instances" => Ok(ResourceType::Instance),
            _ => Err(Error::ParameterOutOfRange(format!(
                "Unknown resource type: {s}"
            ))),
        }
    }
}

/// Typed key of a metadata entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetadataType {
    IndexInSeries,
    ReceptionDate,
    RemoteAet,
    ExpectedNumberOfInstances,
    ModifiedFrom,
    AnonymizedFrom,
    LastUpdate,
    Origin,
    TransferSyntax,
    SopClassUid,
    RemoteIp,
    CalledAet,
    HttpUsername,
    PixelDataOffset,
    MainDicomTagsSignature,
    MainDicomSequences,
    PixelDataVr,
    User(u16),
}

impl MetadataType {
    pub fn code(self) -> i64 {
        match self {
            MetadataType::IndexInSeries => 1,
            MetadataType::ReceptionDate => 2,
            MetadataType::RemoteAet => 3,
            MetadataType::ExpectedNumberOfInstances => 4,
            MetadataType::ModifiedFrom => 5,
            MetadataType::AnonymizedFrom => 6,
            MetadataType::LastUpdate => 7,
            MetadataType::Origin => 8,
            MetadataType::TransferSyntax => 9,
            MetadataType::SopClassUid => 10,
            MetadataType::RemoteIp => 11,
            MetadataType::CalledAet => 12,
            MetadataType::HttpUsername => 13,
            MetadataType::PixelDataOffset => 14,
            MetadataType::MainDicomTagsSignature => 15,
            MetadataType::MainDicomSequences => 16,
            MetadataType::PixelDataVr => 17,
            MetadataType::User(code) => i64::from(code),
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        Ok(match code {
            1 => MetadataType::IndexInSeries,
            2 => MetadataType::ReceptionDate,
            3 => MetadataType::RemoteAet,
            4 => MetadataType::ExpectedNumberOfInstances,
            5 => MetadataType::ModifiedFrom,
            6 => MetadataType::AnonymizedFrom,
            7 => MetadataType::LastUpdate,
            8 => MetadataType::Origin,
            9 => MetadataType::TransferSyntax,
            10 => MetadataType::SopClassUid,
            11 => MetadataType::RemoteIp,
            12 => MetadataType::CalledAet,
            13 => MetadataType::HttpUsername,
            14 => MetadataType::PixelDataOffset,
            15 => MetadataType::MainDicomTagsSignature,
            16 => MetadataType::MainDicomSequences,
            17 => MetadataType::PixelDataVr,
            other => MetadataType::User(user_code("metadata type", other)?),
        })
    }

    pub fn name(self) -> String {
        let name = match self {
            MetadataType::IndexInSeries => "IndexInSeries",
            MetadataType::ReceptionDate => "ReceptionDate",
            MetadataType::RemoteAet => "RemoteAET",
            MetadataType::ExpectedNumberOfInstances => "ExpectedNumberOfInstances",
            MetadataType::ModifiedFrom => "ModifiedFrom",
            MetadataType::AnonymizedFrom => "AnonymizedFrom",
            MetadataType::LastUpdate => "LastUpdate",
            MetadataType::Origin => "Origin",
            MetadataType::TransferSyntax => "TransferSyntax",
            MetadataType::SopClassUid => "SopClassUid",
            MetadataType::RemoteIp => "RemoteIP",
            MetadataType::CalledAet => "CalledAET",
            MetadataType::HttpUsername => "HttpUsername",
            MetadataType::PixelDataOffset => "PixelDataOffset",
            MetadataType::MainDicomTagsSignature => "MainDicomTagsSignature",
            MetadataType::MainDicomSequences => "MainDicomSequences",
            MetadataType::PixelDataVr => "PixelDataVR",
            MetadataType::User(code) => return code.to_string(),
        };
        name.to_string()
    }
}

impl fmt::Display for MetadataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Kind of file attached to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileContentType {
    Dicom,
    DicomAsJson,
    DicomUntilPixelData,
    User(u16),
}

impl FileContentType {
    pub fn code(self) -> i64 {
        match self {
            FileContentType::Dicom => 1,
            FileContentType::DicomAsJson => 2,
            FileContentType::DicomUntilPixelData => 3,
            FileContentType::User(code) => i64::from(code),
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        Ok(match code {
            1 => FileContentType::Dicom,
            2 => FileContentType::DicomAsJson,
            3 => FileContentType::DicomUntilPixelData,
            other => FileContentType::User(user_code("file content type", other)?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionType {
    None,
    ZlibWithSize,
}

impl CompressionType {
    pub fn code(self) -> i64 {
        match self {
            CompressionType::None => 1,
            CompressionType::ZlibWithSize => 2,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(CompressionType::None),
            2 => Ok(CompressionType::ZlibWithSize),
            _ => Err(out_of_range("compression type", code)),
        }
    }
}

/// Kind of entry in the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    CompletedSeries,
    Deleted,
    NewChildInstance,
    NewInstance,
    NewPatient,
    NewSeries,
    NewStudy,
    AnonymizedStudy,
    AnonymizedSeries,
    ModifiedStudy,
    ModifiedSeries,
    AnonymizedPatient,
    ModifiedPatient,
    StablePatient,
    StableStudy,
    StableSeries,
    UpdatedAttachment,
    UpdatedMetadata,
}

impl ChangeType {
    const TABLE: [ChangeType; 18] = [
        ChangeType::CompletedSeries,
        ChangeType::Deleted,
        ChangeType::NewChildInstance,
        ChangeType::NewInstance,
        ChangeType::NewPatient,
        ChangeType::NewSeries,
        ChangeType::NewStudy,
        ChangeType::AnonymizedStudy,
        ChangeType::AnonymizedSeries,
        ChangeType::ModifiedStudy,
        ChangeType::ModifiedSeries,
        ChangeType::AnonymizedPatient,
        ChangeType::ModifiedPatient,
        ChangeType::StablePatient,
        ChangeType::StableStudy,
        ChangeType::StableSeries,
        ChangeType::UpdatedAttachment,
        ChangeType::UpdatedMetadata,
    ];

    pub fn code(self) -> i64 {
        Self::TABLE
            .iter()
            .position(|c| *c == self)
            .map(|p| p as i64 + 1)
            .unwrap_or_default()
    }

    pub fn from_code(code: i64) -> Result<Self> {
        usize::try_from(code - 1)
            .ok()
            .and_then(|i| Self::TABLE.get(i).copied())
            .ok_or_else(|| out_of_range("change type", code))
    }

    /// The change logged when a resource of `level` is first stored.
    pub fn new_resource(level: ResourceType) -> Self {
        match level {
            ResourceType::Patient => ChangeType::NewPatient,
            ResourceType::Study => ChangeType::NewStudy,
            ResourceType::Series => ChangeType::NewSeries,
            ResourceType::Instance => ChangeType::NewInstance,
        }
    }
}

/// Server-wide key of a global property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlobalProperty {
    DatabaseSchemaVersion,
    AnonymizationSequence,
    DatabasePatchLevel,
    User(u16),
}

impl GlobalProperty {
    pub fn code(self) -> i64 {
        match self {
            GlobalProperty::DatabaseSchemaVersion => 1,
            GlobalProperty::AnonymizationSequence => 3,
            GlobalProperty::DatabasePatchLevel => 4,
            GlobalProperty::User(code) => i64::from(code),
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        Ok(match code {
            1 => GlobalProperty::DatabaseSchemaVersion,
            3 => GlobalProperty::AnonymizationSequence,
            4 => GlobalProperty::DatabasePatchLevel,
            other => GlobalProperty::User(user_code("global property", other)?),
        })
    }
}

/// How the labels of a find request combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LabelsConstraint {
    /// The resource carries every label.
    #[default]
    All,
    /// The resource carries at least one label.
    Any,
    /// The resource carries none of the labels.
    None,
}

impl FromStr for LabelsConstraint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(LabelsConstraint::All),
            "any" => Ok(LabelsConstraint::Any),
            "none" => Ok(LabelsConstraint::None),
            _ => Err(Error::ParameterOutOfRange(format!(
                "Unknown labels constraint: {s}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    ReadOnly,
    ReadWrite,
}

/// Completeness of a series, derived from the instance indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SeriesStatus {
    Complete,
    Missing,
    Inconsistent,
    Unknown,
}

impl SeriesStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SeriesStatus::Complete => "Complete",
            SeriesStatus::Missing => "Missing",
            SeriesStatus::Inconsistent => "Inconsistent",
            SeriesStatus::Unknown => "Unknown",
        }
    }
}

/// End of a queue a value is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrigin {
    Front,
    Back,
}
