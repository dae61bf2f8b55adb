use dicom_core::Tag;
use dicom_dictionary_std::tags;

use dicom_index::db::InstanceRecord;
use dicom_index::models::{DicomMap, FileContentType, FileInfo};

use super::TestIndex;

/// Common test constants
pub mod constants {
    pub const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
    pub const MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
    pub const FILE_SIZE: u64 = 1000;
}

/// Builds one instance with its whole chain. Each id is used both as the
/// public id and as the matching DICOM UID.
pub struct InstanceBuilder {
    record: InstanceRecord,
}

impl InstanceBuilder {
    pub fn new(patient: &str, study: &str, series: &str, instance: &str) -> Self {
        let mut tags = DicomMap::new();
        tags.set_value(tags::PATIENT_ID, patient.to_uppercase());
        tags.set_value(tags::STUDY_INSTANCE_UID, study);
        tags.set_value(tags::SERIES_INSTANCE_UID, series);
        tags.set_value(tags::SOP_INSTANCE_UID, instance);

        let mut record = InstanceRecord::new(patient, study, series, instance, tags);
        record.attachments.push(FileInfo::uncompressed(
            format!("file-{instance}"),
            FileContentType::Dicom,
            constants::FILE_SIZE,
            format!("md5-{instance}"),
        ));

        Self { record }
    }

    pub fn tag(mut self, tag: Tag, value: &str) -> Self {
        self.record.tags.set_value(tag, value);
        self
    }

    pub fn patient_name(self, name: &str) -> Self {
        self.tag(tags::PATIENT_NAME, name)
    }

    pub fn study_date(self, date: &str) -> Self {
        self.tag(tags::STUDY_DATE, date)
    }

    pub fn study_description(self, description: &str) -> Self {
        self.tag(tags::STUDY_DESCRIPTION, description)
    }

    pub fn modality(self, modality: &str) -> Self {
        self.tag(tags::MODALITY, modality)
    }

    pub fn sop_class(self, sop_class: &str) -> Self {
        self.tag(tags::SOP_CLASS_UID, sop_class)
    }

    pub fn index_in_series(mut self, index: i64) -> Self {
        self.record.index_in_series = Some(index);
        self.tag(tags::INSTANCE_NUMBER, &index.to_string())
    }

    pub fn expected_instances(mut self, expected: u32) -> Self {
        self.record.expected_number_of_instances = Some(expected);
        self
    }

    pub fn build(self) -> InstanceRecord {
        self.record
    }
}

/// Public ids of the standard tree.
pub mod ids {
    pub const PATIENT_1: &str = "p1";
    pub const PATIENT_2: &str = "p2";
    pub const STUDY_BRAIN: &str = "st1";
    pub const STUDY_CHEST: &str = "st2";
    pub const STUDY_KNEE: &str = "st3";
    pub const SERIES_BRAIN_MR: &str = "se1";
    pub const SERIES_BRAIN_CT: &str = "se2";
    pub const SERIES_CHEST_CT: &str = "se3";
    pub const SERIES_KNEE_MR: &str = "se4";
}

/// The standard tree:
///
/// ```text
/// p1 DOE^JOHN
///   st1 20200101 Brain:  se1 MR (i1, i2, expects 2), se2 CT (i3)
///   st2 20210615 Chest:  se3 CT (i4)
/// p2 ROE^JANE
///   st3 20220301 Knee:   se4 MR (i5)
/// ```
pub fn standard_tree() -> Vec<InstanceRecord> {
    use constants::*;
    use ids::*;

    let brain = |series: &str, instance: &str| {
        InstanceBuilder::new(PATIENT_1, STUDY_BRAIN, series, instance)
            .patient_name("DOE^JOHN")
            .study_date("20200101")
            .study_description("Brain")
    };

    vec![
        brain(SERIES_BRAIN_MR, "i1")
            .modality("MR")
            .sop_class(MR_IMAGE_STORAGE)
            .index_in_series(1)
            .expected_instances(2)
            .build(),
        brain(SERIES_BRAIN_MR, "i2")
            .modality("MR")
            .sop_class(MR_IMAGE_STORAGE)
            .index_in_series(2)
            .expected_instances(2)
            .build(),
        brain(SERIES_BRAIN_CT, "i3")
            .modality("CT")
            .sop_class(CT_IMAGE_STORAGE)
            .index_in_series(1)
            .build(),
        InstanceBuilder::new(PATIENT_1, STUDY_CHEST, SERIES_CHEST_CT, "i4")
            .patient_name("DOE^JOHN")
            .study_date("20210615")
            .study_description("Chest")
            .modality("CT")
            .sop_class(CT_IMAGE_STORAGE)
            .index_in_series(1)
            .build(),
        InstanceBuilder::new(PATIENT_2, STUDY_KNEE, SERIES_KNEE_MR, "i5")
            .patient_name("ROE^JANE")
            .study_date("20220301")
            .study_description("Knee")
            .modality("MR")
            .sop_class(MR_IMAGE_STORAGE)
            .index_in_series(1)
            .build(),
    ]
}

pub async fn populate(index: &TestIndex) -> anyhow::Result<()> {
    for record in standard_tree() {
        index.index.store_instance(&record).await?;
    }
    Ok(())
}

/// Sorted copy, to compare answers regardless of the backend ordering.
pub fn sorted<S: AsRef<str>>(ids: impl IntoIterator<Item = S>) -> Vec<String> {
    let mut ids: Vec<String> = ids.into_iter().map(|s| s.as_ref().to_string()).collect();
    ids.sort();
    ids
}
