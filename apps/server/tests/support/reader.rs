use async_trait::async_trait;
use dicom_core::Tag;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use dicom_index::finder::DicomFileReader;
use dicom_index::models::DicomMap;

/// In-memory storage area that counts the files it opens.
#[derive(Default)]
pub struct CountingReader {
    files: HashMap<String, DicomMap>,
    vanished: HashSet<String>,
    reads: AtomicUsize,
    opened: Mutex<Vec<String>>,
}

impl CountingReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, instance_id: &str, tags: DicomMap) -> Self {
        self.files.insert(instance_id.to_string(), tags);
        self
    }

    /// The file of `instance_id` disappears before it is read.
    pub fn vanished(mut self, instance_id: &str) -> Self {
        self.vanished.insert(instance_id.to_string());
        self
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl DicomFileReader for CountingReader {
    async fn read(
        &self,
        instance_id: &str,
        tags: &BTreeSet<Tag>,
    ) -> dicom_index::Result<Option<DicomMap>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.opened.lock().unwrap().push(instance_id.to_string());

        if self.vanished.contains(instance_id) {
            return Ok(None);
        }
        Ok(Some(
            self.files
                .get(instance_id)
                .map(|file| file.extract(tags))
                .unwrap_or_default(),
        ))
    }
}
