use crate::domain::error::ProcessingError;
use serde::Serialize;

/// Outcome of one `process_batch` call
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProcessingResult {
    pub successful_records: usize,
    pub failed_records: usize,
    pub processing_errors: Vec<ProcessingError>,
}

impl BatchProcessingResult {
    pub fn total_records(&self) -> usize {
        self.successful_records + self.failed_records
    }

    /// True when a non-empty batch had no successful record
    pub fn all_failed(&self) -> bool {
        self.failed_records > 0 && self.successful_records == 0
    }

    pub fn has_failures(&self) -> bool {
        self.failed_records > 0
    }
}
