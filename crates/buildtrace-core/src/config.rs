//! Pipeline tuning knobs.

use std::time::Duration;

use crate::message::Stage;
use crate::queue::QueueConfig;

/// Default worker counts per stage. OCR dominates wall-clock time, so it
/// gets the widest pool.
pub const OCR_WORKERS: usize = 4;
pub const DIFF_WORKERS: usize = 2;
pub const SUMMARY_WORKERS: usize = 2;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// `create_job` rejects requests beyond this many pages.
    pub max_pages_per_job: u32,
    /// One executor invocation is abandoned past this and retried as a
    /// transient failure.
    pub stage_timeout: Duration,
    pub ocr_workers: usize,
    pub diff_workers: usize,
    pub summary_workers: usize,
    pub queue: QueueConfig,
}

impl PipelineConfig {
    pub fn workers_for(&self, stage: Stage) -> usize {
        match stage {
            Stage::Ocr => self.ocr_workers,
            Stage::Diff => self.diff_workers,
            Stage::Summary => self.summary_workers,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_pages_per_job: 200,
            stage_timeout: Duration::from_secs(120),
            ocr_workers: OCR_WORKERS,
            diff_workers: DIFF_WORKERS,
            summary_workers: SUMMARY_WORKERS,
            queue: QueueConfig::default(),
        }
    }
}
