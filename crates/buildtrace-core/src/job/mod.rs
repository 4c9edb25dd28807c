//! Job and page records plus the aggregate status state machine.
//!
//! Pages are flat records keyed by (job id, page number). A job's overall
//! status is never tracked incrementally; it is recomputed from its pages
//! with [`aggregate_status`] after every page mutation.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactRef;
use crate::message::Stage;

pub mod store;

/// Overall status of a comparison job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Partial,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Partial
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Partial => "partial",
        };
        write!(f, "{s}")
    }
}

/// A page's current position in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PagePhase {
    Ocr,
    Diff,
    Summary,
    Done,
    Failed,
}

impl PagePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PagePhase::Done | PagePhase::Failed)
    }

    /// The stage a non-terminal phase is waiting on.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PagePhase::Ocr => Some(Stage::Ocr),
            PagePhase::Diff => Some(Stage::Diff),
            PagePhase::Summary => Some(Stage::Summary),
            PagePhase::Done | PagePhase::Failed => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            PagePhase::Ocr => 0,
            PagePhase::Diff => 1,
            PagePhase::Summary => 2,
            PagePhase::Done => 3,
            PagePhase::Failed => 4,
        }
    }

    /// Legal transitions: one stage hop forward, or `failed` from any
    /// non-terminal phase. Terminal phases never move again.
    pub fn can_advance_to(&self, next: PagePhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            PagePhase::Failed => true,
            _ => next.rank() == self.rank() + 1,
        }
    }
}

impl From<Stage> for PagePhase {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Ocr => PagePhase::Ocr,
            Stage::Diff => PagePhase::Diff,
            Stage::Summary => PagePhase::Summary,
        }
    }
}

impl std::fmt::Display for PagePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PagePhase::Ocr => "ocr",
            PagePhase::Diff => "diff",
            PagePhase::Summary => "summary",
            PagePhase::Done => "done",
            PagePhase::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One comparison job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Owning session/project in the surrounding product.
    pub session_id: String,
    pub page_count: u32,
    pub status: JobStatus,
    pub created_at: String,
    pub completed_at: Option<String>,
}

impl Job {
    pub fn new(id: impl Into<String>, session_id: impl Into<String>, page_count: u32) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            page_count,
            status: JobStatus::Pending,
            created_at: Utc::now().to_rfc3339(),
            completed_at: None,
        }
    }
}

/// Artifact outputs recorded per stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageArtifacts {
    pub ocr: Option<ArtifactRef>,
    pub diff: Option<ArtifactRef>,
    pub summary: Option<ArtifactRef>,
}

impl StageArtifacts {
    pub fn get(&self, stage: Stage) -> Option<&ArtifactRef> {
        match stage {
            Stage::Ocr => self.ocr.as_ref(),
            Stage::Diff => self.diff.as_ref(),
            Stage::Summary => self.summary.as_ref(),
        }
    }

    pub fn set(&mut self, stage: Stage, output: ArtifactRef) {
        match stage {
            Stage::Ocr => self.ocr = Some(output),
            Stage::Diff => self.diff = Some(output),
            Stage::Summary => self.summary = Some(output),
        }
    }

    /// Recorded outputs in stage order.
    pub fn in_order(&self) -> Vec<ArtifactRef> {
        [&self.ocr, &self.diff, &self.summary]
            .into_iter()
            .filter_map(|output| output.clone())
            .collect()
    }
}

/// Highest delivery attempt observed per stage.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StageAttempts {
    pub ocr: u32,
    pub diff: u32,
    pub summary: u32,
}

impl StageAttempts {
    pub fn get(&self, stage: Stage) -> u32 {
        match stage {
            Stage::Ocr => self.ocr,
            Stage::Diff => self.diff,
            Stage::Summary => self.summary,
        }
    }

    /// Record an observed attempt; stale duplicates never lower the count.
    pub fn record(&mut self, stage: Stage, attempt: u32) {
        let slot = match stage {
            Stage::Ocr => &mut self.ocr,
            Stage::Diff => &mut self.diff,
            Stage::Summary => &mut self.summary,
        };
        *slot = (*slot).max(attempt);
    }
}

/// One page's journey through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageWorkItem {
    pub job_id: String,
    /// 1-based.
    pub page_number: u32,
    pub phase: PagePhase,
    /// Upstream-supplied artifact for this page.
    pub source: ArtifactRef,
    pub attempts: StageAttempts,
    pub outputs: StageArtifacts,
    pub last_error: Option<String>,
}

impl PageWorkItem {
    pub fn new(job_id: impl Into<String>, page_number: u32, source: ArtifactRef) -> Self {
        Self {
            job_id: job_id.into(),
            page_number,
            phase: PagePhase::Ocr,
            source,
            attempts: StageAttempts::default(),
            outputs: StageArtifacts::default(),
            last_error: None,
        }
    }

    /// Inputs for the next stage message: source artifact first, then the
    /// outputs recorded so far, in stage order.
    pub fn input_refs(&self) -> Vec<ArtifactRef> {
        let mut refs = vec![self.source.clone()];
        refs.extend(self.outputs.in_order());
        refs
    }
}

/// Recompute a job's aggregate status from its pages. Pure; every mutation
/// path calls this rather than editing job status by hand.
pub fn aggregate_status(pages: &[PageWorkItem]) -> JobStatus {
    if pages.is_empty() {
        return JobStatus::Pending;
    }
    let mut failed = 0usize;
    for page in pages {
        match page.phase {
            PagePhase::Done => {}
            PagePhase::Failed => failed += 1,
            _ => return JobStatus::Running,
        }
    }
    if failed == 0 {
        JobStatus::Completed
    } else if failed == pages.len() {
        JobStatus::Failed
    } else {
        JobStatus::Partial
    }
}
