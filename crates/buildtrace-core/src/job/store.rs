//! Job state store seam and the in-memory reference implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::artifact::ArtifactRef;
use crate::message::Stage;

use super::{aggregate_status, Job, PagePhase, PageWorkItem};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {message}")]
    Unavailable { message: String },
    #[error("job already exists: {job_id}")]
    DuplicateJob { job_id: String },
    #[error("page already exists: {job_id} page {page_number}")]
    DuplicatePage { job_id: String, page_number: u32 },
    #[error("job not found: {job_id}")]
    JobNotFound { job_id: String },
    #[error("page not found: {job_id} page {page_number}")]
    PageNotFound { job_id: String, page_number: u32 },
    #[error("illegal page transition: {from} -> {to}")]
    IllegalTransition { from: PagePhase, to: PagePhase },
}

/// What a successful compare-and-set writes.
#[derive(Debug, Clone)]
pub struct PageTransition {
    pub to: PagePhase,
    /// Output recorded for the stage that just finished.
    pub output: Option<(Stage, ArtifactRef)>,
    /// Delivery attempt observed for that stage.
    pub attempt: Option<(Stage, u32)>,
    pub error: Option<String>,
}

/// Result of the guarded page update.
#[derive(Debug, Clone)]
pub enum CasOutcome {
    /// Guard matched; the transition was written.
    Applied(PageWorkItem),
    /// The page was no longer in the expected phase; nothing was written.
    /// Carries the row as it already is. Duplicate deliveries land here.
    Stale(PageWorkItem),
}

impl CasOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, CasOutcome::Applied(_))
    }
}

/// Narrow persistence seam for jobs and pages. The guarded `advance_page`
/// is the pipeline's only serialization point for concurrent handlers.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: Job) -> Result<(), StoreError>;

    async fn insert_page(&self, page: PageWorkItem) -> Result<(), StoreError>;

    async fn job(&self, job_id: &str) -> Result<Option<Job>, StoreError>;

    async fn page(&self, job_id: &str, page_number: u32)
        -> Result<Option<PageWorkItem>, StoreError>;

    /// All pages of a job, ordered by page number.
    async fn pages(&self, job_id: &str) -> Result<Vec<PageWorkItem>, StoreError>;

    /// Compare-and-set: apply `transition` only if the page is currently in
    /// `expect`. The observe-and-write happens atomically; whichever of two
    /// duplicate handlers gets there first wins, the other sees `Stale`.
    async fn advance_page(
        &self,
        job_id: &str,
        page_number: u32,
        expect: PagePhase,
        transition: PageTransition,
    ) -> Result<CasOutcome, StoreError>;

    /// Recompute the job's aggregate status from its pages and persist it.
    /// Sets the completion time the first time the job goes terminal.
    async fn recompute_job_status(&self, job_id: &str) -> Result<Job, StoreError>;
}

/// In-memory store: flat maps behind one lock. The persistence technology
/// behind [`JobStore`] is an embedding decision; this implementation backs
/// tests and single-process runs.
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    inner: Arc<RwLock<StoreInner>>,
}

#[derive(Default)]
struct StoreInner {
    jobs: HashMap<String, Job>,
    pages: HashMap<(String, u32), PageWorkItem>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_job(&self, job: Job) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.jobs.contains_key(&job.id) {
            return Err(StoreError::DuplicateJob { job_id: job.id });
        }
        inner.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn insert_page(&self, page: PageWorkItem) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let key = (page.job_id.clone(), page.page_number);
        if inner.pages.contains_key(&key) {
            return Err(StoreError::DuplicatePage {
                job_id: page.job_id,
                page_number: page.page_number,
            });
        }
        inner.pages.insert(key, page);
        Ok(())
    }

    async fn job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.read().await.jobs.get(job_id).cloned())
    }

    async fn page(
        &self,
        job_id: &str,
        page_number: u32,
    ) -> Result<Option<PageWorkItem>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .pages
            .get(&(job_id.to_string(), page_number))
            .cloned())
    }

    async fn pages(&self, job_id: &str) -> Result<Vec<PageWorkItem>, StoreError> {
        let mut pages: Vec<PageWorkItem> = self
            .inner
            .read()
            .await
            .pages
            .values()
            .filter(|page| page.job_id == job_id)
            .cloned()
            .collect();
        pages.sort_by_key(|page| page.page_number);
        Ok(pages)
    }

    async fn advance_page(
        &self,
        job_id: &str,
        page_number: u32,
        expect: PagePhase,
        transition: PageTransition,
    ) -> Result<CasOutcome, StoreError> {
        if !expect.can_advance_to(transition.to) {
            return Err(StoreError::IllegalTransition {
                from: expect,
                to: transition.to,
            });
        }

        let mut inner = self.inner.write().await;
        let key = (job_id.to_string(), page_number);
        let page = inner.pages.get_mut(&key).ok_or(StoreError::PageNotFound {
            job_id: key.0.clone(),
            page_number,
        })?;

        if page.phase != expect {
            return Ok(CasOutcome::Stale(page.clone()));
        }

        page.phase = transition.to;
        if let Some((stage, output)) = transition.output {
            page.outputs.set(stage, output);
        }
        if let Some((stage, attempt)) = transition.attempt {
            page.attempts.record(stage, attempt);
        }
        if transition.error.is_some() {
            page.last_error = transition.error;
        }
        Ok(CasOutcome::Applied(page.clone()))
    }

    async fn recompute_job_status(&self, job_id: &str) -> Result<Job, StoreError> {
        let mut inner = self.inner.write().await;
        let pages: Vec<PageWorkItem> = inner
            .pages
            .values()
            .filter(|page| page.job_id == job_id)
            .cloned()
            .collect();
        let status = aggregate_status(&pages);

        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
        job.status = status;
        if status.is_terminal() && job.completed_at.is_none() {
            job.completed_at = Some(Utc::now().to_rfc3339());
        }
        Ok(job.clone())
    }
}
