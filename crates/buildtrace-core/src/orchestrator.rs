//! Job orchestration: create jobs, apply stage completions, answer status
//! queries.
//!
//! The orchestrator is the only writer of job state. Workers never touch the
//! store; they publish a [`StageResult`] to the completions topic and the
//! consumer here folds it in. Progression is per page, so one page failing
//! permanently leaves the rest of its job moving.

use std::sync::Arc;

use futures::future::try_join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::artifact::ArtifactRef;
use crate::error::CoreError;
use crate::job::store::{CasOutcome, JobStore, PageTransition};
use crate::job::{Job, JobStatus, PagePhase, PageWorkItem};
use crate::message::{Stage, StageMessage, StageOutcome, StageResult};
use crate::queue::{QueueTransport, Subscription};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One comparison request: a source artifact per page, in page order.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub session_id: String,
    pub pages: Vec<ArtifactRef>,
}

/// Point-in-time view of a job and its per-page breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job: Job,
    pub pages: Vec<PageWorkItem>,
}

/// Emitted on the notification channel after every status re-evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobEvent {
    pub job_id: String,
    pub status: JobStatus,
}

pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    transport: Arc<dyn QueueTransport>,
    max_pages_per_job: u32,
    notify_tx: mpsc::Sender<JobEvent>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        transport: Arc<dyn QueueTransport>,
        max_pages_per_job: u32,
    ) -> (Self, mpsc::Receiver<JobEvent>) {
        let (notify_tx, notify_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            Self {
                store,
                transport,
                max_pages_per_job,
                notify_tx,
            },
            notify_rx,
        )
    }

    /// Validate, persist, then publish. Persistence failures surface as
    /// [`CoreError::StorageUnavailable`] before anything reaches the queue,
    /// so a rejected job leaves no stray messages behind.
    pub async fn create_job(&self, request: JobRequest) -> Result<Job, CoreError> {
        if request.pages.is_empty() {
            return Err(CoreError::invalid_input("a job needs at least one page"));
        }
        if request.pages.len() > self.max_pages_per_job as usize {
            return Err(CoreError::invalid_input(format!(
                "{} pages exceeds the limit of {}",
                request.pages.len(),
                self.max_pages_per_job
            )));
        }

        let job = Job::new(
            Uuid::new_v4().to_string(),
            &request.session_id,
            request.pages.len() as u32,
        );
        self.store.insert_job(job.clone()).await?;

        let mut items = Vec::with_capacity(request.pages.len());
        for (index, source) in request.pages.into_iter().enumerate() {
            let page = PageWorkItem::new(&job.id, index as u32 + 1, source);
            self.store.insert_page(page.clone()).await?;
            items.push(page);
        }

        // Every page is persisted at this point; fan the first stage out.
        try_join_all(
            items
                .iter()
                .map(|page| self.publish_stage(page, Stage::Ocr)),
        )
        .await?;

        let job = self.recompute_and_notify(&job.id).await?;
        tracing::info!(
            job_id = %job.id,
            session_id = %job.session_id,
            pages = job.page_count,
            "Job created"
        );
        Ok(job)
    }

    /// Fold one worker report into job state. Idempotent: a redelivered
    /// completion finds the page already advanced and is discarded without
    /// publishing anything further.
    pub async fn on_stage_completed(&self, result: &StageResult) -> Result<(), CoreError> {
        match &result.outcome {
            StageOutcome::Success { output } => self.apply_success(result, output.clone()).await,
            StageOutcome::PermanentFailure { reason } => {
                self.on_stage_failed_permanently(
                    &result.job_id,
                    result.page_number,
                    result.stage,
                    reason,
                )
                .await
            }
        }
    }

    async fn apply_success(
        &self,
        result: &StageResult,
        output: ArtifactRef,
    ) -> Result<(), CoreError> {
        let to = result
            .stage
            .next()
            .map(PagePhase::from)
            .unwrap_or(PagePhase::Done);
        let transition = PageTransition {
            to,
            output: Some((result.stage, output)),
            attempt: Some((result.stage, result.attempt)),
            error: None,
        };
        let outcome = self
            .store
            .advance_page(
                &result.job_id,
                result.page_number,
                PagePhase::from(result.stage),
                transition,
            )
            .await?;

        match outcome {
            CasOutcome::Applied(page) => {
                if let Some(next) = result.stage.next() {
                    self.publish_stage(&page, next).await?;
                }
                self.recompute_and_notify(&result.job_id).await?;
                tracing::debug!(
                    job_id = %result.job_id,
                    page = result.page_number,
                    stage = %result.stage,
                    advanced_to = %page.phase,
                    "Stage completion applied"
                );
            }
            CasOutcome::Stale(page) => {
                tracing::debug!(
                    job_id = %result.job_id,
                    page = result.page_number,
                    stage = %result.stage,
                    phase = %page.phase,
                    "Duplicate stage completion discarded"
                );
            }
        }
        Ok(())
    }

    /// Terminate one page with a reason. Reached from permanent-failure
    /// reports and from the dead-letter drains; duplicates and reports for
    /// pages that already reached a terminal phase are discarded.
    pub async fn on_stage_failed_permanently(
        &self,
        job_id: &str,
        page_number: u32,
        stage: Stage,
        reason: &str,
    ) -> Result<(), CoreError> {
        let transition = PageTransition {
            to: PagePhase::Failed,
            output: None,
            attempt: None,
            error: Some(reason.to_string()),
        };
        let outcome = self
            .store
            .advance_page(job_id, page_number, PagePhase::from(stage), transition)
            .await?;

        match outcome {
            CasOutcome::Applied(_) => {
                tracing::warn!(
                    job_id = %job_id,
                    page = page_number,
                    stage = %stage,
                    reason = %reason,
                    "Page failed permanently"
                );
                self.recompute_and_notify(job_id).await?;
            }
            CasOutcome::Stale(page) => {
                tracing::debug!(
                    job_id = %job_id,
                    page = page_number,
                    stage = %stage,
                    phase = %page.phase,
                    "Late failure report discarded"
                );
            }
        }
        Ok(())
    }

    /// Read-only snapshot; never blocks on in-flight work.
    pub async fn job_status(&self, job_id: &str) -> Result<JobSnapshot, CoreError> {
        let job = self
            .store
            .job(job_id)
            .await?
            .ok_or_else(|| CoreError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
        let pages = self.store.pages(job_id).await?;
        Ok(JobSnapshot { job, pages })
    }

    async fn publish_stage(&self, page: &PageWorkItem, stage: Stage) -> Result<(), CoreError> {
        let message = StageMessage::new(&page.job_id, page.page_number, stage, page.input_refs());
        let payload = message.encode()?;
        self.transport.publish(stage.topic(), payload).await?;
        Ok(())
    }

    async fn recompute_and_notify(&self, job_id: &str) -> Result<Job, CoreError> {
        let job = self.store.recompute_job_status(job_id).await?;
        let event = JobEvent {
            job_id: job.id.clone(),
            status: job.status,
        };
        // Observability only; a full channel must not stall orchestration.
        if let Err(e) = self.notify_tx.try_send(event) {
            tracing::debug!(job_id = %job_id, error = %e, "Job event dropped");
        }
        Ok(job)
    }
}

/// Consume the completions topic and apply each report. Malformed payloads
/// go to the paired dead-letter topic; reports the store refuses stay
/// unacked and come back with the next redelivery.
pub async fn run_completion_consumer(
    orchestrator: Arc<Orchestrator>,
    subscription: Arc<dyn Subscription>,
    cancel: CancellationToken,
) {
    tracing::debug!("Completion consumer started");

    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            delivery = subscription.next() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let result = match StageResult::decode(&delivery.payload) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, "Undecodable completion; rejecting");
                if let Err(e) = subscription.nack(delivery.receipt).await {
                    tracing::debug!(error = %e, "Nack failed");
                }
                continue;
            }
        };

        match orchestrator.on_stage_completed(&result).await {
            Ok(()) => {
                if let Err(e) = subscription.ack(delivery.receipt).await {
                    tracing::debug!(error = %e, "Ack failed");
                }
            }
            Err(e) => {
                tracing::error!(
                    job_id = %result.job_id,
                    page = result.page_number,
                    stage = %result.stage,
                    error = %e,
                    "Failed to apply stage completion; leaving delivery for retry"
                );
            }
        }
    }

    tracing::debug!("Completion consumer stopped");
}
