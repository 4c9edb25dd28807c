//! Assembly of a running pipeline.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::dlq::spawn_dead_letter_drains;
use crate::job::store::JobStore;
use crate::message::Stage;
use crate::orchestrator::{run_completion_consumer, JobEvent, Orchestrator};
use crate::queue::{QueueTransport, COMPLETIONS_TOPIC};
use crate::worker::{spawn_stage_workers, StageExecutor};

/// One executor per stage.
#[derive(Clone)]
pub struct StageExecutors {
    pub ocr: Arc<dyn StageExecutor>,
    pub diff: Arc<dyn StageExecutor>,
    pub summary: Arc<dyn StageExecutor>,
}

impl StageExecutors {
    fn for_stage(&self, stage: Stage) -> Arc<dyn StageExecutor> {
        match stage {
            Stage::Ocr => self.ocr.clone(),
            Stage::Diff => self.diff.clone(),
            Stage::Summary => self.summary.clone(),
        }
    }
}

/// A fully wired pipeline: stage worker pools, the completion consumer, and
/// the dead-letter drains, all bound to one cancellation token. Dropping the
/// pipeline (or calling [`shutdown`](Self::shutdown)) stops every task.
pub struct ComparisonPipeline {
    orchestrator: Arc<Orchestrator>,
    cancel: CancellationToken,
}

impl ComparisonPipeline {
    pub async fn start(
        config: PipelineConfig,
        store: Arc<dyn JobStore>,
        transport: Arc<dyn QueueTransport>,
        executors: StageExecutors,
    ) -> anyhow::Result<(Self, mpsc::Receiver<JobEvent>)> {
        let cancel = CancellationToken::new();
        let (orchestrator, events) =
            Orchestrator::new(store, transport.clone(), config.max_pages_per_job);
        let orchestrator = Arc::new(orchestrator);

        for stage in Stage::ALL {
            let subscription = transport.subscribe(stage.topic()).await?;
            spawn_stage_workers(
                config.workers_for(stage),
                stage,
                subscription,
                transport.clone(),
                executors.for_stage(stage),
                config.stage_timeout,
                cancel.child_token(),
            );
        }

        let completions = transport.subscribe(COMPLETIONS_TOPIC).await?;
        tokio::spawn(run_completion_consumer(
            orchestrator.clone(),
            completions,
            cancel.child_token(),
        ));

        spawn_dead_letter_drains(orchestrator.clone(), transport, &cancel).await?;

        tracing::info!(
            ocr_workers = config.ocr_workers,
            diff_workers = config.diff_workers,
            summary_workers = config.summary_workers,
            "Comparison pipeline started"
        );
        Ok((
            Self {
                orchestrator,
                cancel,
            },
            events,
        ))
    }

    /// The orchestration API: create jobs and query their status.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ComparisonPipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
