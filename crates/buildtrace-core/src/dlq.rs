//! Dead-letter drains.
//!
//! A message that exhausts its delivery ceiling, or is rejected outright,
//! lands on the dead-letter topic paired with its source topic. One drain
//! task per topic turns each dead letter into a permanent page failure on
//! the orchestrator. The store's compare-and-set makes a duplicate or late
//! report a no-op, so the drain itself stays oblivious to ordering.

use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::message::Stage;
use crate::orchestrator::Orchestrator;
use crate::queue::{
    dead_letter_topic, QueueError, QueueTransport, Subscription, COMPLETIONS_TOPIC,
};

/// The addressing fields shared by both wire payloads. Decoding ignores the
/// rest, so one envelope serves stage messages and completion reports alike.
#[derive(Debug, Deserialize)]
struct DeadLetterEnvelope {
    job_id: String,
    page_number: u32,
    stage: Stage,
}

/// Consume one dead-letter topic until cancelled.
pub async fn run_dead_letter_drain(
    source_topic: String,
    orchestrator: Arc<Orchestrator>,
    subscription: Arc<dyn Subscription>,
    cancel: CancellationToken,
) {
    tracing::debug!(topic = %source_topic, "Dead-letter drain started");

    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            delivery = subscription.next() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let envelope: DeadLetterEnvelope = match serde_json::from_slice(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                // No job to attribute this to; drop it with a trace.
                tracing::error!(
                    topic = %source_topic,
                    error = %e,
                    "Unaddressable dead letter dropped"
                );
                if let Err(e) = subscription.ack(delivery.receipt).await {
                    tracing::debug!(error = %e, "Ack failed");
                }
                continue;
            }
        };

        let reason = format!("delivery attempts exhausted on {source_topic}");
        match orchestrator
            .on_stage_failed_permanently(
                &envelope.job_id,
                envelope.page_number,
                envelope.stage,
                &reason,
            )
            .await
        {
            Ok(()) => {
                if let Err(e) = subscription.ack(delivery.receipt).await {
                    tracing::debug!(error = %e, "Ack failed");
                }
            }
            Err(e) => {
                tracing::error!(
                    job_id = %envelope.job_id,
                    page = envelope.page_number,
                    error = %e,
                    "Failed to record dead letter; leaving delivery for retry"
                );
            }
        }
    }

    tracing::debug!(topic = %source_topic, "Dead-letter drain stopped");
}

/// Spawn one drain per dead-letter topic: the three stage topics plus the
/// completions topic.
pub async fn spawn_dead_letter_drains(
    orchestrator: Arc<Orchestrator>,
    transport: Arc<dyn QueueTransport>,
    cancel: &CancellationToken,
) -> Result<(), QueueError> {
    let mut topics: Vec<&str> = Stage::ALL.iter().map(|stage| stage.topic()).collect();
    topics.push(COMPLETIONS_TOPIC);

    for topic in topics {
        let subscription = transport.subscribe(&dead_letter_topic(topic)).await?;
        tokio::spawn(run_dead_letter_drain(
            topic.to_string(),
            orchestrator.clone(),
            subscription,
            cancel.child_token(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactRef;
    use crate::job::store::{JobStore, MemoryJobStore};
    use crate::job::{JobStatus, PagePhase};
    use crate::message::StageMessage;
    use crate::orchestrator::JobRequest;
    use crate::queue::{MemoryTransport, QueueConfig};
    use std::time::Duration;

    async fn seeded_job(orchestrator: &Orchestrator) -> String {
        let job = orchestrator
            .create_job(JobRequest {
                session_id: "session-1".into(),
                pages: vec![ArtifactRef::new("src-1")],
            })
            .await
            .unwrap();
        job.id
    }

    async fn wait_for_phase(store: &MemoryJobStore, job_id: &str, phase: PagePhase) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let page = store.page(job_id, 1).await.unwrap().unwrap();
            if page.phase == phase {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "page never reached {phase}, stuck at {}",
                page.phase
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn dead_letter_fails_the_page_with_an_exhaustion_reason() {
        let store = MemoryJobStore::new();
        let transport = Arc::new(MemoryTransport::new(QueueConfig::default()));
        let (orchestrator, _events) =
            Orchestrator::new(Arc::new(store.clone()), transport.clone(), 10);
        let orchestrator = Arc::new(orchestrator);
        let job_id = seeded_job(&orchestrator).await;

        let cancel = CancellationToken::new();
        spawn_dead_letter_drains(orchestrator.clone(), transport.clone(), &cancel)
            .await
            .unwrap();

        // The transport would route an exhausted OCR message here.
        let message = StageMessage::new(&job_id, 1, Stage::Ocr, vec![ArtifactRef::new("src-1")]);
        transport
            .publish(&dead_letter_topic(Stage::Ocr.topic()), message.encode().unwrap())
            .await
            .unwrap();

        wait_for_phase(&store, &job_id, PagePhase::Failed).await;
        let page = store.page(&job_id, 1).await.unwrap().unwrap();
        assert_eq!(
            page.last_error.as_deref(),
            Some("delivery attempts exhausted on ocr")
        );
        let job = store.job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        cancel.cancel();
    }

    #[tokio::test]
    async fn unaddressable_dead_letter_does_not_wedge_the_drain() {
        let store = MemoryJobStore::new();
        let transport = Arc::new(MemoryTransport::new(QueueConfig::default()));
        let (orchestrator, _events) =
            Orchestrator::new(Arc::new(store.clone()), transport.clone(), 10);
        let orchestrator = Arc::new(orchestrator);
        let job_id = seeded_job(&orchestrator).await;

        let cancel = CancellationToken::new();
        spawn_dead_letter_drains(orchestrator.clone(), transport.clone(), &cancel)
            .await
            .unwrap();

        let dlq = dead_letter_topic(Stage::Ocr.topic());
        transport
            .publish(&dlq, bytes::Bytes::from_static(b"{{{"))
            .await
            .unwrap();
        // A valid dead letter behind garbage still gets through.
        let message = StageMessage::new(&job_id, 1, Stage::Ocr, vec![ArtifactRef::new("src-1")]);
        transport
            .publish(&dlq, message.encode().unwrap())
            .await
            .unwrap();

        wait_for_phase(&store, &job_id, PagePhase::Failed).await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn duplicate_dead_letters_are_discarded() {
        let store = MemoryJobStore::new();
        let transport = Arc::new(MemoryTransport::new(QueueConfig::default()));
        let (orchestrator, _events) =
            Orchestrator::new(Arc::new(store.clone()), transport.clone(), 10);
        let orchestrator = Arc::new(orchestrator);
        let job_id = seeded_job(&orchestrator).await;

        let cancel = CancellationToken::new();
        spawn_dead_letter_drains(orchestrator.clone(), transport.clone(), &cancel)
            .await
            .unwrap();

        let message = StageMessage::new(&job_id, 1, Stage::Ocr, vec![ArtifactRef::new("src-1")]);
        let dlq = dead_letter_topic(Stage::Ocr.topic());
        for _ in 0..2 {
            transport
                .publish(&dlq, message.encode().unwrap())
                .await
                .unwrap();
        }

        wait_for_phase(&store, &job_id, PagePhase::Failed).await;
        // Drain time for the duplicate, then confirm nothing changed.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let job = store.job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        cancel.cancel();
    }
}
