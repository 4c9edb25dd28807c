//! Generic stage worker harness.
//!
//! One harness serves all three stages; the stage-specific work lives behind
//! [`StageExecutor`]. Workers hold no state between messages, so any number
//! of them can consume one topic and a crashed worker's unacked delivery
//! simply reappears for another instance.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::artifact::ArtifactRef;
use crate::message::{Stage, StageMessage, StageResult};
use crate::queue::{Delivery, QueueTransport, Subscription, COMPLETIONS_TOPIC};

/// Failure classification for one executor invocation.
#[derive(Debug, Error)]
pub enum StageError {
    /// Retryable; redelivery will try again, bounded by the delivery ceiling.
    #[error("transient stage failure: {0}")]
    Transient(anyhow::Error),
    /// Not retryable; the page terminates through the failure path.
    #[error("permanent stage failure: {reason}")]
    Permanent { reason: String },
}

impl StageError {
    pub fn transient(cause: impl Into<anyhow::Error>) -> Self {
        StageError::Transient(cause.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        StageError::Permanent {
            reason: reason.into(),
        }
    }
}

/// One stage's opaque per-page operation.
///
/// Implementations read their inputs through the artifact store referenced
/// by `message.input_refs` and write one output artifact, returning its
/// locator.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, message: &StageMessage) -> Result<ArtifactRef, StageError>;
}

/// Spawn `count` workers consuming `stage`'s topic.
pub fn spawn_stage_workers(
    count: usize,
    stage: Stage,
    subscription: Arc<dyn Subscription>,
    transport: Arc<dyn QueueTransport>,
    executor: Arc<dyn StageExecutor>,
    stage_timeout: Duration,
    cancel: CancellationToken,
) {
    for i in 0..count {
        let subscription = subscription.clone();
        let transport = transport.clone();
        let executor = executor.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            tracing::debug!(worker = i, stage = %stage, "Stage worker started");

            loop {
                let delivery = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    delivery = subscription.next() => match delivery {
                        Some(delivery) => delivery,
                        None => break,
                    },
                };
                handle_delivery(
                    stage,
                    &*subscription,
                    &*transport,
                    &*executor,
                    stage_timeout,
                    delivery,
                )
                .await;
            }

            tracing::debug!(worker = i, stage = %stage, "Stage worker stopped");
        });
    }
}

async fn handle_delivery(
    stage: Stage,
    subscription: &dyn Subscription,
    transport: &dyn QueueTransport,
    executor: &dyn StageExecutor,
    stage_timeout: Duration,
    delivery: Delivery,
) {
    let message = match StageMessage::decode(&delivery.payload) {
        Ok(message) if message.stage == stage => message,
        Ok(message) => {
            tracing::warn!(
                expected = %stage,
                got = %message.stage,
                job_id = %message.job_id,
                "Message addressed to the wrong stage; rejecting"
            );
            reject(subscription, &delivery).await;
            return;
        }
        Err(e) => {
            tracing::warn!(stage = %stage, error = %e, "Poison message; rejecting");
            reject(subscription, &delivery).await;
            return;
        }
    };

    let started = tokio::time::Instant::now();
    let result = match tokio::time::timeout(stage_timeout, executor.execute(&message)).await {
        Ok(result) => result,
        Err(_) => Err(StageError::transient(anyhow::anyhow!(
            "stage timed out after {stage_timeout:?}"
        ))),
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(output) => {
            let completion = StageResult::success(&message, delivery.attempt, output, duration_ms);
            // The completion must be on the wire before the input is acked;
            // a duplicate completion is safe, a lost one is not.
            match publish_completion(transport, &completion).await {
                Ok(()) => {
                    acknowledge(subscription, &delivery).await;
                    tracing::debug!(
                        job_id = %message.job_id,
                        page = message.page_number,
                        stage = %stage,
                        duration_ms,
                        "Stage completed"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        job_id = %message.job_id,
                        page = message.page_number,
                        stage = %stage,
                        error = %e,
                        "Failed to publish completion; leaving delivery for retry"
                    );
                }
            }
        }
        Err(StageError::Transient(cause)) => {
            // No ack: the transport redelivers up to the delivery ceiling.
            tracing::warn!(
                job_id = %message.job_id,
                page = message.page_number,
                stage = %stage,
                attempt = delivery.attempt,
                error = %cause,
                "Transient stage failure; awaiting redelivery"
            );
        }
        Err(StageError::Permanent { reason }) => {
            let completion =
                StageResult::permanent_failure(&message, delivery.attempt, &reason, duration_ms);
            match publish_completion(transport, &completion).await {
                Ok(()) => {
                    acknowledge(subscription, &delivery).await;
                    tracing::warn!(
                        job_id = %message.job_id,
                        page = message.page_number,
                        stage = %stage,
                        reason = %reason,
                        "Permanent stage failure reported"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        job_id = %message.job_id,
                        page = message.page_number,
                        stage = %stage,
                        error = %e,
                        "Failed to publish failure report; leaving delivery for retry"
                    );
                }
            }
        }
    }
}

async fn publish_completion(
    transport: &dyn QueueTransport,
    completion: &StageResult,
) -> anyhow::Result<()> {
    let payload = completion.encode()?;
    transport.publish(COMPLETIONS_TOPIC, payload).await?;
    Ok(())
}

async fn acknowledge(subscription: &dyn Subscription, delivery: &Delivery) {
    if let Err(e) = subscription.ack(delivery.receipt).await {
        // Visibility expired first; the redelivery no-ops downstream.
        tracing::debug!(error = %e, "Ack failed");
    }
}

async fn reject(subscription: &dyn Subscription, delivery: &Delivery) {
    if let Err(e) = subscription.nack(delivery.receipt).await {
        tracing::debug!(error = %e, "Nack failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StageOutcome;
    use crate::queue::{BackoffPolicy, MemoryTransport, QueueConfig};

    enum Script {
        Succeed,
        Transient,
        Permanent(&'static str),
        Stall(Duration),
    }

    struct ScriptedExecutor {
        script: Script,
    }

    #[async_trait]
    impl StageExecutor for ScriptedExecutor {
        async fn execute(&self, message: &StageMessage) -> Result<ArtifactRef, StageError> {
            match &self.script {
                Script::Succeed => Ok(ArtifactRef::new(format!(
                    "out-{}-{}",
                    message.stage, message.page_number
                ))),
                Script::Transient => Err(StageError::transient(anyhow::anyhow!("engine busy"))),
                Script::Permanent(reason) => Err(StageError::permanent(*reason)),
                Script::Stall(how_long) => {
                    tokio::time::sleep(*how_long).await;
                    Ok(ArtifactRef::new("late"))
                }
            }
        }
    }

    struct Harness {
        transport: Arc<MemoryTransport>,
        completions: Arc<dyn Subscription>,
        cancel: CancellationToken,
    }

    async fn start_worker(script: Script, stage_timeout: Duration, visibility_ms: u64) -> Harness {
        let transport = Arc::new(MemoryTransport::new(QueueConfig {
            max_delivery_attempts: 3,
            visibility_timeout: Duration::from_millis(visibility_ms),
            redelivery_backoff: BackoffPolicy::none(),
        }));
        let subscription = transport.subscribe(Stage::Ocr.topic()).await.unwrap();
        let completions = transport.subscribe(COMPLETIONS_TOPIC).await.unwrap();
        let cancel = CancellationToken::new();

        spawn_stage_workers(
            1,
            Stage::Ocr,
            subscription,
            transport.clone(),
            Arc::new(ScriptedExecutor { script }),
            stage_timeout,
            cancel.clone(),
        );

        Harness {
            transport,
            completions,
            cancel,
        }
    }

    async fn publish_work(harness: &Harness) -> StageMessage {
        let message = StageMessage::new("job-1", 1, Stage::Ocr, vec![ArtifactRef::new("src")]);
        harness
            .transport
            .publish(Stage::Ocr.topic(), message.encode().unwrap())
            .await
            .unwrap();
        message
    }

    async fn next_within(sub: &Arc<dyn Subscription>, ms: u64) -> Option<Delivery> {
        tokio::time::timeout(Duration::from_millis(ms), sub.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn success_publishes_completion_and_acks() {
        let harness = start_worker(Script::Succeed, Duration::from_secs(5), 5000).await;
        let message = publish_work(&harness).await;

        let delivery = next_within(&harness.completions, 2000).await.unwrap();
        let completion = StageResult::decode(&delivery.payload).unwrap();
        assert_eq!(completion.job_id, "job-1");
        assert_eq!(completion.stage, Stage::Ocr);
        assert_eq!(completion.idempotency_key, message.idempotency_key);
        assert!(matches!(completion.outcome, StageOutcome::Success { .. }));

        // Acked: nothing left on the stage topic.
        assert_eq!(harness.transport.depth(Stage::Ocr.topic()).await, 0);
        harness.cancel.cancel();
    }

    #[tokio::test]
    async fn transient_failure_leaves_delivery_unacked() {
        let harness = start_worker(Script::Transient, Duration::from_secs(5), 60).await;
        publish_work(&harness).await;

        // Wait for the worker to consume the first delivery, then stop it so
        // the redelivery stays observable on the topic.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while harness.transport.depth(Stage::Ocr.topic()).await > 0 {
            assert!(tokio::time::Instant::now() < deadline, "never consumed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        harness.cancel.cancel();

        // No completion was published, and the visibility sweep puts the
        // message back for another attempt.
        assert!(next_within(&harness.completions, 200).await.is_none());
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while harness.transport.depth(Stage::Ocr.topic()).await == 0 {
            assert!(tokio::time::Instant::now() < deadline, "never requeued");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn permanent_failure_reports_and_acks() {
        let harness = start_worker(
            Script::Permanent("unsupported content"),
            Duration::from_secs(5),
            5000,
        )
        .await;
        publish_work(&harness).await;

        let delivery = next_within(&harness.completions, 2000).await.unwrap();
        let completion = StageResult::decode(&delivery.payload).unwrap();
        match completion.outcome {
            StageOutcome::PermanentFailure { reason } => {
                assert_eq!(reason, "unsupported content");
            }
            other => panic!("expected permanent failure, got {other:?}"),
        }
        assert_eq!(harness.transport.depth(Stage::Ocr.topic()).await, 0);
        harness.cancel.cancel();
    }

    #[tokio::test]
    async fn poison_message_is_rejected_to_dead_letter() {
        let harness = start_worker(Script::Succeed, Duration::from_secs(5), 5000).await;
        let dlq = harness
            .transport
            .subscribe(&crate::queue::dead_letter_topic(Stage::Ocr.topic()))
            .await
            .unwrap();

        harness
            .transport
            .publish(Stage::Ocr.topic(), bytes::Bytes::from_static(b"not json"))
            .await
            .unwrap();

        let dead = next_within(&dlq, 2000).await.unwrap();
        assert_eq!(&dead.payload[..], b"not json");
        assert!(next_within(&harness.completions, 200).await.is_none());
        harness.cancel.cancel();
    }

    #[tokio::test]
    async fn wrong_stage_message_is_rejected() {
        let harness = start_worker(Script::Succeed, Duration::from_secs(5), 5000).await;
        let dlq = harness
            .transport
            .subscribe(&crate::queue::dead_letter_topic(Stage::Ocr.topic()))
            .await
            .unwrap();

        // A diff message on the ocr topic is structurally invalid here.
        let message = StageMessage::new("job-1", 1, Stage::Diff, vec![ArtifactRef::new("src")]);
        harness
            .transport
            .publish(Stage::Ocr.topic(), message.encode().unwrap())
            .await
            .unwrap();

        assert!(next_within(&dlq, 2000).await.is_some());
        assert!(next_within(&harness.completions, 200).await.is_none());
        harness.cancel.cancel();
    }

    #[tokio::test]
    async fn timeout_classifies_as_transient() {
        let harness = start_worker(
            Script::Stall(Duration::from_secs(10)),
            Duration::from_millis(50),
            5000,
        )
        .await;
        publish_work(&harness).await;

        // Timed out before producing anything: no completion published.
        assert!(next_within(&harness.completions, 500).await.is_none());
        harness.cancel.cancel();
    }
}
