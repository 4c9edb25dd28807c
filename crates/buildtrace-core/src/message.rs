//! Wire types moving between the orchestrator and stage workers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactRef;

/// Processing stage in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Ocr,
    Diff,
    Summary,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Ocr, Stage::Diff, Stage::Summary];

    /// Topic this stage's workers consume.
    pub fn topic(&self) -> &'static str {
        match self {
            Stage::Ocr => "ocr",
            Stage::Diff => "diff",
            Stage::Summary => "summary",
        }
    }

    /// The stage after this one, if any.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Ocr => Some(Stage::Diff),
            Stage::Diff => Some(Stage::Summary),
            Stage::Summary => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.topic())
    }
}

/// Deterministic identifier for one (job, page, stage) slot; duplicates of a
/// completion event share it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(job_id: &str, page_number: u32, stage: Stage) -> Self {
        let digest = blake3::hash(format!("{job_id}/{page_number}/{stage}").as_bytes());
        Self(digest.to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload published to a stage topic: one unit of work for one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMessage {
    pub job_id: String,
    /// 1-based.
    pub page_number: u32,
    pub stage: Stage,
    /// Publish attempt; delivery attempts are counted by the transport.
    pub attempt: u32,
    /// Source artifact first, then outputs of the stages already completed,
    /// in stage order.
    pub input_refs: Vec<ArtifactRef>,
    pub idempotency_key: IdempotencyKey,
}

impl StageMessage {
    pub fn new(
        job_id: impl Into<String>,
        page_number: u32,
        stage: Stage,
        input_refs: Vec<ArtifactRef>,
    ) -> Self {
        let job_id = job_id.into();
        let idempotency_key = IdempotencyKey::derive(&job_id, page_number, stage);
        Self {
            job_id,
            page_number,
            stage,
            attempt: 1,
            input_refs,
            idempotency_key,
        }
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// How one worker invocation ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Success { output: ArtifactRef },
    PermanentFailure { reason: String },
}

/// Payload published to the completions topic after a worker invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub job_id: String,
    pub page_number: u32,
    pub stage: Stage,
    /// Delivery attempt of the input message that produced this result.
    pub attempt: u32,
    pub outcome: StageOutcome,
    pub duration_ms: u64,
    pub idempotency_key: IdempotencyKey,
}

impl StageResult {
    pub fn success(
        message: &StageMessage,
        attempt: u32,
        output: ArtifactRef,
        duration_ms: u64,
    ) -> Self {
        Self {
            job_id: message.job_id.clone(),
            page_number: message.page_number,
            stage: message.stage,
            attempt,
            outcome: StageOutcome::Success { output },
            duration_ms,
            idempotency_key: message.idempotency_key.clone(),
        }
    }

    pub fn permanent_failure(
        message: &StageMessage,
        attempt: u32,
        reason: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            job_id: message.job_id.clone(),
            page_number: message.page_number,
            stage: message.stage,
            attempt,
            outcome: StageOutcome::PermanentFailure {
                reason: reason.into(),
            },
            duration_ms,
            idempotency_key: message.idempotency_key.clone(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}
