//! BuildTrace Core - Asynchronous comparison pipeline for scanned drawings
//!
//! This crate contains the orchestration machinery for BuildTrace's
//! page-by-page comparison flow:
//! - Job orchestration and aggregate status (pending/running/completed/failed/partial)
//! - Stage workers (OCR, diff, summary) consuming an at-least-once queue
//! - Job state store with compare-and-set stage progression
//! - In-process queue transport with visibility timeouts, redelivery backoff,
//!   and paired dead-letter topics
//! - Dead-letter drains that turn exhausted messages into page failures
//!
//! Pages progress independently: one unreadable page ends in `failed` while
//! the rest of its job completes, leaving the job `partial` rather than dead.

pub mod artifact;
pub mod config;
pub mod dlq;
pub mod error;
pub mod job;
pub mod message;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod worker;

pub use artifact::{ArtifactRef, ArtifactStore, FsArtifactStore};
pub use config::PipelineConfig;
pub use error::CoreError;
pub use job::store::{JobStore, MemoryJobStore};
pub use job::{Job, JobStatus, PagePhase, PageWorkItem};
pub use message::{Stage, StageMessage, StageOutcome, StageResult};
pub use orchestrator::{JobEvent, JobRequest, JobSnapshot, Orchestrator};
pub use pipeline::{ComparisonPipeline, StageExecutors};
pub use queue::{MemoryTransport, QueueConfig, QueueTransport, Subscription};
pub use worker::{StageError, StageExecutor};
