//! Submission side of the queue engine.

use std::sync::Arc;

use delegate_core::{BatchId, JobId, SerializedInvocation};

use crate::types::RetryPolicy;

/// Single-job submission.
#[derive(Debug, Clone, PartialEq)]
pub struct PushRequest {
    /// Job type identity
    pub class: String,
    pub queue: String,
    pub args: SerializedInvocation,
    /// Batch the job becomes a member of
    pub batch: Option<BatchId>,
    pub retry: RetryPolicy,
}

/// Bulk submission: one job per element, all sharing class, queue and batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkPushRequest {
    pub class: String,
    pub queue: String,
    pub args: Vec<SerializedInvocation>,
    pub batch: Option<BatchId>,
    pub retry: RetryPolicy,
}

/// Queue engine error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),
    #[error("batch invalidated: {0}")]
    BatchInvalidated(BatchId),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("engine state lock poisoned")]
    Poisoned,
    #[error("storage error: {0}")]
    Storage(String),
}

/// Client of the external queue engine.
///
/// Implementations must be safe to call concurrently from many enqueuers and workers.
pub trait QueueClient: Send + Sync {
    /// Submit one job.
    fn push(&self, request: PushRequest) -> Result<JobId, EngineError>;

    /// Submit many jobs in one call.
    fn push_bulk(&self, request: BulkPushRequest) -> Result<Vec<JobId>, EngineError>;
}

impl<T: QueueClient + ?Sized> QueueClient for Arc<T> {
    fn push(&self, request: PushRequest) -> Result<JobId, EngineError> {
        (**self).push(request)
    }

    fn push_bulk(&self, request: BulkPushRequest) -> Result<Vec<JobId>, EngineError> {
        (**self).push_bulk(request)
    }
}
