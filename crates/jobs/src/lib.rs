//! Delegate jobs on top of a queue engine.
//!
//! ## Design
//!
//! - A job type ([`DelegateJob`]) owns routing: class name, queue, retry policy, batch mode
//! - The work is always a [`DeferredInvocation`](delegate_core::DeferredInvocation)
//!   validated at enqueue and again at execution
//! - Misconfigured payloads finish as non-retryable; delegate failures go to the retry policy
//! - Batches group jobs; contained job types fold nested enqueues into their own batch
//!
//! ## Components
//!
//! - `QueueClient` / `BatchEngine`: what the delegate layer needs from an engine
//! - `InMemoryEngine`: engine implementation for tests/dev
//! - `JobExecutor`: local worker that claims and performs jobs

pub mod batch;
pub mod client;
pub mod delegate;
pub mod executor;
pub mod store;
pub mod types;

pub use batch::{Batch, BatchCallback, BatchEngine, BatchEvent, BatchState, BatchStatus};
pub use client::{BulkPushRequest, EngineError, PushRequest, QueueClient};
pub use delegate::{DelegateJob, EnqueueError, EnqueueOptions, IntoInvocations};
pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle};
pub use store::{InMemoryEngine, JobStats, JobStore};
pub use types::{
    BackoffStrategy, DEFAULT_QUEUE, JobAttemptRecord, JobContext, JobMode, JobOptions, JobOutcome,
    JobRecord, JobStatus, RetryPolicy,
};
