//! Job records, per-job-type options and retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use delegate_core::{BatchId, InvocationError, JobId};

/// Queue used when a job type does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// How a delegate job type treats batches when it executes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    /// Runs regardless of batch membership; nested work starts detached.
    #[default]
    Standalone,
    /// Runs only while its batch is live; nested work starts detached.
    BatchGated,
    /// Runs only while its batch is live; nested work joins that same batch.
    Contained,
}

/// Job execution status as tracked by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed by a worker
    Enqueued,
    /// Claimed and executing
    Running,
    /// Finished
    Completed,
    /// Misconfigured; never retried
    FailedFatal { error: String },
    /// Handler failed; rescheduled by the retry policy
    FailedRetryable { error: String, attempt: u32 },
    /// Retries exhausted
    Dead { error: String, attempts: u32 },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::FailedFatal { .. } | JobStatus::Dead { .. }
        )
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, JobStatus::FailedRetryable { .. })
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed,
    /// base * 2^(attempt-1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// Retry policy of a job type. Applied by the engine, never by the delegate layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts before the job dies (0 = die on first failure)
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 60_000,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        Self {
            max_attempts,
            base_delay_ms: ms,
            max_delay_ms: ms,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Delay before the retry following `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.base_delay_ms as f64;
        let cap = self.max_delay_ms as f64;
        let delay = match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Exponential => {
                let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                (base * 2_f64.powi(exp)).min(cap)
            }
            BackoffStrategy::Linear => (base * attempt as f64).min(cap),
        };

        // deterministic per attempt so schedules are reproducible
        let spread = delay * self.jitter;
        let offset = if spread > 0.0 {
            let unit = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            spread * (unit - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay + offset).max(0.0) as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Per-job-type configuration, read by the enqueuer and handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub queue: String,
    pub retry: RetryPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl JobOptions {
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// What the engine tells a job about the run it is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobContext {
    pub job_id: JobId,
    pub batch: Option<BatchId>,
    pub attempt: u32,
}

impl JobContext {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            batch: None,
            attempt: 1,
        }
    }

    pub fn in_batch(mut self, batch: BatchId) -> Self {
        self.batch = Some(batch);
        self
    }
}

/// Result of a job run that the engine must treat as finished (no retry).
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The delegate ran and returned this value.
    Completed(Value),
    /// The payload could not be turned into a valid invocation.
    Misconfigured(InvocationError),
    /// The job's batch is gone; nothing was run.
    Discarded,
}

/// One stored job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Job type identity
    pub class: String,
    pub queue: String,
    /// Wire record of the invocation
    pub payload: Value,
    pub batch: Option<BatchId>,
    pub status: JobStatus,
    pub retry_policy: RetryPolicy,
    /// Current attempt number (starts at 0)
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time of the next run, when delayed by backoff
    pub scheduled_at: Option<DateTime<Utc>>,
    pub history: Vec<JobAttemptRecord>,
    /// Engine-assigned FIFO position
    pub sequence: u64,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl JobRecord {
    pub fn new(class: impl Into<String>, queue: impl Into<String>, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            class: class.into(),
            queue: queue.into(),
            payload,
            batch: None,
            status: JobStatus::Enqueued,
            retry_policy: RetryPolicy::default(),
            attempt: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            history: Vec::new(),
            sequence: 0,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn in_batch(mut self, batch: Option<BatchId>) -> Self {
        self.batch = batch;
        self
    }

    pub fn context(&self) -> JobContext {
        JobContext {
            job_id: self.id,
            batch: self.batch,
            attempt: self.attempt,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.scheduled_at.is_none_or(|at| Utc::now() >= at)
    }

    pub fn is_claimable(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Enqueued | JobStatus::FailedRetryable { .. }
        ) && self.is_ready()
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.updated_at = Utc::now();
    }

    pub fn mark_completed(&mut self, started_at: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.record_attempt(started_at, None);
    }

    /// Non-retryable failure; the job is finished.
    pub fn mark_failed_fatal(&mut self, error: String, started_at: DateTime<Utc>) {
        self.record_attempt(started_at, Some(error.clone()));
        self.status = JobStatus::FailedFatal { error };
    }

    /// Retryable failure: reschedule with backoff, or die when attempts run out.
    pub fn mark_failed(&mut self, error: String, started_at: DateTime<Utc>) {
        let now = self.record_attempt(started_at, Some(error.clone()));

        if self.retry_policy.should_retry(self.attempt) {
            let delay = self.retry_policy.delay_for_attempt(self.attempt);
            let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
            // past the calendar's end the retry is parked at the latest instant
            self.scheduled_at = Some(
                now.checked_add_signed(delay)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            );
            self.status = JobStatus::FailedRetryable {
                error,
                attempt: self.attempt,
            };
        } else {
            self.status = JobStatus::Dead {
                error,
                attempts: self.attempt,
            };
        }
    }

    fn record_attempt(&mut self, started_at: DateTime<Utc>, error: Option<String>) -> DateTime<Utc> {
        let now = Utc::now();
        self.updated_at = now;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: error.is_none(),
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
        now
    }
}
