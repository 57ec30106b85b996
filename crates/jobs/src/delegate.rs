//! Delegate jobs: job types whose only work is calling a deferred invocation.
//!
//! A job type defines *where* and *how* work runs (class name, queue, retry
//! policy, batch mode). *What* runs is always a [`DeferredInvocation`] supplied by
//! the enqueuing code, so business logic and its call signature stay with the code
//! that owns them instead of being duplicated in a job definition.
//!
//! Enqueue validates before anything reaches the engine. Execution re-validates
//! (the payload may be older than the code now running) and classifies
//! misconfiguration as non-retryable.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use delegate_core::{
    CallContext, DeferredInvocation, InvocationError, InvocationResult, JobId, Registry,
    SerializedInvocation, decode_value, encode,
};

use crate::batch::{Batch, BatchEngine};
use crate::client::{BulkPushRequest, EngineError, PushRequest, QueueClient};
use crate::types::{JobContext, JobMode, JobOptions, JobOutcome};

/// Per-call enqueue options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Overrides the job type's default queue.
    pub queue: Option<String>,
    /// Active scope; its batch, if any, receives the new jobs.
    pub context: CallContext,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn within(context: &CallContext) -> Self {
        Self {
            queue: None,
            context: *context,
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }
}

/// Enqueue failure. Nothing was submitted when this is returned.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Invalid(#[from] InvocationError),
    #[error("bulk element {index} rejected: {source}")]
    InvalidElement {
        index: usize,
        #[source]
        source: InvocationError,
    },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Output of a bulk transform for one source element.
pub trait IntoInvocations {
    fn into_invocations(self) -> Vec<DeferredInvocation>;
}

impl IntoInvocations for DeferredInvocation {
    fn into_invocations(self) -> Vec<DeferredInvocation> {
        vec![self]
    }
}

impl IntoInvocations for Option<DeferredInvocation> {
    fn into_invocations(self) -> Vec<DeferredInvocation> {
        self.into_iter().collect()
    }
}

impl IntoInvocations for Vec<DeferredInvocation> {
    fn into_invocations(self) -> Vec<DeferredInvocation> {
        self
    }
}

/// A job type that delegates its work to deferred invocations.
#[derive(Clone)]
pub struct DelegateJob {
    class: String,
    options: JobOptions,
    mode: JobMode,
    registry: Registry,
    client: Arc<dyn QueueClient>,
    batches: Option<Arc<dyn BatchEngine>>,
}

impl DelegateJob {
    pub fn new(class: impl Into<String>, registry: Registry, client: Arc<dyn QueueClient>) -> Self {
        Self {
            class: class.into(),
            options: JobOptions::default(),
            mode: JobMode::Standalone,
            registry,
            client,
            batches: None,
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Only run while the job's batch is live.
    pub fn batch_gated(mut self, batches: Arc<dyn BatchEngine>) -> Self {
        self.mode = JobMode::BatchGated;
        self.batches = Some(batches);
        self
    }

    /// Only run while the job's batch is live, and fold anything the delegate
    /// enqueues into that same batch.
    pub fn contained(mut self, batches: Arc<dyn BatchEngine>) -> Self {
        self.mode = JobMode::Contained;
        self.batches = Some(batches);
        self
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    pub fn mode(&self) -> JobMode {
        self.mode
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The invocation must target a registered, type-level callable.
    pub fn validate_delegate(&self, invocation: &DeferredInvocation) -> InvocationResult<()> {
        self.registry.type_method(invocation.reference()).map(|_| ())
    }

    /// Validate and submit one job.
    pub fn enqueue(
        &self,
        invocation: &DeferredInvocation,
        options: &EnqueueOptions,
    ) -> Result<JobId, EnqueueError> {
        self.validate_delegate(invocation)?;

        let request = PushRequest {
            class: self.class.clone(),
            queue: self.queue_for(options).to_string(),
            args: encode(invocation),
            batch: options.context.batch(),
            retry: self.options.retry.clone(),
        };
        let id = self.client.push(request)?;
        debug!(
            class = %self.class,
            job_id = %id,
            queue = self.queue_for(options),
            batch = ?options.context.batch(),
            "enqueued delegate"
        );
        Ok(id)
    }

    /// Validate every invocation, then submit them all in one bulk call.
    pub fn enqueue_bulk<'a, I>(
        &self,
        invocations: I,
        options: &EnqueueOptions,
    ) -> Result<Vec<JobId>, EnqueueError>
    where
        I: IntoIterator<Item = &'a DeferredInvocation>,
    {
        let mut args = Vec::new();
        for (index, invocation) in invocations.into_iter().enumerate() {
            self.validate_delegate(invocation)
                .map_err(|source| EnqueueError::InvalidElement { index, source })?;
            args.push(encode(invocation));
        }
        self.submit_bulk(args, options)
    }

    /// Map each source element to zero, one or many invocations, validating each
    /// as it is produced, then submit them all in one bulk call.
    ///
    /// `None` and empty results are dropped and vectors are flattened. Any
    /// transform or validation error aborts before submission; `index` is the
    /// position in the flattened sequence.
    pub fn enqueue_bulk_with<S, T, F>(
        &self,
        source: impl IntoIterator<Item = S>,
        options: &EnqueueOptions,
        mut transform: F,
    ) -> Result<Vec<JobId>, EnqueueError>
    where
        F: FnMut(S) -> Result<T, InvocationError>,
        T: IntoInvocations,
    {
        let mut args: Vec<SerializedInvocation> = Vec::new();
        for element in source {
            let produced = transform(element).map_err(|source| EnqueueError::InvalidElement {
                index: args.len(),
                source,
            })?;
            for invocation in produced.into_invocations() {
                self.validate_delegate(&invocation)
                    .map_err(|source| EnqueueError::InvalidElement {
                        index: args.len(),
                        source,
                    })?;
                args.push(encode(&invocation));
            }
        }
        self.submit_bulk(args, options)
    }

    fn submit_bulk(
        &self,
        args: Vec<SerializedInvocation>,
        options: &EnqueueOptions,
    ) -> Result<Vec<JobId>, EnqueueError> {
        if args.is_empty() {
            return Ok(Vec::new());
        }

        let count = args.len();
        let request = BulkPushRequest {
            class: self.class.clone(),
            queue: self.queue_for(options).to_string(),
            args,
            batch: options.context.batch(),
            retry: self.options.retry.clone(),
        };
        let ids = self.client.push_bulk(request)?;
        debug!(
            class = %self.class,
            count,
            queue = self.queue_for(options),
            batch = ?options.context.batch(),
            "bulk enqueued delegates"
        );
        Ok(ids)
    }

    fn queue_for<'a>(&'a self, options: &'a EnqueueOptions) -> &'a str {
        options.queue.as_deref().unwrap_or(&self.options.queue)
    }

    /// Execute one job payload.
    ///
    /// - `Ok(Misconfigured)`: the payload was malformed, referenced an unusable
    ///   callable, or no longer matches its signature. Logged, never retried.
    /// - `Ok(Discarded)`: batch modes only; the job's batch is gone.
    /// - `Err`: the delegate itself failed; the engine's retry policy decides.
    pub fn perform(&self, payload: &Value, job: &JobContext) -> anyhow::Result<JobOutcome> {
        match self.mode {
            JobMode::Standalone => self.call_delegate(payload, job, &CallContext::detached()),
            JobMode::BatchGated | JobMode::Contained => {
                let Some(batch) = self.live_batch(job) else {
                    warn!(
                        class = %self.class,
                        job_id = %job.job_id,
                        batch = ?job.batch,
                        "batch invalidated (dying quietly)"
                    );
                    return Ok(JobOutcome::Discarded);
                };

                if self.mode == JobMode::Contained {
                    batch.jobs(|scope| self.call_delegate(payload, job, scope))
                } else {
                    self.call_delegate(payload, job, &CallContext::detached())
                }
            }
        }
    }

    fn live_batch(&self, job: &JobContext) -> Option<Batch> {
        let (Some(engine), Some(id)) = (self.batches.as_ref(), job.batch) else {
            return None;
        };
        engine
            .is_valid(id)
            .then(|| Batch::attach(engine.clone(), id))
    }

    fn call_delegate(
        &self,
        payload: &Value,
        job: &JobContext,
        ctx: &CallContext,
    ) -> anyhow::Result<JobOutcome> {
        let invocation = match decode_value(&self.registry, payload) {
            Ok(invocation) => invocation,
            Err(e) => {
                info!(class = %self.class, job_id = %job.job_id, invocation = "nothing", "delegate begin");
                error!(
                    class = %self.class,
                    job_id = %job.job_id,
                    reason = e.kind(),
                    error = %e,
                    "NON-RETRYABLE: job is misconfigured; enqueue through enqueue or enqueue_bulk so it is validated up front"
                );
                info!(class = %self.class, job_id = %job.job_id, invocation = "nothing", "delegate end");
                return Ok(JobOutcome::Misconfigured(e));
            }
        };

        info!(class = %self.class, job_id = %job.job_id, invocation = %invocation, "delegate begin");
        let result = invocation.call(&self.registry, ctx);
        info!(
            class = %self.class,
            job_id = %job.job_id,
            invocation = %invocation,
            ok = result.is_ok(),
            "delegate end"
        );

        result.map(JobOutcome::Completed)
    }
}

impl std::fmt::Debug for DelegateJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateJob")
            .field("class", &self.class)
            .field("options", &self.options)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
