//! Batches: engine-tracked groups of jobs with aggregate completion.
//!
//! The engine owns membership, counting and outcome transitions. This module only
//! opens batches, scopes enqueues into them, registers callbacks and waits.
//!
//! ```ignore
//! let batch = Batch::wrap(engine.clone(), |scope| {
//!     reports.enqueue(&rebuild, &EnqueueOptions::within(scope))?;
//!     Ok::<_, EnqueueError>(())
//! })?
//! .on_any_outcome(|event, status, _| tracing::info!(?event, pending = status.pending, "batch settled"), Value::Null)?
//! .await_completion()?;
//! ```

use core::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use delegate_core::{BatchId, CallContext};

use crate::client::EngineError;

/// Terminal events a callback can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchEvent {
    /// Every member has run at least once.
    Complete,
    /// Every member has succeeded.
    Success,
    /// A member exhausted its retries.
    Death,
}

impl BatchEvent {
    pub const ALL: [BatchEvent; 3] = [BatchEvent::Complete, BatchEvent::Success, BatchEvent::Death];
}

/// Lifecycle state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Open,
    Closed,
    Complete,
    Success,
    Dead,
}

impl BatchState {
    /// Whether a waiter blocked on the batch may return.
    pub fn is_finished(self) -> bool {
        matches!(self, BatchState::Complete | BatchState::Success | BatchState::Dead)
    }
}

/// Snapshot of a batch as reported by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatus {
    pub id: BatchId,
    pub description: Option<String>,
    pub state: BatchState,
    pub total: usize,
    pub pending: usize,
    pub failures: usize,
    pub dead: usize,
    pub invalidated: bool,
    pub created_at: DateTime<Utc>,
}

/// Callback fired by the engine for a batch event, with the options it was
/// registered with.
pub type BatchCallback = Arc<dyn Fn(BatchEvent, &BatchStatus, &Value) + Send + Sync>;

/// Batch-tracking side of the queue engine.
pub trait BatchEngine: Send + Sync {
    fn open(&self, description: Option<&str>) -> Result<BatchId, EngineError>;

    /// Mark the initial job set as fully submitted. Completion is only reported
    /// for closed batches. Closing twice is a no-op.
    fn close(&self, batch: BatchId) -> Result<(), EngineError>;

    fn status(&self, batch: BatchId) -> Result<BatchStatus, EngineError>;

    /// Block until the batch reaches a finished state. No timeout.
    fn join(&self, batch: BatchId) -> Result<BatchStatus, EngineError>;

    fn register_callback(
        &self,
        batch: BatchId,
        event: BatchEvent,
        callback: BatchCallback,
        options: Value,
    ) -> Result<(), EngineError>;

    fn invalidate(&self, batch: BatchId) -> Result<(), EngineError>;

    /// Whether the batch exists and has not been invalidated.
    fn is_valid(&self, batch: BatchId) -> bool;
}

/// Handle to one batch.
#[derive(Clone)]
pub struct Batch {
    id: BatchId,
    engine: Arc<dyn BatchEngine>,
}

impl Batch {
    pub fn open(engine: Arc<dyn BatchEngine>) -> Result<Self, EngineError> {
        Self::open_described(engine, None)
    }

    pub fn open_described(
        engine: Arc<dyn BatchEngine>,
        description: Option<&str>,
    ) -> Result<Self, EngineError> {
        let id = engine.open(description)?;
        debug!(batch = %id, ?description, "opened batch");
        Ok(Self { id, engine })
    }

    /// Handle to an existing batch, e.g. the one a running job belongs to.
    pub fn attach(engine: Arc<dyn BatchEngine>, id: BatchId) -> Self {
        Self { id, engine }
    }

    /// Open a batch and run `body` with it as the active scope.
    ///
    /// The batch is returned still open, so more work can be added with
    /// [`jobs`](Self::jobs) before [`close`](Self::close) or
    /// [`await_completion`](Self::await_completion). If `body` fails the batch is
    /// invalidated, so members that were already submitted die quietly instead
    /// of running as part of a half-built batch.
    pub fn wrap<F, E>(engine: Arc<dyn BatchEngine>, body: F) -> Result<Self, E>
    where
        F: FnOnce(&CallContext) -> Result<(), E>,
        E: From<EngineError>,
    {
        let batch = Self::open(engine)?;
        if let Err(e) = batch.jobs(body) {
            if let Err(inv) = batch.engine.invalidate(batch.id) {
                warn!(batch = %batch.id, error = %inv, "failed to invalidate abandoned batch");
            }
            return Err(e);
        }
        Ok(batch)
    }

    /// Run `body` with this batch as the active enqueue scope.
    pub fn jobs<F, R>(&self, body: F) -> R
    where
        F: FnOnce(&CallContext) -> R,
    {
        body(&self.context())
    }

    pub fn close(&self) -> Result<(), EngineError> {
        self.engine.close(self.id)
    }

    /// Close the batch and block until the engine reports it finished.
    ///
    /// Unbounded; callers needing a deadline must wrap this themselves.
    pub fn await_completion(self) -> Result<Self, EngineError> {
        self.close()?;
        let status = self.engine.join(self.id)?;
        debug!(batch = %self.id, state = ?status.state, "batch finished");
        Ok(self)
    }

    pub fn on<F>(self, event: BatchEvent, callback: F, options: Value) -> Result<Self, EngineError>
    where
        F: Fn(BatchEvent, &BatchStatus, &Value) + Send + Sync + 'static,
    {
        self.engine
            .register_callback(self.id, event, Arc::new(callback), options)?;
        Ok(self)
    }

    /// Register `callback` for complete, success and death alike.
    pub fn on_any_outcome<F>(self, callback: F, options: Value) -> Result<Self, EngineError>
    where
        F: Fn(BatchEvent, &BatchStatus, &Value) + Send + Sync + 'static,
    {
        let callback: BatchCallback = Arc::new(callback);
        for event in BatchEvent::ALL {
            self.engine
                .register_callback(self.id, event, callback.clone(), options.clone())?;
        }
        Ok(self)
    }

    pub fn status(&self) -> Result<BatchStatus, EngineError> {
        self.engine.status(self.id)
    }

    pub fn invalidate(&self) -> Result<(), EngineError> {
        self.engine.invalidate(self.id)
    }

    pub fn is_valid(&self) -> bool {
        self.engine.is_valid(self.id)
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn context(&self) -> CallContext {
        CallContext::in_batch(self.id)
    }
}

impl PartialEq for Batch {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch").field("id", &self.id).finish_non_exhaustive()
    }
}
