//! In-memory queue engine for tests/dev.
//!
//! Stores jobs, hands them out in FIFO order per queue and tracks batch
//! membership. Batch events are fired outside the state lock, so callbacks may
//! call back into the engine.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use delegate_core::{BatchId, JobId};

use crate::batch::{BatchCallback, BatchEngine, BatchEvent, BatchState, BatchStatus};
use crate::client::{BulkPushRequest, EngineError, PushRequest, QueueClient};
use crate::types::{JobRecord, JobStatus, RetryPolicy};

/// Worker-facing side of the engine.
pub trait JobStore: Send + Sync {
    /// Claim the oldest claimable job on any of `queues` (any queue when empty)
    /// and mark it running.
    fn claim_next(&self, queues: &[String]) -> Result<Option<JobRecord>, EngineError>;

    /// Store a job's new state and apply it to its batch.
    fn update(&self, job: &JobRecord) -> Result<(), EngineError>;

    fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, EngineError>;

    fn stats(&self) -> Result<JobStats, EngineError>;
}

impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    fn claim_next(&self, queues: &[String]) -> Result<Option<JobRecord>, EngineError> {
        (**self).claim_next(queues)
    }

    fn update(&self, job: &JobRecord) -> Result<(), EngineError> {
        (**self).update(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, EngineError> {
        (**self).get(job_id)
    }

    fn stats(&self) -> Result<JobStats, EngineError> {
        (**self).stats()
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub enqueued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed_fatal: usize,
    pub retrying: usize,
    pub dead: usize,
}

struct Registration {
    event: BatchEvent,
    callback: BatchCallback,
    options: Value,
}

type Firing = (BatchCallback, BatchEvent, BatchStatus, Value);

struct BatchEntry {
    status: BatchStatus,
    closed: bool,
    /// Pending members that have failed at least once
    failing: HashSet<JobId>,
    callbacks: Vec<Registration>,
    fired: Vec<BatchEvent>,
}

impl BatchEntry {
    fn new(id: BatchId, description: Option<&str>) -> Self {
        Self {
            status: BatchStatus {
                id,
                description: description.map(str::to_string),
                state: BatchState::Open,
                total: 0,
                pending: 0,
                failures: 0,
                dead: 0,
                invalidated: false,
                created_at: Utc::now(),
            },
            closed: false,
            failing: HashSet::new(),
            callbacks: Vec::new(),
            fired: Vec::new(),
        }
    }

    fn add_member(&mut self) {
        self.status.total += 1;
        self.status.pending += 1;
    }

    fn track(&mut self, job: JobId, previous: &JobStatus, current: &JobStatus) {
        if previous == current {
            return;
        }
        match current {
            JobStatus::Completed | JobStatus::FailedFatal { .. } => {
                if !previous.is_terminal() {
                    self.status.pending = self.status.pending.saturating_sub(1);
                    self.failing.remove(&job);
                }
            }
            JobStatus::FailedRetryable { .. } => {
                self.failing.insert(job);
            }
            JobStatus::Dead { .. } => {
                self.failing.insert(job);
                self.status.dead += 1;
            }
            JobStatus::Enqueued | JobStatus::Running => {}
        }
    }

    /// Recompute the state and collect callbacks for newly reached events.
    ///
    /// complete: every pending member has failed at least once.
    /// success: nothing pending. death: some member died.
    fn settle(&mut self) -> Vec<Firing> {
        self.status.failures = self.failing.len();
        if !self.closed {
            self.status.state = BatchState::Open;
            return Vec::new();
        }

        let pending = self.status.pending;
        let all_ran = pending == self.status.failures;
        self.status.state = if pending == 0 {
            BatchState::Success
        } else if all_ran && self.status.dead > 0 {
            BatchState::Dead
        } else if all_ran {
            BatchState::Complete
        } else {
            BatchState::Closed
        };

        let mut reached = Vec::new();
        if self.status.dead > 0 {
            reached.push(BatchEvent::Death);
        }
        if all_ran {
            reached.push(BatchEvent::Complete);
        }
        if pending == 0 {
            reached.push(BatchEvent::Success);
        }

        let mut firings = Vec::new();
        for event in reached {
            if self.fired.contains(&event) {
                continue;
            }
            self.fired.push(event);
            firings.extend(
                self.callbacks
                    .iter()
                    .filter(|r| r.event == event)
                    .map(|r| (r.callback.clone(), event, self.status.clone(), r.options.clone())),
            );
        }
        firings
    }
}

#[derive(Default)]
struct EngineState {
    jobs: HashMap<JobId, JobRecord>,
    batches: HashMap<BatchId, BatchEntry>,
    sequence: u64,
}

impl EngineState {
    fn check_batch(&self, batch: Option<BatchId>) -> Result<(), EngineError> {
        let Some(id) = batch else {
            return Ok(());
        };
        match self.batches.get(&id) {
            None => Err(EngineError::BatchNotFound(id)),
            Some(entry) if entry.status.invalidated => Err(EngineError::BatchInvalidated(id)),
            Some(_) => Ok(()),
        }
    }

    fn insert(
        &mut self,
        class: &str,
        queue: &str,
        payload: Value,
        batch: Option<BatchId>,
        retry: &RetryPolicy,
    ) -> JobId {
        self.sequence += 1;
        let mut job = JobRecord::new(class, queue, payload)
            .with_retry_policy(retry.clone())
            .in_batch(batch);
        job.sequence = self.sequence;

        if let Some(entry) = batch.and_then(|b| self.batches.get_mut(&b)) {
            entry.add_member();
        }

        let id = job.id;
        self.jobs.insert(id, job);
        id
    }

    /// Re-evaluate a batch after members were added; a finished batch that
    /// gains pending work goes back to waiting.
    fn settle_batch(&mut self, batch: Option<BatchId>) -> Vec<Firing> {
        batch
            .and_then(|b| self.batches.get_mut(&b))
            .map(BatchEntry::settle)
            .unwrap_or_default()
    }

    fn batch_mut(&mut self, batch: BatchId) -> Result<&mut BatchEntry, EngineError> {
        self.batches
            .get_mut(&batch)
            .ok_or(EngineError::BatchNotFound(batch))
    }
}

/// In-memory engine implementing [`QueueClient`], [`JobStore`] and [`BatchEngine`].
#[derive(Default)]
pub struct InMemoryEngine {
    state: Mutex<EngineState>,
    changed: Condvar,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Members of `batch` in submission order.
    pub fn batch_members(&self, batch: BatchId) -> Result<Vec<JobRecord>, EngineError> {
        let state = self.lock()?;
        let mut members: Vec<_> = state
            .jobs
            .values()
            .filter(|j| j.batch == Some(batch))
            .cloned()
            .collect();
        members.sort_by_key(|j| j.sequence);
        Ok(members)
    }

    /// Jobs on `queue` in submission order, whatever their status.
    pub fn jobs_on(&self, queue: &str) -> Result<Vec<JobRecord>, EngineError> {
        let state = self.lock()?;
        let mut jobs: Vec<_> = state
            .jobs
            .values()
            .filter(|j| j.queue == queue)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.sequence);
        Ok(jobs)
    }

    fn lock(&self) -> Result<MutexGuard<'_, EngineState>, EngineError> {
        self.state.lock().map_err(|_| EngineError::Poisoned)
    }

    fn fire(firings: Vec<Firing>) {
        for (callback, event, status, options) in firings {
            info!(
                batch = %status.id,
                ?event,
                total = status.total,
                pending = status.pending,
                failures = status.failures,
                "batch event"
            );
            callback(event, &status, &options);
        }
    }
}

impl std::fmt::Debug for InMemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEngine").finish_non_exhaustive()
    }
}

impl QueueClient for InMemoryEngine {
    fn push(&self, request: PushRequest) -> Result<JobId, EngineError> {
        let (id, firings) = {
            let mut state = self.lock()?;
            state.check_batch(request.batch)?;
            let id = state.insert(
                &request.class,
                &request.queue,
                request.args.to_value(),
                request.batch,
                &request.retry,
            );
            (id, state.settle_batch(request.batch))
        };
        self.changed.notify_all();
        Self::fire(firings);
        Ok(id)
    }

    fn push_bulk(&self, request: BulkPushRequest) -> Result<Vec<JobId>, EngineError> {
        let (ids, firings) = {
            let mut state = self.lock()?;
            state.check_batch(request.batch)?;
            let ids = request
                .args
                .iter()
                .map(|args| {
                    state.insert(
                        &request.class,
                        &request.queue,
                        args.to_value(),
                        request.batch,
                        &request.retry,
                    )
                })
                .collect::<Vec<_>>();
            (ids, state.settle_batch(request.batch))
        };
        self.changed.notify_all();
        Self::fire(firings);
        Ok(ids)
    }
}

impl JobStore for InMemoryEngine {
    fn claim_next(&self, queues: &[String]) -> Result<Option<JobRecord>, EngineError> {
        let mut state = self.lock()?;

        let next = state
            .jobs
            .values()
            .filter(|j| j.is_claimable() && (queues.is_empty() || queues.contains(&j.queue)))
            .min_by_key(|j| j.sequence)
            .map(|j| j.id);

        Ok(next.and_then(|id| state.jobs.get_mut(&id)).map(|job| {
            job.mark_running();
            job.clone()
        }))
    }

    fn update(&self, job: &JobRecord) -> Result<(), EngineError> {
        let firings = {
            let mut state = self.lock()?;
            let previous = state
                .jobs
                .get(&job.id)
                .map(|j| j.status.clone())
                .ok_or(EngineError::JobNotFound(job.id))?;
            state.jobs.insert(job.id, job.clone());

            match job.batch.and_then(|b| state.batches.get_mut(&b)) {
                Some(entry) => {
                    entry.track(job.id, &previous, &job.status);
                    entry.settle()
                }
                None => Vec::new(),
            }
        };
        self.changed.notify_all();
        Self::fire(firings);
        Ok(())
    }

    fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, EngineError> {
        Ok(self.lock()?.jobs.get(&job_id).cloned())
    }

    fn stats(&self) -> Result<JobStats, EngineError> {
        let state = self.lock()?;
        let mut stats = JobStats::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Enqueued => stats.enqueued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::FailedFatal { .. } => stats.failed_fatal += 1,
                JobStatus::FailedRetryable { .. } => stats.retrying += 1,
                JobStatus::Dead { .. } => stats.dead += 1,
            }
        }
        Ok(stats)
    }
}

impl BatchEngine for InMemoryEngine {
    fn open(&self, description: Option<&str>) -> Result<BatchId, EngineError> {
        let id = BatchId::new();
        self.lock()?
            .batches
            .insert(id, BatchEntry::new(id, description));
        Ok(id)
    }

    fn close(&self, batch: BatchId) -> Result<(), EngineError> {
        let firings = {
            let mut state = self.lock()?;
            let entry = state.batch_mut(batch)?;
            entry.closed = true;
            debug!(batch = %batch, total = entry.status.total, "closed batch");
            entry.settle()
        };
        self.changed.notify_all();
        Self::fire(firings);
        Ok(())
    }

    fn status(&self, batch: BatchId) -> Result<BatchStatus, EngineError> {
        let mut state = self.lock()?;
        Ok(state.batch_mut(batch)?.status.clone())
    }

    fn join(&self, batch: BatchId) -> Result<BatchStatus, EngineError> {
        let mut state = self.lock()?;
        loop {
            let status = &state.batch_mut(batch)?.status;
            if status.state.is_finished() {
                return Ok(status.clone());
            }
            state = self.changed.wait(state).map_err(|_| EngineError::Poisoned)?;
        }
    }

    fn register_callback(
        &self,
        batch: BatchId,
        event: BatchEvent,
        callback: BatchCallback,
        options: Value,
    ) -> Result<(), EngineError> {
        let late = {
            let mut state = self.lock()?;
            let entry = state.batch_mut(batch)?;
            if entry.fired.contains(&event) {
                Some((callback, event, entry.status.clone(), options))
            } else {
                entry.callbacks.push(Registration {
                    event,
                    callback,
                    options,
                });
                None
            }
        };
        Self::fire(late.into_iter().collect());
        Ok(())
    }

    fn invalidate(&self, batch: BatchId) -> Result<(), EngineError> {
        self.lock()?.batch_mut(batch)?.status.invalidated = true;
        info!(batch = %batch, "batch invalidated");
        Ok(())
    }

    fn is_valid(&self, batch: BatchId) -> bool {
        self.lock()
            .map(|state| {
                state
                    .batches
                    .get(&batch)
                    .is_some_and(|entry| !entry.status.invalidated)
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use serde_json::json;

    use delegate_core::SerializedInvocation;

    fn args(n: i64) -> SerializedInvocation {
        SerializedInvocation {
            receiver: "Reports".to_string(),
            name: "rebuild".to_string(),
            args: vec![json!(n)],
            named_args: Default::default(),
        }
    }

    fn push(engine: &InMemoryEngine, queue: &str, n: i64, batch: Option<BatchId>) -> JobId {
        engine
            .push(PushRequest {
                class: "ReportJob".to_string(),
                queue: queue.to_string(),
                args: args(n),
                batch,
                retry: RetryPolicy::fixed(2, Duration::ZERO),
            })
            .unwrap()
    }

    fn run(engine: &InMemoryEngine, succeed: bool) -> JobRecord {
        let mut job = engine.claim_next(&[]).unwrap().unwrap();
        let started = Utc::now();
        if succeed {
            job.mark_completed(started);
        } else {
            job.mark_failed("boom".to_string(), started);
        }
        engine.update(&job).unwrap();
        job
    }

    fn recorder(engine: &InMemoryEngine, batch: BatchId) -> Arc<Mutex<Vec<BatchEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        for event in BatchEvent::ALL {
            let sink = seen.clone();
            engine
                .register_callback(
                    batch,
                    event,
                    Arc::new(move |event: BatchEvent, _: &BatchStatus, _: &Value| {
                        sink.lock().unwrap().push(event)
                    }),
                    Value::Null,
                )
                .unwrap();
        }
        seen
    }

    #[test]
    fn claims_in_fifo_order_per_queue() {
        let engine = InMemoryEngine::new();
        let first = push(&engine, "default", 1, None);
        let urgent = push(&engine, "critical", 2, None);
        let second = push(&engine, "default", 3, None);

        let critical = engine.claim_next(&["critical".to_string()]).unwrap().unwrap();
        assert_eq!(critical.id, urgent);
        assert_eq!(critical.status, JobStatus::Running);
        assert_eq!(critical.attempt, 1);

        assert_eq!(engine.claim_next(&[]).unwrap().unwrap().id, first);
        assert_eq!(engine.claim_next(&[]).unwrap().unwrap().id, second);
        assert!(engine.claim_next(&[]).unwrap().is_none());
    }

    #[test]
    fn payload_is_the_wire_record() {
        let engine = InMemoryEngine::new();
        let id = push(&engine, "default", 7, None);

        let job = engine.get(id).unwrap().unwrap();
        assert_eq!(job.payload, args(7).to_value());
        assert_eq!(job.class, "ReportJob");
    }

    #[test]
    fn backoff_delays_the_next_claim() {
        let engine = InMemoryEngine::new();
        engine
            .push(PushRequest {
                class: "ReportJob".to_string(),
                queue: "default".to_string(),
                args: args(1),
                batch: None,
                retry: RetryPolicy::fixed(3, Duration::from_secs(60)),
            })
            .unwrap();

        let failed = run(&engine, false);
        assert!(failed.status.is_retriable());
        assert!(engine.claim_next(&[]).unwrap().is_none());

        let mut due = failed;
        due.scheduled_at = None;
        engine.update(&due).unwrap();
        assert_eq!(engine.claim_next(&[]).unwrap().unwrap().attempt, 2);
    }

    #[test]
    fn push_into_unknown_or_invalidated_batch_fails() {
        let engine = InMemoryEngine::new();
        let missing = BatchId::new();
        let err = engine
            .push(PushRequest {
                class: "ReportJob".to_string(),
                queue: "default".to_string(),
                args: args(1),
                batch: Some(missing),
                retry: RetryPolicy::default(),
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::BatchNotFound(id) if id == missing));

        let batch = engine.open(None).unwrap();
        engine.invalidate(batch).unwrap();
        assert!(!engine.is_valid(batch));
        let err = engine
            .push_bulk(BulkPushRequest {
                class: "ReportJob".to_string(),
                queue: "default".to_string(),
                args: vec![args(1), args(2)],
                batch: Some(batch),
                retry: RetryPolicy::default(),
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::BatchInvalidated(_)));
        assert_eq!(engine.stats().unwrap(), JobStats::default());
    }

    #[test]
    fn successful_batch_fires_complete_then_success_once() {
        let engine = InMemoryEngine::new();
        let batch = engine.open(Some("nightly")).unwrap();
        let seen = recorder(&engine, batch);
        push(&engine, "default", 1, Some(batch));
        push(&engine, "default", 2, Some(batch));
        engine.close(batch).unwrap();

        run(&engine, true);
        assert_eq!(engine.status(batch).unwrap().state, BatchState::Closed);
        run(&engine, true);

        let status = engine.status(batch).unwrap();
        assert_eq!(status.state, BatchState::Success);
        assert_eq!((status.total, status.pending), (2, 0));
        assert_eq!(status.description.as_deref(), Some("nightly"));
        assert_eq!(*seen.lock().unwrap(), vec![BatchEvent::Complete, BatchEvent::Success]);

        engine.close(batch).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn open_batch_never_finishes() {
        let engine = InMemoryEngine::new();
        let batch = engine.open(None).unwrap();
        let seen = recorder(&engine, batch);
        push(&engine, "default", 1, Some(batch));

        run(&engine, true);

        assert_eq!(engine.status(batch).unwrap().state, BatchState::Open);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_batch_succeeds_on_close() {
        let engine = InMemoryEngine::new();
        let batch = engine.open(None).unwrap();
        let seen = recorder(&engine, batch);

        engine.close(batch).unwrap();

        assert_eq!(engine.join(batch).unwrap().state, BatchState::Success);
        assert_eq!(*seen.lock().unwrap(), vec![BatchEvent::Complete, BatchEvent::Success]);
    }

    #[test]
    fn dead_member_completes_the_batch_without_success() {
        let engine = InMemoryEngine::new();
        let batch = engine.open(None).unwrap();
        let seen = recorder(&engine, batch);
        push(&engine, "default", 1, Some(batch));
        push(&engine, "default", 2, Some(batch));
        engine.close(batch).unwrap();

        run(&engine, true);
        let failed = run(&engine, false);
        assert_eq!(engine.status(batch).unwrap().failures, 1);
        assert_eq!(*seen.lock().unwrap(), vec![BatchEvent::Complete]);

        let mut retry = failed;
        retry.scheduled_at = None;
        engine.update(&retry).unwrap();
        let died = run(&engine, false);
        assert!(matches!(died.status, JobStatus::Dead { attempts: 2, .. }));

        let status = engine.join(batch).unwrap();
        assert_eq!(status.state, BatchState::Dead);
        assert_eq!((status.pending, status.dead), (1, 1));
        assert_eq!(*seen.lock().unwrap(), vec![BatchEvent::Complete, BatchEvent::Death]);
    }

    #[test]
    fn fatal_failure_counts_as_finished() {
        let engine = InMemoryEngine::new();
        let batch = engine.open(None).unwrap();
        push(&engine, "default", 1, Some(batch));
        engine.close(batch).unwrap();

        let mut job = engine.claim_next(&[]).unwrap().unwrap();
        job.mark_failed_fatal("misconfigured".to_string(), Utc::now());
        engine.update(&job).unwrap();

        assert_eq!(engine.status(batch).unwrap().state, BatchState::Success);
        assert_eq!(engine.stats().unwrap().failed_fatal, 1);
    }

    #[test]
    fn late_callback_fires_immediately_with_its_options() {
        let engine = InMemoryEngine::new();
        let batch = engine.open(None).unwrap();
        engine.close(batch).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        engine
            .register_callback(
                batch,
                BatchEvent::Success,
                Arc::new(move |event: BatchEvent, status: &BatchStatus, options: &Value| {
                    assert_eq!(event, BatchEvent::Success);
                    assert_eq!(status.state, BatchState::Success);
                    assert_eq!(options, &json!({"notify": "ops"}));
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                json!({"notify": "ops"}),
            )
            .unwrap();
        engine
            .register_callback(
                batch,
                BatchEvent::Death,
                Arc::new(|_: BatchEvent, _: &BatchStatus, _: &Value| panic!("no death")),
                Value::Null,
            )
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn join_blocks_until_members_finish() {
        let engine = InMemoryEngine::arc();
        let batch = engine.open(None).unwrap();
        push(&engine, "default", 1, Some(batch));
        engine.close(batch).unwrap();

        let worker = {
            let engine = engine.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                run(&engine, true);
            })
        };

        let status = engine.join(batch).unwrap();
        assert_eq!(status.state, BatchState::Success);
        worker.join().unwrap();
    }

    #[test]
    fn member_added_after_success_reopens_the_wait() {
        let engine = InMemoryEngine::arc();
        let batch = engine.open(None).unwrap();
        let seen = recorder(&engine, batch);
        engine.close(batch).unwrap();
        assert_eq!(engine.status(batch).unwrap().state, BatchState::Success);

        push(&engine, "late", 1, Some(batch));
        let status = engine.status(batch).unwrap();
        assert_eq!(status.state, BatchState::Closed);
        assert_eq!((status.total, status.pending), (1, 1));
        assert_eq!(engine.jobs_on("late").unwrap().len(), 1);
        assert!(engine.jobs_on("default").unwrap().is_empty());

        let worker = {
            let engine = engine.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                run(&engine, true)
            })
        };

        let status = engine.join(batch).unwrap();
        assert_eq!(status.state, BatchState::Success);
        assert_eq!(status.pending, 0);
        let ran = worker.join().unwrap();
        assert_eq!(engine.get(ran.id).unwrap().unwrap().status, JobStatus::Completed);
        // success already fired on the empty close
        let successes = seen.lock().unwrap().iter().filter(|e| **e == BatchEvent::Success).count();
        assert_eq!(successes, 1);
    }

    #[test]
    fn unknown_job_update_is_rejected() {
        let engine = InMemoryEngine::new();
        let stray = JobRecord::new("ReportJob", "default", Value::Null);

        assert!(matches!(engine.update(&stray), Err(EngineError::JobNotFound(_))));
        assert!(engine.get(stray.id).unwrap().is_none());
    }
}
