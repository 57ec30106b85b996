//! Local worker: claims jobs from a [`JobStore`] and performs them with the
//! registered delegate job types.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::client::EngineError;
use crate::delegate::DelegateJob;
use crate::store::JobStore;
use crate::types::{JobOutcome, JobRecord, JobStatus};

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How long to wait when no job is claimable
    pub poll_interval: Duration,
    /// Name for logging and the worker thread
    pub name: String,
    /// Queues to claim from; empty means all
    pub queues: Vec<String>,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            name: "delegate-worker".to_string(),
            queues: Vec::new(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_queues<I, Q>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Request graceful shutdown and wait for the current job to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    /// Delegate failures, retried or not
    pub jobs_failed: u64,
    pub jobs_dead: u64,
    /// Misconfigured payloads and jobs discarded with their batch
    pub jobs_dropped: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

impl ExecutorStats {
    fn record(&mut self, job: &JobRecord, result: &Result<(), String>) {
        self.jobs_processed += 1;
        match (&job.status, result) {
            (JobStatus::Completed, Ok(())) => self.jobs_succeeded += 1,
            (JobStatus::Completed | JobStatus::FailedFatal { .. }, _) => self.jobs_dropped += 1,
            (JobStatus::Dead { .. }, _) => {
                self.jobs_failed += 1;
                self.jobs_dead += 1;
            }
            _ => self.jobs_failed += 1,
        }
    }
}

/// Background job executor.
///
/// Looks up the delegate job type by the job's class, performs it and records
/// the outcome back into the store, which applies retry policy and batch
/// accounting.
pub struct JobExecutor<S: JobStore> {
    store: S,
    jobs: HashMap<String, DelegateJob>,
}

impl<S: JobStore + 'static> JobExecutor<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            jobs: HashMap::new(),
        }
    }

    /// Register a delegate job type under its class name.
    pub fn register(&mut self, job: DelegateJob) {
        debug!(class = job.class(), mode = ?job.mode(), "registered job type");
        self.jobs.insert(job.class().to_string(), job);
    }

    /// Spawn the executor in a background thread.
    pub fn spawn(self, config: JobExecutorConfig) -> io::Result<JobExecutorHandle>
    where
        S: Send,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || {
                executor_loop(self, config, shutdown_rx, stats_clone);
            })?;

        Ok(JobExecutorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }

    /// Perform one claimed job and store the result.
    ///
    /// `Err` carries the failure recorded on the job; `job.status` says whether
    /// it will be retried.
    pub fn execute_one(&self, job: &mut JobRecord) -> Result<(), String> {
        let Some(job_type) = self.jobs.get(&job.class) else {
            let error = format!("no job type registered for class: {}", job.class);
            warn!(job_id = %job.id, class = %job.class, "no job type for job");
            job.mark_failed(error.clone(), Utc::now());
            self.store.update(job).map_err(|e| e.to_string())?;
            return Err(error);
        };

        let started = Utc::now();
        match job_type.perform(&job.payload, &job.context()) {
            Ok(JobOutcome::Completed(_)) => {
                job.mark_completed(started);
                self.store.update(job).map_err(|e| e.to_string())?;
                debug!(job_id = %job.id, "job completed successfully");
                Ok(())
            }
            Ok(JobOutcome::Discarded) => {
                job.mark_completed(started);
                self.store.update(job).map_err(|e| e.to_string())?;
                Err("discarded with its batch".to_string())
            }
            Ok(JobOutcome::Misconfigured(e)) => {
                let error = e.to_string();
                job.mark_failed_fatal(error.clone(), started);
                self.store.update(job).map_err(|e| e.to_string())?;
                Err(error)
            }
            Err(e) => {
                let error = format!("{e:#}");
                job.mark_failed(error.clone(), started);
                self.store.update(job).map_err(|e| e.to_string())?;

                if matches!(job.status, JobStatus::Dead { .. }) {
                    warn!(job_id = %job.id, class = %job.class, error = %error, "job died");
                }
                Err(error)
            }
        }
    }

    /// Claim and perform jobs on this thread until none is claimable.
    ///
    /// Returns how many jobs were performed.
    pub fn run_until_idle(&self, queues: &[String]) -> Result<usize, EngineError> {
        let mut performed = 0;
        while let Some(mut job) = self.store.claim_next(queues)? {
            if let Err(e) = self.execute_one(&mut job) {
                debug!(job_id = %job.id, error = %e, status = ?job.status, "job execution failed");
            }
            performed += 1;
        }
        Ok(performed)
    }
}

fn executor_loop<S: JobStore>(
    executor: JobExecutor<S>,
    config: JobExecutorConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<ExecutorStats>>,
) where
    S: 'static,
{
    info!(executor = %config.name, queues = ?config.queues, "job executor started");
    let start_time = Instant::now();
    let lock_stats = || stats.lock().unwrap_or_else(PoisonError::into_inner);

    loop {
        lock_stats().uptime_secs = start_time.elapsed().as_secs();

        let idle = match executor.store.claim_next(&config.queues) {
            Ok(Some(mut job)) => {
                debug!(
                    executor = %config.name,
                    job_id = %job.id,
                    class = %job.class,
                    attempt = job.attempt,
                    "claimed job"
                );
                lock_stats().current_running += 1;

                let result = executor.execute_one(&mut job);

                {
                    let mut s = lock_stats();
                    s.current_running = s.current_running.saturating_sub(1);
                    s.record(&job, &result);
                }

                if let Err(e) = result {
                    debug!(
                        executor = %config.name,
                        job_id = %job.id,
                        error = %e,
                        status = ?job.status,
                        "job execution failed"
                    );
                }
                false
            }
            Ok(None) => true,
            Err(e) => {
                error!(executor = %config.name, error = %e, "failed to claim job");
                true
            }
        };

        let wait = if idle { config.poll_interval } else { Duration::ZERO };
        match shutdown_rx.recv_timeout(wait) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
    }

    info!(executor = %config.name, "job executor stopped");
}
