//! Polling job executor.
//!
//! One executor serves one worker family: it claims only the job types it has
//! processors for, routes each claimed job to its processor and turns the
//! result into a completion or a `FailJob` through [`JobLifecycle`].
//!
//! With parent recovery enabled, idle ticks also sweep for `FullCourse`
//! parents whose children have all ended but which were never finalized.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::processors::{JobContext, JobProcessor, ProcessError};

use super::lifecycle::JobLifecycle;
use super::store::JobStoreError;
use super::types::{ClaimFilter, ClaimedJob, FailureOutcome, GenerationJob, JobType};

/// Parents examined per recovery sweep.
const STALLED_PARENT_BATCH: usize = 50;

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// Name for logging and thread names
    pub name: String,
    /// Sleep between polls when the queue is empty
    pub poll_interval: Duration,
    /// A `Processing` job older than this is presumed abandoned
    pub stale_after: Duration,
    /// Also claim rows of unrecognized type so they get failed
    pub claim_unrecognized: bool,
    /// Number of polling threads
    pub concurrency: usize,
    /// Sweep for unfinalized parents when the queue is empty
    pub recover_parents: bool,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            name: "job-executor".to_string(),
            poll_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(30 * 60),
            claim_unrecognized: false,
            concurrency: 1,
            recover_parents: false,
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_unrecognized(mut self) -> Self {
        self.claim_unrecognized = true;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_parent_recovery(mut self) -> Self {
        self.recover_parents = true;
        self
    }
}

/// What one `run_once` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    /// Failed with retries left; back in the queue.
    Requeued,
    Failed,
    /// Claimed row could not be decoded and was failed.
    Malformed,
    /// Job went terminal while processing; its result was discarded.
    Cancelled,
    /// A stale reclaim with no attempts left, failed without reprocessing.
    Abandoned,
    /// No processor for the claimed type; handed back untouched.
    Ignored,
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    name: String,
    workers: Vec<(mpsc::Sender<()>, thread::JoinHandle<()>)>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Request graceful shutdown and wait for in-flight jobs to finish.
    pub fn shutdown(self) {
        for (shutdown, _) in &self.workers {
            let _ = shutdown.send(());
        }
        for (_, join) in self.workers {
            if join.join().is_err() {
                error!(executor = %self.name, "job executor thread panicked");
            }
        }
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_requeued: u64,
    pub jobs_cancelled: u64,
    pub malformed: u64,
    pub parents_recovered: u64,
    pub uptime_secs: u64,
}

impl ExecutorStats {
    fn record(&mut self, outcome: RunOutcome) {
        self.jobs_processed += 1;
        match outcome {
            RunOutcome::Succeeded => self.jobs_succeeded += 1,
            RunOutcome::Requeued => self.jobs_requeued += 1,
            RunOutcome::Failed | RunOutcome::Abandoned => self.jobs_failed += 1,
            RunOutcome::Malformed => self.malformed += 1,
            RunOutcome::Cancelled => self.jobs_cancelled += 1,
            RunOutcome::Ignored => {}
        }
    }
}

/// Background job executor.
pub struct JobExecutor {
    lifecycle: Arc<JobLifecycle>,
    processors: HashMap<JobType, Arc<dyn JobProcessor>>,
}

impl JobExecutor {
    pub fn new(lifecycle: Arc<JobLifecycle>) -> Self {
        Self {
            lifecycle,
            processors: HashMap::new(),
        }
    }

    /// Register the processor for its job type, replacing any previous one.
    pub fn register(&mut self, processor: Arc<dyn JobProcessor>) {
        self.processors.insert(processor.job_type(), processor);
    }

    pub fn with_processor(mut self, processor: Arc<dyn JobProcessor>) -> Self {
        self.register(processor);
        self
    }

    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.processors.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    /// Claim filter covering exactly the registered job types.
    pub fn claim_filter(&self, config: &JobExecutorConfig) -> ClaimFilter {
        let stale_after = chrono::Duration::from_std(config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let filter = ClaimFilter::only(self.job_types()).with_stale_after(stale_after);
        if config.claim_unrecognized {
            filter.with_unrecognized()
        } else {
            filter
        }
    }

    /// Claim and run at most one job. `Ok(None)` when nothing was eligible.
    ///
    /// An error means a store write failed; a job left `Processing` by it is
    /// recovered by a later stale reclaim.
    pub fn run_once(&self, filter: &ClaimFilter) -> Result<Option<RunOutcome>, JobStoreError> {
        let claimed = match self.lifecycle.store().claim_next(filter)? {
            Some(claimed) => claimed,
            None => return Ok(None),
        };

        let outcome = match claimed {
            ClaimedJob::Malformed(job) => {
                self.lifecycle.fail_malformed(&job)?;
                RunOutcome::Malformed
            }
            ClaimedJob::Ready(mut job) => self.execute(&mut job)?,
        };
        Ok(Some(outcome))
    }

    fn execute(&self, job: &mut GenerationJob) -> Result<RunOutcome, JobStoreError> {
        let Some(processor) = self.processors.get(&job.job_type) else {
            warn!(job_id = %job.id, job_type = %job.job_type, "no processor for claimed job, releasing it");
            job.release_claim();
            self.lifecycle.store().update(job)?;
            return Ok(RunOutcome::Ignored);
        };

        if job.retries_exhausted() {
            let message = format!("abandoned after {} attempts", job.retry_count);
            return settle(self.lifecycle.fail_terminally(job, &message).map(|()| {
                processor.on_terminal_failure(job);
                RunOutcome::Abandoned
            }));
        }

        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.retry_count,
            "processing job"
        );

        let result = {
            let store = self.lifecycle.store();
            let notifier = self.lifecycle.notifier();
            let mut ctx = JobContext::new(job, store.as_ref(), notifier.as_ref());
            processor.process(&mut ctx)
        };

        match result {
            Ok(done) => settle(
                self.lifecycle
                    .complete(job, &done.message)
                    .map(|()| RunOutcome::Succeeded),
            ),
            Err(ProcessError::Cancelled) => {
                info!(job_id = %job.id, "job cancelled while processing");
                Ok(RunOutcome::Cancelled)
            }
            Err(e) if e.is_retryable() => {
                settle(self.lifecycle.fail(job, &e.to_string()).map(|outcome| match outcome {
                    FailureOutcome::Requeued { .. } => RunOutcome::Requeued,
                    FailureOutcome::Failed => {
                        processor.on_terminal_failure(job);
                        RunOutcome::Failed
                    }
                }))
            }
            Err(e) => settle(self.lifecycle.fail_terminally(job, &e.to_string()).map(|()| {
                processor.on_terminal_failure(job);
                RunOutcome::Failed
            })),
        }
    }

    /// Finalize parents left live after all their children ended.
    pub fn recover_stalled_parents(&self) -> Result<usize, JobStoreError> {
        self.lifecycle.finalizer().recover_stalled(STALLED_PARENT_BATCH)
    }

    /// Spawn the executor on `config.concurrency` background threads.
    pub fn spawn(self, config: JobExecutorConfig) -> JobExecutorHandle {
        let executor = Arc::new(self);
        let filter = executor.claim_filter(&config);
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));

        info!(
            executor = %config.name,
            job_types = ?filter.job_types,
            unrecognized = filter.include_unrecognized,
            recover_parents = config.recover_parents,
            threads = config.concurrency,
            "starting job executor"
        );

        let workers = (0..config.concurrency.max(1))
            .map(|n| {
                let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
                let executor = executor.clone();
                let config = config.clone();
                let filter = filter.clone();
                let stats = stats.clone();
                let join = thread::Builder::new()
                    .name(format!("{}-{n}", config.name))
                    .spawn(move || executor_loop(&executor, &config, &filter, shutdown_rx, &stats))
                    .expect("failed to spawn job executor thread");
                (shutdown_tx, join)
            })
            .collect();

        JobExecutorHandle {
            name: config.name,
            workers,
            stats,
        }
    }
}

/// A job that went terminal under us is a cancellation, not an error.
fn settle(result: Result<RunOutcome, JobStoreError>) -> Result<RunOutcome, JobStoreError> {
    match result {
        Err(JobStoreError::AlreadyTerminal(id)) => {
            info!(job_id = %id, "job became terminal before its result was recorded");
            Ok(RunOutcome::Cancelled)
        }
        other => other,
    }
}

fn executor_loop(
    executor: &JobExecutor,
    config: &JobExecutorConfig,
    filter: &ClaimFilter,
    shutdown_rx: mpsc::Receiver<()>,
    stats: &Mutex<ExecutorStats>,
) {
    info!(executor = %config.name, "job executor started");
    let start_time = Instant::now();
    let mut idle = false;

    loop {
        let stop = if idle {
            !matches!(
                shutdown_rx.recv_timeout(config.poll_interval),
                Err(mpsc::RecvTimeoutError::Timeout)
            )
        } else {
            !matches!(shutdown_rx.try_recv(), Err(mpsc::TryRecvError::Empty))
        };
        if stop {
            break;
        }

        match executor.run_once(filter) {
            Ok(Some(outcome)) => {
                idle = false;
                if let Ok(mut s) = stats.lock() {
                    s.record(outcome);
                    s.uptime_secs = start_time.elapsed().as_secs();
                }
            }
            Ok(None) => {
                idle = true;
                let recovered = if config.recover_parents {
                    match executor.recover_stalled_parents() {
                        Ok(n) => n,
                        Err(e) => {
                            warn!(executor = %config.name, error = %e, "stalled parent sweep failed");
                            0
                        }
                    }
                } else {
                    0
                };
                if let Ok(mut s) = stats.lock() {
                    s.parents_recovered += recovered as u64;
                    s.uptime_secs = start_time.elapsed().as_secs();
                }
            }
            Err(e) => {
                idle = true;
                error!(executor = %config.name, error = %e, "job run failed");
            }
        }
    }

    info!(executor = %config.name, "job executor stopped");
}
