//! Terminal and retry transitions shared by every processor.

use std::sync::Arc;

use tracing::{info, warn};

use coursegen_core::Clock;

use crate::notify::{JobProgress, Notifier};

use super::finalizer::ParentFinalizer;
use super::store::{JobStore, JobStoreError};
use super::types::{FailureOutcome, GenerationJob, MalformedJob};

pub struct JobLifecycle {
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn Notifier>,
    finalizer: Arc<ParentFinalizer>,
    clock: Arc<dyn Clock>,
}

impl JobLifecycle {
    pub fn new(
        store: Arc<dyn JobStore>,
        notifier: Arc<dyn Notifier>,
        finalizer: Arc<ParentFinalizer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            notifier,
            finalizer,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn finalizer(&self) -> &Arc<ParentFinalizer> {
        &self.finalizer
    }

    /// Mark `job` completed, notify the requester and finalize its parent.
    pub fn complete(&self, job: &mut GenerationJob, message: &str) -> Result<(), JobStoreError> {
        job.mark_completed(self.clock.now(), message);
        self.store.update(job)?;

        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            tokens = job.tokens_used,
            "job completed"
        );
        self.notify(job);
        self.finalize_parent(job);
        Ok(())
    }

    /// `FailJob`: requeue while retries remain, otherwise fail terminally.
    pub fn fail(&self, job: &mut GenerationJob, message: &str) -> Result<FailureOutcome, JobStoreError> {
        let outcome = job.apply_failure(message, self.clock.now());
        self.store.update(job)?;

        match outcome {
            FailureOutcome::Requeued {
                attempt,
                max_retries,
            } => {
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt,
                    max_retries,
                    error = %message,
                    "job requeued after failure"
                );
                self.notify(job);
            }
            FailureOutcome::Failed => self.after_terminal_failure(job),
        }
        Ok(outcome)
    }

    /// Fail without consulting the retry budget.
    pub fn fail_terminally(&self, job: &mut GenerationJob, message: &str) -> Result<(), JobStoreError> {
        job.fail_terminally(message, self.clock.now());
        self.store.update(job)?;
        self.after_terminal_failure(job);
        Ok(())
    }

    /// Fail a claimed row that could not be decoded.
    pub fn fail_malformed(&self, job: &MalformedJob) -> Result<(), JobStoreError> {
        let message = format!("job could not be decoded: {}", job.reason);
        self.store.fail_malformed(job.id, &message)?;
        warn!(job_id = %job.id, reason = %job.reason, "malformed job failed");

        if let (Some(tenant_id), Some(parent_id)) = (job.tenant_id, job.parent_job_id) {
            if let Err(e) = self.finalizer.finalize_with_retry(tenant_id, parent_id) {
                warn!(job_id = %job.id, parent_id = %parent_id, error = %e, "parent finalization failed");
            }
        }
        Ok(())
    }

    fn after_terminal_failure(&self, job: &GenerationJob) {
        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            retries = job.retry_count,
            error = job.error_message.as_deref().unwrap_or_default(),
            "job failed"
        );
        self.notify(job);
        self.finalize_parent(job);
    }

    fn notify(&self, job: &GenerationJob) {
        if let Err(e) = self.notifier.notify_job_progress(&JobProgress::of(job)) {
            warn!(job_id = %job.id, error = %e, "job notification failed");
        }
    }

    /// Transient errors are retried in place. A parent still left live after
    /// its last child ended is finished by the executor's stalled-parent sweep.
    fn finalize_parent(&self, job: &GenerationJob) {
        let Some(parent_id) = job.parent_job_id else {
            return;
        };
        if let Err(e) = self.finalizer.finalize_with_retry(job.tenant_id, parent_id) {
            warn!(job_id = %job.id, parent_id = %parent_id, error = %e, "parent finalization failed");
        }
    }
}
