//! Parent-job finalizer.
//!
//! Called after every terminal transition of a fan-out child. The store does
//! the locked check-and-update; this type turns the single winning call into
//! exactly one course notification.
//!
//! Transient store errors are retried a few times in place. A parent whose
//! last finalization still failed keeps no live children, so
//! [`ParentFinalizer::recover_stalled`] finds it later and finishes the job.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use coursegen_core::{JobId, TenantId};

use crate::content::GenerationInputRepository;
use crate::notify::{CourseOutcome, Notifier};

use super::store::{JobStore, JobStoreError};
use super::types::{FinalizationResult, FinalizeLabels};

const FALLBACK_COURSE_TITLE: &str = "your course";

/// In-place attempts for a finalization hitting transient store errors.
pub const DEFAULT_FINALIZE_ATTEMPTS: u32 = 3;

pub struct ParentFinalizer {
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn Notifier>,
    inputs: Arc<dyn GenerationInputRepository>,
    labels: FinalizeLabels,
    attempts: u32,
    retry_delay: Duration,
}

impl ParentFinalizer {
    pub fn new(
        store: Arc<dyn JobStore>,
        notifier: Arc<dyn Notifier>,
        inputs: Arc<dyn GenerationInputRepository>,
    ) -> Self {
        Self {
            store,
            notifier,
            inputs,
            labels: FinalizeLabels::default(),
            attempts: DEFAULT_FINALIZE_ATTEMPTS,
            retry_delay: Duration::from_millis(50),
        }
    }

    pub fn with_labels(mut self, labels: FinalizeLabels) -> Self {
        self.labels = labels;
        self
    }

    /// Attempts per finalization (at least one) and the pause between them.
    pub fn with_retry(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// [`finalize`](Self::finalize), retrying transient store errors.
    pub fn finalize_with_retry(
        &self,
        tenant_id: TenantId,
        parent_id: JobId,
    ) -> Result<Option<FinalizationResult>, JobStoreError> {
        let mut attempt = 1;
        loop {
            match self.finalize(tenant_id, parent_id) {
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    warn!(
                        parent_id = %parent_id,
                        attempt,
                        error = %e,
                        "parent finalization failed, retrying"
                    );
                    thread::sleep(self.retry_delay * attempt);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Finalize parents that were left live after all their children ended.
    /// Returns how many were finalized.
    pub fn recover_stalled(&self, limit: usize) -> Result<usize, JobStoreError> {
        let mut recovered = 0;
        for (tenant_id, parent_id) in self.store.stalled_parents(limit)? {
            match self.finalize(tenant_id, parent_id) {
                Ok(Some(result)) if result.was_finalized => {
                    info!(parent_id = %parent_id, "recovered stalled parent job");
                    recovered += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(parent_id = %parent_id, error = %e, "stalled parent recovery failed");
                }
            }
        }
        Ok(recovered)
    }

    /// Try to finalize `parent_id`. `None` if the parent does not exist.
    pub fn finalize(
        &self,
        tenant_id: TenantId,
        parent_id: JobId,
    ) -> Result<Option<FinalizationResult>, JobStoreError> {
        let Some(result) = self
            .store
            .try_finalize_parent(tenant_id, parent_id, &self.labels)?
        else {
            warn!(tenant_id = %tenant_id, parent_id = %parent_id, "parent job not found for finalization");
            return Ok(None);
        };

        if !result.was_finalized {
            debug!(
                parent_id = %parent_id,
                pending = result.pending_count,
                total = result.total_count,
                "parent not finalized"
            );
            return Ok(Some(result));
        }

        info!(
            parent_id = %parent_id,
            status = %result.parent_status,
            completed = result.completed_count,
            failed = result.failed_count,
            tokens = result.total_tokens,
            "parent job finalized"
        );
        self.notify(tenant_id, parent_id, &result);
        Ok(Some(result))
    }

    fn notify(&self, tenant_id: TenantId, parent_id: JobId, result: &FinalizationResult) {
        let parent = match self.store.get(tenant_id, parent_id) {
            Ok(Some(parent)) => parent,
            Ok(None) => {
                warn!(parent_id = %parent_id, "finalized parent vanished before notification");
                return;
            }
            Err(e) => {
                warn!(parent_id = %parent_id, error = %e, "failed to load finalized parent");
                return;
            }
        };

        let course_title = parent
            .course_id
            .and_then(|course_id| match self.inputs.generation_input(tenant_id, course_id) {
                Ok(input) => input.map(|i| i.course_title),
                Err(e) => {
                    warn!(parent_id = %parent_id, error = %e, "failed to load course title");
                    None
                }
            })
            .unwrap_or_else(|| FALLBACK_COURSE_TITLE.to_string());

        let outcome = CourseOutcome {
            tenant_id,
            user_id: parent.user_id,
            course_id: parent.course_id,
            course_title,
            parent_job_id: parent_id,
            completed_count: result.completed_count,
            failed_count: result.failed_count,
            total_count: result.total_count,
            tokens_used: result.total_tokens,
            error: parent.error_message.clone(),
        };

        let sent = if result.parent_status == self.labels.completed {
            self.notifier.notify_course_complete(&outcome)
        } else {
            self.notifier.notify_course_failed(&outcome)
        };
        if let Err(e) = sent {
            warn!(parent_id = %parent_id, error = %e, "course notification failed");
        }
    }
}
