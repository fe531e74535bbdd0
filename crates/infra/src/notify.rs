//! User notifications about asynchronous job progress.
//!
//! Every notification is best-effort: callers log a failed send and carry on.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::info;

use coursegen_core::{CourseId, JobId, TenantId, UserId};

use crate::jobs::{GenerationJob, JobStatus, JobType};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),
}

/// A job phase transition, completion or failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobProgress {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub job_id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub message: Option<String>,
}

impl JobProgress {
    pub fn of(job: &GenerationJob) -> Self {
        Self {
            tenant_id: job.tenant_id,
            user_id: job.user_id,
            job_id: job.id,
            job_type: job.job_type,
            status: job.status,
            progress_percent: job.progress_percent,
            message: if job.status == JobStatus::Failed {
                job.error_message.clone()
            } else {
                job.progress_message.clone()
            },
        }
    }
}

/// Final word on a fan-out course generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CourseOutcome {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub course_id: Option<CourseId>,
    pub course_title: String,
    pub parent_job_id: JobId,
    pub completed_count: u32,
    pub failed_count: u32,
    pub total_count: u32,
    pub tokens_used: u64,
    pub error: Option<String>,
}

pub trait Notifier: Send + Sync {
    fn notify_job_progress(&self, progress: &JobProgress) -> Result<(), NotifyError>;

    fn notify_course_complete(&self, outcome: &CourseOutcome) -> Result<(), NotifyError>;

    fn notify_course_failed(&self, outcome: &CourseOutcome) -> Result<(), NotifyError>;
}

impl<N> Notifier for Arc<N>
where
    N: Notifier + ?Sized,
{
    fn notify_job_progress(&self, progress: &JobProgress) -> Result<(), NotifyError> {
        (**self).notify_job_progress(progress)
    }

    fn notify_course_complete(&self, outcome: &CourseOutcome) -> Result<(), NotifyError> {
        (**self).notify_course_complete(outcome)
    }

    fn notify_course_failed(&self, outcome: &CourseOutcome) -> Result<(), NotifyError> {
        (**self).notify_course_failed(outcome)
    }
}

/// Everything a notifier was asked to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    JobProgress(JobProgress),
    CourseComplete(CourseOutcome),
    CourseFailed(CourseOutcome),
}

/// Records notifications in memory. Used by tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: bool,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier whose every send fails (still records the attempt).
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn course_outcomes(&self) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|n| !matches!(n, Notification::JobProgress(_)))
            .collect()
    }

    fn record(&self, notification: Notification) -> Result<(), NotifyError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification);
        }
        if self.failing {
            return Err(NotifyError::Unavailable("in-memory notifier set to fail".to_string()));
        }
        Ok(())
    }
}

impl Notifier for InMemoryNotifier {
    fn notify_job_progress(&self, progress: &JobProgress) -> Result<(), NotifyError> {
        self.record(Notification::JobProgress(progress.clone()))
    }

    fn notify_course_complete(&self, outcome: &CourseOutcome) -> Result<(), NotifyError> {
        self.record(Notification::CourseComplete(outcome.clone()))
    }

    fn notify_course_failed(&self, outcome: &CourseOutcome) -> Result<(), NotifyError> {
        self.record(Notification::CourseFailed(outcome.clone()))
    }
}

/// Emits notifications as structured log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify_job_progress(&self, p: &JobProgress) -> Result<(), NotifyError> {
        info!(
            tenant_id = %p.tenant_id,
            user_id = %p.user_id,
            job_id = %p.job_id,
            job_type = %p.job_type,
            status = %p.status,
            progress = p.progress_percent,
            message = p.message.as_deref().unwrap_or_default(),
            "job progress"
        );
        Ok(())
    }

    fn notify_course_complete(&self, o: &CourseOutcome) -> Result<(), NotifyError> {
        info!(
            tenant_id = %o.tenant_id,
            user_id = %o.user_id,
            parent_job_id = %o.parent_job_id,
            course = %o.course_title,
            lessons = o.completed_count,
            tokens = o.tokens_used,
            "course generation complete"
        );
        Ok(())
    }

    fn notify_course_failed(&self, o: &CourseOutcome) -> Result<(), NotifyError> {
        info!(
            tenant_id = %o.tenant_id,
            user_id = %o.user_id,
            parent_job_id = %o.parent_job_id,
            course = %o.course_title,
            failed = o.failed_count,
            total = o.total_count,
            error = o.error.as_deref().unwrap_or_default(),
            "course generation failed"
        );
        Ok(())
    }
}
