//! Generation job entity, state transitions and claim/finalize value types.

use core::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use coursegen_core::{
    CourseId, DomainError, JobId, LessonId, OutlineLessonId, SmeTaskId, SubmissionId, TenantId,
    UserId,
};

/// Default retry budget for processable jobs.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Kind of generation work, used to route a claimed job to its processor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    CourseOutline,
    LessonContent,
    /// Fan-out parent tracking a course's lesson jobs. Never claimed.
    FullCourse,
    ComponentRegen,
    SmeIngestion,
}

impl JobType {
    pub const ALL: [JobType; 5] = [
        JobType::CourseOutline,
        JobType::LessonContent,
        JobType::FullCourse,
        JobType::ComponentRegen,
        JobType::SmeIngestion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::CourseOutline => "course_outline",
            JobType::LessonContent => "lesson_content",
            JobType::FullCourse => "full_course",
            JobType::ComponentRegen => "component_regen",
            JobType::SmeIngestion => "sme_ingestion",
        }
    }

    /// Tracking jobs aggregate children and are never processed themselves.
    pub fn is_tracking(&self) -> bool {
        matches!(self, JobType::FullCourse)
    }

    pub fn default_max_retries(&self) -> u32 {
        if self.is_tracking() {
            0
        } else {
            DEFAULT_MAX_RETRIES
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job type: {s}")))
    }
}

/// Job execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed
    Queued,
    /// Claimed by a worker
    Processing,
    Completed,
    Failed,
    /// Cancelled by user action
    Cancelled,
}

impl JobStatus {
    pub const TERMINAL: [JobStatus; 3] =
        [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled];

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// A tenant-scoped asynchronous AI generation job.
///
/// Linkage is a flat set of optional foreign keys. Which of them a job needs
/// depends on its type:
///
/// | type             | required linkage                 |
/// |------------------|----------------------------------|
/// | `CourseOutline`  | `course_id`                      |
/// | `LessonContent`  | `course_id`, `lesson_id`         |
/// | `FullCourse`     | `course_id`                      |
/// | `ComponentRegen` | `lesson_id`                      |
/// | `SmeIngestion`   | `sme_task_id`, `submission_id`   |
///
/// The storage layer does not enforce this; [`GenerationJob::validate`] runs
/// at create time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: JobId,
    pub tenant_id: TenantId,
    /// Requester; receives notifications.
    pub user_id: UserId,
    pub job_type: JobType,
    pub status: JobStatus,

    pub course_id: Option<CourseId>,
    pub lesson_id: Option<LessonId>,
    pub outline_lesson_id: Option<OutlineLessonId>,
    pub sme_task_id: Option<SmeTaskId>,
    pub submission_id: Option<SubmissionId>,
    /// Set only on fan-out children.
    pub parent_job_id: Option<JobId>,

    /// 0..=100, never decreases for the lifetime of the job.
    pub progress_percent: u8,
    pub progress_message: Option<String>,
    pub tokens_used: u64,
    /// Set only when the job failed (or is being retried after a failure).
    pub error_message: Option<String>,

    pub retry_count: u32,
    pub max_retries: u32,

    pub created_at: DateTime<Utc>,
    /// Set on claim, cleared on requeue.
    pub started_at: Option<DateTime<Utc>>,
    /// Set once, on any terminal transition.
    pub completed_at: Option<DateTime<Utc>>,
}

/// What `FailJob` decided for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to `Queued`; `attempt` is the new retry count.
    Requeued { attempt: u32, max_retries: u32 },
    /// Terminal `Failed`.
    Failed,
}

impl GenerationJob {
    /// Create a queued job. The store stamps `created_at` on insert.
    pub fn new(tenant_id: TenantId, user_id: UserId, job_type: JobType) -> Self {
        Self {
            id: JobId::new(),
            tenant_id,
            user_id,
            job_type,
            status: JobStatus::Queued,
            course_id: None,
            lesson_id: None,
            outline_lesson_id: None,
            sme_task_id: None,
            submission_id: None,
            parent_job_id: None,
            progress_percent: 0,
            progress_message: None,
            tokens_used: 0,
            error_message: None,
            retry_count: 0,
            max_retries: job_type.default_max_retries(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_course(mut self, course_id: CourseId) -> Self {
        self.course_id = Some(course_id);
        self
    }

    pub fn with_lesson(mut self, lesson_id: LessonId) -> Self {
        self.lesson_id = Some(lesson_id);
        self
    }

    pub fn with_outline_lesson(mut self, outline_lesson_id: OutlineLessonId) -> Self {
        self.outline_lesson_id = Some(outline_lesson_id);
        self
    }

    pub fn with_sme_task(mut self, sme_task_id: SmeTaskId) -> Self {
        self.sme_task_id = Some(sme_task_id);
        self
    }

    pub fn with_submission(mut self, submission_id: SubmissionId) -> Self {
        self.submission_id = Some(submission_id);
        self
    }

    pub fn with_parent(mut self, parent_job_id: JobId) -> Self {
        self.parent_job_id = Some(parent_job_id);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Check tenant presence and the type → linkage table.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.tenant_id.as_uuid().is_nil() {
            return Err(DomainError::validation("tenant_id is required"));
        }

        let missing = |field: &str| DomainError::required(format!("{} job", self.job_type), field);

        match self.job_type {
            JobType::CourseOutline | JobType::FullCourse => {
                self.course_id.ok_or_else(|| missing("course_id"))?;
            }
            JobType::LessonContent => {
                self.course_id.ok_or_else(|| missing("course_id"))?;
                self.lesson_id.ok_or_else(|| missing("lesson_id"))?;
            }
            JobType::ComponentRegen => {
                self.lesson_id.ok_or_else(|| missing("lesson_id"))?;
            }
            JobType::SmeIngestion => {
                self.sme_task_id.ok_or_else(|| missing("sme_task_id"))?;
                self.submission_id.ok_or_else(|| missing("submission_id"))?;
            }
        }

        if self.job_type.is_tracking() {
            if self.parent_job_id.is_some() {
                return Err(DomainError::validation("a full_course job cannot have a parent"));
            }
            if self.max_retries != 0 {
                return Err(DomainError::validation(
                    "tracking jobs are never retried (max_retries must be 0)",
                ));
            }
        }

        if self.parent_job_id == Some(self.id) {
            return Err(DomainError::validation("a job cannot be its own parent"));
        }

        Ok(())
    }

    /// Reset to the state every new row starts in.
    pub(crate) fn reset_for_insert(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Queued;
        self.created_at = now;
        self.started_at = None;
        self.completed_at = None;
        self.progress_percent = 0;
        self.progress_message = None;
        self.tokens_used = 0;
        self.error_message = None;
        self.retry_count = 0;
    }

    /// Record a phase transition. Progress never moves backwards.
    pub fn set_progress(&mut self, percent: u8, message: impl Into<String>) {
        self.progress_percent = self.progress_percent.max(percent.min(100));
        self.progress_message = Some(message.into());
    }

    pub fn add_tokens(&mut self, tokens: u64) {
        self.tokens_used = self.tokens_used.saturating_add(tokens);
    }

    /// Claim transition. Reclaiming a stale `Processing` job counts as a retry.
    pub(crate) fn mark_claimed(&mut self, now: DateTime<Utc>) {
        if self.status == JobStatus::Processing {
            self.retry_count += 1;
        }
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
    }

    /// Hand a claimed job back to the queue without counting an attempt.
    pub(crate) fn release_claim(&mut self) {
        self.status = JobStatus::Queued;
        self.started_at = None;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>, message: impl Into<String>) {
        self.status = JobStatus::Completed;
        self.progress_percent = 100;
        self.progress_message = Some(message.into());
        self.error_message = None;
        self.completed_at = Some(now);
    }

    /// Shared failure path: requeue while retries remain, otherwise fail.
    pub fn apply_failure(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> FailureOutcome {
        let message = message.into();
        if self.retry_count < self.max_retries {
            self.retry_count += 1;
            self.status = JobStatus::Queued;
            self.started_at = None;
            self.completed_at = None;
            self.progress_message = Some(format!(
                "Retry {}/{}: {}",
                self.retry_count, self.max_retries, message
            ));
            self.error_message = Some(message);
            FailureOutcome::Requeued {
                attempt: self.retry_count,
                max_retries: self.max_retries,
            }
        } else {
            self.fail_terminally(message, now);
            FailureOutcome::Failed
        }
    }

    /// Fail without consulting the retry budget (bad data will not improve).
    pub fn fail_terminally(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        let message = message.into();
        self.status = JobStatus::Failed;
        self.progress_message = Some(format!("Failed: {message}"));
        self.error_message = Some(message);
        self.completed_at = Some(now);
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Cancelled;
        self.progress_message = Some("Cancelled".to_string());
        self.completed_at = Some(now);
    }

    /// True when a stale reclaim pushed the attempt count past the budget.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count > self.max_retries
    }

    /// Eligible for `claim_next` at `now`?
    pub(crate) fn is_claimable(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        if self.job_type.is_tracking() {
            return false;
        }
        match self.status {
            JobStatus::Queued => true,
            JobStatus::Processing => self
                .started_at
                .is_some_and(|started| started < now - stale_after),
            _ => false,
        }
    }
}

/// Which jobs a worker family may claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimFilter {
    pub job_types: Vec<JobType>,
    /// Also claim rows whose stored type this build does not recognize, so
    /// they surface as malformed instead of sitting in the queue forever.
    pub include_unrecognized: bool,
    /// A `Processing` job whose `started_at` is older than this is presumed
    /// abandoned and may be reclaimed.
    pub stale_after: Duration,
}

impl ClaimFilter {
    pub fn only(job_types: impl IntoIterator<Item = JobType>) -> Self {
        Self {
            job_types: job_types
                .into_iter()
                .filter(|t| !t.is_tracking())
                .collect(),
            include_unrecognized: false,
            stale_after: Duration::minutes(30),
        }
    }

    pub fn with_unrecognized(mut self) -> Self {
        self.include_unrecognized = true;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn allows(&self, job_type: JobType) -> bool {
        self.job_types.contains(&job_type)
    }
}

/// A row claimed by `claim_next` that could not be decoded.
///
/// The claim itself is committed; the caller must fail the job explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedJob {
    pub id: JobId,
    pub tenant_id: Option<TenantId>,
    pub parent_job_id: Option<JobId>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimedJob {
    Ready(GenerationJob),
    Malformed(MalformedJob),
}

/// Labels applied to a parent when its children are all terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeLabels {
    pub completed: JobStatus,
    pub failed: JobStatus,
    pub progress_message: String,
}

impl Default for FinalizeLabels {
    fn default() -> Self {
        Self {
            completed: JobStatus::Completed,
            failed: JobStatus::Failed,
            progress_message: "Course generation finished".to_string(),
        }
    }
}

impl FinalizeLabels {
    pub fn validate(&self) -> Result<(), DomainError> {
        if !self.completed.is_terminal() || !self.failed.is_terminal() {
            return Err(DomainError::validation("finalize labels must be terminal statuses"));
        }
        Ok(())
    }
}

/// Counts over a parent's children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChildAggregate {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub cancelled: u32,
    pub total_tokens: u64,
}

impl ChildAggregate {
    pub fn from_children<'a>(children: impl IntoIterator<Item = &'a GenerationJob>) -> Self {
        children.into_iter().fold(Self::default(), |mut agg, child| {
            agg.total += 1;
            agg.total_tokens = agg.total_tokens.saturating_add(child.tokens_used);
            match child.status {
                JobStatus::Completed => agg.completed += 1,
                JobStatus::Failed => agg.failed += 1,
                JobStatus::Cancelled => agg.cancelled += 1,
                JobStatus::Queued | JobStatus::Processing => {}
            }
            agg
        })
    }

    /// Children neither completed, failed nor cancelled.
    pub fn pending(&self) -> u32 {
        self.total
            .saturating_sub(self.completed + self.failed + self.cancelled)
    }

    /// Parent status and error once nothing is pending.
    pub fn verdict(&self, labels: &FinalizeLabels) -> (JobStatus, Option<String>) {
        if self.failed > 0 {
            (
                labels.failed,
                Some(format!("{} lesson(s) failed to generate", self.failed)),
            )
        } else {
            (labels.completed, None)
        }
    }
}

/// Outcome of a finalization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizationResult {
    /// True only for the single call that moved the parent to a terminal status.
    pub was_finalized: bool,
    /// True when no child is pending (or the parent was already terminal).
    pub all_complete: bool,
    pub total_count: u32,
    pub completed_count: u32,
    pub failed_count: u32,
    pub pending_count: u32,
    pub total_tokens: u64,
    /// Parent status after the call.
    pub parent_status: JobStatus,
}

impl FinalizationResult {
    pub(crate) fn already_final(parent_status: JobStatus) -> Self {
        Self {
            was_finalized: false,
            all_complete: true,
            total_count: 0,
            completed_count: 0,
            failed_count: 0,
            pending_count: 0,
            total_tokens: 0,
            parent_status,
        }
    }

    pub(crate) fn from_aggregate(
        agg: &ChildAggregate,
        was_finalized: bool,
        parent_status: JobStatus,
    ) -> Self {
        Self {
            was_finalized,
            all_complete: agg.pending() == 0,
            total_count: agg.total,
            completed_count: agg.completed,
            failed_count: agg.failed,
            pending_count: agg.pending(),
            total_tokens: agg.total_tokens,
            parent_status,
        }
    }
}

/// Per-tenant job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStats {
    pub(crate) fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }
}
