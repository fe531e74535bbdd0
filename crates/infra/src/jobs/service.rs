//! Request-side job operations: enqueue, fan-out, cancel and queries.

use std::sync::Arc;

use tracing::{info, warn};

use coursegen_core::{CourseId, JobId, LessonId, OutlineLessonId, SmeTaskId, SubmissionId, TenantId, UserId};

use super::finalizer::ParentFinalizer;
use super::store::{JobStore, JobStoreError};
use super::types::{GenerationJob, JobStats, JobStatus, JobType};

/// Default page size for job listings.
pub const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobServiceError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// One lesson of a full-course fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LessonTarget {
    pub lesson_id: LessonId,
    pub outline_lesson_id: Option<OutlineLessonId>,
}

impl LessonTarget {
    pub fn new(lesson_id: LessonId) -> Self {
        Self {
            lesson_id,
            outline_lesson_id: None,
        }
    }

    pub fn from_outline(mut self, outline_lesson_id: OutlineLessonId) -> Self {
        self.outline_lesson_id = Some(outline_lesson_id);
        self
    }
}

pub struct JobService {
    store: Arc<dyn JobStore>,
    finalizer: Arc<ParentFinalizer>,
    max_retries: Option<u32>,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>, finalizer: Arc<ParentFinalizer>) -> Self {
        Self {
            store,
            finalizer,
            max_retries: None,
        }
    }

    /// Retry budget for new processable jobs instead of the per-type default.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    fn job(&self, tenant_id: TenantId, user_id: UserId, job_type: JobType) -> GenerationJob {
        let job = GenerationJob::new(tenant_id, user_id, job_type);
        match self.max_retries {
            Some(max) if !job_type.is_tracking() => job.with_max_retries(max),
            _ => job,
        }
    }

    fn create(&self, job: GenerationJob) -> Result<GenerationJob, JobServiceError> {
        let job = self.store.create(job)?;
        info!(
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            job_type = %job.job_type,
            "job enqueued"
        );
        Ok(job)
    }

    pub fn enqueue_outline(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        course_id: CourseId,
    ) -> Result<GenerationJob, JobServiceError> {
        self.create(self.job(tenant_id, user_id, JobType::CourseOutline).with_course(course_id))
    }

    pub fn enqueue_lesson_content(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        course_id: CourseId,
        lesson: LessonTarget,
    ) -> Result<GenerationJob, JobServiceError> {
        self.create(self.lesson_job(tenant_id, user_id, course_id, lesson))
    }

    fn lesson_job(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        course_id: CourseId,
        lesson: LessonTarget,
    ) -> GenerationJob {
        let job = self
            .job(tenant_id, user_id, JobType::LessonContent)
            .with_course(course_id)
            .with_lesson(lesson.lesson_id);
        match lesson.outline_lesson_id {
            Some(id) => job.with_outline_lesson(id),
            None => job,
        }
    }

    /// Create a `FullCourse` parent with one lesson-content child per lesson,
    /// atomically.
    pub fn enqueue_full_course(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        course_id: CourseId,
        lessons: &[LessonTarget],
    ) -> Result<(GenerationJob, Vec<GenerationJob>), JobServiceError> {
        if lessons.is_empty() {
            return Err(JobServiceError::Validation(
                "a full course needs at least one lesson".to_string(),
            ));
        }

        let parent = self
            .job(tenant_id, user_id, JobType::FullCourse)
            .with_course(course_id);
        let children = lessons
            .iter()
            .map(|lesson| {
                self.lesson_job(tenant_id, user_id, course_id, *lesson)
                    .with_parent(parent.id)
            })
            .collect();

        let (parent, children) = self.store.create_fan_out(parent, children)?;
        info!(
            parent_id = %parent.id,
            tenant_id = %tenant_id,
            course_id = %course_id,
            children = children.len(),
            "full course enqueued"
        );
        Ok((parent, children))
    }

    pub fn enqueue_component_regen(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        lesson_id: LessonId,
    ) -> Result<GenerationJob, JobServiceError> {
        self.create(self.job(tenant_id, user_id, JobType::ComponentRegen).with_lesson(lesson_id))
    }

    pub fn enqueue_sme_ingestion(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        sme_task_id: SmeTaskId,
        submission_id: SubmissionId,
    ) -> Result<GenerationJob, JobServiceError> {
        self.create(
            self.job(tenant_id, user_id, JobType::SmeIngestion)
                .with_sme_task(sme_task_id)
                .with_submission(submission_id),
        )
    }

    /// Cancel a live job. A cancelled child may be the last one its parent
    /// was waiting for, so the parent is finalized too.
    pub fn cancel(&self, tenant_id: TenantId, job_id: JobId) -> Result<GenerationJob, JobServiceError> {
        let job = self.store.cancel(tenant_id, job_id).map_err(|e| match e {
            JobStoreError::NotFound(id) => JobServiceError::NotFound(id),
            other => JobServiceError::Store(other),
        })?;
        info!(job_id = %job.id, tenant_id = %tenant_id, job_type = %job.job_type, "job cancelled");

        if let Some(parent_id) = job.parent_job_id {
            if let Err(e) = self.finalizer.finalize_with_retry(tenant_id, parent_id) {
                warn!(job_id = %job.id, parent_id = %parent_id, error = %e, "parent finalization failed");
            }
        }
        Ok(job)
    }

    pub fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<GenerationJob, JobServiceError> {
        self.store
            .get(tenant_id, job_id)?
            .ok_or(JobServiceError::NotFound(job_id))
    }

    pub fn list_children(
        &self,
        tenant_id: TenantId,
        parent_id: JobId,
    ) -> Result<Vec<GenerationJob>, JobServiceError> {
        Ok(self.store.list_by_parent_id(tenant_id, parent_id)?)
    }

    pub fn list(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<GenerationJob>, JobServiceError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, 500);
        Ok(self.store.list_by_status(tenant_id, status, limit)?)
    }

    pub fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobServiceError> {
        Ok(self.store.stats(tenant_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::InMemoryContent;
    use crate::jobs::InMemoryJobStore;
    use crate::notify::{InMemoryNotifier, Notification};

    struct Fixture {
        service: JobService,
        notifier: Arc<InMemoryNotifier>,
        tenant: TenantId,
        user: UserId,
        course: CourseId,
    }

    fn fixture() -> Fixture {
        let store = InMemoryJobStore::arc();
        let notifier = Arc::new(InMemoryNotifier::new());
        let finalizer = Arc::new(ParentFinalizer::new(
            store.clone(),
            notifier.clone(),
            Arc::new(InMemoryContent::new()),
        ));
        Fixture {
            service: JobService::new(store, finalizer),
            notifier,
            tenant: TenantId::new(),
            user: UserId::new(),
            course: CourseId::new(),
        }
    }

    fn targets(n: usize) -> Vec<LessonTarget> {
        (0..n).map(|_| LessonTarget::new(LessonId::new())).collect()
    }

    #[test]
    fn enqueue_outline_creates_a_queued_job() {
        let f = fixture();
        let job = f.service.enqueue_outline(f.tenant, f.user, f.course).unwrap();

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.course_id, Some(f.course));
        assert_eq!(job.max_retries, 3);
        assert_eq!(f.service.get(f.tenant, job.id).unwrap(), job);
    }

    #[test]
    fn full_course_fans_out_one_child_per_lesson() {
        let f = fixture();
        let outline_lesson = OutlineLessonId::new();
        let mut lessons = targets(2);
        lessons[0] = lessons[0].from_outline(outline_lesson);

        let (parent, children) = f
            .service
            .enqueue_full_course(f.tenant, f.user, f.course, &lessons)
            .unwrap();

        assert_eq!(parent.job_type, JobType::FullCourse);
        assert_eq!(parent.max_retries, 0);
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.parent_job_id == Some(parent.id)));
        assert_eq!(children[0].outline_lesson_id, Some(outline_lesson));
        assert_eq!(f.service.list_children(f.tenant, parent.id).unwrap().len(), 2);
    }

    #[test]
    fn regen_and_ingestion_carry_their_linkage() {
        let f = fixture();
        let lesson = LessonId::new();
        let regen = f
            .service
            .enqueue_component_regen(f.tenant, f.user, lesson)
            .unwrap();
        assert_eq!(regen.job_type, JobType::ComponentRegen);
        assert_eq!(regen.lesson_id, Some(lesson));
        assert_eq!(regen.course_id, None);

        let (task, submission) = (SmeTaskId::new(), SubmissionId::new());
        let ingestion = f
            .service
            .enqueue_sme_ingestion(f.tenant, f.user, task, submission)
            .unwrap();
        assert_eq!(ingestion.sme_task_id, Some(task));
        assert_eq!(ingestion.submission_id, Some(submission));

        let queued = f.service.list(f.tenant, Some(JobStatus::Queued), None).unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(f.service.stats(f.tenant).unwrap().queued, 2);
    }

    #[test]
    fn full_course_without_lessons_is_rejected() {
        let f = fixture();
        assert!(matches!(
            f.service.enqueue_full_course(f.tenant, f.user, f.course, &[]),
            Err(JobServiceError::Validation(_))
        ));
        assert_eq!(f.service.stats(f.tenant).unwrap(), JobStats::default());
    }

    #[test]
    fn cancelling_the_last_pending_child_finalizes_the_parent() {
        let f = fixture();
        let (parent, children) = f
            .service
            .enqueue_full_course(f.tenant, f.user, f.course, &targets(1))
            .unwrap();

        f.service.cancel(f.tenant, children[0].id).unwrap();

        let parent = f.service.get(f.tenant, parent.id).unwrap();
        assert_eq!(parent.status, JobStatus::Completed);
        assert!(matches!(
            f.notifier.course_outcomes().as_slice(),
            [Notification::CourseComplete(o)] if o.completed_count == 0 && o.total_count == 1
        ));
    }

    #[test]
    fn cancelling_a_parent_cascades() {
        let f = fixture();
        let (parent, _) = f
            .service
            .enqueue_full_course(f.tenant, f.user, f.course, &targets(3))
            .unwrap();

        f.service.cancel(f.tenant, parent.id).unwrap();

        let children = f.service.list_children(f.tenant, parent.id).unwrap();
        assert!(children.iter().all(|c| c.status == JobStatus::Cancelled));
        assert_eq!(f.service.stats(f.tenant).unwrap().cancelled, 4);
    }

    #[test]
    fn other_tenants_cannot_see_or_cancel() {
        let f = fixture();
        let job = f.service.enqueue_outline(f.tenant, f.user, f.course).unwrap();
        let other = TenantId::new();

        assert_eq!(
            f.service.get(other, job.id),
            Err(JobServiceError::NotFound(job.id))
        );
        assert_eq!(
            f.service.cancel(other, job.id),
            Err(JobServiceError::NotFound(job.id))
        );
    }

    #[test]
    fn custom_retry_budget_skips_tracking_jobs() {
        let f = fixture();
        let service = JobService { max_retries: Some(5), ..f.service };
        let (parent, children) = service
            .enqueue_full_course(f.tenant, f.user, f.course, &targets(1))
            .unwrap();
        assert_eq!(parent.max_retries, 0);
        assert_eq!(children[0].max_retries, 5);
    }
}
