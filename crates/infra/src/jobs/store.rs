//! Job storage: trait, errors and the in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use coursegen_core::{Clock, DomainError, JobId, SystemClock, TenantId};

use super::types::{
    ChildAggregate, ClaimFilter, ClaimedJob, FinalizationResult, FinalizeLabels, GenerationJob,
    JobStats, JobStatus, JobType, MalformedJob,
};

/// Durable table of generation jobs.
///
/// Every operation except `claim_next`, `fail_malformed` and
/// `stalled_parents` is scoped to a tenant: rows belonging to another tenant
/// are invisible.
pub trait JobStore: Send + Sync {
    /// Insert a job as `Queued` with `created_at = now`.
    fn create(&self, job: GenerationJob) -> Result<GenerationJob, JobStoreError>;

    /// Insert a `FullCourse` parent and its children in one atomic unit.
    fn create_fan_out(
        &self,
        parent: GenerationJob,
        children: Vec<GenerationJob>,
    ) -> Result<(GenerationJob, Vec<GenerationJob>), JobStoreError>;

    fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<GenerationJob>, JobStoreError>;

    /// Atomically claim one eligible job and move it to `Processing`.
    ///
    /// Eligible: `Queued`, or `Processing` with `started_at` older than
    /// `filter.stale_after`. Queued jobs win over stale ones; oldest
    /// `created_at` first within each class. Tracking jobs are never claimed.
    /// A stale reclaim increments `retry_count`.
    fn claim_next(&self, filter: &ClaimFilter) -> Result<Option<ClaimedJob>, JobStoreError>;

    /// Persist the mutable fields of a job.
    ///
    /// Identity, tenant, type and linkage are never written. Rejected with
    /// `AlreadyTerminal` if the stored row is terminal.
    fn update(&self, job: &GenerationJob) -> Result<(), JobStoreError>;

    /// Fail a claimed row that could not be decoded.
    fn fail_malformed(&self, job_id: JobId, message: &str) -> Result<(), JobStoreError>;

    /// Cancel a live job. Cancelling a tracking parent cancels its live
    /// children in the same unit.
    fn cancel(&self, tenant_id: TenantId, job_id: JobId) -> Result<GenerationJob, JobStoreError>;

    fn list_by_parent_id(
        &self,
        tenant_id: TenantId,
        parent_id: JobId,
    ) -> Result<Vec<GenerationJob>, JobStoreError>;

    fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<GenerationJob>, JobStoreError>;

    /// Lock the parent, aggregate its children and, if none is pending,
    /// move the parent to its terminal status. `None` if the parent does not
    /// exist.
    fn try_finalize_parent(
        &self,
        tenant_id: TenantId,
        parent_id: JobId,
        labels: &FinalizeLabels,
    ) -> Result<Option<FinalizationResult>, JobStoreError>;

    /// Live `FullCourse` parents none of whose children is live, oldest
    /// first. These missed their finalization and are safe to finalize again.
    fn stalled_parents(&self, limit: usize) -> Result<Vec<(TenantId, JobId)>, JobStoreError>;

    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError>;
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn create(&self, job: GenerationJob) -> Result<GenerationJob, JobStoreError> {
        (**self).create(job)
    }

    fn create_fan_out(
        &self,
        parent: GenerationJob,
        children: Vec<GenerationJob>,
    ) -> Result<(GenerationJob, Vec<GenerationJob>), JobStoreError> {
        (**self).create_fan_out(parent, children)
    }

    fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<GenerationJob>, JobStoreError> {
        (**self).get(tenant_id, job_id)
    }

    fn claim_next(&self, filter: &ClaimFilter) -> Result<Option<ClaimedJob>, JobStoreError> {
        (**self).claim_next(filter)
    }

    fn update(&self, job: &GenerationJob) -> Result<(), JobStoreError> {
        (**self).update(job)
    }

    fn fail_malformed(&self, job_id: JobId, message: &str) -> Result<(), JobStoreError> {
        (**self).fail_malformed(job_id, message)
    }

    fn cancel(&self, tenant_id: TenantId, job_id: JobId) -> Result<GenerationJob, JobStoreError> {
        (**self).cancel(tenant_id, job_id)
    }

    fn list_by_parent_id(
        &self,
        tenant_id: TenantId,
        parent_id: JobId,
    ) -> Result<Vec<GenerationJob>, JobStoreError> {
        (**self).list_by_parent_id(tenant_id, parent_id)
    }

    fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<GenerationJob>, JobStoreError> {
        (**self).list_by_status(tenant_id, status, limit)
    }

    fn try_finalize_parent(
        &self,
        tenant_id: TenantId,
        parent_id: JobId,
        labels: &FinalizeLabels,
    ) -> Result<Option<FinalizationResult>, JobStoreError> {
        (**self).try_finalize_parent(tenant_id, parent_id, labels)
    }

    fn stalled_parents(&self, limit: usize) -> Result<Vec<(TenantId, JobId)>, JobStoreError> {
        (**self).stalled_parents(limit)
    }

    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        (**self).stats(tenant_id)
    }
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// Bad input or a constraint violation (e.g. unknown tenant).
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    /// The stored job is terminal and cannot change anymore.
    #[error("job {0} is already terminal")]
    AlreadyTerminal(JobId),
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    /// Transient infrastructure failure; the caller decides whether to retry.
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, JobStoreError::Storage(_))
    }
}

impl From<DomainError> for JobStoreError {
    fn from(err: DomainError) -> Self {
        JobStoreError::Validation(err.to_string())
    }
}

/// Checks shared by every store before a fan-out insert.
pub(crate) fn validate_fan_out(
    parent: &GenerationJob,
    children: &[GenerationJob],
) -> Result<(), JobStoreError> {
    if parent.job_type != JobType::FullCourse {
        return Err(JobStoreError::Validation(format!(
            "fan-out parent must be a full_course job, got {}",
            parent.job_type
        )));
    }
    parent.validate()?;

    if children.is_empty() {
        return Err(JobStoreError::Validation(
            "fan-out requires at least one child".to_string(),
        ));
    }

    for child in children {
        child.validate()?;
        if child.tenant_id != parent.tenant_id {
            return Err(JobStoreError::TenantIsolation);
        }
        if child.parent_job_id != Some(parent.id) {
            return Err(JobStoreError::Validation(format!(
                "child {} does not point at parent {}",
                child.id, parent.id
            )));
        }
        if child.job_type.is_tracking() {
            return Err(JobStoreError::Validation(
                "fan-out children cannot be tracking jobs".to_string(),
            ));
        }
    }
    Ok(())
}

/// In-memory job store for tests/dev.
///
/// A single write lock serializes claims and finalization, which gives the
/// same exclusivity the Postgres store gets from row locks.
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, GenerationJob>>,
    clock: Arc<dyn Clock>,
    /// Upcoming `try_finalize_parent` calls that fail as a storage error.
    finalize_failures: AtomicU32,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            clock,
            finalize_failures: AtomicU32::new(0),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, GenerationJob>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job table lock poisoned".to_string()))
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<JobId, GenerationJob>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job table lock poisoned".to_string()))
    }

    /// Test hook: overwrite a stored row as-is (bypasses every invariant).
    #[cfg(test)]
    pub(crate) fn force_put(&self, job: GenerationJob) {
        if let Ok(mut jobs) = self.jobs.write() {
            jobs.insert(job.id, job);
        }
    }

    /// Test hook: make the next `n` finalizations fail with a storage error.
    #[cfg(test)]
    pub(crate) fn fail_finalizations(&self, n: u32) {
        self.finalize_failures.store(n, Ordering::SeqCst);
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let count = self.jobs.read().map(|j| j.len()).unwrap_or_default();
        f.debug_struct("InMemoryJobStore").field("jobs", &count).finish()
    }
}

impl JobStore for InMemoryJobStore {
    fn create(&self, mut job: GenerationJob) -> Result<GenerationJob, JobStoreError> {
        job.validate()?;
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        if let Some(parent_id) = job.parent_job_id {
            match jobs.get(&parent_id) {
                Some(parent) if parent.tenant_id != job.tenant_id => {
                    return Err(JobStoreError::TenantIsolation);
                }
                Some(parent) if parent.job_type.is_tracking() => {}
                _ => {
                    return Err(JobStoreError::Validation(format!(
                        "parent job {parent_id} does not exist or is not a full_course job"
                    )));
                }
            }
        }

        job.reset_for_insert(self.clock.now());
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn create_fan_out(
        &self,
        mut parent: GenerationJob,
        mut children: Vec<GenerationJob>,
    ) -> Result<(GenerationJob, Vec<GenerationJob>), JobStoreError> {
        validate_fan_out(&parent, &children)?;

        let mut jobs = self.write()?;
        for id in std::iter::once(parent.id).chain(children.iter().map(|c| c.id)) {
            if jobs.contains_key(&id) {
                return Err(JobStoreError::AlreadyExists(id));
            }
        }

        let now = self.clock.now();
        parent.reset_for_insert(now);
        jobs.insert(parent.id, parent.clone());
        for child in children.iter_mut() {
            child.reset_for_insert(now);
            jobs.insert(child.id, child.clone());
        }
        Ok((parent, children))
    }

    fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<GenerationJob>, JobStoreError> {
        let jobs = self.read()?;
        Ok(jobs
            .get(&job_id)
            .filter(|j| j.tenant_id == tenant_id)
            .cloned())
    }

    fn claim_next(&self, filter: &ClaimFilter) -> Result<Option<ClaimedJob>, JobStoreError> {
        let mut jobs = self.write()?;
        let now = self.clock.now();

        let next = jobs
            .values()
            .filter(|j| filter.allows(j.job_type) && j.is_claimable(now, filter.stale_after))
            .min_by_key(|j| (j.status != JobStatus::Queued, j.created_at, j.id))
            .map(|j| j.id);

        let Some(job_id) = next else {
            return Ok(None);
        };

        match jobs.get_mut(&job_id) {
            Some(job) => {
                job.mark_claimed(now);
                match job.validate() {
                    Ok(()) => Ok(Some(ClaimedJob::Ready(job.clone()))),
                    Err(e) => Ok(Some(ClaimedJob::Malformed(MalformedJob {
                        id: job.id,
                        tenant_id: Some(job.tenant_id),
                        parent_job_id: job.parent_job_id,
                        reason: e.to_string(),
                    }))),
                }
            }
            None => Ok(None),
        }
    }

    fn update(&self, job: &GenerationJob) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        let stored = match jobs.get_mut(&job.id) {
            Some(stored) if stored.tenant_id == job.tenant_id => stored,
            _ => return Err(JobStoreError::NotFound(job.id)),
        };

        if stored.status.is_terminal() {
            return Err(JobStoreError::AlreadyTerminal(job.id));
        }

        stored.status = job.status;
        stored.progress_percent = stored.progress_percent.max(job.progress_percent.min(100));
        stored.progress_message = job.progress_message.clone();
        stored.tokens_used = job.tokens_used;
        stored.error_message = job.error_message.clone();
        stored.retry_count = job.retry_count;
        stored.started_at = job.started_at;
        stored.completed_at = if job.status.is_terminal() {
            job.completed_at.or_else(|| Some(self.clock.now()))
        } else {
            job.completed_at
        };
        Ok(())
    }

    fn fail_malformed(&self, job_id: JobId, message: &str) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        let now = self.clock.now();
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.status.is_terminal() {
            return Err(JobStoreError::AlreadyTerminal(job_id));
        }
        job.fail_terminally(message, now);
        Ok(())
    }

    fn cancel(&self, tenant_id: TenantId, job_id: JobId) -> Result<GenerationJob, JobStoreError> {
        let mut jobs = self.write()?;
        let now = self.clock.now();

        let job = match jobs.get_mut(&job_id) {
            Some(job) if job.tenant_id == tenant_id => job,
            _ => return Err(JobStoreError::NotFound(job_id)),
        };
        if job.status.is_terminal() {
            return Err(JobStoreError::InvalidTransition {
                id: job_id,
                from: job.status,
                to: JobStatus::Cancelled,
            });
        }
        job.mark_cancelled(now);
        let cancelled = job.clone();

        if cancelled.job_type.is_tracking() {
            for child in jobs.values_mut().filter(|c| {
                c.parent_job_id == Some(job_id) && c.tenant_id == tenant_id && c.status.is_live()
            }) {
                child.mark_cancelled(now);
            }
        }

        Ok(cancelled)
    }

    fn list_by_parent_id(
        &self,
        tenant_id: TenantId,
        parent_id: JobId,
    ) -> Result<Vec<GenerationJob>, JobStoreError> {
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && j.parent_job_id == Some(parent_id))
            .cloned()
            .collect();
        result.sort_by_key(|j| (j.created_at, j.id));
        Ok(result)
    }

    fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<GenerationJob>, JobStoreError> {
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    fn try_finalize_parent(
        &self,
        tenant_id: TenantId,
        parent_id: JobId,
        labels: &FinalizeLabels,
    ) -> Result<Option<FinalizationResult>, JobStoreError> {
        labels.validate()?;
        if self
            .finalize_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(JobStoreError::Storage("connection reset".to_string()));
        }

        // Holding the write lock for the whole call is the "row lock".
        let mut jobs = self.write()?;
        let parent_status = match jobs.get(&parent_id) {
            Some(p) if p.tenant_id == tenant_id => p.status,
            _ => return Ok(None),
        };

        if parent_status.is_terminal() {
            return Ok(Some(FinalizationResult::already_final(parent_status)));
        }

        let agg = ChildAggregate::from_children(
            jobs.values()
                .filter(|c| c.tenant_id == tenant_id && c.parent_job_id == Some(parent_id)),
        );

        if agg.pending() > 0 {
            return Ok(Some(FinalizationResult::from_aggregate(&agg, false, parent_status)));
        }

        let (status, error) = agg.verdict(labels);
        let now = self.clock.now();
        let Some(parent) = jobs.get_mut(&parent_id) else {
            return Ok(None);
        };
        parent.status = status;
        parent.progress_percent = 100;
        parent.progress_message = Some(labels.progress_message.clone());
        parent.tokens_used = agg.total_tokens;
        parent.completed_at = Some(now);
        if error.is_some() {
            parent.error_message = error;
        }

        Ok(Some(FinalizationResult::from_aggregate(&agg, true, status)))
    }

    fn stalled_parents(&self, limit: usize) -> Result<Vec<(TenantId, JobId)>, JobStoreError> {
        let jobs = self.read()?;
        let mut parents: Vec<&GenerationJob> = jobs
            .values()
            .filter(|p| p.job_type.is_tracking() && p.status.is_live())
            .filter(|p| {
                !jobs
                    .values()
                    .any(|c| c.parent_job_id == Some(p.id) && c.status.is_live())
            })
            .collect();
        parents.sort_by_key(|p| (p.created_at, p.id));
        Ok(parents
            .into_iter()
            .take(limit)
            .map(|p| (p.tenant_id, p.id))
            .collect())
    }

    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for job in jobs.values().filter(|j| j.tenant_id == tenant_id) {
            stats.record(job.status);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use chrono::{Duration, Utc};
    use coursegen_core::{CourseId, LessonId, ManualClock, UserId};

    use super::*;

    fn test_tenant() -> TenantId {
        TenantId::new()
    }

    fn outline_job(tenant: TenantId) -> GenerationJob {
        GenerationJob::new(tenant, UserId::new(), JobType::CourseOutline).with_course(CourseId::new())
    }

    fn lesson_filter() -> ClaimFilter {
        ClaimFilter::only([JobType::CourseOutline, JobType::LessonContent])
    }

    fn ready(claim: Option<ClaimedJob>) -> GenerationJob {
        match claim {
            Some(ClaimedJob::Ready(job)) => job,
            other => panic!("expected a ready job, got {other:?}"),
        }
    }

    fn fan_out(
        store: &InMemoryJobStore,
        tenant: TenantId,
        n: usize,
    ) -> (GenerationJob, Vec<GenerationJob>) {
        let user = UserId::new();
        let course = CourseId::new();
        let parent = GenerationJob::new(tenant, user, JobType::FullCourse).with_course(course);
        let children = (0..n)
            .map(|_| {
                GenerationJob::new(tenant, user, JobType::LessonContent)
                    .with_course(course)
                    .with_lesson(LessonId::new())
                    .with_parent(parent.id)
            })
            .collect();
        store.create_fan_out(parent, children).unwrap()
    }

    #[test]
    fn create_and_claim() {
        let store = InMemoryJobStore::new();
        let tenant = test_tenant();

        let created = store.create(outline_job(tenant)).unwrap();
        assert_eq!(created.status, JobStatus::Queued);

        let claimed = ready(store.claim_next(&lesson_filter()).unwrap());
        assert_eq!(claimed.id, created.id);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert!(claimed.started_at.is_some());
        assert_eq!(claimed.retry_count, 0);

        assert!(store.claim_next(&lesson_filter()).unwrap().is_none());
    }

    #[test]
    fn create_rejects_missing_linkage() {
        let store = InMemoryJobStore::new();
        let job = GenerationJob::new(test_tenant(), UserId::new(), JobType::LessonContent);
        assert!(matches!(store.create(job), Err(JobStoreError::Validation(_))));
    }

    #[test]
    fn tenant_isolation() {
        let store = InMemoryJobStore::new();
        let tenant1 = test_tenant();
        let tenant2 = test_tenant();

        let job = store.create(outline_job(tenant1)).unwrap();

        assert!(store.get(tenant2, job.id).unwrap().is_none());
        assert!(store.get(tenant1, job.id).unwrap().is_some());
        assert!(matches!(
            store.cancel(tenant2, job.id),
            Err(JobStoreError::NotFound(_))
        ));
    }

    #[test]
    fn claim_order_prefers_queued_then_oldest() {
        let clock = ManualClock::starting_now();
        let store = InMemoryJobStore::with_clock(clock.clone());
        let tenant = test_tenant();

        let stale = store.create(outline_job(tenant)).unwrap();
        clock.advance(Duration::seconds(1));
        ready(store.claim_next(&lesson_filter()).unwrap());

        clock.advance(Duration::seconds(1));
        let older = store.create(outline_job(tenant)).unwrap();
        clock.advance(Duration::seconds(1));
        let newer = store.create(outline_job(tenant)).unwrap();

        clock.advance(Duration::hours(1));

        let first = ready(store.claim_next(&lesson_filter()).unwrap());
        let second = ready(store.claim_next(&lesson_filter()).unwrap());
        let third = ready(store.claim_next(&lesson_filter()).unwrap());
        assert_eq!(first.id, older.id);
        assert_eq!(second.id, newer.id);
        assert_eq!(third.id, stale.id);
    }

    #[test]
    fn stale_processing_job_is_reclaimed_with_one_more_retry() {
        let clock = ManualClock::starting_now();
        let store = InMemoryJobStore::with_clock(clock.clone());
        let filter = lesson_filter().with_stale_after(Duration::minutes(30));

        store.create(outline_job(test_tenant())).unwrap();
        let first = ready(store.claim_next(&filter).unwrap());
        assert_eq!(first.retry_count, 0);

        clock.advance(Duration::minutes(29));
        assert!(store.claim_next(&filter).unwrap().is_none());

        clock.advance(Duration::minutes(2));
        let reclaimed = ready(store.claim_next(&filter).unwrap());
        assert_eq!(reclaimed.id, first.id);
        assert_eq!(reclaimed.retry_count, 1);
        assert_eq!(reclaimed.started_at, Some(clock.now()));
    }

    #[test]
    fn filter_and_tracking_exclusion() {
        let store = InMemoryJobStore::new();
        let tenant = test_tenant();
        let (parent, children) = fan_out(&store, tenant, 1);

        let sme_only = ClaimFilter::only([JobType::SmeIngestion]);
        assert!(store.claim_next(&sme_only).unwrap().is_none());

        let everything = ClaimFilter::only(JobType::ALL);
        let claimed = ready(store.claim_next(&everything).unwrap());
        assert_eq!(claimed.id, children[0].id);
        assert!(store.claim_next(&everything).unwrap().is_none());
        assert_eq!(
            store.get(tenant, parent.id).unwrap().unwrap().status,
            JobStatus::Queued
        );
    }

    #[test]
    fn concurrent_claims_are_exclusive() {
        let store = Arc::new(InMemoryJobStore::new());
        store.create(outline_job(test_tenant())).unwrap();

        let workers = 16;
        let barrier = Arc::new(Barrier::new(workers));
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    store.claim_next(&lesson_filter()).unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(Option::is_some)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn terminal_jobs_are_immutable() {
        let store = InMemoryJobStore::new();
        let tenant = test_tenant();
        store.create(outline_job(tenant)).unwrap();
        let mut job = ready(store.claim_next(&lesson_filter()).unwrap());

        job.mark_completed(Utc::now(), "done");
        store.update(&job).unwrap();

        let mut again = job.clone();
        again.status = JobStatus::Queued;
        assert_eq!(
            store.update(&again),
            Err(JobStoreError::AlreadyTerminal(job.id))
        );
        assert_eq!(
            store.get(tenant, job.id).unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[test]
    fn update_never_touches_identity_or_linkage() {
        let store = InMemoryJobStore::new();
        let tenant = test_tenant();
        let created = store.create(outline_job(tenant)).unwrap();

        let mut tampered = created.clone();
        tampered.job_type = JobType::SmeIngestion;
        tampered.course_id = None;
        tampered.tokens_used = 12;
        store.update(&tampered).unwrap();

        let stored = store.get(tenant, created.id).unwrap().unwrap();
        assert_eq!(stored.job_type, JobType::CourseOutline);
        assert_eq!(stored.course_id, created.course_id);
        assert_eq!(stored.tokens_used, 12);
    }

    #[test]
    fn finalize_waits_for_pending_children() {
        let store = InMemoryJobStore::new();
        let tenant = test_tenant();
        let (parent, children) = fan_out(&store, tenant, 2);

        let mut first = children[0].clone();
        first.mark_completed(Utc::now(), "done");
        first.tokens_used = 7;
        store.update(&first).unwrap();

        let result = store
            .try_finalize_parent(tenant, parent.id, &FinalizeLabels::default())
            .unwrap()
            .unwrap();
        assert!(!result.was_finalized);
        assert!(!result.all_complete);
        assert_eq!(result.pending_count, 1);
        assert_eq!(
            store.get(tenant, parent.id).unwrap().unwrap().status,
            JobStatus::Queued
        );
    }

    #[test]
    fn finalize_mixed_children_and_idempotence() {
        let store = InMemoryJobStore::new();
        let tenant = test_tenant();
        let (parent, children) = fan_out(&store, tenant, 3);

        for (child, (status, tokens)) in children.iter().zip([
            (JobStatus::Completed, 10),
            (JobStatus::Completed, 20),
            (JobStatus::Failed, 5),
        ]) {
            let mut c = child.clone();
            c.status = status;
            c.tokens_used = tokens;
            c.completed_at = Some(Utc::now());
            store.update(&c).unwrap();
        }

        let labels = FinalizeLabels::default();
        let result = store
            .try_finalize_parent(tenant, parent.id, &labels)
            .unwrap()
            .unwrap();
        assert!(result.was_finalized);
        assert_eq!(result.completed_count, 2);
        assert_eq!(result.failed_count, 1);
        assert_eq!(result.total_count, 3);
        assert_eq!(result.total_tokens, 35);

        let finalized = store.get(tenant, parent.id).unwrap().unwrap();
        assert_eq!(finalized.status, JobStatus::Failed);
        assert_eq!(finalized.tokens_used, 35);
        assert_eq!(finalized.progress_percent, 100);
        assert!(finalized
            .error_message
            .as_deref()
            .unwrap()
            .contains("1 lesson(s) failed"));

        for _ in 0..2 {
            let again = store
                .try_finalize_parent(tenant, parent.id, &labels)
                .unwrap()
                .unwrap();
            assert!(!again.was_finalized);
            assert!(again.all_complete);
            let unchanged = store.get(tenant, parent.id).unwrap().unwrap();
            assert_eq!(unchanged.completed_at, finalized.completed_at);
            assert_eq!(unchanged.tokens_used, finalized.tokens_used);
        }
    }

    #[test]
    fn finalize_missing_parent_is_none() {
        let store = InMemoryJobStore::new();
        assert!(store
            .try_finalize_parent(test_tenant(), JobId::new(), &FinalizeLabels::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn concurrent_finalization_happens_once() {
        let store = Arc::new(InMemoryJobStore::new());
        let tenant = test_tenant();
        let (parent, children) = fan_out(&store, tenant, 8);
        for child in &children {
            let mut c = child.clone();
            c.mark_completed(Utc::now(), "done");
            store.update(&c).unwrap();
        }

        let barrier = Arc::new(Barrier::new(children.len()));
        let handles: Vec<_> = children
            .iter()
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    store
                        .try_finalize_parent(tenant, parent.id, &FinalizeLabels::default())
                        .unwrap()
                        .unwrap()
                        .was_finalized
                })
            })
            .collect();

        let finalized = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|f| *f)
            .count();
        assert_eq!(finalized, 1);
    }

    #[test]
    fn stalled_parents_are_live_parents_without_live_children() {
        let store = InMemoryJobStore::new();
        let tenant = test_tenant();
        let (waiting, _) = fan_out(&store, tenant, 1);
        let (stalled, children) = fan_out(&store, tenant, 2);
        let (finished, done) = fan_out(&store, test_tenant(), 1);

        for child in &children {
            let mut c = child.clone();
            c.mark_completed(Utc::now(), "done");
            store.update(&c).unwrap();
        }
        let mut c = done[0].clone();
        c.mark_completed(Utc::now(), "done");
        store.update(&c).unwrap();
        store
            .try_finalize_parent(finished.tenant_id, finished.id, &FinalizeLabels::default())
            .unwrap();

        let found = store.stalled_parents(10).unwrap();
        assert_eq!(found, vec![(tenant, stalled.id)]);
        assert!(!found.iter().any(|(_, id)| *id == waiting.id));
        assert!(store.stalled_parents(0).unwrap().is_empty());
    }

    #[test]
    fn injected_finalize_failures_are_transient_and_counted() {
        let store = InMemoryJobStore::new();
        let tenant = test_tenant();
        let (parent, _) = fan_out(&store, tenant, 1);
        store.fail_finalizations(1);

        let err = store
            .try_finalize_parent(tenant, parent.id, &FinalizeLabels::default())
            .unwrap_err();
        assert!(err.is_transient());
        assert!(store
            .try_finalize_parent(tenant, parent.id, &FinalizeLabels::default())
            .is_ok());
    }

    #[test]
    fn cancel_parent_cascades_to_live_children() {
        let store = InMemoryJobStore::new();
        let tenant = test_tenant();
        let (parent, children) = fan_out(&store, tenant, 2);

        let mut done = children[0].clone();
        done.mark_completed(Utc::now(), "done");
        store.update(&done).unwrap();

        let cancelled = store.cancel(tenant, parent.id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());

        let kids = store.list_by_parent_id(tenant, parent.id).unwrap();
        let statuses: Vec<_> = kids.iter().map(|k| (k.id, k.status)).collect();
        assert!(statuses.contains(&(children[0].id, JobStatus::Completed)));
        assert!(statuses.contains(&(children[1].id, JobStatus::Cancelled)));

        assert!(matches!(
            store.cancel(tenant, parent.id),
            Err(JobStoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn fan_out_rejects_cross_tenant_children() {
        let store = InMemoryJobStore::new();
        let user = UserId::new();
        let course = CourseId::new();
        let parent =
            GenerationJob::new(test_tenant(), user, JobType::FullCourse).with_course(course);
        let stranger = GenerationJob::new(test_tenant(), user, JobType::LessonContent)
            .with_course(course)
            .with_lesson(LessonId::new())
            .with_parent(parent.id);

        assert_eq!(
            store.create_fan_out(parent, vec![stranger]),
            Err(JobStoreError::TenantIsolation)
        );
    }

    #[test]
    fn stats_tracking() {
        let store = InMemoryJobStore::new();
        let tenant = test_tenant();

        for _ in 0..5 {
            store.create(outline_job(tenant)).unwrap();
        }
        store.create(outline_job(test_tenant())).unwrap();

        let stats = store.stats(tenant).unwrap();
        assert_eq!(stats.queued, 5);

        // Both claims may land on the other tenant's job; count across both.
        store.claim_next(&lesson_filter()).unwrap();
        store.claim_next(&lesson_filter()).unwrap();

        let stats = store.stats(tenant).unwrap();
        assert_eq!(stats.queued + stats.processing, 5);
        assert!(stats.processing >= 1);
    }
}
