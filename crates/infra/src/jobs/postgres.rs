//! Postgres-backed job store.
//!
//! ## Claiming
//!
//! `claim_next` selects one eligible row with `FOR UPDATE SKIP LOCKED` and
//! moves it to `processing` in the same statement, so two workers can never
//! claim the same job. Rows are decoded only after the claim is committed; a
//! row that fails to decode is returned as [`ClaimedJob::Malformed`] and stays
//! `processing` until the caller fails it.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` on inserts, `Validation` elsewhere |
//! | Database (foreign key violation) | `23503` | `Validation` |
//! | Database (check constraint violation) | `23514` | `Validation` |
//! | Database (not null violation) | `23502` | `Validation` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Io / timeouts | N/A | `Storage` |
//!
//! ## Runtime
//!
//! The `JobStore` trait is synchronous. Workers run on plain threads, so the
//! store keeps a handle to the tokio runtime that owns the pool and blocks on
//! it. Never call the sync methods from inside an async task.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::{instrument, warn, Span};

use coursegen_core::{
    CourseId, JobId, LessonId, OutlineLessonId, SmeTaskId, SubmissionId, TenantId, UserId,
};

use super::store::{validate_fan_out, JobStore, JobStoreError};
use super::types::{
    ChildAggregate, ClaimFilter, ClaimedJob, FinalizationResult, FinalizeLabels, GenerationJob,
    JobStats, JobStatus, JobType, MalformedJob,
};

const JOB_COLUMNS: &str = r#"
    id, tenant_id, user_id, job_type, status,
    course_id, lesson_id, outline_lesson_id, sme_task_id, submission_id, parent_job_id,
    progress_percent, progress_message, tokens_used, error_message,
    retry_count, max_retries, created_at, started_at, completed_at
"#;

/// Postgres-backed job table.
///
/// Every tenant-scoped query carries `tenant_id` in its WHERE clause.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresJobStore {
    /// Create a store over `pool`; `runtime` drives the sync trait methods.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, tenant_id = %job.tenant_id, job_type = %job.job_type),
        err
    )]
    pub async fn insert(&self, job: GenerationJob) -> Result<GenerationJob, JobStoreError> {
        job.validate()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        if let Some(parent_id) = job.parent_job_id {
            let parent = sqlx::query("SELECT tenant_id, job_type FROM generation_jobs WHERE id = $1")
                .bind(parent_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("load_parent", e))?;

            let Some(parent) = parent else {
                return Err(JobStoreError::Validation(format!(
                    "parent job {parent_id} does not exist"
                )));
            };
            let parent_tenant: uuid::Uuid = parent
                .try_get("tenant_id")
                .map_err(|e| map_sqlx_error("load_parent", e))?;
            let parent_type: String = parent
                .try_get("job_type")
                .map_err(|e| map_sqlx_error("load_parent", e))?;

            if parent_tenant != *job.tenant_id.as_uuid() {
                return Err(JobStoreError::TenantIsolation);
            }
            if parent_type != JobType::FullCourse.as_str() {
                return Err(JobStoreError::Validation(format!(
                    "parent job {parent_id} is not a full_course job"
                )));
            }
        }

        let stored = insert_row(&mut tx, &job).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(stored)
    }

    #[instrument(
        skip(self, parent, children),
        fields(parent_id = %parent.id, tenant_id = %parent.tenant_id, child_count = children.len()),
        err
    )]
    pub async fn insert_fan_out(
        &self,
        parent: GenerationJob,
        children: Vec<GenerationJob>,
    ) -> Result<(GenerationJob, Vec<GenerationJob>), JobStoreError> {
        validate_fan_out(&parent, &children)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let parent = insert_row(&mut tx, &parent).await?;
        let mut stored_children = Vec::with_capacity(children.len());
        for child in &children {
            stored_children.push(insert_row(&mut tx, child).await?);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok((parent, stored_children))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    pub async fn fetch(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
    ) -> Result<Option<GenerationJob>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM generation_jobs WHERE id = $1 AND tenant_id = $2");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(tenant_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(|row| decode_strict(&row)).transpose()
    }

    /// Claim one eligible job.
    #[instrument(
        skip(self, filter),
        fields(
            job_types = ?filter.job_types,
            include_unrecognized = filter.include_unrecognized,
            malformed = tracing::field::Empty,
        ),
        err
    )]
    pub async fn claim(&self, filter: &ClaimFilter) -> Result<Option<ClaimedJob>, JobStoreError> {
        let span = Span::current();

        let allowed: Vec<String> = filter
            .job_types
            .iter()
            .filter(|t| !t.is_tracking())
            .map(|t| t.as_str().to_string())
            .collect();
        let known: Vec<String> = JobType::ALL.iter().map(|t| t.as_str().to_string()).collect();
        let stale_secs = filter.stale_after.num_milliseconds() as f64 / 1000.0;

        // The inner SELECT sees the pre-update status; a stale reclaim
        // counts as one more attempt.
        let sql = format!(
            r#"
            WITH next AS (
                SELECT id
                FROM generation_jobs
                WHERE job_type <> 'full_course'
                  AND (job_type = ANY($1) OR ($2 AND NOT (job_type = ANY($3))))
                  AND (
                        status = 'queued'
                        OR (status = 'processing' AND started_at < NOW() - make_interval(secs => $4))
                  )
                ORDER BY CASE WHEN status = 'queued' THEN 0 ELSE 1 END, created_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE generation_jobs AS j
            SET status = 'processing',
                retry_count = CASE WHEN j.status = 'processing' THEN j.retry_count + 1 ELSE j.retry_count END,
                started_at = NOW()
            FROM next
            WHERE j.id = next.id
            RETURNING {}
            "#,
            qualified_columns("j")
        );

        let row = sqlx::query(&sql)
            .bind(&allowed)
            .bind(filter.include_unrecognized)
            .bind(&known)
            .bind(stale_secs)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let claimed = decode_claimed(&row)?;
        if let ClaimedJob::Malformed(ref m) = claimed {
            span.record("malformed", true);
            warn!(job_id = %m.id, reason = %m.reason, "claimed a job row that cannot be decoded");
        }
        Ok(Some(claimed))
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status), err)]
    pub async fn save(&self, job: &GenerationJob) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = $3,
                progress_percent = GREATEST(progress_percent, $4),
                progress_message = $5,
                tokens_used = $6,
                error_message = $7,
                retry_count = $8,
                started_at = $9,
                completed_at = CASE
                    WHEN $3 IN ('completed', 'failed', 'cancelled') THEN COALESCE($10, NOW())
                    ELSE $10
                END
            WHERE id = $1
              AND tenant_id = $2
              AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.tenant_id.as_uuid())
        .bind(job.status.as_str())
        .bind(i32::from(job.progress_percent.min(100)))
        .bind(&job.progress_message)
        .bind(to_i64(job.tokens_used))
        .bind(&job.error_message)
        .bind(to_i32(job.retry_count))
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        Err(self.explain_missed_write(Some(job.tenant_id), job.id).await)
    }

    #[instrument(skip(self, message), fields(job_id = %job_id), err)]
    pub async fn mark_malformed(&self, job_id: JobId, message: &str) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = 'failed',
                error_message = $2,
                progress_message = 'Failed: ' || $2,
                completed_at = NOW()
            WHERE id = $1
              AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(message)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_malformed", e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        Err(self.explain_missed_write(None, job_id).await)
    }

    #[instrument(
        skip(self),
        fields(tenant_id = %tenant_id, job_id = %job_id, cascaded = tracing::field::Empty),
        err
    )]
    pub async fn cancel_job(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
    ) -> Result<GenerationJob, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE id = $1 AND tenant_id = $2 FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(tenant_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_job", e))?
            .ok_or(JobStoreError::NotFound(job_id))?;
        let mut job = decode_strict(&row)?;

        if job.status.is_terminal() {
            return Err(JobStoreError::InvalidTransition {
                id: job_id,
                from: job.status,
                to: JobStatus::Cancelled,
            });
        }

        let completed_at: DateTime<Utc> = sqlx::query_scalar(
            r#"
            UPDATE generation_jobs
            SET status = 'cancelled', progress_message = 'Cancelled', completed_at = NOW()
            WHERE id = $1 AND tenant_id = $2
            RETURNING completed_at
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(tenant_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("cancel_job", e))?;

        if job.job_type.is_tracking() {
            let cascaded = sqlx::query(
                r#"
                UPDATE generation_jobs
                SET status = 'cancelled', progress_message = 'Cancelled', completed_at = NOW()
                WHERE parent_job_id = $1
                  AND tenant_id = $2
                  AND status IN ('queued', 'processing')
                "#,
            )
            .bind(job_id.as_uuid())
            .bind(tenant_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("cancel_children", e))?;
            Span::current().record("cascaded", cascaded.rows_affected());
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        job.mark_cancelled(completed_at);
        Ok(job)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, parent_id = %parent_id), err)]
    pub async fn children(
        &self,
        tenant_id: TenantId,
        parent_id: JobId,
    ) -> Result<Vec<GenerationJob>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs \
             WHERE tenant_id = $1 AND parent_job_id = $2 \
             ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(parent_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_by_parent_id", e))?;

        Ok(decode_listing(&rows))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, status = ?status), err)]
    pub async fn by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<GenerationJob>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs \
             WHERE tenant_id = $1 AND ($2::TEXT IS NULL OR status = $2) \
             ORDER BY created_at, id \
             LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(status.map(|s| s.as_str()))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_by_status", e))?;

        Ok(decode_listing(&rows))
    }

    /// Lock the parent row, aggregate its children and finalize at most once.
    #[instrument(
        skip(self, labels),
        fields(
            tenant_id = %tenant_id,
            parent_id = %parent_id,
            already_final = tracing::field::Empty,
            final_status = tracing::field::Empty,
        ),
        err
    )]
    pub async fn finalize_parent(
        &self,
        tenant_id: TenantId,
        parent_id: JobId,
        labels: &FinalizeLabels,
    ) -> Result<Option<FinalizationResult>, JobStoreError> {
        labels.validate()?;
        let span = Span::current();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM generation_jobs WHERE id = $1 AND tenant_id = $2 FOR UPDATE",
        )
        .bind(parent_id.as_uuid())
        .bind(tenant_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_parent", e))?;

        let Some(status) = status else {
            return Ok(None);
        };
        let parent_status: JobStatus = status
            .parse()
            .map_err(|e| JobStoreError::Storage(format!("parent {parent_id}: {e}")))?;

        if parent_status.is_terminal() {
            span.record("already_final", true);
            return Ok(Some(FinalizationResult::already_final(parent_status)));
        }

        let counts = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled,
                COALESCE(SUM(tokens_used), 0)::BIGINT AS total_tokens
            FROM generation_jobs
            WHERE parent_job_id = $1 AND tenant_id = $2
            "#,
        )
        .bind(parent_id.as_uuid())
        .bind(tenant_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("aggregate_children", e))?;

        let agg = aggregate_from_row(&counts).map_err(|e| map_sqlx_error("aggregate_children", e))?;
        if agg.pending() > 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(Some(FinalizationResult::from_aggregate(&agg, false, parent_status)));
        }

        let (final_status, error) = agg.verdict(labels);
        sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = $3,
                progress_percent = 100,
                progress_message = $4,
                tokens_used = $5,
                error_message = COALESCE($6, error_message),
                completed_at = NOW()
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(parent_id.as_uuid())
        .bind(tenant_id.as_uuid())
        .bind(final_status.as_str())
        .bind(&labels.progress_message)
        .bind(to_i64(agg.total_tokens))
        .bind(&error)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("finalize_parent", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        span.record("final_status", final_status.as_str());
        Ok(Some(FinalizationResult::from_aggregate(&agg, true, final_status)))
    }

    #[instrument(skip(self), fields(found = tracing::field::Empty), err)]
    pub async fn stalled(&self, limit: usize) -> Result<Vec<(TenantId, JobId)>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT p.tenant_id, p.id
            FROM generation_jobs AS p
            WHERE p.job_type = 'full_course'
              AND p.status IN ('queued', 'processing')
              AND NOT EXISTS (
                    SELECT 1
                    FROM generation_jobs AS c
                    WHERE c.parent_job_id = p.id
                      AND c.status IN ('queued', 'processing')
              )
            ORDER BY p.created_at, p.id
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stalled_parents", e))?;

        let parents = rows
            .iter()
            .map(|row| {
                let tenant_id: uuid::Uuid = row.try_get("tenant_id")?;
                let id: uuid::Uuid = row.try_get("id")?;
                Ok((TenantId::from_uuid(tenant_id), JobId::from_uuid(id)))
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| map_sqlx_error("stalled_parents", e))?;

        Span::current().record("found", parents.len());
        Ok(parents)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    pub async fn counts(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM generation_jobs WHERE tenant_id = $1 GROUP BY status",
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let Ok(status) = status.parse::<JobStatus>() else {
                warn!(status = %status, "ignoring unknown job status in stats");
                continue;
            };
            for _ in 0..n {
                stats.record(status);
            }
        }
        Ok(stats)
    }

    /// A conditional write touched no row: work out why.
    async fn explain_missed_write(&self, tenant_id: Option<TenantId>, job_id: JobId) -> JobStoreError {
        let status: Result<Option<String>, _> = sqlx::query_scalar(
            "SELECT status FROM generation_jobs WHERE id = $1 AND ($2::UUID IS NULL OR tenant_id = $2)",
        )
        .bind(job_id.as_uuid())
        .bind(tenant_id.map(|t| *t.as_uuid()))
        .fetch_optional(&*self.pool)
        .await;

        match status {
            Ok(None) => JobStoreError::NotFound(job_id),
            Ok(Some(_)) => JobStoreError::AlreadyTerminal(job_id),
            Err(e) => map_sqlx_error("explain_missed_write", e),
        }
    }
}

impl JobStore for PostgresJobStore {
    fn create(&self, job: GenerationJob) -> Result<GenerationJob, JobStoreError> {
        self.runtime.block_on(self.insert(job))
    }

    fn create_fan_out(
        &self,
        parent: GenerationJob,
        children: Vec<GenerationJob>,
    ) -> Result<(GenerationJob, Vec<GenerationJob>), JobStoreError> {
        self.runtime.block_on(self.insert_fan_out(parent, children))
    }

    fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<GenerationJob>, JobStoreError> {
        self.runtime.block_on(self.fetch(tenant_id, job_id))
    }

    fn claim_next(&self, filter: &ClaimFilter) -> Result<Option<ClaimedJob>, JobStoreError> {
        self.runtime.block_on(self.claim(filter))
    }

    fn update(&self, job: &GenerationJob) -> Result<(), JobStoreError> {
        self.runtime.block_on(self.save(job))
    }

    fn fail_malformed(&self, job_id: JobId, message: &str) -> Result<(), JobStoreError> {
        self.runtime.block_on(self.mark_malformed(job_id, message))
    }

    fn cancel(&self, tenant_id: TenantId, job_id: JobId) -> Result<GenerationJob, JobStoreError> {
        self.runtime.block_on(self.cancel_job(tenant_id, job_id))
    }

    fn list_by_parent_id(
        &self,
        tenant_id: TenantId,
        parent_id: JobId,
    ) -> Result<Vec<GenerationJob>, JobStoreError> {
        self.runtime.block_on(self.children(tenant_id, parent_id))
    }

    fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<GenerationJob>, JobStoreError> {
        self.runtime.block_on(self.by_status(tenant_id, status, limit))
    }

    fn try_finalize_parent(
        &self,
        tenant_id: TenantId,
        parent_id: JobId,
        labels: &FinalizeLabels,
    ) -> Result<Option<FinalizationResult>, JobStoreError> {
        self.runtime
            .block_on(self.finalize_parent(tenant_id, parent_id, labels))
    }

    fn stalled_parents(&self, limit: usize) -> Result<Vec<(TenantId, JobId)>, JobStoreError> {
        self.runtime.block_on(self.stalled(limit))
    }

    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        self.runtime.block_on(self.counts(tenant_id))
    }
}

async fn insert_row(
    tx: &mut Transaction<'_, Postgres>,
    job: &GenerationJob,
) -> Result<GenerationJob, JobStoreError> {
    let sql = format!(
        r#"
        INSERT INTO generation_jobs (
            id, tenant_id, user_id, job_type, status,
            course_id, lesson_id, outline_lesson_id, sme_task_id, submission_id, parent_job_id,
            progress_percent, tokens_used, retry_count, max_retries, created_at
        )
        VALUES ($1, $2, $3, $4, 'queued', $5, $6, $7, $8, $9, $10, 0, 0, 0, $11, NOW())
        RETURNING {JOB_COLUMNS}
        "#
    );

    let row = sqlx::query(&sql)
        .bind(job.id.as_uuid())
        .bind(job.tenant_id.as_uuid())
        .bind(job.user_id.as_uuid())
        .bind(job.job_type.as_str())
        .bind(job.course_id.map(|id| *id.as_uuid()))
        .bind(job.lesson_id.map(|id| *id.as_uuid()))
        .bind(job.outline_lesson_id.map(|id| *id.as_uuid()))
        .bind(job.sme_task_id.map(|id| *id.as_uuid()))
        .bind(job.submission_id.map(|id| *id.as_uuid()))
        .bind(job.parent_job_id.map(|id| *id.as_uuid()))
        .bind(to_i32(job.max_retries))
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

    decode_strict(&row)
}

fn qualified_columns(alias: &str) -> String {
    JOB_COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn aggregate_from_row(row: &PgRow) -> Result<ChildAggregate, sqlx::Error> {
    let count = |name: &str| -> Result<u32, sqlx::Error> {
        let n: i64 = row.try_get(name)?;
        Ok(u32::try_from(n).unwrap_or(u32::MAX))
    };
    let tokens: i64 = row.try_get("total_tokens")?;
    Ok(ChildAggregate {
        total: count("total")?,
        completed: count("completed")?,
        failed: count("failed")?,
        cancelled: count("cancelled")?,
        total_tokens: u64::try_from(tokens).unwrap_or_default(),
    })
}

fn decode_claimed(row: &PgRow) -> Result<ClaimedJob, JobStoreError> {
    let raw = JobRow::from_row(row).map_err(|e| map_sqlx_error("decode_job", e))?;
    Ok(raw.into_claimed())
}

fn decode_strict(row: &PgRow) -> Result<GenerationJob, JobStoreError> {
    let raw = JobRow::from_row(row).map_err(|e| map_sqlx_error("decode_job", e))?;
    let id = raw.id;
    GenerationJob::try_from(raw)
        .map_err(|reason| JobStoreError::Storage(format!("job {id} cannot be decoded: {reason}")))
}

fn decode_listing(rows: &[PgRow]) -> Vec<GenerationJob> {
    rows.iter()
        .filter_map(|row| match decode_strict(row) {
            Ok(job) => Some(job),
            Err(e) => {
                warn!(error = %e, "skipping undecodable job row");
                None
            }
        })
        .collect()
}

/// Map sqlx errors to job store errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // foreign key / check / not null / unique outside an insert
                Some("23503") | Some("23514") | Some("23502") | Some("23505") => {
                    JobStoreError::Validation(msg)
                }
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            JobStoreError::Storage(format!("unexpected row not found in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

// SQLx row types

/// A job row exactly as stored, before any domain checks.
#[derive(Debug, Clone)]
struct JobRow {
    id: uuid::Uuid,
    tenant_id: Option<uuid::Uuid>,
    user_id: Option<uuid::Uuid>,
    job_type: String,
    status: String,
    course_id: Option<uuid::Uuid>,
    lesson_id: Option<uuid::Uuid>,
    outline_lesson_id: Option<uuid::Uuid>,
    sme_task_id: Option<uuid::Uuid>,
    submission_id: Option<uuid::Uuid>,
    parent_job_id: Option<uuid::Uuid>,
    progress_percent: i32,
    progress_message: Option<String>,
    tokens_used: i64,
    error_message: Option<String>,
    retry_count: i32,
    max_retries: i32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            user_id: row.try_get("user_id")?,
            job_type: row.try_get("job_type")?,
            status: row.try_get("status")?,
            course_id: row.try_get("course_id")?,
            lesson_id: row.try_get("lesson_id")?,
            outline_lesson_id: row.try_get("outline_lesson_id")?,
            sme_task_id: row.try_get("sme_task_id")?,
            submission_id: row.try_get("submission_id")?,
            parent_job_id: row.try_get("parent_job_id")?,
            progress_percent: row.try_get("progress_percent")?,
            progress_message: row.try_get("progress_message")?,
            tokens_used: row.try_get("tokens_used")?,
            error_message: row.try_get("error_message")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

impl JobRow {
    fn into_claimed(self) -> ClaimedJob {
        let id = JobId::from_uuid(self.id);
        let tenant_id = self.tenant_id.map(TenantId::from_uuid);
        let parent_job_id = self.parent_job_id.map(JobId::from_uuid);
        match GenerationJob::try_from(self) {
            Ok(job) => ClaimedJob::Ready(job),
            Err(reason) => ClaimedJob::Malformed(MalformedJob {
                id,
                tenant_id,
                parent_job_id,
                reason,
            }),
        }
    }
}

impl TryFrom<JobRow> for GenerationJob {
    type Error = String;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let tenant_id = row
            .tenant_id
            .filter(|t| !t.is_nil())
            .map(TenantId::from_uuid)
            .ok_or("missing tenant_id")?;
        let user_id = row
            .user_id
            .map(UserId::from_uuid)
            .ok_or("missing user_id")?;
        let job_type: JobType = row.job_type.parse().map_err(|e| format!("{e}"))?;
        let status: JobStatus = row.status.parse().map_err(|e| format!("{e}"))?;

        let progress_percent = u8::try_from(row.progress_percent)
            .ok()
            .filter(|p| *p <= 100)
            .ok_or_else(|| format!("progress_percent out of range: {}", row.progress_percent))?;
        let tokens_used = u64::try_from(row.tokens_used)
            .map_err(|_| format!("negative tokens_used: {}", row.tokens_used))?;
        let retry_count = u32::try_from(row.retry_count)
            .map_err(|_| format!("negative retry_count: {}", row.retry_count))?;
        let max_retries = u32::try_from(row.max_retries)
            .map_err(|_| format!("negative max_retries: {}", row.max_retries))?;

        let job = GenerationJob {
            id: JobId::from_uuid(row.id),
            tenant_id,
            user_id,
            job_type,
            status,
            course_id: row.course_id.map(CourseId::from_uuid),
            lesson_id: row.lesson_id.map(LessonId::from_uuid),
            outline_lesson_id: row.outline_lesson_id.map(OutlineLessonId::from_uuid),
            sme_task_id: row.sme_task_id.map(SmeTaskId::from_uuid),
            submission_id: row.submission_id.map(SubmissionId::from_uuid),
            parent_job_id: row.parent_job_id.map(JobId::from_uuid),
            progress_percent,
            progress_message: row.progress_message,
            tokens_used,
            error_message: row.error_message,
            retry_count,
            max_retries,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        };

        job.validate().map_err(|e| e.to_string())?;
        Ok(job)
    }
}
