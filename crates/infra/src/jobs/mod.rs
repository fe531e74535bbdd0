//! Course-generation job orchestration.
//!
//! ## Design
//!
//! - Jobs are tenant-scoped, typed and carry the ids of the content they act on
//! - `claim_next` is atomic: two workers never hold the same job
//! - One retry policy (`FailJob`) for every type; bad input fails at once
//! - A stale `Processing` job is reclaimed and counts as a retry
//! - Rows that cannot be decoded are failed instead of blocking the queue
//! - A `FullCourse` parent tracks lesson children and is finalized exactly once
//!
//! ## Components
//!
//! - `GenerationJob`: the job row and its transitions
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `JobLifecycle`: completion and failure paths shared by all processors
//! - `ParentFinalizer`: aggregates children into the parent's terminal status
//!   and recovers parents whose finalization was missed
//! - `JobExecutor`: polls, routes claimed jobs to processors
//! - `JobService`: enqueue, fan-out, cancel and queries

pub mod executor;
pub mod finalizer;
pub mod lifecycle;
pub mod postgres;
pub mod service;
pub mod store;
pub mod types;

pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle, RunOutcome};
pub use finalizer::{ParentFinalizer, DEFAULT_FINALIZE_ATTEMPTS};
pub use lifecycle::JobLifecycle;
pub use postgres::PostgresJobStore;
pub use service::{JobService, JobServiceError, LessonTarget};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{
    ChildAggregate, ClaimFilter, ClaimedJob, FailureOutcome, FinalizationResult, FinalizeLabels,
    GenerationJob, JobStats, JobStatus, JobType, MalformedJob, DEFAULT_MAX_RETRIES,
};
