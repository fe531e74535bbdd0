//! Type-specific job processors.
//!
//! A processor receives a job that is already `Processing`, reports phase
//! progress through [`JobContext`], and returns a [`Completion`]. The executor
//! turns the result into a completion or a `FailJob` via
//! [`JobLifecycle`](crate::jobs::JobLifecycle).

use std::sync::Arc;

use tracing::{debug, warn};

use coursegen_ai::{AiError, AudienceProfile, ProviderGateway};
use coursegen_core::TenantId;
use coursegen_courses::{GenerationInput, TargetAudience};

use crate::content::{Repositories, RepositoryError};
use crate::jobs::{GenerationJob, JobStore, JobStoreError, JobType};
use crate::notify::{JobProgress, Notifier};

pub mod component_regen;
pub mod lesson_content;
pub mod outline;
pub mod sme_ingestion;

pub use component_regen::ComponentRegenProcessor;
pub use lesson_content::LessonContentProcessor;
pub use outline::OutlineProcessor;
pub use sme_ingestion::SmeIngestionProcessor;

/// Why a processor gave up on a job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    /// The job's data is intrinsically bad; retrying will not help.
    #[error("invalid job input: {0}")]
    Validation(String),
    #[error(transparent)]
    Provider(#[from] AiError),
    #[error("job store error: {0}")]
    Store(JobStoreError),
    #[error("repository error: {0}")]
    Repository(RepositoryError),
    /// The job became terminal (cancelled) while it was being processed.
    #[error("job was cancelled while processing")]
    Cancelled,
}

impl ProcessError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Subject to the retry policy (as opposed to failing at once).
    pub fn is_retryable(&self) -> bool {
        match self {
            ProcessError::Validation(_) | ProcessError::Cancelled => false,
            ProcessError::Provider(_) => true,
            ProcessError::Store(e) => e.is_transient(),
            ProcessError::Repository(e) => matches!(e, RepositoryError::Storage(_)),
        }
    }
}

/// Zero-based position of a generated item as stored.
pub(crate) fn position(index: usize, what: &str) -> Result<u32, ProcessError> {
    u32::try_from(index)
        .map_err(|_| ProcessError::validation(format!("{what} position {index} is out of range")))
}

impl From<JobStoreError> for ProcessError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::AlreadyTerminal(_) => ProcessError::Cancelled,
            other => ProcessError::Store(other),
        }
    }
}

impl From<RepositoryError> for ProcessError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(what) => {
                ProcessError::Validation(format!("{what} does not exist"))
            }
            other => ProcessError::Repository(other),
        }
    }
}

/// Successful processor run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub message: String,
}

impl Completion {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub trait JobProcessor: Send + Sync {
    fn job_type(&self) -> JobType;

    fn process(&self, ctx: &mut JobContext<'_>) -> Result<Completion, ProcessError>;

    /// Hook for a job that ended `Failed`.
    fn on_terminal_failure(&self, _job: &GenerationJob) {}
}

/// What a processor sees while it runs one claimed job.
pub struct JobContext<'a> {
    job: &'a mut GenerationJob,
    store: &'a dyn JobStore,
    notifier: &'a dyn Notifier,
}

impl<'a> JobContext<'a> {
    pub fn new(job: &'a mut GenerationJob, store: &'a dyn JobStore, notifier: &'a dyn Notifier) -> Self {
        Self {
            job,
            store,
            notifier,
        }
    }

    pub fn job(&self) -> &GenerationJob {
        &*self.job
    }

    pub fn tenant_id(&self) -> TenantId {
        self.job.tenant_id
    }

    /// Record a phase transition.
    ///
    /// Persisting it is best-effort: a failed write is logged and ignored,
    /// except when the job went terminal under us, which stops the run.
    pub fn progress(&mut self, percent: u8, message: &str) -> Result<(), ProcessError> {
        self.job.set_progress(percent, message);
        match self.store.update(&*self.job) {
            Ok(()) => {}
            Err(JobStoreError::AlreadyTerminal(_)) => return Err(ProcessError::Cancelled),
            Err(e) => {
                warn!(job_id = %self.job.id, error = %e, "failed to persist job progress");
            }
        }

        debug!(job_id = %self.job.id, percent, message, "job progress");
        if let Err(e) = self.notifier.notify_job_progress(&JobProgress::of(&*self.job)) {
            warn!(job_id = %self.job.id, error = %e, "progress notification failed");
        }
        Ok(())
    }

    /// Add provider usage to the job; persisted with the next write.
    pub fn record_tokens(&mut self, tokens: u64) {
        self.job.add_tokens(tokens);
    }
}

/// Dependencies shared by the generation processors.
#[derive(Clone)]
pub struct ProcessorDeps {
    pub repos: Repositories,
    pub gateway: Arc<dyn ProviderGateway>,
}

impl ProcessorDeps {
    /// Atomic tenant-level usage increment. Best-effort.
    pub(crate) fn bill_tokens(&self, tenant_id: TenantId, tokens: u64) {
        if tokens == 0 {
            return;
        }
        if let Err(e) = self.repos.ai_settings.increment_token_usage(tenant_id, tokens) {
            warn!(tenant_id = %tenant_id, tokens, error = %e, "failed to record token usage");
        }
    }

    /// Course input plus its audience and SME knowledge.
    pub(crate) fn course_context(
        &self,
        tenant_id: TenantId,
        course_id: coursegen_core::CourseId,
    ) -> Result<CourseContext, ProcessError> {
        let input = self
            .repos
            .inputs
            .generation_input(tenant_id, course_id)?
            .ok_or_else(|| {
                ProcessError::validation(format!("no generation input for course {course_id}"))
            })?;
        input
            .validate()
            .map_err(|e| ProcessError::validation(e.to_string()))?;

        let audience = match input.audience_id {
            Some(id) => self.repos.inputs.audience(tenant_id, id)?,
            None => None,
        };

        let knowledge = self
            .repos
            .sme
            .knowledge(tenant_id, &input.sme_task_ids)?
            .into_iter()
            .map(|c| c.content)
            .collect();

        Ok(CourseContext {
            input,
            audience,
            knowledge,
        })
    }
}

impl core::fmt::Debug for ProcessorDeps {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProcessorDeps").finish_non_exhaustive()
    }
}

pub(crate) struct CourseContext {
    pub input: GenerationInput,
    pub audience: Option<TargetAudience>,
    pub knowledge: Vec<String>,
}

impl CourseContext {
    pub fn audience_profile(&self) -> Option<AudienceProfile> {
        self.audience.as_ref().map(|a| AudienceProfile {
            name: a.name.clone(),
            description: a.description.clone(),
            expertise_level: a.expertise_level.clone(),
        })
    }
}
