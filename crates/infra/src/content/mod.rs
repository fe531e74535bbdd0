//! Repositories for course content the processors read and write.
//!
//! These are the systems of record for derived content (outlines, lesson
//! components, SME knowledge). Writes are not coordinated across jobs: each
//! is scoped to a job that is exclusively claimed.

use std::sync::Arc;

use coursegen_ai::{AiError, TenantCredentials, TenantCredentialsSource};
use coursegen_core::{
    AudienceId, CourseId, DomainError, LessonId, OutlineLessonId, SectionId, SmeTaskId,
    SubmissionId, TenantId,
};
use coursegen_courses::{
    GenerationInput, KnowledgeChunk, Lesson, LessonComponent, NewComponent, NewOutlineLesson,
    NewSection, OutlineLesson, OutlineSection, SmeSubmission, SubmissionStatus, TargetAudience,
};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryContent;
pub use postgres::PostgresContent;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("tenant isolation violation")]
    TenantIsolation,
    /// Transient infrastructure failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for RepositoryError {
    fn from(err: DomainError) -> Self {
        RepositoryError::Validation(err.to_string())
    }
}

pub trait GenerationInputRepository: Send + Sync {
    fn generation_input(
        &self,
        tenant_id: TenantId,
        course_id: CourseId,
    ) -> Result<Option<GenerationInput>, RepositoryError>;

    fn audience(
        &self,
        tenant_id: TenantId,
        audience_id: AudienceId,
    ) -> Result<Option<TargetAudience>, RepositoryError>;
}

pub trait OutlineRepository: Send + Sync {
    /// Remove a course's outline so a regenerated one does not pile on top.
    fn clear_outline(&self, tenant_id: TenantId, course_id: CourseId) -> Result<(), RepositoryError>;

    fn create_section(
        &self,
        tenant_id: TenantId,
        section: NewSection,
    ) -> Result<OutlineSection, RepositoryError>;

    fn create_outline_lesson(
        &self,
        tenant_id: TenantId,
        lesson: NewOutlineLesson,
    ) -> Result<OutlineLesson, RepositoryError>;

    fn outline_lesson(
        &self,
        tenant_id: TenantId,
        id: OutlineLessonId,
    ) -> Result<Option<OutlineLesson>, RepositoryError>;

    fn sections(
        &self,
        tenant_id: TenantId,
        course_id: CourseId,
    ) -> Result<Vec<OutlineSection>, RepositoryError>;

    fn outline_lessons(
        &self,
        tenant_id: TenantId,
        section_id: SectionId,
    ) -> Result<Vec<OutlineLesson>, RepositoryError>;
}

pub trait LessonRepository: Send + Sync {
    fn lesson(&self, tenant_id: TenantId, id: LessonId) -> Result<Option<Lesson>, RepositoryError>;

    fn set_segue(
        &self,
        tenant_id: TenantId,
        id: LessonId,
        segue_text: Option<&str>,
    ) -> Result<(), RepositoryError>;

    /// Swap a lesson's components for a new ordered list.
    fn replace_components(
        &self,
        tenant_id: TenantId,
        lesson_id: LessonId,
        components: Vec<NewComponent>,
    ) -> Result<Vec<LessonComponent>, RepositoryError>;

    fn components(
        &self,
        tenant_id: TenantId,
        lesson_id: LessonId,
    ) -> Result<Vec<LessonComponent>, RepositoryError>;
}

pub trait SmeRepository: Send + Sync {
    fn submission(
        &self,
        tenant_id: TenantId,
        id: SubmissionId,
    ) -> Result<Option<SmeSubmission>, RepositoryError>;

    /// Knowledge chunks of the given tasks, ordered by submission then position.
    fn knowledge(
        &self,
        tenant_id: TenantId,
        sme_task_ids: &[SmeTaskId],
    ) -> Result<Vec<KnowledgeChunk>, RepositoryError>;

    fn replace_chunks(
        &self,
        tenant_id: TenantId,
        submission_id: SubmissionId,
        chunks: Vec<KnowledgeChunk>,
    ) -> Result<(), RepositoryError>;

    fn set_submission_status(
        &self,
        tenant_id: TenantId,
        id: SubmissionId,
        status: SubmissionStatus,
        summary: Option<&str>,
    ) -> Result<(), RepositoryError>;
}

/// Per-tenant AI configuration and usage counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantAiSettings {
    pub tenant_id: TenantId,
    /// `base64(nonce || ciphertext)`.
    pub encrypted_api_key: Option<String>,
    pub model: Option<String>,
    pub tokens_used: u64,
}

pub trait TenantAiSettingsRepository: Send + Sync {
    fn ai_settings(&self, tenant_id: TenantId) -> Result<Option<TenantAiSettings>, RepositoryError>;

    /// Atomic `tokens_used += tokens`.
    fn increment_token_usage(&self, tenant_id: TenantId, tokens: u64) -> Result<(), RepositoryError>;
}

/// Everything a processor can reach.
#[derive(Clone)]
pub struct Repositories {
    pub inputs: Arc<dyn GenerationInputRepository>,
    pub outlines: Arc<dyn OutlineRepository>,
    pub lessons: Arc<dyn LessonRepository>,
    pub sme: Arc<dyn SmeRepository>,
    pub ai_settings: Arc<dyn TenantAiSettingsRepository>,
}

impl Repositories {
    /// Use one backend for every repository.
    pub fn shared<R>(backend: Arc<R>) -> Self
    where
        R: GenerationInputRepository
            + OutlineRepository
            + LessonRepository
            + SmeRepository
            + TenantAiSettingsRepository
            + 'static,
    {
        Self {
            inputs: backend.clone(),
            outlines: backend.clone(),
            lessons: backend.clone(),
            sme: backend.clone(),
            ai_settings: backend,
        }
    }
}

impl core::fmt::Debug for Repositories {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Repositories").finish_non_exhaustive()
    }
}

/// Feeds the AI gateway from the tenant AI settings repository.
pub struct SettingsCredentials {
    settings: Arc<dyn TenantAiSettingsRepository>,
}

impl SettingsCredentials {
    pub fn new(settings: Arc<dyn TenantAiSettingsRepository>) -> Self {
        Self { settings }
    }
}

impl TenantCredentialsSource for SettingsCredentials {
    fn credentials(&self, tenant_id: TenantId) -> Result<Option<TenantCredentials>, AiError> {
        let settings = self.settings.ai_settings(tenant_id).map_err(|e| match e {
            RepositoryError::Storage(msg) => AiError::Internal(msg),
            other => AiError::unavailable(other.to_string()),
        })?;

        Ok(settings.map(|s| TenantCredentials {
            encrypted_api_key: s.encrypted_api_key,
            model: s.model,
        }))
    }
}
