//! In-memory content repositories for tests/dev.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use coursegen_core::{
    AudienceId, ComponentId, CourseId, LessonId, OutlineLessonId, SectionId, SmeTaskId,
    SubmissionId, TenantId,
};
use coursegen_courses::{
    GenerationInput, KnowledgeChunk, Lesson, LessonComponent, NewComponent, NewOutlineLesson,
    NewSection, OutlineLesson, OutlineSection, SmeSubmission, SubmissionStatus, TargetAudience,
};

use super::{
    GenerationInputRepository, LessonRepository, OutlineRepository, RepositoryError,
    SmeRepository, TenantAiSettings, TenantAiSettingsRepository,
};

#[derive(Debug, Default)]
struct Tables {
    inputs: HashMap<CourseId, GenerationInput>,
    audiences: HashMap<AudienceId, TargetAudience>,
    sections: HashMap<SectionId, OutlineSection>,
    outline_lessons: HashMap<OutlineLessonId, OutlineLesson>,
    lessons: HashMap<LessonId, Lesson>,
    components: HashMap<LessonId, Vec<LessonComponent>>,
    submissions: HashMap<SubmissionId, SmeSubmission>,
    chunks: HashMap<SubmissionId, Vec<KnowledgeChunk>>,
    ai_settings: HashMap<TenantId, TenantAiSettings>,
    /// Outline lesson titles whose insert is rejected (simulated write failures).
    rejected_titles: Vec<String>,
}

/// All content repositories over one set of in-memory tables.
///
/// Every lookup is tenant-scoped: a row owned by another tenant reads as
/// missing.
#[derive(Debug, Default)]
pub struct InMemoryContent {
    tables: RwLock<Tables>,
}

impl InMemoryContent {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, RepositoryError> {
        self.tables
            .read()
            .map_err(|_| RepositoryError::Storage("content lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, RepositoryError> {
        self.tables
            .write()
            .map_err(|_| RepositoryError::Storage("content lock poisoned".to_string()))
    }

    fn seed(&self, f: impl FnOnce(&mut Tables)) {
        if let Ok(mut tables) = self.tables.write() {
            f(&mut tables);
        }
    }

    pub fn put_input(&self, input: GenerationInput) {
        self.seed(|t| {
            t.inputs.insert(input.course_id, input);
        });
    }

    pub fn put_audience(&self, audience: TargetAudience) {
        self.seed(|t| {
            t.audiences.insert(audience.id, audience);
        });
    }

    pub fn put_lesson(&self, lesson: Lesson) {
        self.seed(|t| {
            t.lessons.insert(lesson.id, lesson);
        });
    }

    pub fn put_outline_lesson(&self, lesson: OutlineLesson) {
        self.seed(|t| {
            t.outline_lessons.insert(lesson.id, lesson);
        });
    }

    pub fn put_submission(&self, submission: SmeSubmission) {
        self.seed(|t| {
            t.submissions.insert(submission.id, submission);
        });
    }

    pub fn put_chunks(&self, submission_id: SubmissionId, chunks: Vec<KnowledgeChunk>) {
        self.seed(|t| {
            t.chunks.insert(submission_id, chunks);
        });
    }

    pub fn put_ai_settings(&self, settings: TenantAiSettings) {
        self.seed(|t| {
            t.ai_settings.insert(settings.tenant_id, settings);
        });
    }

    /// Make every `create_outline_lesson` with this title fail.
    pub fn reject_outline_lesson(&self, title: impl Into<String>) {
        let title = title.into();
        self.seed(|t| t.rejected_titles.push(title));
    }
}

impl GenerationInputRepository for InMemoryContent {
    fn generation_input(
        &self,
        tenant_id: TenantId,
        course_id: CourseId,
    ) -> Result<Option<GenerationInput>, RepositoryError> {
        Ok(self
            .read()?
            .inputs
            .get(&course_id)
            .filter(|i| i.tenant_id == tenant_id)
            .cloned())
    }

    fn audience(
        &self,
        tenant_id: TenantId,
        audience_id: AudienceId,
    ) -> Result<Option<TargetAudience>, RepositoryError> {
        Ok(self
            .read()?
            .audiences
            .get(&audience_id)
            .filter(|a| a.tenant_id == tenant_id)
            .cloned())
    }
}

impl OutlineRepository for InMemoryContent {
    fn clear_outline(&self, tenant_id: TenantId, course_id: CourseId) -> Result<(), RepositoryError> {
        let mut tables = self.write()?;
        let doomed: Vec<SectionId> = tables
            .sections
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.course_id == course_id)
            .map(|s| s.id)
            .collect();
        tables.sections.retain(|id, _| !doomed.contains(id));
        tables
            .outline_lessons
            .retain(|_, l| !doomed.contains(&l.section_id));
        Ok(())
    }

    fn create_section(
        &self,
        tenant_id: TenantId,
        section: NewSection,
    ) -> Result<OutlineSection, RepositoryError> {
        if section.title.trim().is_empty() {
            return Err(RepositoryError::Validation("section title is required".to_string()));
        }
        let stored = OutlineSection {
            id: SectionId::new(),
            tenant_id,
            course_id: section.course_id,
            title: section.title,
            description: section.description,
            position: section.position,
        };
        self.write()?.sections.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn create_outline_lesson(
        &self,
        tenant_id: TenantId,
        lesson: NewOutlineLesson,
    ) -> Result<OutlineLesson, RepositoryError> {
        let mut tables = self.write()?;
        if tables.rejected_titles.contains(&lesson.title) {
            return Err(RepositoryError::Storage(format!(
                "insert rejected for outline lesson '{}'",
                lesson.title
            )));
        }
        match tables.sections.get(&lesson.section_id) {
            Some(s) if s.tenant_id == tenant_id => {}
            Some(_) => return Err(RepositoryError::TenantIsolation),
            None => {
                return Err(RepositoryError::NotFound(format!(
                    "section {}",
                    lesson.section_id
                )));
            }
        }

        let stored = OutlineLesson {
            id: OutlineLessonId::new(),
            tenant_id,
            section_id: lesson.section_id,
            title: lesson.title,
            summary: lesson.summary,
            objectives: lesson.objectives,
            position: lesson.position,
        };
        tables.outline_lessons.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn outline_lesson(
        &self,
        tenant_id: TenantId,
        id: OutlineLessonId,
    ) -> Result<Option<OutlineLesson>, RepositoryError> {
        Ok(self
            .read()?
            .outline_lessons
            .get(&id)
            .filter(|l| l.tenant_id == tenant_id)
            .cloned())
    }

    fn sections(
        &self,
        tenant_id: TenantId,
        course_id: CourseId,
    ) -> Result<Vec<OutlineSection>, RepositoryError> {
        let mut sections: Vec<_> = self
            .read()?
            .sections
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.course_id == course_id)
            .cloned()
            .collect();
        sections.sort_by_key(|s| s.position);
        Ok(sections)
    }

    fn outline_lessons(
        &self,
        tenant_id: TenantId,
        section_id: SectionId,
    ) -> Result<Vec<OutlineLesson>, RepositoryError> {
        let mut lessons: Vec<_> = self
            .read()?
            .outline_lessons
            .values()
            .filter(|l| l.tenant_id == tenant_id && l.section_id == section_id)
            .cloned()
            .collect();
        lessons.sort_by_key(|l| l.position);
        Ok(lessons)
    }
}

impl LessonRepository for InMemoryContent {
    fn lesson(&self, tenant_id: TenantId, id: LessonId) -> Result<Option<Lesson>, RepositoryError> {
        Ok(self
            .read()?
            .lessons
            .get(&id)
            .filter(|l| l.tenant_id == tenant_id)
            .cloned())
    }

    fn set_segue(
        &self,
        tenant_id: TenantId,
        id: LessonId,
        segue_text: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.write()?;
        match tables.lessons.get_mut(&id) {
            Some(lesson) if lesson.tenant_id == tenant_id => {
                lesson.segue_text = segue_text.map(str::to_string);
                Ok(())
            }
            _ => Err(RepositoryError::NotFound(format!("lesson {id}"))),
        }
    }

    fn replace_components(
        &self,
        tenant_id: TenantId,
        lesson_id: LessonId,
        components: Vec<NewComponent>,
    ) -> Result<Vec<LessonComponent>, RepositoryError> {
        let mut tables = self.write()?;
        match tables.lessons.get(&lesson_id) {
            Some(l) if l.tenant_id == tenant_id => {}
            _ => return Err(RepositoryError::NotFound(format!("lesson {lesson_id}"))),
        }

        let stored: Vec<LessonComponent> = components
            .into_iter()
            .map(|c| LessonComponent {
                id: ComponentId::new(),
                tenant_id,
                lesson_id,
                kind: c.kind,
                title: c.title,
                body: c.body,
                position: c.position,
            })
            .collect();
        tables.components.insert(lesson_id, stored.clone());
        Ok(stored)
    }

    fn components(
        &self,
        tenant_id: TenantId,
        lesson_id: LessonId,
    ) -> Result<Vec<LessonComponent>, RepositoryError> {
        Ok(self
            .read()?
            .components
            .get(&lesson_id)
            .map(|cs| cs.iter().filter(|c| c.tenant_id == tenant_id).cloned().collect())
            .unwrap_or_default())
    }
}

impl SmeRepository for InMemoryContent {
    fn submission(
        &self,
        tenant_id: TenantId,
        id: SubmissionId,
    ) -> Result<Option<SmeSubmission>, RepositoryError> {
        Ok(self
            .read()?
            .submissions
            .get(&id)
            .filter(|s| s.tenant_id == tenant_id)
            .cloned())
    }

    fn knowledge(
        &self,
        tenant_id: TenantId,
        sme_task_ids: &[SmeTaskId],
    ) -> Result<Vec<KnowledgeChunk>, RepositoryError> {
        let tables = self.read()?;
        let mut chunks: Vec<KnowledgeChunk> = tables
            .chunks
            .values()
            .flatten()
            .filter(|c| c.tenant_id == tenant_id && sme_task_ids.contains(&c.sme_task_id))
            .cloned()
            .collect();
        chunks.sort_by_key(|c| (c.submission_id, c.position));
        Ok(chunks)
    }

    fn replace_chunks(
        &self,
        tenant_id: TenantId,
        submission_id: SubmissionId,
        chunks: Vec<KnowledgeChunk>,
    ) -> Result<(), RepositoryError> {
        if chunks
            .iter()
            .any(|c| c.tenant_id != tenant_id || c.submission_id != submission_id)
        {
            return Err(RepositoryError::TenantIsolation);
        }
        self.write()?.chunks.insert(submission_id, chunks);
        Ok(())
    }

    fn set_submission_status(
        &self,
        tenant_id: TenantId,
        id: SubmissionId,
        status: SubmissionStatus,
        summary: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.write()?;
        match tables.submissions.get_mut(&id) {
            Some(s) if s.tenant_id == tenant_id => {
                s.status = status;
                if let Some(summary) = summary {
                    s.summary = Some(summary.to_string());
                }
                Ok(())
            }
            _ => Err(RepositoryError::NotFound(format!("submission {id}"))),
        }
    }
}

impl TenantAiSettingsRepository for InMemoryContent {
    fn ai_settings(&self, tenant_id: TenantId) -> Result<Option<TenantAiSettings>, RepositoryError> {
        Ok(self.read()?.ai_settings.get(&tenant_id).cloned())
    }

    fn increment_token_usage(&self, tenant_id: TenantId, tokens: u64) -> Result<(), RepositoryError> {
        let mut tables = self.write()?;
        let settings = tables
            .ai_settings
            .entry(tenant_id)
            .or_insert_with(|| TenantAiSettings {
                tenant_id,
                encrypted_api_key: None,
                model: None,
                tokens_used: 0,
            });
        settings.tokens_used = settings.tokens_used.saturating_add(tokens);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use coursegen_courses::ComponentKind;

    use super::*;

    fn lesson(tenant: TenantId) -> Lesson {
        Lesson {
            id: LessonId::new(),
            tenant_id: tenant,
            course_id: CourseId::new(),
            outline_lesson_id: None,
            title: "Pallet basics".to_string(),
            summary: String::new(),
            segue_text: None,
        }
    }

    #[test]
    fn lookups_are_tenant_scoped() {
        let repo = InMemoryContent::new();
        let tenant = TenantId::new();
        let l = lesson(tenant);
        repo.put_lesson(l.clone());

        assert_eq!(repo.lesson(tenant, l.id).unwrap(), Some(l.clone()));
        assert_eq!(repo.lesson(TenantId::new(), l.id).unwrap(), None);
        assert!(matches!(
            repo.set_segue(TenantId::new(), l.id, Some("next up")),
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[test]
    fn replace_components_swaps_the_whole_list() {
        let repo = InMemoryContent::new();
        let tenant = TenantId::new();
        let l = lesson(tenant);
        repo.put_lesson(l.clone());

        let new = |kind, position| NewComponent {
            lesson_id: l.id,
            kind,
            title: None,
            body: json!({"text": "..."}),
            position,
        };

        repo.replace_components(tenant, l.id, vec![new(ComponentKind::Text, 0), new(ComponentKind::Quiz, 1)])
            .unwrap();
        repo.replace_components(tenant, l.id, vec![new(ComponentKind::Summary, 0)])
            .unwrap();

        let components = repo.components(tenant, l.id).unwrap();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].kind, ComponentKind::Summary);
    }

    #[test]
    fn clear_outline_removes_sections_and_their_lessons() {
        let repo = InMemoryContent::new();
        let tenant = TenantId::new();
        let course = CourseId::new();

        let section = repo
            .create_section(
                tenant,
                NewSection {
                    course_id: course,
                    title: "Basics".to_string(),
                    description: String::new(),
                    position: 0,
                },
            )
            .unwrap();
        repo.create_outline_lesson(
            tenant,
            NewOutlineLesson {
                section_id: section.id,
                title: "Intro".to_string(),
                summary: String::new(),
                objectives: vec![],
                position: 0,
            },
        )
        .unwrap();

        repo.clear_outline(tenant, course).unwrap();
        assert!(repo.sections(tenant, course).unwrap().is_empty());
        assert!(repo.outline_lessons(tenant, section.id).unwrap().is_empty());
    }

    #[test]
    fn token_usage_accumulates() {
        let repo = InMemoryContent::new();
        let tenant = TenantId::new();
        repo.increment_token_usage(tenant, 10).unwrap();
        repo.increment_token_usage(tenant, 5).unwrap();
        assert_eq!(repo.ai_settings(tenant).unwrap().unwrap().tokens_used, 15);
    }

    #[test]
    fn knowledge_filters_by_task() {
        let repo = InMemoryContent::new();
        let tenant = TenantId::new();
        let task = SmeTaskId::new();
        let submission = SubmissionId::new();
        repo.put_submission(SmeSubmission {
            id: submission,
            tenant_id: tenant,
            sme_task_id: task,
            source_name: "notes.txt".to_string(),
            content: "forks up".to_string(),
            status: SubmissionStatus::Pending,
            summary: None,
            submitted_at: Utc::now(),
        });
        repo.replace_chunks(
            tenant,
            submission,
            vec![KnowledgeChunk {
                tenant_id: tenant,
                sme_task_id: task,
                submission_id: submission,
                content: "keep forks low".to_string(),
                position: 0,
            }],
        )
        .unwrap();

        assert_eq!(repo.knowledge(tenant, &[task]).unwrap().len(), 1);
        assert!(repo.knowledge(tenant, &[SmeTaskId::new()]).unwrap().is_empty());
    }
}
