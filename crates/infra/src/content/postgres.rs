//! Postgres-backed content repositories.
//!
//! Same runtime model as the job store: async inherent methods, sync trait
//! impls that block on the owning runtime.

use std::sync::Arc;

use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use coursegen_core::{
    AudienceId, ComponentId, CourseId, LessonId, OutlineLessonId, SectionId, SmeTaskId,
    SubmissionId, TenantId,
};
use coursegen_courses::{
    ComponentKind, GenerationInput, KnowledgeChunk, Lesson, LessonComponent, NewComponent,
    NewOutlineLesson, NewSection, OutlineLesson, OutlineSection, SmeSubmission, SubmissionStatus,
    TargetAudience,
};

use super::{
    GenerationInputRepository, LessonRepository, OutlineRepository, RepositoryError,
    SmeRepository, TenantAiSettings, TenantAiSettingsRepository,
};

/// All content repositories over one connection pool.
#[derive(Debug, Clone)]
pub struct PostgresContent {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresContent {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, course_id = %course_id), err)]
    async fn load_input(
        &self,
        tenant_id: TenantId,
        course_id: CourseId,
    ) -> Result<Option<GenerationInput>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, course_id, course_title, description, learning_objectives,
                   audience_id, sme_task_ids, desired_lesson_count
            FROM generation_inputs
            WHERE tenant_id = $1 AND course_id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(course_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_generation_input", e))?;

        row.map(|row| -> Result<GenerationInput, sqlx::Error> {
            let objectives: Json<Vec<String>> = row.try_get("learning_objectives")?;
            let tasks: Vec<uuid::Uuid> = row.try_get("sme_task_ids")?;
            let desired: Option<i32> = row.try_get("desired_lesson_count")?;
            Ok(GenerationInput {
                tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
                course_id: CourseId::from_uuid(row.try_get("course_id")?),
                course_title: row.try_get("course_title")?,
                description: row.try_get("description")?,
                learning_objectives: objectives.0,
                audience_id: row
                    .try_get::<Option<uuid::Uuid>, _>("audience_id")?
                    .map(AudienceId::from_uuid),
                sme_task_ids: tasks.into_iter().map(SmeTaskId::from_uuid).collect(),
                desired_lesson_count: desired.and_then(|n| u32::try_from(n).ok()),
            })
        })
        .transpose()
        .map_err(|e| map_sqlx_error("decode_generation_input", e))
    }

    async fn load_audience(
        &self,
        tenant_id: TenantId,
        audience_id: AudienceId,
    ) -> Result<Option<TargetAudience>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, name, description, expertise_level
            FROM target_audiences
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(audience_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_audience", e))?;

        row.map(|row| -> Result<TargetAudience, sqlx::Error> {
            Ok(TargetAudience {
                id: AudienceId::from_uuid(row.try_get("id")?),
                tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
                name: row.try_get("name")?,
                description: row.try_get("description")?,
                expertise_level: row.try_get("expertise_level")?,
            })
        })
        .transpose()
        .map_err(|e| map_sqlx_error("decode_audience", e))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, course_id = %course_id), err)]
    async fn delete_outline(&self, tenant_id: TenantId, course_id: CourseId) -> Result<(), RepositoryError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            r#"
            DELETE FROM outline_lessons
            WHERE tenant_id = $1
              AND section_id IN (SELECT id FROM outline_sections WHERE tenant_id = $1 AND course_id = $2)
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(course_id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("delete_outline_lessons", e))?;

        sqlx::query("DELETE FROM outline_sections WHERE tenant_id = $1 AND course_id = $2")
            .bind(tenant_id.as_uuid())
            .bind(course_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_outline_sections", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn insert_section(
        &self,
        tenant_id: TenantId,
        section: NewSection,
    ) -> Result<OutlineSection, RepositoryError> {
        let stored = OutlineSection {
            id: SectionId::new(),
            tenant_id,
            course_id: section.course_id,
            title: section.title,
            description: section.description,
            position: section.position,
        };

        sqlx::query(
            r#"
            INSERT INTO outline_sections (id, tenant_id, course_id, title, description, position)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(stored.id.as_uuid())
        .bind(tenant_id.as_uuid())
        .bind(stored.course_id.as_uuid())
        .bind(&stored.title)
        .bind(&stored.description)
        .bind(position(stored.position))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_section", e))?;

        Ok(stored)
    }

    async fn insert_outline_lesson(
        &self,
        tenant_id: TenantId,
        lesson: NewOutlineLesson,
    ) -> Result<OutlineLesson, RepositoryError> {
        let stored = OutlineLesson {
            id: OutlineLessonId::new(),
            tenant_id,
            section_id: lesson.section_id,
            title: lesson.title,
            summary: lesson.summary,
            objectives: lesson.objectives,
            position: lesson.position,
        };

        // The section must belong to the same tenant.
        let result = sqlx::query(
            r#"
            INSERT INTO outline_lessons (id, tenant_id, section_id, title, summary, objectives, position)
            SELECT $1, $2, s.id, $4, $5, $6, $7
            FROM outline_sections s
            WHERE s.id = $3 AND s.tenant_id = $2
            "#,
        )
        .bind(stored.id.as_uuid())
        .bind(tenant_id.as_uuid())
        .bind(stored.section_id.as_uuid())
        .bind(&stored.title)
        .bind(&stored.summary)
        .bind(Json(&stored.objectives))
        .bind(position(stored.position))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_outline_lesson", e))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("section {}", stored.section_id)));
        }
        Ok(stored)
    }

    async fn load_outline_lessons(
        &self,
        tenant_id: TenantId,
        filter_column: &'static str,
        id: uuid::Uuid,
    ) -> Result<Vec<OutlineLesson>, RepositoryError> {
        let sql = format!(
            "SELECT id, tenant_id, section_id, title, summary, objectives, position \
             FROM outline_lessons WHERE tenant_id = $1 AND {filter_column} = $2 ORDER BY position"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(id)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_outline_lessons", e))?;

        rows.iter()
            .map(outline_lesson_from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error("decode_outline_lesson", e))
    }

    async fn load_sections(
        &self,
        tenant_id: TenantId,
        course_id: CourseId,
    ) -> Result<Vec<OutlineSection>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, course_id, title, description, position
            FROM outline_sections
            WHERE tenant_id = $1 AND course_id = $2
            ORDER BY position
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(course_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_sections", e))?;

        rows.iter()
            .map(|row| -> Result<OutlineSection, sqlx::Error> {
                Ok(OutlineSection {
                    id: SectionId::from_uuid(row.try_get("id")?),
                    tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
                    course_id: CourseId::from_uuid(row.try_get("course_id")?),
                    title: row.try_get("title")?,
                    description: row.try_get("description")?,
                    position: from_position(row.try_get("position")?),
                })
            })
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error("decode_section", e))
    }

    async fn load_lesson(&self, tenant_id: TenantId, id: LessonId) -> Result<Option<Lesson>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, course_id, outline_lesson_id, title, summary, segue_text
            FROM lessons
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_lesson", e))?;

        row.map(|row| -> Result<Lesson, sqlx::Error> {
            Ok(Lesson {
                id: LessonId::from_uuid(row.try_get("id")?),
                tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
                course_id: CourseId::from_uuid(row.try_get("course_id")?),
                outline_lesson_id: row
                    .try_get::<Option<uuid::Uuid>, _>("outline_lesson_id")?
                    .map(OutlineLessonId::from_uuid),
                title: row.try_get("title")?,
                summary: row.try_get("summary")?,
                segue_text: row.try_get("segue_text")?,
            })
        })
        .transpose()
        .map_err(|e| map_sqlx_error("decode_lesson", e))
    }

    async fn update_segue(
        &self,
        tenant_id: TenantId,
        id: LessonId,
        segue_text: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE lessons SET segue_text = $3 WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id.as_uuid())
            .bind(id.as_uuid())
            .bind(segue_text)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_segue", e))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("lesson {id}")));
        }
        Ok(())
    }

    #[instrument(skip(self, components), fields(tenant_id = %tenant_id, lesson_id = %lesson_id, count = components.len()), err)]
    async fn swap_components(
        &self,
        tenant_id: TenantId,
        lesson_id: LessonId,
        components: Vec<NewComponent>,
    ) -> Result<Vec<LessonComponent>, RepositoryError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let owned: Option<uuid::Uuid> =
            sqlx::query_scalar("SELECT id FROM lessons WHERE tenant_id = $1 AND id = $2 FOR UPDATE")
                .bind(tenant_id.as_uuid())
                .bind(lesson_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("lock_lesson", e))?;
        if owned.is_none() {
            return Err(RepositoryError::NotFound(format!("lesson {lesson_id}")));
        }

        sqlx::query("DELETE FROM lesson_components WHERE tenant_id = $1 AND lesson_id = $2")
            .bind(tenant_id.as_uuid())
            .bind(lesson_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_components", e))?;

        let mut stored = Vec::with_capacity(components.len());
        for c in components {
            let component = LessonComponent {
                id: ComponentId::new(),
                tenant_id,
                lesson_id,
                kind: c.kind,
                title: c.title,
                body: c.body,
                position: c.position,
            };
            sqlx::query(
                r#"
                INSERT INTO lesson_components (id, tenant_id, lesson_id, kind, title, body, position)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(component.id.as_uuid())
            .bind(tenant_id.as_uuid())
            .bind(lesson_id.as_uuid())
            .bind(component.kind.as_str())
            .bind(&component.title)
            .bind(&component.body)
            .bind(position(component.position))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_component", e))?;
            stored.push(component);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(stored)
    }

    async fn load_components(
        &self,
        tenant_id: TenantId,
        lesson_id: LessonId,
    ) -> Result<Vec<LessonComponent>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, lesson_id, kind, title, body, position
            FROM lesson_components
            WHERE tenant_id = $1 AND lesson_id = $2
            ORDER BY position
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(lesson_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_components", e))?;

        let mut components = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.try_get("kind").map_err(|e| map_sqlx_error("decode_component", e))?;
            let kind: ComponentKind = kind.parse()?;
            components.push(LessonComponent {
                id: ComponentId::from_uuid(row.try_get("id").map_err(|e| map_sqlx_error("decode_component", e))?),
                tenant_id,
                lesson_id,
                kind,
                title: row.try_get("title").map_err(|e| map_sqlx_error("decode_component", e))?,
                body: row.try_get("body").map_err(|e| map_sqlx_error("decode_component", e))?,
                position: from_position(
                    row.try_get("position").map_err(|e| map_sqlx_error("decode_component", e))?,
                ),
            });
        }
        Ok(components)
    }

    async fn load_submission(
        &self,
        tenant_id: TenantId,
        id: SubmissionId,
    ) -> Result<Option<SmeSubmission>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, sme_task_id, source_name, content, status, summary, submitted_at
            FROM sme_submissions
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_submission", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let decode = |e| map_sqlx_error("decode_submission", e);
        let status: String = row.try_get("status").map_err(decode)?;
        let status = SubmissionStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Validation(format!("unknown submission status: {status}")))?;

        Ok(Some(SmeSubmission {
            id: SubmissionId::from_uuid(row.try_get("id").map_err(decode)?),
            tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(decode)?),
            sme_task_id: SmeTaskId::from_uuid(row.try_get("sme_task_id").map_err(decode)?),
            source_name: row.try_get("source_name").map_err(decode)?,
            content: row.try_get("content").map_err(decode)?,
            status,
            summary: row.try_get("summary").map_err(decode)?,
            submitted_at: row.try_get("submitted_at").map_err(decode)?,
        }))
    }

    async fn load_knowledge(
        &self,
        tenant_id: TenantId,
        sme_task_ids: &[SmeTaskId],
    ) -> Result<Vec<KnowledgeChunk>, RepositoryError> {
        let tasks: Vec<uuid::Uuid> = sme_task_ids.iter().map(|t| *t.as_uuid()).collect();
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, sme_task_id, submission_id, content, position
            FROM knowledge_chunks
            WHERE tenant_id = $1 AND sme_task_id = ANY($2)
            ORDER BY submission_id, position
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(&tasks)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_knowledge", e))?;

        rows.iter()
            .map(|row| -> Result<KnowledgeChunk, sqlx::Error> {
                Ok(KnowledgeChunk {
                    tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
                    sme_task_id: SmeTaskId::from_uuid(row.try_get("sme_task_id")?),
                    submission_id: SubmissionId::from_uuid(row.try_get("submission_id")?),
                    content: row.try_get("content")?,
                    position: from_position(row.try_get("position")?),
                })
            })
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error("decode_chunk", e))
    }

    #[instrument(skip(self, chunks), fields(tenant_id = %tenant_id, submission_id = %submission_id, count = chunks.len()), err)]
    async fn store_chunks(
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

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("DELETE FROM knowledge_chunks WHERE tenant_id = $1 AND submission_id = $2")
            .bind(tenant_id.as_uuid())
            .bind(submission_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_chunks", e))?;

        for chunk in &chunks {
            sqlx::query(
                r#"
                INSERT INTO knowledge_chunks (tenant_id, sme_task_id, submission_id, content, position)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(tenant_id.as_uuid())
            .bind(chunk.sme_task_id.as_uuid())
            .bind(submission_id.as_uuid())
            .bind(&chunk.content)
            .bind(position(chunk.position))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_chunk", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn update_submission_status(
        &self,
        tenant_id: TenantId,
        id: SubmissionId,
        status: SubmissionStatus,
        summary: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE sme_submissions
            SET status = $3, summary = COALESCE($4, summary)
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(summary)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_submission_status", e))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("submission {id}")));
        }
        Ok(())
    }

    async fn load_ai_settings(&self, tenant_id: TenantId) -> Result<Option<TenantAiSettings>, RepositoryError> {
        let row = sqlx::query(
            "SELECT tenant_id, encrypted_api_key, model, tokens_used FROM tenant_ai_settings WHERE tenant_id = $1",
        )
        .bind(tenant_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_ai_settings", e))?;

        row.map(|row| -> Result<TenantAiSettings, sqlx::Error> {
            let tokens: i64 = row.try_get("tokens_used")?;
            Ok(TenantAiSettings {
                tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
                encrypted_api_key: row.try_get("encrypted_api_key")?,
                model: row.try_get("model")?,
                tokens_used: u64::try_from(tokens).unwrap_or_default(),
            })
        })
        .transpose()
        .map_err(|e| map_sqlx_error("decode_ai_settings", e))
    }

    /// Single-statement increment; no read-modify-write in application code.
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn add_token_usage(&self, tenant_id: TenantId, tokens: u64) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO tenant_ai_settings (tenant_id, tokens_used)
            VALUES ($1, $2)
            ON CONFLICT (tenant_id)
            DO UPDATE SET tokens_used = tenant_ai_settings.tokens_used + EXCLUDED.tokens_used
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(i64::try_from(tokens).unwrap_or(i64::MAX))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("increment_token_usage", e))?;
        Ok(())
    }
}

impl GenerationInputRepository for PostgresContent {
    fn generation_input(
        &self,
        tenant_id: TenantId,
        course_id: CourseId,
    ) -> Result<Option<GenerationInput>, RepositoryError> {
        self.runtime.block_on(self.load_input(tenant_id, course_id))
    }

    fn audience(
        &self,
        tenant_id: TenantId,
        audience_id: AudienceId,
    ) -> Result<Option<TargetAudience>, RepositoryError> {
        self.runtime.block_on(self.load_audience(tenant_id, audience_id))
    }
}

impl OutlineRepository for PostgresContent {
    fn clear_outline(&self, tenant_id: TenantId, course_id: CourseId) -> Result<(), RepositoryError> {
        self.runtime.block_on(self.delete_outline(tenant_id, course_id))
    }

    fn create_section(
        &self,
        tenant_id: TenantId,
        section: NewSection,
    ) -> Result<OutlineSection, RepositoryError> {
        self.runtime.block_on(self.insert_section(tenant_id, section))
    }

    fn create_outline_lesson(
        &self,
        tenant_id: TenantId,
        lesson: NewOutlineLesson,
    ) -> Result<OutlineLesson, RepositoryError> {
        self.runtime.block_on(self.insert_outline_lesson(tenant_id, lesson))
    }

    fn outline_lesson(
        &self,
        tenant_id: TenantId,
        id: OutlineLessonId,
    ) -> Result<Option<OutlineLesson>, RepositoryError> {
        let mut lessons = self
            .runtime
            .block_on(self.load_outline_lessons(tenant_id, "id", *id.as_uuid()))?;
        Ok(lessons.pop())
    }

    fn sections(
        &self,
        tenant_id: TenantId,
        course_id: CourseId,
    ) -> Result<Vec<OutlineSection>, RepositoryError> {
        self.runtime.block_on(self.load_sections(tenant_id, course_id))
    }

    fn outline_lessons(
        &self,
        tenant_id: TenantId,
        section_id: SectionId,
    ) -> Result<Vec<OutlineLesson>, RepositoryError> {
        self.runtime
            .block_on(self.load_outline_lessons(tenant_id, "section_id", *section_id.as_uuid()))
    }
}

impl LessonRepository for PostgresContent {
    fn lesson(&self, tenant_id: TenantId, id: LessonId) -> Result<Option<Lesson>, RepositoryError> {
        self.runtime.block_on(self.load_lesson(tenant_id, id))
    }

    fn set_segue(
        &self,
        tenant_id: TenantId,
        id: LessonId,
        segue_text: Option<&str>,
    ) -> Result<(), RepositoryError> {
        self.runtime.block_on(self.update_segue(tenant_id, id, segue_text))
    }

    fn replace_components(
        &self,
        tenant_id: TenantId,
        lesson_id: LessonId,
        components: Vec<NewComponent>,
    ) -> Result<Vec<LessonComponent>, RepositoryError> {
        self.runtime
            .block_on(self.swap_components(tenant_id, lesson_id, components))
    }

    fn components(
        &self,
        tenant_id: TenantId,
        lesson_id: LessonId,
    ) -> Result<Vec<LessonComponent>, RepositoryError> {
        self.runtime.block_on(self.load_components(tenant_id, lesson_id))
    }
}

impl SmeRepository for PostgresContent {
    fn submission(
        &self,
        tenant_id: TenantId,
        id: SubmissionId,
    ) -> Result<Option<SmeSubmission>, RepositoryError> {
        self.runtime.block_on(self.load_submission(tenant_id, id))
    }

    fn knowledge(
        &self,
        tenant_id: TenantId,
        sme_task_ids: &[SmeTaskId],
    ) -> Result<Vec<KnowledgeChunk>, RepositoryError> {
        if sme_task_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.runtime.block_on(self.load_knowledge(tenant_id, sme_task_ids))
    }

    fn replace_chunks(
        &self,
        tenant_id: TenantId,
        submission_id: SubmissionId,
        chunks: Vec<KnowledgeChunk>,
    ) -> Result<(), RepositoryError> {
        self.runtime
            .block_on(self.store_chunks(tenant_id, submission_id, chunks))
    }

    fn set_submission_status(
        &self,
        tenant_id: TenantId,
        id: SubmissionId,
        status: SubmissionStatus,
        summary: Option<&str>,
    ) -> Result<(), RepositoryError> {
        self.runtime
            .block_on(self.update_submission_status(tenant_id, id, status, summary))
    }
}

impl TenantAiSettingsRepository for PostgresContent {
    fn ai_settings(&self, tenant_id: TenantId) -> Result<Option<TenantAiSettings>, RepositoryError> {
        self.runtime.block_on(self.load_ai_settings(tenant_id))
    }

    fn increment_token_usage(&self, tenant_id: TenantId, tokens: u64) -> Result<(), RepositoryError> {
        self.runtime.block_on(self.add_token_usage(tenant_id, tokens))
    }
}

fn outline_lesson_from_row(row: &PgRow) -> Result<OutlineLesson, sqlx::Error> {
    let objectives: Json<Vec<String>> = row.try_get("objectives")?;
    Ok(OutlineLesson {
        id: OutlineLessonId::from_uuid(row.try_get("id")?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
        section_id: SectionId::from_uuid(row.try_get("section_id")?),
        title: row.try_get("title")?,
        summary: row.try_get("summary")?,
        objectives: objectives.0,
        position: from_position(row.try_get("position")?),
    })
}

fn position(p: u32) -> i32 {
    i32::try_from(p).unwrap_or(i32::MAX)
}

fn from_position(p: i32) -> u32 {
    u32::try_from(p).unwrap_or_default()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23503") | Some("23514") | Some("23502") | Some("23505") => {
                    RepositoryError::Validation(msg)
                }
                _ => RepositoryError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            RepositoryError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => RepositoryError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
