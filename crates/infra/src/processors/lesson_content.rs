//! Lesson content generation, one lesson per job.

use core::str::FromStr;

use tracing::{info, warn};

use coursegen_ai::{AiError, GeneratedComponent, LessonContentRequest, LessonContentResponse};
use coursegen_core::{JobId, LessonId, OutlineLessonId, TenantId};
use coursegen_courses::{ComponentKind, Lesson, NewComponent};

use crate::jobs::JobType;

use super::{Completion, JobContext, JobProcessor, ProcessError, ProcessorDeps, position};

pub struct LessonContentProcessor {
    deps: ProcessorDeps,
}

impl LessonContentProcessor {
    pub fn new(deps: ProcessorDeps) -> Self {
        Self { deps }
    }
}

impl JobProcessor for LessonContentProcessor {
    fn job_type(&self) -> JobType {
        JobType::LessonContent
    }

    fn process(&self, ctx: &mut JobContext<'_>) -> Result<Completion, ProcessError> {
        let lesson_id = ctx
            .job()
            .lesson_id
            .ok_or_else(|| ProcessError::validation("lesson content job has no lesson"))?;
        let outline_lesson_id = ctx.job().outline_lesson_id;

        let (lesson, generated) = generate_for_lesson(&self.deps, ctx, lesson_id, outline_lesson_id)?;
        let tenant_id = ctx.tenant_id();

        ctx.progress(80, "Saving lesson content")?;
        let components = to_components(ctx.job().id, lesson.id, generated.components)?;
        let saved = self
            .deps
            .repos
            .lessons
            .replace_components(tenant_id, lesson.id, components)?;
        self.deps
            .repos
            .lessons
            .set_segue(tenant_id, lesson.id, generated.segue_text.as_deref())?;

        info!(job_id = %ctx.job().id, lesson_id = %lesson.id, components = saved.len(), "lesson content saved");
        Ok(Completion::new(format!(
            "Lesson content generated: {} component(s)",
            saved.len()
        )))
    }
}

/// Load the lesson and its course context, then ask the provider for content.
/// Tokens are recorded on the job and billed to the tenant.
pub(super) fn generate_for_lesson(
    deps: &ProcessorDeps,
    ctx: &mut JobContext<'_>,
    lesson_id: LessonId,
    outline_lesson_id: Option<OutlineLessonId>,
) -> Result<(Lesson, LessonContentResponse), ProcessError> {
    let tenant_id = ctx.tenant_id();

    ctx.progress(10, "Loading lesson")?;
    let lesson = deps
        .repos
        .lessons
        .lesson(tenant_id, lesson_id)?
        .ok_or_else(|| ProcessError::validation(format!("lesson {lesson_id} does not exist")))?;
    let course = deps.course_context(tenant_id, lesson.course_id)?;
    let (summary, objectives) = outline_details(deps, tenant_id, &lesson, outline_lesson_id)?;
    let provider = deps.gateway.get_provider(tenant_id)?;

    ctx.progress(30, "Generating lesson content")?;
    let request = LessonContentRequest {
        course_title: course.input.course_title.clone(),
        lesson_title: lesson.title.clone(),
        lesson_summary: summary,
        objectives,
        audience: course.audience_profile(),
        knowledge: course.knowledge.clone(),
    };
    let generated = provider.generate_lesson_content(&request)?;
    ctx.record_tokens(generated.tokens_used);
    deps.bill_tokens(tenant_id, generated.tokens_used);

    Ok((lesson, generated))
}

/// Summary and objectives, preferring the outline entry the lesson came from.
fn outline_details(
    deps: &ProcessorDeps,
    tenant_id: TenantId,
    lesson: &Lesson,
    outline_lesson_id: Option<OutlineLessonId>,
) -> Result<(String, Vec<String>), ProcessError> {
    let outline = match outline_lesson_id.or(lesson.outline_lesson_id) {
        Some(id) => deps.repos.outlines.outline_lesson(tenant_id, id)?,
        None => None,
    };
    Ok(match outline {
        Some(o) if !o.summary.is_empty() => (o.summary, o.objectives),
        Some(o) => (lesson.summary.clone(), o.objectives),
        None => (lesson.summary.clone(), Vec::new()),
    })
}

/// Map provider components onto stored ones. Unknown kinds are dropped; a
/// response with nothing usable is a provider failure.
pub(super) fn to_components(
    job_id: JobId,
    lesson_id: LessonId,
    generated: Vec<GeneratedComponent>,
) -> Result<Vec<NewComponent>, ProcessError> {
    let mut components = Vec::with_capacity(generated.len());
    for component in generated {
        let kind = match ComponentKind::from_str(&component.kind) {
            Ok(kind) => kind,
            Err(_) => {
                warn!(job_id = %job_id, kind = %component.kind, "dropping component of unknown kind");
                continue;
            }
        };
        components.push(NewComponent {
            lesson_id,
            kind,
            title: component.title,
            body: component.body,
            position: position(components.len(), "component")?,
        });
    }

    if components.is_empty() {
        return Err(ProcessError::Provider(AiError::invalid_response(
            "lesson content has no usable components",
        )));
    }
    Ok(components)
}
