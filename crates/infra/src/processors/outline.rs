//! Course outline generation.

use tracing::{info, warn};

use coursegen_ai::OutlineRequest;
use coursegen_courses::{NewOutlineLesson, NewSection};

use crate::jobs::JobType;

use super::{Completion, JobContext, JobProcessor, ProcessError, ProcessorDeps, position};

pub struct OutlineProcessor {
    deps: ProcessorDeps,
}

impl OutlineProcessor {
    pub fn new(deps: ProcessorDeps) -> Self {
        Self { deps }
    }
}

impl JobProcessor for OutlineProcessor {
    fn job_type(&self) -> JobType {
        JobType::CourseOutline
    }

    fn process(&self, ctx: &mut JobContext<'_>) -> Result<Completion, ProcessError> {
        let tenant_id = ctx.tenant_id();
        let course_id = ctx
            .job()
            .course_id
            .ok_or_else(|| ProcessError::validation("outline job has no course"))?;

        ctx.progress(10, "Gathering course inputs")?;
        let course = self.deps.course_context(tenant_id, course_id)?;
        let provider = self.deps.gateway.get_provider(tenant_id)?;

        ctx.progress(30, "Generating course outline")?;
        let request = OutlineRequest {
            course_title: course.input.course_title.clone(),
            description: course.input.description.clone(),
            learning_objectives: course.input.learning_objectives.clone(),
            audience: course.audience_profile(),
            knowledge: course.knowledge.clone(),
            desired_lesson_count: course.input.desired_lesson_count,
        };
        let outline = provider.generate_outline(&request)?;
        ctx.record_tokens(outline.tokens_used);
        self.deps.bill_tokens(tenant_id, outline.tokens_used);

        if outline.sections.is_empty() {
            return Err(ProcessError::Provider(coursegen_ai::AiError::invalid_response(
                "outline has no sections",
            )));
        }

        ctx.progress(70, "Saving course outline")?;
        self.deps.repos.outlines.clear_outline(tenant_id, course_id)?;

        let (mut sections, mut lessons) = (0usize, 0usize);
        for (s_pos, generated) in outline.sections.into_iter().enumerate() {
            let s_pos = position(s_pos, "section")?;
            let section = match self.deps.repos.outlines.create_section(
                tenant_id,
                NewSection {
                    course_id,
                    title: generated.title.clone(),
                    description: generated.description,
                    position: s_pos,
                },
            ) {
                Ok(section) => section,
                Err(e) => {
                    warn!(
                        job_id = %ctx.job().id,
                        section = %generated.title,
                        error = %e,
                        "skipping outline section that failed to save"
                    );
                    continue;
                }
            };
            sections += 1;

            for (l_pos, lesson) in generated.lessons.into_iter().enumerate() {
                let l_pos = position(l_pos, "lesson")?;
                let title = lesson.title.clone();
                let saved = self.deps.repos.outlines.create_outline_lesson(
                    tenant_id,
                    NewOutlineLesson {
                        section_id: section.id,
                        title: lesson.title,
                        summary: lesson.summary,
                        objectives: lesson.objectives,
                        position: l_pos,
                    },
                );
                match saved {
                    Ok(_) => lessons += 1,
                    Err(e) => warn!(
                        job_id = %ctx.job().id,
                        lesson = %title,
                        error = %e,
                        "skipping outline lesson that failed to save"
                    ),
                }
            }
        }

        if sections == 0 {
            return Err(ProcessError::validation("no outline section could be saved"));
        }

        info!(job_id = %ctx.job().id, sections, lessons, "outline saved");
        Ok(Completion::new(format!(
            "Outline generated: {sections} section(s), {lessons} lesson(s)"
        )))
    }
}

#[cfg(test)]
mod tests {
    use coursegen_ai::{AiError, OutlineResponse};

    use super::*;
    use crate::content::{OutlineRepository, TenantAiSettingsRepository};
    use crate::jobs::{GenerationJob, JobStore};
    use crate::processors::testing::World;

    fn outline_job(world: &World) -> GenerationJob {
        world.claimed(
            GenerationJob::new(world.tenant, world.user, JobType::CourseOutline)
                .with_course(world.course),
        )
    }

    #[test]
    fn saves_sections_and_lessons() {
        let world = World::new();
        let processor = OutlineProcessor::new(world.deps.clone());
        let mut job = outline_job(&world);

        let done = world.run(&processor, &mut job).unwrap();
        assert_eq!(done.message, "Outline generated: 2 section(s), 3 lesson(s)");
        assert_eq!(job.tokens_used, 120);
        assert_eq!(job.progress_percent, 70);

        let sections = world.content.sections(world.tenant, world.course).unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].title, "Basics");
        let lessons = world
            .content
            .outline_lessons(world.tenant, sections[0].id)
            .unwrap();
        assert_eq!(lessons.len(), 2);

        assert_eq!(
            world.content.ai_settings(world.tenant).unwrap().unwrap().tokens_used,
            120
        );
        let stored = world.store.get(world.tenant, job.id).unwrap().unwrap();
        assert_eq!(stored.progress_message.as_deref(), Some("Saving course outline"));
    }

    #[test]
    fn a_lesson_that_fails_to_save_is_skipped() {
        let world = World::new();
        world.content.reject_outline_lesson("Controls");
        let processor = OutlineProcessor::new(world.deps.clone());
        let mut job = outline_job(&world);

        let done = world.run(&processor, &mut job).unwrap();
        assert_eq!(done.message, "Outline generated: 2 section(s), 2 lesson(s)");
    }

    #[test]
    fn regenerating_replaces_the_previous_outline() {
        let world = World::new();
        let processor = OutlineProcessor::new(world.deps.clone());

        let mut first = outline_job(&world);
        world.run(&processor, &mut first).unwrap();
        let mut second = outline_job(&world);
        world.run(&processor, &mut second).unwrap();

        assert_eq!(world.content.sections(world.tenant, world.course).unwrap().len(), 2);
    }

    #[test]
    fn provider_errors_are_retryable() {
        let world = World::new();
        world
            .script
            .outlines
            .lock()
            .unwrap()
            .push_back(Err(AiError::RateLimited));
        let processor = OutlineProcessor::new(world.deps.clone());
        let mut job = outline_job(&world);

        let err = world.run(&processor, &mut job).unwrap_err();
        assert_eq!(err, ProcessError::Provider(AiError::RateLimited));
        assert!(err.is_retryable());
    }

    #[test]
    fn empty_outline_is_a_provider_failure() {
        let world = World::new();
        world.script.outlines.lock().unwrap().push_back(Ok(OutlineResponse {
            sections: vec![],
            tokens_used: 5,
        }));
        let processor = OutlineProcessor::new(world.deps.clone());
        let mut job = outline_job(&world);

        assert!(matches!(
            world.run(&processor, &mut job),
            Err(ProcessError::Provider(AiError::InvalidResponse(_)))
        ));
    }

    #[test]
    fn missing_provider_key_fails_the_run() {
        let world = World::without_provider();
        let processor = OutlineProcessor::new(world.deps.clone());
        let mut job = outline_job(&world);

        assert!(matches!(
            world.run(&processor, &mut job),
            Err(ProcessError::Provider(AiError::ProviderUnavailable(_)))
        ));
    }

    #[test]
    fn unknown_course_is_a_validation_error() {
        let world = World::new();
        let processor = OutlineProcessor::new(world.deps.clone());
        let mut job = world.claimed(
            GenerationJob::new(world.tenant, world.user, JobType::CourseOutline)
                .with_course(coursegen_core::CourseId::new()),
        );

        let err = world.run(&processor, &mut job).unwrap_err();
        assert!(!err.is_retryable());
    }
}
