//! Regenerates the component list of an existing lesson.

use tracing::info;

use crate::jobs::JobType;

use super::lesson_content::{generate_for_lesson, to_components};
use super::{Completion, JobContext, JobProcessor, ProcessError, ProcessorDeps};

/// Unlike [`LessonContentProcessor`](super::LessonContentProcessor) the
/// lesson's segue is left as it is.
pub struct ComponentRegenProcessor {
    deps: ProcessorDeps,
}

impl ComponentRegenProcessor {
    pub fn new(deps: ProcessorDeps) -> Self {
        Self { deps }
    }
}

impl JobProcessor for ComponentRegenProcessor {
    fn job_type(&self) -> JobType {
        JobType::ComponentRegen
    }

    fn process(&self, ctx: &mut JobContext<'_>) -> Result<Completion, ProcessError> {
        let lesson_id = ctx
            .job()
            .lesson_id
            .ok_or_else(|| ProcessError::validation("component regeneration job has no lesson"))?;
        let outline_lesson_id = ctx.job().outline_lesson_id;

        let (lesson, generated) = generate_for_lesson(&self.deps, ctx, lesson_id, outline_lesson_id)?;

        ctx.progress(80, "Replacing lesson components")?;
        let components = to_components(ctx.job().id, lesson.id, generated.components)?;
        let saved = self
            .deps
            .repos
            .lessons
            .replace_components(ctx.tenant_id(), lesson.id, components)?;

        info!(job_id = %ctx.job().id, lesson_id = %lesson.id, components = saved.len(), "lesson components regenerated");
        Ok(Completion::new(format!(
            "Components regenerated: {} component(s)",
            saved.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use coursegen_ai::AiError;
    use coursegen_courses::ComponentKind;

    use super::*;
    use crate::content::LessonRepository;
    use crate::jobs::GenerationJob;
    use crate::processors::testing::{World, default_lesson};

    #[test]
    fn replaces_components_and_keeps_the_segue() {
        let world = World::new();
        let mut lesson = world.lesson("Load limits");
        lesson.segue_text = Some("Up next: parking".to_string());
        world.content.put_lesson(lesson.clone());

        let mut first = default_lesson(4);
        first.components.truncate(1);
        world.script.lessons.lock().unwrap().push_back(Ok(first));

        let processor = ComponentRegenProcessor::new(world.deps.clone());
        let mut job = world.claimed(
            GenerationJob::new(world.tenant, world.user, JobType::ComponentRegen).with_lesson(lesson.id),
        );

        let done = world.run(&processor, &mut job).unwrap();
        assert_eq!(done.message, "Components regenerated: 1 component(s)");
        assert_eq!(job.tokens_used, 4);

        let components = world.content.components(world.tenant, lesson.id).unwrap();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].kind, ComponentKind::Heading);
        assert_eq!(
            world
                .content
                .lesson(world.tenant, lesson.id)
                .unwrap()
                .unwrap()
                .segue_text
                .as_deref(),
            Some("Up next: parking")
        );
    }

    #[test]
    fn provider_failure_leaves_components_alone() {
        let world = World::new();
        let lesson = world.lesson("Load limits");
        world
            .script
            .lessons
            .lock()
            .unwrap()
            .push_back(Err(AiError::RequestFailed("timeout".to_string())));

        let processor = ComponentRegenProcessor::new(world.deps.clone());
        let mut job = world.claimed(
            GenerationJob::new(world.tenant, world.user, JobType::ComponentRegen).with_lesson(lesson.id),
        );

        let err = world.run(&processor, &mut job).unwrap_err();
        assert!(err.is_retryable());
        assert!(world.content.components(world.tenant, lesson.id).unwrap().is_empty());
    }
}
