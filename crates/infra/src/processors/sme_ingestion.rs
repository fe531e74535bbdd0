//! SME submission ingestion: summarize and chunk raw expert material into
//! knowledge used by later generation.

use tracing::{info, warn};

use coursegen_ai::ProcessContentRequest;
use coursegen_courses::{KnowledgeChunk, SubmissionStatus};

use crate::jobs::{GenerationJob, JobType};

use super::{Completion, JobContext, JobProcessor, ProcessError, ProcessorDeps, position};

pub struct SmeIngestionProcessor {
    deps: ProcessorDeps,
}

impl SmeIngestionProcessor {
    pub fn new(deps: ProcessorDeps) -> Self {
        Self { deps }
    }
}

impl JobProcessor for SmeIngestionProcessor {
    fn job_type(&self) -> JobType {
        JobType::SmeIngestion
    }

    fn process(&self, ctx: &mut JobContext<'_>) -> Result<Completion, ProcessError> {
        let tenant_id = ctx.tenant_id();
        let (Some(submission_id), Some(sme_task_id)) = (ctx.job().submission_id, ctx.job().sme_task_id)
        else {
            return Err(ProcessError::validation(
                "SME ingestion job needs a submission and a task",
            ));
        };

        ctx.progress(10, "Loading submission")?;
        let submission = self
            .deps
            .repos
            .sme
            .submission(tenant_id, submission_id)?
            .ok_or_else(|| {
                ProcessError::validation(format!("submission {submission_id} does not exist"))
            })?;
        if submission.sme_task_id != sme_task_id {
            return Err(ProcessError::validation(format!(
                "submission {submission_id} does not belong to task {sme_task_id}"
            )));
        }
        if submission.content.trim().is_empty() {
            return Err(ProcessError::validation(format!(
                "submission {submission_id} is empty"
            )));
        }
        let provider = self.deps.gateway.get_provider(tenant_id)?;

        ctx.progress(30, "Processing submission")?;
        let processed = provider.process_content(&ProcessContentRequest {
            source_name: submission.source_name.clone(),
            content: submission.content.clone(),
        })?;
        ctx.record_tokens(processed.tokens_used);
        self.deps.bill_tokens(tenant_id, processed.tokens_used);

        ctx.progress(80, "Saving knowledge")?;
        let chunks = processed
            .chunks
            .into_iter()
            .filter(|c| !c.trim().is_empty())
            .enumerate()
            .map(|(index, content)| {
                Ok(KnowledgeChunk {
                    tenant_id,
                    sme_task_id,
                    submission_id,
                    content,
                    position: position(index, "chunk")?,
                })
            })
            .collect::<Result<Vec<_>, ProcessError>>()?;
        let count = chunks.len();
        self.deps.repos.sme.replace_chunks(tenant_id, submission_id, chunks)?;
        self.deps.repos.sme.set_submission_status(
            tenant_id,
            submission_id,
            SubmissionStatus::Processed,
            Some(&processed.summary),
        )?;

        info!(job_id = %ctx.job().id, submission_id = %submission_id, chunks = count, "submission ingested");
        Ok(Completion::new(format!(
            "Submission processed: {count} knowledge chunk(s)"
        )))
    }

    fn on_terminal_failure(&self, job: &GenerationJob) {
        let Some(submission_id) = job.submission_id else {
            return;
        };
        if let Err(e) = self.deps.repos.sme.set_submission_status(
            job.tenant_id,
            submission_id,
            SubmissionStatus::Failed,
            None,
        ) {
            warn!(job_id = %job.id, submission_id = %submission_id, error = %e, "failed to mark submission failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use coursegen_ai::AiError;
    use coursegen_core::{SmeTaskId, SubmissionId};
    use coursegen_courses::SmeSubmission;

    use super::*;
    use crate::content::SmeRepository;
    use crate::processors::testing::World;

    fn submission(world: &World, content: &str) -> SmeSubmission {
        let submission = SmeSubmission {
            id: SubmissionId::new(),
            tenant_id: world.tenant,
            sme_task_id: SmeTaskId::new(),
            source_name: "floor-manual.pdf".to_string(),
            content: content.to_string(),
            status: SubmissionStatus::Pending,
            summary: None,
            submitted_at: Utc::now(),
        };
        world.content.put_submission(submission.clone());
        submission
    }

    fn ingestion_job(world: &World, submission: &SmeSubmission) -> GenerationJob {
        world.claimed(
            GenerationJob::new(world.tenant, world.user, JobType::SmeIngestion)
                .with_sme_task(submission.sme_task_id)
                .with_submission(submission.id),
        )
    }

    #[test]
    fn stores_chunks_and_marks_processed() {
        let world = World::new();
        let sub = submission(&world, "Always lower the forks before parking.");
        let processor = SmeIngestionProcessor::new(world.deps.clone());
        let mut job = ingestion_job(&world, &sub);

        let done = world.run(&processor, &mut job).unwrap();
        assert_eq!(done.message, "Submission processed: 2 knowledge chunk(s)");
        assert_eq!(job.tokens_used, 30);

        let knowledge = world.content.knowledge(world.tenant, &[sub.sme_task_id]).unwrap();
        let texts: Vec<_> = knowledge.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(texts, vec!["first", "second"]);

        let stored = world.content.submission(world.tenant, sub.id).unwrap().unwrap();
        assert_eq!(stored.status, SubmissionStatus::Processed);
        assert_eq!(stored.summary.as_deref(), Some("Summary of floor-manual.pdf"));
    }

    #[test]
    fn task_mismatch_is_a_validation_error() {
        let world = World::new();
        let sub = submission(&world, "text");
        let processor = SmeIngestionProcessor::new(world.deps.clone());
        let mut job = world.claimed(
            GenerationJob::new(world.tenant, world.user, JobType::SmeIngestion)
                .with_sme_task(SmeTaskId::new())
                .with_submission(sub.id),
        );

        assert!(matches!(
            world.run(&processor, &mut job),
            Err(ProcessError::Validation(_))
        ));
    }

    #[test]
    fn provider_failure_is_retryable_and_keeps_submission_pending() {
        let world = World::new();
        let sub = submission(&world, "text");
        world
            .script
            .contents
            .lock()
            .unwrap()
            .push_back(Err(AiError::RateLimited));
        let processor = SmeIngestionProcessor::new(world.deps.clone());
        let mut job = ingestion_job(&world, &sub);

        assert!(world.run(&processor, &mut job).unwrap_err().is_retryable());
        let stored = world.content.submission(world.tenant, sub.id).unwrap().unwrap();
        assert_eq!(stored.status, SubmissionStatus::Pending);
    }

    #[test]
    fn terminal_failure_marks_submission_failed() {
        let world = World::new();
        let sub = submission(&world, "text");
        let processor = SmeIngestionProcessor::new(world.deps.clone());
        let job = GenerationJob::new(world.tenant, world.user, JobType::SmeIngestion)
            .with_sme_task(sub.sme_task_id)
            .with_submission(sub.id);

        processor.on_terminal_failure(&job);

        let stored = world.content.submission(world.tenant, sub.id).unwrap().unwrap();
        assert_eq!(stored.status, SubmissionStatus::Failed);
    }
}
