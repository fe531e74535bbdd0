//! Worker families.
//!
//! - generation: outline, lesson content and component regeneration; also
//!   claims unrecognized job types so they are failed instead of stranded
//! - sme: SME submission ingestion
//!
//! Each family is an independent [`JobExecutor`] with its own poll interval.

use std::sync::Arc;

use tracing::info;

use coursegen_ai::ProviderGateway;
use coursegen_core::Clock;

use crate::config::WorkerSettings;
use crate::content::Repositories;
use crate::jobs::{
    ExecutorStats, FinalizeLabels, JobExecutor, JobExecutorHandle, JobLifecycle, JobStore,
    ParentFinalizer,
};
use crate::notify::Notifier;
use crate::processors::{
    ComponentRegenProcessor, LessonContentProcessor, OutlineProcessor, ProcessorDeps,
    SmeIngestionProcessor,
};

/// Everything the workers need, wired once per process.
#[derive(Clone)]
pub struct WorkerServices {
    pub store: Arc<dyn JobStore>,
    pub notifier: Arc<dyn Notifier>,
    pub repos: Repositories,
    pub gateway: Arc<dyn ProviderGateway>,
    pub clock: Arc<dyn Clock>,
    pub labels: FinalizeLabels,
}

impl WorkerServices {
    pub fn finalizer(&self) -> Arc<ParentFinalizer> {
        Arc::new(
            ParentFinalizer::new(
                self.store.clone(),
                self.notifier.clone(),
                self.repos.inputs.clone(),
            )
            .with_labels(self.labels.clone()),
        )
    }

    pub fn lifecycle(&self) -> Arc<JobLifecycle> {
        Arc::new(JobLifecycle::new(
            self.store.clone(),
            self.notifier.clone(),
            self.finalizer(),
            self.clock.clone(),
        ))
    }

    pub fn processor_deps(&self) -> ProcessorDeps {
        ProcessorDeps {
            repos: self.repos.clone(),
            gateway: self.gateway.clone(),
        }
    }
}

pub fn generation_executor(services: &WorkerServices) -> JobExecutor {
    let deps = services.processor_deps();
    JobExecutor::new(services.lifecycle())
        .with_processor(Arc::new(OutlineProcessor::new(deps.clone())))
        .with_processor(Arc::new(LessonContentProcessor::new(deps.clone())))
        .with_processor(Arc::new(ComponentRegenProcessor::new(deps)))
}

pub fn sme_executor(services: &WorkerServices) -> JobExecutor {
    JobExecutor::new(services.lifecycle())
        .with_processor(Arc::new(SmeIngestionProcessor::new(services.processor_deps())))
}

/// Both worker families, running.
#[derive(Debug)]
pub struct Workers {
    generation: JobExecutorHandle,
    sme: JobExecutorHandle,
}

impl Workers {
    pub fn spawn(services: &WorkerServices, settings: &WorkerSettings) -> Self {
        let generation = generation_executor(services).spawn(settings.generation_executor());
        let sme = sme_executor(services).spawn(settings.sme_executor());
        info!("workers started");
        Self { generation, sme }
    }

    pub fn generation_stats(&self) -> ExecutorStats {
        self.generation.stats()
    }

    pub fn sme_stats(&self) -> ExecutorStats {
        self.sme.stats()
    }

    /// Stop polling and wait for in-flight jobs.
    pub fn shutdown(self) {
        self.generation.shutdown();
        self.sme.shutdown();
        info!("workers stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use chrono::Utc;

    use coursegen_core::{SmeTaskId, SubmissionId};
    use coursegen_courses::{SmeSubmission, SubmissionStatus};

    use super::*;
    use crate::jobs::{GenerationJob, JobStatus, JobType};
    use crate::processors::testing::World;

    fn services(world: &World) -> WorkerServices {
        WorkerServices {
            store: world.store.clone(),
            notifier: world.notifier.clone(),
            repos: world.deps.repos.clone(),
            gateway: world.deps.gateway.clone(),
            clock: world.clock.clone(),
            labels: FinalizeLabels::default(),
        }
    }

    #[test]
    fn families_own_disjoint_job_types() {
        let world = World::new();
        let services = services(&world);

        assert_eq!(
            generation_executor(&services).job_types(),
            vec![JobType::ComponentRegen, JobType::CourseOutline, JobType::LessonContent]
        );
        assert_eq!(sme_executor(&services).job_types(), vec![JobType::SmeIngestion]);
    }

    #[test]
    fn spawned_families_process_their_jobs() {
        let world = World::new();
        let submission = SmeSubmission {
            id: SubmissionId::new(),
            tenant_id: world.tenant,
            sme_task_id: SmeTaskId::new(),
            source_name: "checklist.txt".to_string(),
            content: "Inspect the mast daily.".to_string(),
            status: SubmissionStatus::Pending,
            summary: None,
            submitted_at: Utc::now(),
        };
        world.content.put_submission(submission.clone());

        let outline = world
            .store
            .create(
                GenerationJob::new(world.tenant, world.user, JobType::CourseOutline)
                    .with_course(world.course),
            )
            .unwrap();
        let ingestion = world
            .store
            .create(
                GenerationJob::new(world.tenant, world.user, JobType::SmeIngestion)
                    .with_sme_task(submission.sme_task_id)
                    .with_submission(submission.id),
            )
            .unwrap();

        let settings = WorkerSettings {
            generation_poll_interval: Duration::from_millis(5),
            sme_poll_interval: Duration::from_millis(5),
            ..WorkerSettings::default()
        };
        let workers = Workers::spawn(&services(&world), &settings);

        let done = |job: &GenerationJob| {
            world.store.get(world.tenant, job.id).unwrap().unwrap().status == JobStatus::Completed
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while (workers.generation_stats().jobs_processed < 1 || workers.sme_stats().jobs_processed < 1)
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(5));
        }
        let (generation, sme) = (workers.generation_stats(), workers.sme_stats());
        workers.shutdown();

        assert!(done(&outline));
        assert!(done(&ingestion));
        assert_eq!(generation.jobs_succeeded, 1);
        assert_eq!(sme.jobs_succeeded, 1);
    }
}
