//! Integration tests for the generation pipeline.
//!
//! Tests: JobService → JobStore → JobExecutor → processor → ParentFinalizer
//!
//! Verifies:
//! - A full-course fan-out finalizes its parent exactly once
//! - Failed and malformed children fail the parent
//! - Crashed workers' jobs are recovered by stale reclaim
//! - A parent whose finalization failed is recovered by the stalled sweep
//! - Concurrent workers never double-process or double-finalize

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use chrono::Duration;

    use coursegen_ai::AiError;
    use coursegen_core::TenantId;

    use crate::content::LessonRepository;
    use crate::jobs::{
        ClaimFilter, DEFAULT_FINALIZE_ATTEMPTS, FinalizeLabels, GenerationJob, JobExecutor,
        JobExecutorConfig, JobService, JobStatus, JobStore, JobType, LessonTarget, RunOutcome,
    };
    use crate::notify::Notification;
    use crate::processors::testing::World;
    use crate::workers::{WorkerServices, generation_executor};

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

    fn job_service(services: &WorkerServices) -> JobService {
        JobService::new(services.store.clone(), services.finalizer())
    }

    fn lessons(world: &World, n: usize) -> Vec<LessonTarget> {
        (0..n)
            .map(|i| LessonTarget::new(world.lesson(&format!("Lesson {i}")).id))
            .collect()
    }

    /// Run the executor until the queue is empty.
    fn drain(executor: &JobExecutor) -> Vec<RunOutcome> {
        let filter = executor.claim_filter(&JobExecutorConfig::default().with_unrecognized());
        let mut outcomes = Vec::new();
        while let Some(outcome) = executor.run_once(&filter).unwrap() {
            outcomes.push(outcome);
        }
        outcomes
    }

    fn course_notices(world: &World) -> Vec<Notification> {
        world.notifier.course_outcomes()
    }

    #[test]
    fn full_course_completes_parent_once() {
        let world = World::new();
        let services = services(&world);
        let targets = lessons(&world, 3);
        let (parent, children) = job_service(&services)
            .enqueue_full_course(world.tenant, world.user, world.course, &targets)
            .unwrap();

        let outcomes = drain(&generation_executor(&services));
        assert_eq!(outcomes, vec![RunOutcome::Succeeded; 3]);

        let parent = world.store.get(world.tenant, parent.id).unwrap().unwrap();
        assert_eq!(parent.status, JobStatus::Completed);
        assert_eq!(parent.progress_percent, 100);
        assert_eq!(parent.tokens_used, 30);
        assert!(parent.completed_at.is_some());

        for child in &children {
            let lesson = child.lesson_id.unwrap();
            assert_eq!(world.content.components(world.tenant, lesson).unwrap().len(), 3);
        }

        match course_notices(&world).as_slice() {
            [Notification::CourseComplete(outcome)] => {
                assert_eq!(outcome.course_title, "Forklift safety");
                assert_eq!(outcome.user_id, world.user);
                assert_eq!(outcome.completed_count, 3);
                assert_eq!(outcome.total_count, 3);
                assert_eq!(outcome.tokens_used, 30);
            }
            other => panic!("expected one completion notice, got {other:?}"),
        }
    }

    #[test]
    fn exhausted_child_fails_the_parent() {
        let world = World::new();
        world
            .script
            .lessons
            .lock()
            .unwrap()
            .push_back(Err(AiError::RequestFailed("upstream timeout".to_string())));
        let services = services(&world);
        let targets = lessons(&world, 3);
        let (parent, _) = job_service(&services)
            .with_max_retries(0)
            .enqueue_full_course(world.tenant, world.user, world.course, &targets)
            .unwrap();

        let mut outcomes = drain(&generation_executor(&services));
        outcomes.sort_by_key(|o| *o != RunOutcome::Failed);
        assert_eq!(
            outcomes,
            vec![RunOutcome::Failed, RunOutcome::Succeeded, RunOutcome::Succeeded]
        );

        let parent = world.store.get(world.tenant, parent.id).unwrap().unwrap();
        assert_eq!(parent.status, JobStatus::Failed);
        assert_eq!(
            parent.error_message.as_deref(),
            Some("1 lesson(s) failed to generate")
        );

        match course_notices(&world).as_slice() {
            [Notification::CourseFailed(outcome)] => {
                assert_eq!(outcome.failed_count, 1);
                assert_eq!(outcome.completed_count, 2);
            }
            other => panic!("expected one failure notice, got {other:?}"),
        }
    }

    #[test]
    fn retried_child_still_completes_the_course() {
        let world = World::new();
        world
            .script
            .lessons
            .lock()
            .unwrap()
            .push_back(Err(AiError::RateLimited));
        let services = services(&world);
        let targets = lessons(&world, 2);
        let (parent, _) = job_service(&services)
            .enqueue_full_course(world.tenant, world.user, world.course, &targets)
            .unwrap();

        let outcomes = drain(&generation_executor(&services));
        assert_eq!(outcomes.iter().filter(|o| **o == RunOutcome::Requeued).count(), 1);
        assert_eq!(outcomes.iter().filter(|o| **o == RunOutcome::Succeeded).count(), 2);

        let parent = world.store.get(world.tenant, parent.id).unwrap().unwrap();
        assert_eq!(parent.status, JobStatus::Completed);
        assert_eq!(course_notices(&world).len(), 1);
    }

    #[test]
    fn poison_child_is_failed_and_counted() {
        let world = World::new();
        let services = services(&world);
        let targets = lessons(&world, 1);
        let (parent, _) = job_service(&services)
            .enqueue_full_course(world.tenant, world.user, world.course, &targets)
            .unwrap();

        // A child row whose linkage got lost: it can be claimed but not run.
        let poison = GenerationJob::new(world.tenant, world.user, JobType::LessonContent)
            .with_course(world.course)
            .with_parent(parent.id);
        world.store.force_put(poison.clone());

        let mut outcomes = drain(&generation_executor(&services));
        outcomes.sort_by_key(|o| *o != RunOutcome::Malformed);
        assert_eq!(outcomes, vec![RunOutcome::Malformed, RunOutcome::Succeeded]);

        let poison = world.store.get(world.tenant, poison.id).unwrap().unwrap();
        assert_eq!(poison.status, JobStatus::Failed);

        let parent = world.store.get(world.tenant, parent.id).unwrap().unwrap();
        assert_eq!(parent.status, JobStatus::Failed);
        assert_eq!(course_notices(&world).len(), 1);
    }

    #[test]
    fn missed_finalization_is_recovered_by_the_sweep() {
        let world = World::new();
        let services = services(&world);
        let targets = lessons(&world, 2);
        let (parent, _) = job_service(&services)
            .enqueue_full_course(world.tenant, world.user, world.course, &targets)
            .unwrap();

        // The database drops out for the whole finalization after the last
        // child: every in-place attempt fails.
        let executor = generation_executor(&services);
        let filter = executor.claim_filter(&JobExecutorConfig::default());
        assert_eq!(executor.run_once(&filter).unwrap(), Some(RunOutcome::Succeeded));
        world.store.fail_finalizations(DEFAULT_FINALIZE_ATTEMPTS);
        assert_eq!(executor.run_once(&filter).unwrap(), Some(RunOutcome::Succeeded));

        world.clock.advance(Duration::hours(2));
        assert!(drain(&executor).is_empty());
        let stuck = world.store.get(world.tenant, parent.id).unwrap().unwrap();
        assert_eq!(stuck.status, JobStatus::Queued);
        assert!(course_notices(&world).is_empty());

        assert_eq!(executor.recover_stalled_parents().unwrap(), 1);
        assert_eq!(executor.recover_stalled_parents().unwrap(), 0);

        let parent = world.store.get(world.tenant, parent.id).unwrap().unwrap();
        assert_eq!(parent.status, JobStatus::Completed);
        assert_eq!(parent.tokens_used, 20);
        assert_eq!(course_notices(&world).len(), 1);
    }

    #[test]
    fn crashed_worker_job_is_recovered_after_stale_window() {
        let world = World::new();
        let services = services(&world);
        let job = job_service(&services)
            .enqueue_outline(world.tenant, world.user, world.course)
            .unwrap();

        // Claimed by a worker that never reports back.
        world
            .store
            .claim_next(&ClaimFilter::only([JobType::CourseOutline]))
            .unwrap();

        let executor = generation_executor(&services);
        assert!(drain(&executor).is_empty());

        world.clock.advance(Duration::minutes(31));
        assert_eq!(drain(&executor), vec![RunOutcome::Succeeded]);

        let job = world.store.get(world.tenant, job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 1);
    }

    #[test]
    fn cancelled_course_is_not_processed() {
        let world = World::new();
        let services = services(&world);
        let targets = lessons(&world, 2);
        let jobs = job_service(&services);
        let (parent, children) = jobs
            .enqueue_full_course(world.tenant, world.user, world.course, &targets)
            .unwrap();

        jobs.cancel(world.tenant, parent.id).unwrap();

        assert!(drain(&generation_executor(&services)).is_empty());
        for child in children {
            let lesson = child.lesson_id.unwrap();
            assert!(world.content.components(world.tenant, lesson).unwrap().is_empty());
        }
        assert!(course_notices(&world).is_empty());
    }

    #[test]
    fn concurrent_workers_finalize_exactly_once() {
        const WORKERS: usize = 4;
        const LESSONS: usize = 12;

        let world = World::new();
        let services = services(&world);
        let targets = lessons(&world, LESSONS);
        let (parent, _) = job_service(&services)
            .enqueue_full_course(world.tenant, world.user, world.course, &targets)
            .unwrap();

        let executor = Arc::new(generation_executor(&services));
        let barrier = Arc::new(Barrier::new(WORKERS));
        let handles: Vec<_> = (0..WORKERS)
            .map(|_| {
                let executor = executor.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    drain(&executor)
                })
            })
            .collect();

        let processed: usize = handles.into_iter().map(|h| h.join().unwrap().len()).sum();
        assert_eq!(processed, LESSONS);

        let parent = world.store.get(world.tenant, parent.id).unwrap().unwrap();
        assert_eq!(parent.status, JobStatus::Completed);
        assert_eq!(parent.tokens_used, 10 * LESSONS as u64);
        assert_eq!(course_notices(&world).len(), 1);
    }

    #[test]
    fn lessons_of_other_tenants_are_invisible() {
        let world = World::new();
        let services = services(&world);
        let mut foreign = world.lesson("Someone else's lesson");
        foreign.tenant_id = TenantId::new();
        world.content.put_lesson(foreign.clone());

        let job = job_service(&services)
            .enqueue_lesson_content(
                world.tenant,
                world.user,
                world.course,
                LessonTarget::new(foreign.id),
            )
            .unwrap();

        assert_eq!(drain(&generation_executor(&services)), vec![RunOutcome::Failed]);
        let job = world.store.get(world.tenant, job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);
        assert!(
            world
                .content
                .components(foreign.tenant_id, foreign.id)
                .unwrap()
                .is_empty()
        );
    }
}
