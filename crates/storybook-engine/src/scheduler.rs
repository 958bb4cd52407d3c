use std::sync::Arc;

use async_trait::async_trait;
use storybook_contracts::outcome::{FailureClass, TaskFailure, TaskResult};
use storybook_contracts::task::GenerationTask;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, warn};

/// Executes one task to completion, including its retries.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: GenerationTask) -> TaskResult;
}

/// Runs a batch with at most `max_concurrency` tasks in flight, starting
/// them in submission order. A failing task never cancels its siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduler {
    max_concurrency: usize,
    abandon_in_flight: bool,
}

struct Submitted {
    task: GenerationTask,
    handle: JoinHandle<TaskResult>,
}

impl Scheduler {
    pub fn new(max_concurrency: usize, abandon_in_flight: bool) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            abandon_in_flight,
        }
    }

    /// Tasks still queued at `deadline` fail with `DeadlineExceeded` and are
    /// never started. Tasks already running finish, or are abandoned when
    /// configured to. Results come back ordered by task kind.
    pub async fn run_batch(
        &self,
        tasks: Vec<GenerationTask>,
        runner: Arc<dyn TaskRunner>,
        deadline: Instant,
    ) -> Vec<TaskResult> {
        let slots = Arc::new(Semaphore::new(self.max_concurrency));
        let mut submitted = Vec::with_capacity(tasks.len());
        let mut results = Vec::with_capacity(tasks.len());
        let mut queue = tasks.into_iter();

        while let Some(task) = queue.next() {
            let permit = tokio::select! {
                biased;
                _ = sleep_until(deadline) => None,
                permit = Arc::clone(&slots).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                let pending = std::iter::once(task).chain(queue.by_ref());
                for task in pending {
                    debug!(task = %task.kind, "deadline reached before start");
                    results.push(not_started(&task));
                }
                break;
            };

            let runner = Arc::clone(&runner);
            let spawned = task.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                runner.run(spawned).await
            });
            submitted.push(Submitted { task, handle });
        }

        for Submitted { task, mut handle } in submitted {
            let joined = if self.abandon_in_flight {
                match timeout_at(deadline, &mut handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        handle.abort();
                        warn!(task = %task.kind, "abandoned in-flight task at job deadline");
                        results.push(TaskResult::failed(
                            task.kind,
                            task.fingerprint.clone(),
                            TaskFailure::deadline_exceeded("abandoned in flight at job deadline"),
                            0,
                        ));
                        continue;
                    }
                }
            } else {
                handle.await
            };

            results.push(joined.unwrap_or_else(|err| {
                warn!(task = %task.kind, error = %err, "task did not run to completion");
                TaskResult::failed(
                    task.kind,
                    task.fingerprint.clone(),
                    TaskFailure::new(
                        FailureClass::TransientFailure,
                        format!("task aborted: {err}"),
                    ),
                    0,
                )
            }));
        }

        results.sort_by_key(|result| result.kind);
        results
    }
}

fn not_started(task: &GenerationTask) -> TaskResult {
    TaskResult::failed(
        task.kind,
        task.fingerprint.clone(),
        TaskFailure::deadline_exceeded("job deadline reached before the task started"),
        0,
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use storybook_contracts::models::BackendId;
    use storybook_contracts::outcome::{Artifact, FailureClass, TaskResult};
    use storybook_contracts::request::Style;
    use storybook_contracts::task::{GenerationTask, ImageSize, TaskKind};
    use tokio::time::Instant;

    use super::{Scheduler, TaskRunner};

    struct SleepyRunner {
        duration: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        started: Mutex<Vec<TaskKind>>,
    }

    impl SleepyRunner {
        fn new(duration: Duration) -> Arc<Self> {
            Arc::new(Self {
                duration,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                started: Mutex::new(Vec::new()),
            })
        }

        fn started(&self) -> Vec<TaskKind> {
            self.started
                .lock()
                .map(|started| started.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl TaskRunner for SleepyRunner {
        async fn run(&self, task: GenerationTask) -> TaskResult {
            if let Ok(mut started) = self.started.lock() {
                started.push(task.kind);
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.duration).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            TaskResult::generated(
                task.kind,
                task.fingerprint,
                Artifact::new(vec![task.prompt.len() as u8]),
                1,
            )
        }
    }

    fn batch(stanzas: usize) -> Vec<GenerationTask> {
        (0..stanzas)
            .map(|index| {
                GenerationTask::new(
                    format!("stanza {index}"),
                    ImageSize::Square,
                    Style::Muted,
                    BackendId::Dryrun,
                    TaskKind::Stanza(index),
                )
            })
            .chain(std::iter::once(GenerationTask::new(
                "cover",
                ImageSize::Portrait,
                Style::Muted,
                BackendId::Dryrun,
                TaskKind::Cover,
            )))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_ceiling_bounds_in_flight_tasks() {
        let runner = SleepyRunner::new(Duration::from_millis(100));
        let scheduler = Scheduler::new(3, false);
        let started = Instant::now();
        let results = scheduler
            .run_batch(
                batch(6),
                runner.clone(),
                Instant::now() + Duration::from_secs(60),
            )
            .await;

        assert_eq!(results.len(), 7);
        assert!(results.iter().all(|result| result.outcome.is_success()));
        assert!(runner.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(runner.peak.load(Ordering::SeqCst), 3);
        // ceil(7 / 3) rounds of 100ms
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_start_in_submission_order_and_results_sort_by_kind() {
        let runner = SleepyRunner::new(Duration::from_millis(10));
        let mut tasks = batch(4);
        tasks.reverse();
        let submitted: Vec<TaskKind> = tasks.iter().map(|task| task.kind).collect();

        let results = Scheduler::new(1, false)
            .run_batch(tasks, runner.clone(), Instant::now() + Duration::from_secs(60))
            .await;

        assert_eq!(runner.started(), submitted);
        let kinds: Vec<TaskKind> = results.iter().map(|result| result.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TaskKind::Stanza(0),
                TaskKind::Stanza(1),
                TaskKind::Stanza(2),
                TaskKind::Stanza(3),
                TaskKind::Cover
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn queued_tasks_fail_at_deadline_without_starting() {
        let runner = SleepyRunner::new(Duration::from_millis(100));
        let results = Scheduler::new(1, false)
            .run_batch(
                batch(2),
                runner.clone(),
                Instant::now() + Duration::from_millis(150),
            )
            .await;

        // stanza 0 finishes, stanza 1 was already running at the deadline,
        // the cover never started.
        assert_eq!(runner.started().len(), 2);
        assert!(results[0].outcome.is_success());
        assert!(results[1].outcome.is_success());
        let cover = &results[2];
        assert_eq!(cover.kind, TaskKind::Cover);
        assert_eq!(cover.attempts, 0);
        assert_eq!(
            cover.outcome.failure().map(|failure| failure.class),
            Some(FailureClass::DeadlineExceeded)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_tasks_can_be_abandoned_at_deadline() {
        let runner = SleepyRunner::new(Duration::from_millis(100));
        let started = Instant::now();
        let results = Scheduler::new(1, true)
            .run_batch(
                batch(2),
                runner.clone(),
                Instant::now() + Duration::from_millis(150),
            )
            .await;

        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(results[0].outcome.is_success());
        let classes: Vec<Option<FailureClass>> = results[1..]
            .iter()
            .map(|result| result.outcome.failure().map(|failure| failure.class))
            .collect();
        assert_eq!(
            classes,
            vec![
                Some(FailureClass::DeadlineExceeded),
                Some(FailureClass::DeadlineExceeded)
            ]
        );
    }
}
