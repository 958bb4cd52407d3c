use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use storybook_contracts::events::{JobEventKind, JobEventLog};
use storybook_contracts::models::{BackendRegistry, BackendSelector, BackendSpec};
use storybook_contracts::outcome::{content_digest, Artifact, JobResult, TaskFailure, TaskResult};
use storybook_contracts::records::JobRecord;
use storybook_contracts::request::GenerationRequest;
use storybook_contracts::task::{Fingerprint, GenerationTask, TaskKind};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::backends::{GenerateCall, GeneratorRegistry, ImageGenerator};
use crate::cache::{ArtifactCache, Claim, ClaimGuard, Settled};
use crate::config::EngineConfig;
use crate::error::{GenerationError, JobError};
use crate::prompt::{cover_prompt, stanza_prompt};
use crate::rate_limit::{RateLimiters, TokenBucket};
use crate::retry::RetryPolicy;
use crate::scheduler::{Scheduler, TaskRunner};
use crate::storage::{artifact_key, MetadataStore, ObjectStore};

/// Turns one `GenerationRequest` into a `JobResult`.
///
/// The cache and rate limiters are shared with every other job handled by
/// the same orchestrator (or any other holding the same `Arc`s); everything
/// else is per job.
pub struct Orchestrator {
    config: EngineConfig,
    selector: BackendSelector,
    generators: GeneratorRegistry,
    cache: Arc<ArtifactCache>,
    limiters: RateLimiters,
    policy: RetryPolicy,
    scheduler: Scheduler,
    object_store: Option<Arc<dyn ObjectStore>>,
    metadata: Option<Arc<dyn MetadataStore>>,
    events: Option<JobEventLog>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        generators: GeneratorRegistry,
        cache: Arc<ArtifactCache>,
        limiters: RateLimiters,
    ) -> Self {
        Self {
            selector: BackendSelector::new(None, config.default_backend),
            policy: RetryPolicy::new(&config.retry),
            scheduler: Scheduler::new(
                config.max_concurrency,
                config.abandon_in_flight_on_deadline,
            ),
            config,
            generators,
            cache,
            limiters,
            object_store: None,
            metadata: None,
            events: None,
        }
    }

    pub fn with_backends(mut self, backends: BackendRegistry) -> Self {
        self.selector = BackendSelector::new(Some(backends), self.config.default_backend);
        self
    }

    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(store);
        self
    }

    pub fn with_metadata_store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.metadata = Some(store);
        self
    }

    pub fn with_events(mut self, events: JobEventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    #[instrument(
        skip_all,
        fields(job_id = tracing::field::Empty, backend = tracing::field::Empty)
    )]
    pub async fn process(&self, request: &GenerationRequest) -> Result<JobResult, JobError> {
        let selection = self
            .selector
            .select(request.model.as_deref())
            .map_err(JobError::UnsupportedModel)?;
        let spec = selection.spec;
        let Some(generator) = self.generators.get(spec.id) else {
            return Err(JobError::UnsupportedModel(format!(
                "Backend '{}' has no generator configured.",
                spec.id
            )));
        };
        let tasks = self.build_tasks(request, &spec)?;

        let job_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::Span::current();
        span.record("job_id", job_id.as_str());
        span.record("backend", spec.id.as_str());
        let started_at = Utc::now();
        let deadline = Instant::now() + self.config.job_timeout();
        info!(tasks = tasks.len(), style = request.style.as_str(), "job started");
        emit(
            self.events.as_ref(),
            &job_id,
            JobEventKind::JobStarted,
            json!({
                "backend": spec.id.as_str(),
                "style": request.style.as_str(),
                "tasks": tasks.len(),
                "model_requested": selection.requested,
            }),
        );

        let mut results = Vec::with_capacity(tasks.len());
        let mut misses = Vec::new();
        for task in tasks {
            match self.cache.lookup(&task.fingerprint) {
                Some(entry) => {
                    emit_cache_hit(self.events.as_ref(), &job_id, &task, "memory");
                    results.push(TaskResult::cached(task.kind, task.fingerprint, entry.artifact));
                }
                None => misses.push(task),
            }
        }
        debug!(
            hits = results.len(),
            misses = misses.len(),
            "cache partitioned"
        );

        let runner = Arc::new(GenerationRunner {
            job_id: job_id.clone(),
            generator,
            cache: Arc::clone(&self.cache),
            limiter: self.limiters.get(spec.id),
            policy: self.policy,
            task_timeout: self.config.task_timeout(),
            object_store: self.object_store.clone(),
            metadata: self.metadata.clone(),
            events: self.events.clone(),
        });
        results.extend(self.scheduler.run_batch(misses, runner, deadline).await);

        let result = JobResult::from_results(
            job_id,
            spec.id,
            request.style,
            results,
            self.config.min_stanza_successes,
            started_at,
        );
        self.record_job(&result);
        info!(
            status = result.status.as_str(),
            failures = result.failures.len(),
            cache_hits = result.cache_hits(),
            "job finished"
        );
        emit(
            self.events.as_ref(),
            &result.job_id,
            JobEventKind::JobFinished,
            json!({
                "status": result.status.as_str(),
                "failures": result.failures,
                "cache_hits": result.cache_hits(),
                "duration_ms": (result.finished_at - result.started_at).num_milliseconds(),
            }),
        );
        Ok(result)
    }

    /// One task per stanza followed by the cover. Fails before any work when
    /// the poem is empty or too long.
    fn build_tasks(
        &self,
        request: &GenerationRequest,
        spec: &BackendSpec,
    ) -> Result<Vec<GenerationTask>, JobError> {
        let stanzas = request.stanzas();
        if stanzas.is_empty() {
            return Err(JobError::InvalidRequest(
                "poem text contains no stanzas".to_string(),
            ));
        }
        if stanzas.len() > self.config.max_stanzas {
            return Err(JobError::InvalidRequest(format!(
                "poem has {} stanzas (max {})",
                stanzas.len(),
                self.config.max_stanzas
            )));
        }

        let total = stanzas.len();
        let references = request.reference_images();
        let mut tasks: Vec<GenerationTask> = stanzas
            .iter()
            .map(|stanza| {
                GenerationTask::new(
                    stanza_prompt(request, stanza, total),
                    spec.stanza_size,
                    request.style,
                    spec.id,
                    TaskKind::Stanza(stanza.index),
                )
                .with_reference_images(references.clone())
            })
            .collect();
        tasks.push(GenerationTask::new(
            cover_prompt(request, &stanzas),
            spec.cover_size,
            request.style,
            spec.id,
            TaskKind::Cover,
        )
        .with_reference_images(references));
        Ok(tasks)
    }

    fn record_job(&self, result: &JobResult) {
        let Some(metadata) = self.metadata.as_ref() else {
            return;
        };
        if let Err(err) = metadata.put_job(&JobRecord::from_result(result)) {
            warn!(error = %format!("{err:#}"), "failed to persist job record");
        }
    }
}

struct GenerationRunner {
    job_id: String,
    generator: Arc<dyn ImageGenerator>,
    cache: Arc<ArtifactCache>,
    limiter: Arc<TokenBucket>,
    policy: RetryPolicy,
    task_timeout: Duration,
    object_store: Option<Arc<dyn ObjectStore>>,
    metadata: Option<Arc<dyn MetadataStore>>,
    events: Option<JobEventLog>,
}

#[async_trait]
impl TaskRunner for GenerationRunner {
    async fn run(&self, task: GenerationTask) -> TaskResult {
        loop {
            match self.cache.claim(&task.fingerprint) {
                Claim::Hit(entry) => {
                    emit_cache_hit(self.events.as_ref(), &self.job_id, &task, "memory");
                    return TaskResult::cached(task.kind, task.fingerprint, entry.artifact);
                }
                Claim::Wait(pending) => {
                    debug!(task = %task.kind, "waiting on in-flight generation");
                    match pending.wait().await {
                        Settled::Ready(entry) => {
                            emit_cache_hit(self.events.as_ref(), &self.job_id, &task, "in_flight");
                            return TaskResult::cached(task.kind, task.fingerprint, entry.artifact);
                        }
                        // The owner already spent its attempts; share its verdict.
                        Settled::Failed(failure) => return self.fail(task, failure, 0),
                        Settled::Released => continue,
                    }
                }
                Claim::Owner(guard) => return self.produce(task, guard).await,
            }
        }
    }
}

impl GenerationRunner {
    async fn produce(&self, task: GenerationTask, guard: ClaimGuard) -> TaskResult {
        if let Some(artifact) = self.rehydrate(&task.fingerprint).await {
            let entry = guard.complete(artifact);
            emit_cache_hit(self.events.as_ref(), &self.job_id, &task, "durable");
            return TaskResult::cached(task.kind, task.fingerprint, entry.artifact);
        }

        let call = GenerateCall {
            prompt: task.prompt.clone(),
            size: task.size,
            style: task.style,
            reference_images: task.reference_images.clone(),
        };
        if let Err(err) = self.generator.validate(&call) {
            let failure = err.to_failure();
            guard.fail(failure.clone());
            return self.fail(task, failure, 0);
        }

        let generator = &self.generator;
        let limiter = &self.limiter;
        let call = &call;
        let task_timeout = self.task_timeout;
        let (outcome, attempts) = self
            .policy
            .run_observed(
                move |_| async move {
                    limiter.acquire().await;
                    match tokio::time::timeout(task_timeout, generator.generate(call)).await {
                        Ok(result) => result,
                        Err(_) => Err(GenerationError::TransientFailure(format!(
                            "generation timed out after {}ms",
                            task_timeout.as_millis()
                        ))),
                    }
                },
                |attempt, err, next_delay| {
                    warn!(task = %task.kind, attempt, error = %err, "generation attempt failed");
                    emit(
                        self.events.as_ref(),
                        &self.job_id,
                        JobEventKind::TaskAttemptFailed,
                        json!({
                            "task": task.kind.label(),
                            "attempt": attempt,
                            "class": err.class().as_str(),
                            "error": err.to_string(),
                            "retry_in_ms": next_delay.map(|delay| delay.as_millis() as u64),
                        }),
                    );
                },
            )
            .await;

        let image = match outcome {
            Ok(image) => image,
            Err(err) => {
                let failure = err.to_failure();
                guard.fail(failure.clone());
                return self.fail(task, failure, attempts);
            }
        };

        let mut artifact = Artifact::new(image.bytes);
        if let Some(store) = self.object_store.as_ref() {
            match store
                .put(&artifact_key(&task.fingerprint), artifact.bytes())
                .await
            {
                Ok(reference) => artifact = artifact.with_storage_key(reference),
                Err(err) => warn!(
                    task = %task.kind,
                    error = %format!("{err:#}"),
                    "failed to persist artifact; keeping it inline"
                ),
            }
        }
        let entry = guard.complete(artifact);
        if let Some(metadata) = self.metadata.as_ref() {
            if let Err(err) = metadata.put_cache_entry(&entry.to_record()) {
                warn!(error = %format!("{err:#}"), "failed to persist cache entry");
            }
        }

        debug!(task = %task.kind, attempts, bytes = entry.artifact.len(), "task generated");
        emit(
            self.events.as_ref(),
            &self.job_id,
            JobEventKind::TaskGenerated,
            json!({
                "task": task.kind.label(),
                "fingerprint": task.fingerprint.as_str(),
                "attempts": attempts,
                "bytes": entry.artifact.len(),
                "storage_key": entry.artifact.storage_key(),
            }),
        );
        TaskResult::generated(task.kind, task.fingerprint, entry.artifact, attempts)
    }

    fn fail(&self, task: GenerationTask, failure: TaskFailure, attempts: u32) -> TaskResult {
        warn!(task = %task.kind, class = failure.class.as_str(), attempts, "task failed");
        emit(
            self.events.as_ref(),
            &self.job_id,
            JobEventKind::TaskFailed,
            json!({
                "task": task.kind.label(),
                "class": failure.class.as_str(),
                "message": failure.message,
                "attempts": attempts,
            }),
        );
        TaskResult::failed(task.kind, task.fingerprint, failure, attempts)
    }

    /// Loads a previously persisted artifact when both durable stores know
    /// the fingerprint and the bytes still match the recorded digest.
    async fn rehydrate(&self, fingerprint: &Fingerprint) -> Option<Artifact> {
        let metadata = self.metadata.as_ref()?;
        let store = self.object_store.as_ref()?;
        let record = match metadata.cache_entry(fingerprint) {
            Ok(record) => record?,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "cache metadata lookup failed");
                return None;
            }
        };
        let key = record.storage_key?;
        let bytes = match store.get(&key).await {
            Ok(bytes) => bytes?,
            Err(err) => {
                warn!(error = %format!("{err:#}"), %key, "artifact load failed");
                return None;
            }
        };
        if content_digest(&bytes) != record.content_digest {
            warn!(%key, "stored artifact does not match its recorded digest");
            return None;
        }
        Some(Artifact::new(bytes).with_storage_key(key))
    }
}

fn emit_cache_hit(events: Option<&JobEventLog>, job_id: &str, task: &GenerationTask, source: &str) {
    emit(
        events,
        job_id,
        JobEventKind::TaskCacheHit,
        json!({
            "task": task.kind.label(),
            "fingerprint": task.fingerprint.as_str(),
            "source": source,
        }),
    );
}

fn emit(events: Option<&JobEventLog>, job_id: &str, kind: JobEventKind, fields: Value) {
    let Some(events) = events else {
        return;
    };
    let Value::Object(fields) = fields else {
        return;
    };
    if let Err(err) = events.append(job_id, kind, fields) {
        warn!(event = kind.as_str(), error = %format!("{err:#}"), "failed to write event");
    }
}
