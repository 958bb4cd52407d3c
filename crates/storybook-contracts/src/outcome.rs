use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::BackendId;
use crate::request::Style;
use crate::task::{Fingerprint, TaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    InvalidRequest,
    RateLimited,
    TransientFailure,
    ContentRejected,
    RetriesExhausted,
    DeadlineExceeded,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::RateLimited => "rate_limited",
            Self::TransientFailure => "transient_failure",
            Self::ContentRejected => "content_rejected",
            Self::RetriesExhausted => "retries_exhausted",
            Self::DeadlineExceeded => "deadline_exceeded",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::TransientFailure)
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub class: FailureClass,
    pub message: String,
    /// Class of the final attempt when `class` is `RetriesExhausted`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_class: Option<FailureClass>,
}

impl TaskFailure {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            last_class: None,
        }
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(FailureClass::DeadlineExceeded, message)
    }
}

/// Image bytes plus where they were persisted, if anywhere.
#[derive(Clone, PartialEq, Eq)]
pub struct Artifact {
    bytes: Arc<[u8]>,
    digest: String,
    storage_key: Option<String>,
}

impl Artifact {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        let digest = content_digest(&bytes);
        Self {
            bytes,
            digest,
            storage_key: None,
        }
    }

    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = Some(key.into());
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn storage_key(&self) -> Option<&str> {
        self.storage_key.as_deref()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("len", &self.bytes.len())
            .field("digest", &self.digest)
            .field("storage_key", &self.storage_key)
            .finish()
    }
}

pub fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Generated(Artifact),
    Cached(Artifact),
    Failed(TaskFailure),
}

impl TaskOutcome {
    pub fn artifact(&self) -> Option<&Artifact> {
        match self {
            Self::Generated(artifact) | Self::Cached(artifact) => Some(artifact),
            Self::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&TaskFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Generated(_) => "generated",
            Self::Cached(_) => "cached",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub kind: TaskKind,
    pub fingerprint: Fingerprint,
    pub outcome: TaskOutcome,
    pub attempts: u32,
}

impl TaskResult {
    pub fn generated(kind: TaskKind, fingerprint: Fingerprint, artifact: Artifact, attempts: u32) -> Self {
        Self {
            kind,
            fingerprint,
            outcome: TaskOutcome::Generated(artifact),
            attempts,
        }
    }

    pub fn cached(kind: TaskKind, fingerprint: Fingerprint, artifact: Artifact) -> Self {
        Self {
            kind,
            fingerprint,
            outcome: TaskOutcome::Cached(artifact),
            attempts: 0,
        }
    }

    pub fn failed(kind: TaskKind, fingerprint: Fingerprint, failure: TaskFailure, attempts: u32) -> Self {
        Self {
            kind,
            fingerprint,
            outcome: TaskOutcome::Failed(failure),
            attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Complete,
    PartialFailure,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::PartialFailure => "partial_failure",
            Self::Failed => "failed",
        }
    }

    /// A storybook can be rendered unless the job failed outright.
    pub fn is_deliverable(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cover failure fails the job. Otherwise the job is complete when every
/// task produced an artifact, failed when fewer than `min_stanza_successes`
/// stanzas did, and partially failed in every other case.
pub fn classify_job_status(results: &[TaskResult], min_stanza_successes: usize) -> JobStatus {
    let cover_ok = results
        .iter()
        .any(|result| result.kind.is_cover() && result.outcome.is_success());
    if !cover_ok {
        return JobStatus::Failed;
    }

    let stanza_successes = results
        .iter()
        .filter(|result| !result.kind.is_cover() && result.outcome.is_success())
        .count();
    if stanza_successes < min_stanza_successes {
        return JobStatus::Failed;
    }

    if results.iter().all(|result| result.outcome.is_success()) {
        JobStatus::Complete
    } else {
        JobStatus::PartialFailure
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub kind: TaskKind,
    pub class: FailureClass,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: String,
    pub backend: BackendId,
    pub style: Style,
    pub status: JobStatus,
    /// Every task of the job, ordered by kind regardless of completion order.
    pub tasks: Vec<TaskResult>,
    pub failures: Vec<FailureSummary>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    pub fn from_results(
        job_id: impl Into<String>,
        backend: BackendId,
        style: Style,
        mut tasks: Vec<TaskResult>,
        min_stanza_successes: usize,
        started_at: DateTime<Utc>,
    ) -> Self {
        tasks.sort_by_key(|result| result.kind);
        let status = classify_job_status(&tasks, min_stanza_successes);
        let failures = tasks
            .iter()
            .filter_map(|result| {
                result.outcome.failure().map(|failure| FailureSummary {
                    kind: result.kind,
                    class: failure.class,
                    message: failure.message.clone(),
                })
            })
            .collect();
        Self {
            job_id: job_id.into(),
            backend,
            style,
            status,
            tasks,
            failures,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn task(&self, kind: TaskKind) -> Option<&TaskResult> {
        self.tasks.iter().find(|result| result.kind == kind)
    }

    pub fn cover(&self) -> Option<&TaskResult> {
        self.task(TaskKind::Cover)
    }

    pub fn stanza_count(&self) -> usize {
        self.tasks.iter().filter(|result| !result.kind.is_cover()).count()
    }

    pub fn artifacts(&self) -> impl Iterator<Item = (TaskKind, &Artifact)> {
        self.tasks
            .iter()
            .filter_map(|result| result.outcome.artifact().map(|artifact| (result.kind, artifact)))
    }

    pub fn cache_hits(&self) -> usize {
        self.tasks
            .iter()
            .filter(|result| matches!(result.outcome, TaskOutcome::Cached(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::models::BackendId;
    use crate::request::Style;
    use crate::task::{Fingerprint, TaskKind};

    use super::{
        classify_job_status, Artifact, FailureClass, JobResult, JobStatus, TaskFailure,
        TaskResult,
    };

    fn ok(kind: TaskKind) -> TaskResult {
        TaskResult::generated(
            kind,
            Fingerprint::from_hex(kind.label()),
            Artifact::new(kind.label().into_bytes()),
            1,
        )
    }

    fn failed(kind: TaskKind) -> TaskResult {
        TaskResult::failed(
            kind,
            Fingerprint::from_hex(kind.label()),
            TaskFailure::new(FailureClass::ContentRejected, "blocked"),
            1,
        )
    }

    fn batch(stanzas: &[bool], cover: bool) -> Vec<TaskResult> {
        let mut results: Vec<TaskResult> = stanzas
            .iter()
            .enumerate()
            .map(|(idx, success)| {
                if *success {
                    ok(TaskKind::Stanza(idx))
                } else {
                    failed(TaskKind::Stanza(idx))
                }
            })
            .collect();
        results.push(if cover {
            ok(TaskKind::Cover)
        } else {
            failed(TaskKind::Cover)
        });
        results
    }

    #[test]
    fn every_success_is_complete() {
        assert_eq!(
            classify_job_status(&batch(&[true, true, true], true), 0),
            JobStatus::Complete
        );
    }

    #[test]
    fn some_stanza_failures_are_partial() {
        assert_eq!(
            classify_job_status(&batch(&[true, false, true, false, true], true), 0),
            JobStatus::PartialFailure
        );
    }

    #[test]
    fn all_stanzas_failing_with_cover_is_partial() {
        assert_eq!(
            classify_job_status(&batch(&[false, false, false], true), 0),
            JobStatus::PartialFailure
        );
    }

    #[test]
    fn cover_failure_is_failed_regardless_of_stanzas() {
        assert_eq!(
            classify_job_status(&batch(&[true, true, true, true, true], false), 0),
            JobStatus::Failed
        );
    }

    #[test]
    fn stanza_threshold_turns_job_failed() {
        let results = batch(&[true, false, false], true);
        assert_eq!(classify_job_status(&results, 1), JobStatus::PartialFailure);
        assert_eq!(classify_job_status(&results, 2), JobStatus::Failed);
    }

    #[test]
    fn job_result_orders_tasks_and_names_failures() {
        let mut results = batch(&[true, false, true], true);
        results.reverse();
        let job = JobResult::from_results(
            "job-1",
            BackendId::Dryrun,
            Style::Muted,
            results,
            0,
            Utc::now(),
        );
        let kinds: Vec<TaskKind> = job.tasks.iter().map(|result| result.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TaskKind::Stanza(0),
                TaskKind::Stanza(1),
                TaskKind::Stanza(2),
                TaskKind::Cover
            ]
        );
        assert_eq!(job.status, JobStatus::PartialFailure);
        assert_eq!(job.failures.len(), 1);
        assert_eq!(job.failures[0].kind, TaskKind::Stanza(1));
        assert_eq!(job.failures[0].class, FailureClass::ContentRejected);
        assert_eq!(job.artifacts().count(), 3);
        assert_eq!(job.stanza_count(), 3);
        assert!(job.finished_at >= job.started_at);
    }

    #[test]
    fn artifact_digest_tracks_content() {
        let a = Artifact::new(b"png-a".to_vec());
        let b = Artifact::new(b"png-a".to_vec()).with_storage_key("artifacts/aa/x.png");
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), Artifact::new(b"png-b".to_vec()).digest());
        assert_eq!(b.storage_key(), Some("artifacts/aa/x.png"));
    }
}
