use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::now_utc_iso;
use crate::models::BackendId;
use crate::outcome::{JobResult, JobStatus, TaskFailure, TaskResult};
use crate::request::Style;
use crate::task::{Fingerprint, TaskKind};

/// Durable, byte-free view of a finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub backend: BackendId,
    pub style: Style,
    pub status: JobStatus,
    pub stanza_count: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tasks: Vec<TaskRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: String,
    pub kind: TaskKind,
    pub fingerprint: Fingerprint,
    pub outcome: String,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
}

impl From<&TaskResult> for TaskRecord {
    fn from(result: &TaskResult) -> Self {
        Self {
            task: result.kind.label(),
            kind: result.kind,
            fingerprint: result.fingerprint.clone(),
            outcome: result.outcome.label().to_string(),
            attempts: result.attempts,
            storage_key: result
                .outcome
                .artifact()
                .and_then(|artifact| artifact.storage_key())
                .map(str::to_string),
            failure: result.outcome.failure().cloned(),
        }
    }
}

impl JobRecord {
    pub fn from_result(result: &JobResult) -> Self {
        Self {
            job_id: result.job_id.clone(),
            backend: result.backend,
            style: result.style,
            status: result.status,
            stanza_count: result.stanza_count(),
            started_at: result.started_at,
            finished_at: result.finished_at,
            tasks: result.tasks.iter().map(TaskRecord::from).collect(),
        }
    }

    pub fn failed_tasks(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.iter().filter(|task| task.failure.is_some())
    }
}

/// Writes `record` as pretty JSON with a `ts` stamp. Keys in `extra` are
/// merged last.
pub fn write_job_record(
    path: &Path,
    record: &JobRecord,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(record)? {
        Value::Object(map) => map,
        other => anyhow::bail!("job record serialized to non-object: {other}"),
    };
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::{json, Map, Value};

    use crate::models::BackendId;
    use crate::outcome::{Artifact, FailureClass, JobResult, TaskFailure, TaskResult};
    use crate::request::Style;
    use crate::task::{Fingerprint, TaskKind};

    use super::{write_job_record, JobRecord};

    fn sample_result() -> JobResult {
        let tasks = vec![
            TaskResult::failed(
                TaskKind::Stanza(1),
                Fingerprint::from_hex("bb"),
                TaskFailure::new(FailureClass::ContentRejected, "blocked"),
                1,
            ),
            TaskResult::cached(
                TaskKind::Cover,
                Fingerprint::from_hex("cc"),
                Artifact::new(vec![3u8, 4]).with_storage_key("artifacts/cc/cc.png"),
            ),
            TaskResult::generated(
                TaskKind::Stanza(0),
                Fingerprint::from_hex("aa"),
                Artifact::new(vec![1u8, 2]),
                2,
            ),
        ];
        JobResult::from_results("job-1", BackendId::Dryrun, Style::Muted, tasks, 0, Utc::now())
    }

    #[test]
    fn job_record_mirrors_result_without_bytes() {
        let record = JobRecord::from_result(&sample_result());
        assert_eq!(record.stanza_count, 2);
        assert_eq!(record.tasks.len(), 3);
        assert_eq!(record.tasks[0].task, "stanza-01");
        assert_eq!(record.tasks[0].outcome, "generated");
        assert_eq!(record.tasks[0].attempts, 2);
        assert_eq!(record.tasks[1].outcome, "failed");
        assert_eq!(record.tasks[2].storage_key.as_deref(), Some("artifacts/cc/cc.png"));
        assert_eq!(record.failed_tasks().count(), 1);
    }

    #[test]
    fn write_job_record_generates_expected_payload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("jobs").join("job-1.json");
        let record = JobRecord::from_result(&sample_result());
        let mut extra = Map::new();
        extra.insert("extra_key".to_string(), Value::String("extra".to_string()));
        write_job_record(&path, &record, Some(&extra))?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(parsed["job_id"], json!("job-1"));
        assert_eq!(parsed["status"], json!("partial_failure"));
        assert_eq!(parsed["tasks"][1]["failure"]["class"], json!("content_rejected"));
        assert_eq!(parsed["extra_key"], json!("extra"));
        assert!(parsed.get("ts").and_then(Value::as_str).is_some());

        let round_trip: JobRecord = serde_json::from_value(parsed)?;
        assert_eq!(round_trip.job_id, "job-1");
        Ok(())
    }
}
