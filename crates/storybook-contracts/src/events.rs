use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type EventFields = Map<String, Value>;

/// Everything a job reports while it runs, in lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    JobStarted,
    TaskCacheHit,
    TaskAttemptFailed,
    TaskGenerated,
    TaskFailed,
    JobFinished,
}

impl JobEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobStarted => "job_started",
            Self::TaskCacheHit => "task_cache_hit",
            Self::TaskAttemptFailed => "task_attempt_failed",
            Self::TaskGenerated => "task_generated",
            Self::TaskFailed => "task_failed",
            Self::JobFinished => "job_finished",
        }
    }

    /// Events that close out one task of a job.
    pub fn settles_task(&self) -> bool {
        matches!(
            self,
            Self::TaskCacheHit | Self::TaskGenerated | Self::TaskFailed
        )
    }
}

impl fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of `events.jsonl`: `type`, `job_id` and `ts` first, then the
/// event-specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(rename = "type")]
    pub kind: JobEventKind,
    pub job_id: String,
    pub ts: String,
    #[serde(flatten)]
    pub fields: EventFields,
}

const RESERVED_KEYS: [&str; 3] = ["type", "job_id", "ts"];

/// Append-only job event log shared by every job of a process.
///
/// Clones share one lock, so jobs running concurrently never interleave
/// partial lines.
#[derive(Debug, Clone)]
pub struct JobEventLog {
    inner: Arc<JobEventLogInner>,
}

#[derive(Debug)]
struct JobEventLogInner {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JobEventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(JobEventLogInner {
                path: path.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Writes one event. Keys in `fields` that collide with `type`, `job_id`
    /// or `ts` are dropped; those always come from the arguments.
    pub fn append(
        &self,
        job_id: &str,
        kind: JobEventKind,
        mut fields: EventFields,
    ) -> anyhow::Result<JobEvent> {
        for key in RESERVED_KEYS {
            fields.remove(key);
        }
        let event = JobEvent {
            kind,
            job_id: job_id.to_string(),
            ts: now_utc_iso(),
            fields,
        };
        let line = serde_json::to_string(&event)?;

        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("job event log lock poisoned"))?;
        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)
            .with_context(|| format!("failed opening {}", self.inner.path.display()))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(event)
    }

    /// Every event of `job_id`, in write order. A missing log reads as empty.
    pub fn job_events(&self, job_id: &str) -> anyhow::Result<Vec<JobEvent>> {
        let raw = match std::fs::read_to_string(&self.inner.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed reading {}", self.inner.path.display()))
            }
        };
        let mut events = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event: JobEvent = serde_json::from_str(line).with_context(|| {
                format!("bad event on line {} of {}", index + 1, self.inner.path.display())
            })?;
            if event.job_id == job_id {
                events.push(event);
            }
        }
        Ok(events)
    }
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
