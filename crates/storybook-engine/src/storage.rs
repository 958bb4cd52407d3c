use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use storybook_contracts::records::{CacheEntryRecord, JobRecord, JsonDocumentStore};
use storybook_contracts::task::Fingerprint;

/// Durable blob storage for artifact bytes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `bytes` under `key` and returns the reference to record.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// Job and cache-entry records. Not needed for orchestration correctness,
/// only for durability across restarts.
pub trait MetadataStore: Send + Sync {
    fn put_job(&self, record: &JobRecord) -> Result<()>;
    fn put_cache_entry(&self, record: &CacheEntryRecord) -> Result<()>;
    fn cache_entry(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntryRecord>>;
    /// Most recently finished first.
    fn recent_jobs(&self, limit: usize) -> Result<Vec<JobRecord>>;
}

pub fn artifact_key(fingerprint: &Fingerprint) -> String {
    let hex = fingerprint.as_str();
    let shard = hex.get(..2).unwrap_or("00");
    format!("artifacts/{shard}/{hex}.png")
}

/// Object store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative
                .components()
                .any(|component| !matches!(component, Component::Normal(_)))
        {
            bail!("invalid object key '{key}'");
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed reading {}", path.display())),
        }
    }
}

/// Metadata kept in two JSON documents under one directory:
/// `jobs.json` keyed by job id and `cache_entries.json` keyed by fingerprint.
#[derive(Debug)]
pub struct JsonMetadataStore {
    jobs: Mutex<JsonDocumentStore>,
    cache_entries: Mutex<JsonDocumentStore>,
}

impl JsonMetadataStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            jobs: Mutex::new(JsonDocumentStore::new(dir.join("jobs.json"))),
            cache_entries: Mutex::new(JsonDocumentStore::new(dir.join("cache_entries.json"))),
        }
    }
}

fn lock(store: &Mutex<JsonDocumentStore>) -> Result<std::sync::MutexGuard<'_, JsonDocumentStore>> {
    store
        .lock()
        .map_err(|_| anyhow::anyhow!("metadata store lock poisoned"))
}

impl MetadataStore for JsonMetadataStore {
    fn put_job(&self, record: &JobRecord) -> Result<()> {
        lock(&self.jobs)?.put(&record.job_id, record)
    }

    fn put_cache_entry(&self, record: &CacheEntryRecord) -> Result<()> {
        lock(&self.cache_entries)?.put(record.fingerprint.as_str(), record)
    }

    fn cache_entry(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntryRecord>> {
        lock(&self.cache_entries)?.get_as(fingerprint.as_str())
    }

    fn recent_jobs(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let values = lock(&self.jobs)?.values();
        let mut jobs = values
            .into_iter()
            .map(serde_json::from_value::<JobRecord>)
            .collect::<Result<Vec<_>, _>>()
            .context("jobs.json holds a malformed job record")?;
        jobs.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        jobs.truncate(limit);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use storybook_contracts::models::BackendId;
    use storybook_contracts::outcome::JobStatus;
    use storybook_contracts::records::{CacheEntryRecord, JobRecord};
    use storybook_contracts::request::Style;
    use storybook_contracts::task::Fingerprint;

    use super::{artifact_key, FsObjectStore, JsonMetadataStore, MetadataStore, ObjectStore};

    #[test]
    fn artifact_keys_are_sharded_by_prefix() {
        let fp = Fingerprint::from_hex("abcdef0123");
        assert_eq!(artifact_key(&fp), "artifacts/ab/abcdef0123.png");
    }

    #[tokio::test]
    async fn fs_object_store_round_trips_and_rejects_escapes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = FsObjectStore::new(temp.path());
        let reference = store.put("artifacts/ab/abc.png", b"png-bytes").await?;
        assert_eq!(reference, "artifacts/ab/abc.png");
        assert_eq!(
            store.get("artifacts/ab/abc.png").await?,
            Some(b"png-bytes".to_vec())
        );
        assert_eq!(store.get("artifacts/zz/missing.png").await?, None);
        assert!(store.put("../escape.png", b"x").await.is_err());
        assert!(store.put("/etc/passwd", b"x").await.is_err());
        Ok(())
    }

    fn job(job_id: &str, finished_offset_s: i64) -> JobRecord {
        let started = Utc::now();
        JobRecord {
            job_id: job_id.to_string(),
            backend: BackendId::Dryrun,
            style: Style::Muted,
            status: JobStatus::Complete,
            stanza_count: 1,
            started_at: started,
            finished_at: started + Duration::seconds(finished_offset_s),
            tasks: Vec::new(),
        }
    }

    #[test]
    fn metadata_store_lists_recent_jobs_first() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = JsonMetadataStore::new(temp.path());
        store.put_job(&job("old", 1))?;
        store.put_job(&job("new", 30))?;
        store.put_job(&job("mid", 10))?;

        let reopened = JsonMetadataStore::new(temp.path());
        let ids: Vec<String> = reopened
            .recent_jobs(2)?
            .into_iter()
            .map(|record| record.job_id)
            .collect();
        assert_eq!(ids, vec!["new".to_string(), "mid".to_string()]);
        Ok(())
    }

    #[test]
    fn metadata_store_keeps_cache_entries_by_fingerprint() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = JsonMetadataStore::new(temp.path());
        let now = Utc::now();
        let record = CacheEntryRecord {
            fingerprint: Fingerprint::from_hex("ff00"),
            content_digest: "digest".to_string(),
            storage_key: Some("artifacts/ff/ff00.png".to_string()),
            byte_len: 10,
            created_at: now,
            last_accessed_at: now,
        };
        store.put_cache_entry(&record)?;
        assert_eq!(
            store.cache_entry(&Fingerprint::from_hex("ff00"))?,
            Some(record)
        );
        assert_eq!(store.cache_entry(&Fingerprint::from_hex("0000"))?, None);
        Ok(())
    }
}
