use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::Fingerprint;

/// Durable metadata for one cached artifact. The bytes themselves live in
/// object storage under `storage_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntryRecord {
    pub fingerprint: Fingerprint,
    pub content_digest: String,
    pub storage_key: Option<String>,
    pub byte_len: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}
