use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use storybook_contracts::outcome::{Artifact, TaskFailure};
use storybook_contracts::records::CacheEntryRecord;
use storybook_contracts::task::Fingerprint;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub artifact: Artifact,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn to_record(&self) -> CacheEntryRecord {
        CacheEntryRecord {
            fingerprint: self.fingerprint.clone(),
            content_digest: self.artifact.digest().to_string(),
            storage_key: self.artifact.storage_key().map(str::to_string),
            byte_len: self.artifact.len() as u64,
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at,
        }
    }
}

/// What an owner published for its waiters.
type Published = Option<Result<CacheEntry, TaskFailure>>;

#[derive(Debug)]
enum Slot {
    Ready(CacheEntry),
    Pending {
        claim_id: u64,
        done: watch::Receiver<Published>,
    },
}

/// In-memory artifact cache keyed by fingerprint.
///
/// Besides plain `lookup`/`store`, `claim` hands out at most one owner per
/// missing fingerprint; concurrent callers for the same fingerprint wait on
/// the owner's result instead of generating again.
#[derive(Debug, Default)]
pub struct ArtifactCache {
    slots: Mutex<HashMap<Fingerprint, Slot>>,
    next_claim: AtomicU64,
}

pub enum Claim {
    Hit(CacheEntry),
    Owner(ClaimGuard),
    Wait(PendingClaim),
}

/// How a waited-on claim ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled {
    Ready(CacheEntry),
    /// The owner gave up with this failure. Failures are shared with
    /// concurrent waiters but never cached.
    Failed(TaskFailure),
    /// The owner vanished without an outcome; claim again.
    Released,
}

impl ArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry and refreshes its access time.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let mut slots = self.lock();
        match slots.get_mut(fingerprint) {
            Some(Slot::Ready(entry)) => {
                touch(entry);
                Some(entry.clone())
            }
            _ => None,
        }
    }

    /// Upserts. Identical content only refreshes the access time.
    pub fn store(&self, fingerprint: Fingerprint, artifact: Artifact) -> CacheEntry {
        let mut slots = self.lock();
        upsert(&mut slots, fingerprint, artifact)
    }

    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn claim(self: &Arc<Self>, fingerprint: &Fingerprint) -> Claim {
        let mut slots = self.lock();
        match slots.get_mut(fingerprint) {
            Some(Slot::Ready(entry)) => {
                touch(entry);
                return Claim::Hit(entry.clone());
            }
            Some(Slot::Pending { done, .. }) => {
                return Claim::Wait(PendingClaim {
                    cache: Arc::clone(self),
                    fingerprint: fingerprint.clone(),
                    done: done.clone(),
                });
            }
            None => {}
        }

        let claim_id = self.next_claim.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = watch::channel(None);
        slots.insert(
            fingerprint.clone(),
            Slot::Pending {
                claim_id,
                done: receiver,
            },
        );
        Claim::Owner(ClaimGuard {
            cache: Arc::clone(self),
            fingerprint: fingerprint.clone(),
            claim_id,
            sender: Some(sender),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Fingerprint, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive right to produce the artifact for one fingerprint. Dropping it
/// without `complete` or `fail` releases the claim so a later caller can try
/// again.
pub struct ClaimGuard {
    cache: Arc<ArtifactCache>,
    fingerprint: Fingerprint,
    claim_id: u64,
    sender: Option<watch::Sender<Published>>,
}

impl ClaimGuard {
    pub fn complete(mut self, artifact: Artifact) -> CacheEntry {
        let entry = {
            let mut slots = self.cache.lock();
            upsert(&mut slots, self.fingerprint.clone(), artifact)
        };
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Some(Ok(entry.clone())));
        }
        entry
    }

    /// Hands `failure` to everyone waiting on this claim and frees the
    /// fingerprint for later callers.
    pub fn fail(mut self, failure: TaskFailure) {
        self.release();
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Some(Err(failure)));
        }
    }

    fn release(&self) {
        let mut slots = self.cache.lock();
        let owned = matches!(
            slots.get(&self.fingerprint),
            Some(Slot::Pending { claim_id, .. }) if *claim_id == self.claim_id
        );
        if owned {
            slots.remove(&self.fingerprint);
        }
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if self.sender.is_none() {
            return;
        }
        self.release();
        // Sender drops after the slot is gone, waking waiters with `Released`.
    }
}

pub struct PendingClaim {
    cache: Arc<ArtifactCache>,
    fingerprint: Fingerprint,
    done: watch::Receiver<Published>,
}

impl PendingClaim {
    pub async fn wait(mut self) -> Settled {
        let published = match self.done.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        match published {
            Some(Ok(entry)) => {
                Settled::Ready(self.cache.lookup(&self.fingerprint).unwrap_or(entry))
            }
            Some(Err(failure)) => Settled::Failed(failure),
            None => Settled::Released,
        }
    }
}

fn touch(entry: &mut CacheEntry) {
    entry.last_accessed_at = Utc::now().max(entry.last_accessed_at);
}

fn upsert(
    slots: &mut HashMap<Fingerprint, Slot>,
    fingerprint: Fingerprint,
    artifact: Artifact,
) -> CacheEntry {
    let now = Utc::now();
    if let Some(Slot::Ready(entry)) = slots.get_mut(&fingerprint) {
        if entry.artifact.digest() == artifact.digest() {
            if entry.artifact.storage_key().is_none() && artifact.storage_key().is_some() {
                entry.artifact = artifact;
            }
        } else {
            entry.artifact = artifact;
            entry.created_at = now;
        }
        touch(entry);
        return entry.clone();
    }

    let entry = CacheEntry {
        fingerprint: fingerprint.clone(),
        artifact,
        created_at: now,
        last_accessed_at: now,
    };
    slots.insert(fingerprint, Slot::Ready(entry.clone()));
    entry
}
