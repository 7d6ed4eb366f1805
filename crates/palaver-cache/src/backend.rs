//! The cache backend collaborator interface and its in-memory
//! implementation.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;

/// Key/value + set operations the conversation cache builds on.
///
/// Implementations must tolerate concurrent callers; the worker pool
/// does not serialize access on their behalf.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value, optionally bounded by a TTL.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Add a member to a set-valued entry, creating it if missing.
    async fn add_to_set(&self, key: &str, member: String, ttl: Option<Duration>) -> Result<()>;

    /// All members of a set-valued entry; empty when missing or expired.
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

enum Value {
    Plain(String),
    Set(HashSet<String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

/// Process-local [`CacheBackend`].
///
/// Expired entries are skipped on read and reaped by
/// [`MemoryBackend::purge_expired`], which deployments run periodically.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry.  Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.expired());
        before - entries.len()
    }

    /// Number of live entries (expired ones included until purged).
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if !entry.expired() => match &entry.value {
                Value::Plain(value) => Ok(Some(value.clone())),
                Value::Set(_) => Ok(None),
            },
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Plain(value),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn add_to_set(&self, key: &str, member: String, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.write().await;
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        match entries.get_mut(key) {
            Some(entry) if !entry.expired() => {
                if let Value::Set(members) = &mut entry.value {
                    members.insert(member);
                    return Ok(());
                }
                // Plain entry under the same key: replace it.
                entry.value = Value::Set(HashSet::from([member]));
                entry.expires_at = expires_at;
            }
            _ => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Set(HashSet::from([member])),
                        expires_at,
                    },
                );
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if !entry.expired() => match &entry.value {
                Value::Set(members) => Ok(members.iter().cloned().collect()),
                Value::Plain(_) => Ok(Vec::new()),
            },
            _ => Ok(Vec::new()),
        }
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(key) {
            if let Value::Set(members) = &mut entry.value {
                members.remove(member);
            }
        }
        Ok(())
    }
}
