//! In-memory [`CoordStore`] with lease expiry, for tests and mock runs.
//!
//! Leases are tracked against [`tokio::time::Instant`], so tests running
//! under a paused clock can drive expiry with `tokio::time::advance`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::{CoordError, CoordStore, CreateOutcome};

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Shared in-memory key space. Clones see the same entries, so one store
/// can back several agents in a test.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete a key outright, as an upstream scheduler or operator would.
    /// Returns the previous value if the key was live.
    pub async fn remove(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries
            .remove(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value)
    }
}

#[async_trait]
impl CoordStore for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<String>, CoordError> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn write(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CoordError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<CreateOutcome, CoordError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        // An expired entry no longer guards the key.
        if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(CreateOutcome::Created)
    }

    async fn list_children(&self, key: &str) -> Result<BTreeMap<String, String>, CoordError> {
        let now = Instant::now();
        let prefix = format!("{}/", key.trim_end_matches('/'));
        let entries = self.entries.read().await;

        let mut children = BTreeMap::new();
        for (full_key, entry) in entries.iter() {
            if !entry.is_live(now) {
                continue;
            }
            let Some(rest) = full_key.strip_prefix(&prefix) else {
                continue;
            };
            if rest.is_empty() || rest.contains('/') {
                continue;
            }
            children.insert(rest.to_string(), entry.value.clone());
        }
        Ok(children)
    }
}
