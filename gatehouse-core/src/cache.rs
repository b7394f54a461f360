//! In-memory key/value store with per-entry TTL.
//!
//! Entries are replaced, never updated in place. Expired entries are never
//! returned: reads drop them lazily and a background sweep removes whatever
//! was not read again.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Key/value store consumed by the introspector.
///
/// Implementations synchronize internally; `get` and `set` are atomic with
/// respect to each other.
pub trait CacheStore: Send + Sync {
    /// Fetch a live entry.
    fn get(&self, key: &str) -> Option<Bytes>;

    /// Store `value` for `ttl_seconds`. A non-positive TTL stores nothing.
    fn set(&self, key: &str, value: Bytes, ttl_seconds: i64);
}

/// Entry in the memory store.
#[derive(Debug)]
struct CacheEntry {
    value: Bytes,
    expires_at: Instant,
}

/// Concurrent memory store shared by all introspectors of a configuration
/// generation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Spawn the periodic expiry sweep. Stops when `shutdown` is cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // Skip immediate first tick
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let removed = store.purge_expired();
                        if removed > 0 {
                            debug!(removed, remaining = store.len(), "Swept expired cache entries");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Cache sweeper shutting down");
                        break;
                    }
                }
            }
        })
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Bytes> {
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > Instant::now() {
                return Some(entry.value.clone());
            }
            // Entry expired, remove it
            drop(entry);
            self.entries
                .remove_if(key, |_, entry| entry.expires_at <= Instant::now());
        }
        None
    }

    fn set(&self, key: &str, value: Bytes, ttl_seconds: i64) {
        let Ok(ttl) = u64::try_from(ttl_seconds) else {
            return;
        };
        if ttl == 0 {
            return;
        }
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + Duration::from_secs(ttl),
        };
        self.entries.insert(key.to_string(), entry);
    }
}
