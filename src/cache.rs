//! Tiered cache of live process memories.
//!
//! A byte-bounded LRU keyed by process id, owned by the orchestrator and
//! never touched by workers. When the byte budget is exceeded, least
//! recently used buffers are spilled to files and the entry becomes
//! file-backed (costing nothing against the budget); a file-backed entry
//! evicted under further pressure is dropped outright, leaving the file on
//! disk for the checkpoint index to rediscover. Expired entries are spilled
//! and removed by a periodic sweeper driven by a cascaded timer, so TTLs
//! beyond the platform's native max delay behave correctly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::model::{MemoryOrigin, MemoryPayload, ProcessMemory};

/// Longest single timer the sweeper will arm; longer waits cascade.
const MAX_TIMER_CHUNK: Duration = Duration::from_secs(24 * 24 * 60 * 60);

/// Destination for buffers evicted from the live tier.
///
/// Implemented by the checkpoint file store; tests supply a tempdir-backed
/// implementation. Synchronous by design: spills happen inside the cache
/// lock on the `set` path.
pub trait SpillWriter: Send + Sync {
    fn spill(&self, origin: &MemoryOrigin, bytes: &bytes::Bytes) -> std::io::Result<PathBuf>;
}

/// Point-in-time occupancy counters for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheUsage {
    pub entries: usize,
    pub resident_bytes: usize,
    pub spilled: usize,
}

struct Entry {
    memory: ProcessMemory,
    expires_at: Instant,
}

struct Inner {
    lru: LruCache<String, Entry>,
    resident_bytes: usize,
}

/// Size-bounded LRU of process memories with TTL and file spill.
///
/// Cloning shares the underlying cache.
#[derive(Clone)]
pub struct ProcessMemoryCache {
    inner: Arc<Mutex<Inner>>,
    max_bytes: usize,
    ttl: Duration,
    spill: Arc<dyn SpillWriter>,
}

impl ProcessMemoryCache {
    pub fn new(max_bytes: usize, ttl: Duration, spill: Arc<dyn SpillWriter>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                lru: LruCache::unbounded(),
                resident_bytes: 0,
            })),
            max_bytes,
            ttl,
            spill,
        }
    }

    /// Latest known memory for a process, refreshing recency and TTL.
    ///
    /// A file-backed result must be hydrated by the consumer before use.
    pub fn get(&self, process_id: &str) -> Option<ProcessMemory> {
        let mut inner = self.inner.lock();
        let expired = match inner.lru.get_mut(process_id) {
            None => return None,
            Some(entry) if entry.expires_at <= Instant::now() => true,
            Some(entry) => {
                entry.expires_at = Instant::now() + self.ttl;
                return Some(entry.memory.clone());
            }
        };
        if expired {
            self.expire_locked(&mut inner, process_id);
        }
        None
    }

    /// Insert or replace the memory for a process, evicting under pressure.
    pub fn set(&self, process_id: impl Into<String>, memory: ProcessMemory) {
        let process_id = process_id.into();
        let added = memory.memory.resident_bytes();
        let mut inner = self.inner.lock();
        if let Some(old) = inner.lru.put(
            process_id.clone(),
            Entry {
                memory,
                expires_at: Instant::now() + self.ttl,
            },
        ) {
            inner.resident_bytes -= old.memory.memory.resident_bytes();
        }
        inner.resident_bytes += added;

        while inner.resident_bytes > self.max_bytes && inner.lru.len() > 1 {
            let Some((key, mut entry)) = inner.lru.pop_lru() else {
                break;
            };
            if key == process_id {
                // The entry we just wrote is the working memory; keep it live.
                inner.lru.put(key, entry);
                break;
            }
            match &entry.memory.memory {
                MemoryPayload::Loaded(bytes) => match self.spill.spill(&entry.memory.origin, bytes)
                {
                    Ok(path) => {
                        inner.resident_bytes -= bytes.len();
                        entry.memory.memory = MemoryPayload::Spilled(path);
                        inner.lru.put(key, entry);
                    }
                    Err(e) => {
                        // Spill failed: drop the buffer rather than grow without bound.
                        tracing::warn!(process_id = %key, error = %e, "memory spill failed, dropping entry");
                        inner.resident_bytes -= bytes.len();
                    }
                },
                MemoryPayload::Spilled(_) => {
                    // Second eviction: drop the entry, the file stays on disk.
                    tracing::debug!(process_id = %key, "dropping file-backed cache entry");
                }
            }
        }
    }

    /// Snapshot of current entries for bulk checkpointing.
    ///
    /// Taken under the lock and returned by value, so visitors can await
    /// freely while `set` proceeds concurrently.
    pub fn snapshot(&self) -> Vec<(String, ProcessMemory)> {
        let inner = self.inner.lock();
        inner
            .lru
            .iter()
            .map(|(k, e)| (k.clone(), e.memory.clone()))
            .collect()
    }

    pub fn usage(&self) -> CacheUsage {
        let inner = self.inner.lock();
        let spilled = inner
            .lru
            .iter()
            .filter(|(_, e)| matches!(e.memory.memory, MemoryPayload::Spilled(_)))
            .count();
        CacheUsage {
            entries: inner.lru.len(),
            resident_bytes: inner.resident_bytes,
            spilled,
        }
    }

    /// Spill (when live) and remove every expired entry.
    pub fn sweep_expired(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let expired: Vec<String> = inner
            .lru
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.expire_locked(&mut inner, &key);
        }
    }

    fn expire_locked(&self, inner: &mut Inner, process_id: &str) {
        if let Some(entry) = inner.lru.pop(process_id) {
            if let MemoryPayload::Loaded(bytes) = &entry.memory.memory {
                inner.resident_bytes -= bytes.len();
                if let Err(e) = self.spill.spill(&entry.memory.origin, bytes) {
                    tracing::warn!(process_id, error = %e, "spill of expired memory failed");
                }
            }
        }
    }

    /// Run the TTL sweeper until the handle is aborted.
    pub fn spawn_ttl_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        let period = cache.ttl.max(Duration::from_secs(1));
        tokio::spawn(async move {
            loop {
                sleep_long(period).await;
                cache.sweep_expired();
            }
        })
    }
}

/// Sleep for an arbitrary duration by cascading bounded timers.
///
/// Platform timers cap out near 24.8 days; chunking keeps longer TTLs and
/// throttles honest.
pub async fn sleep_long(duration: Duration) {
    let mut remaining = duration;
    while remaining > MAX_TIMER_CHUNK {
        tokio::time::sleep(MAX_TIMER_CHUNK).await;
        remaining -= MAX_TIMER_CHUNK;
    }
    tokio::time::sleep(remaining).await;
}
