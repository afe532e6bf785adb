//! In-process expiring cache for single-item reads.
//!
//! Entries live for a fixed TTL counted from insertion; reads never extend it.
//! Expiry is checked on every read, and a background sweeper evicts dead
//! entries between `start` and `stop` so memory does not grow with ids that
//! are never read again.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Context, CoreError};

/// Cache configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Time an entry stays readable after `set`. Also the upper bound on how
    /// stale a cached item can be relative to the store.
    pub ttl: Duration,
    /// Period of the background eviction pass.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Point-in-time counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Stored entries, including expired ones not yet swept.
    pub entries: usize,
}

struct Entry<V> {
    value: V,
    /// None when the TTL reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

struct Inner<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: Eq + Hash, V> Inner<K, V> {
    async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }
}

struct Sweeper {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Key/value cache with per-entry time-to-live.
///
/// Safe to share between concurrent requests; all synchronization is
/// internal. Each instance is independent, so tests can build their own.
pub struct ExpiringCache<K, V> {
    inner: Arc<Inner<K, V>>,
    sweep_interval: Duration,
    sweeper: Mutex<Option<Sweeper>>,
}

/// Shortest sweep period; `tokio::time::interval` rejects zero.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Build a stopped cache. `sweep_interval` is clamped to
    /// [`MIN_SWEEP_INTERVAL`].
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                ttl: config.ttl,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
            sweep_interval: config.sweep_interval.max(MIN_SWEEP_INTERVAL),
            sweeper: Mutex::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Return the entry if it exists and has not expired. Does not touch the TTL.
    pub async fn get(&self, ctx: &Context, key: &K) -> Result<Option<V>, CoreError> {
        ctx.run(async {
            let entries = self.inner.entries.read().await;
            let live = entries
                .get(key)
                .filter(|e| e.is_live(Instant::now()))
                .map(|e| e.value.clone());
            let counter = if live.is_some() {
                &self.inner.hits
            } else {
                &self.inner.misses
            };
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(live)
        })
        .await
    }

    /// Insert or replace, restarting the entry's TTL.
    pub async fn set(&self, ctx: &Context, key: K, value: V) -> Result<(), CoreError> {
        ctx.run(async {
            let expires_at = Instant::now().checked_add(self.inner.ttl);
            self.inner
                .entries
                .write()
                .await
                .insert(key, Entry { value, expires_at });
            Ok(())
        })
        .await
    }

    pub async fn remove(&self, ctx: &Context, key: &K) -> Result<(), CoreError> {
        ctx.run(async {
            self.inner.entries.write().await.remove(key);
            Ok(())
        })
        .await
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            entries: self.inner.entries.read().await.len(),
        }
    }

    /// Empty the cache and launch the background sweeper. Restarting an
    /// already running cache replaces its sweeper.
    pub async fn start(&self) {
        let mut slot = self.sweeper.lock().await;
        if let Some(old) = slot.take() {
            old.token.cancel();
            let _ = old.handle.await;
        }
        self.inner.entries.write().await.clear();

        let token = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let stop = token.clone();
        let period = self.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval fires immediately once; nothing can be expired yet
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = inner.sweep().await;
                        if evicted > 0 {
                            debug!(evicted, "cache sweep");
                        }
                    }
                }
            }
        });
        *slot = Some(Sweeper { token, handle });
    }

    /// Stop the sweeper and wait for it to exit. Entries are kept.
    pub async fn stop(&self) -> Result<(), CoreError> {
        let Some(sweeper) = self.sweeper.lock().await.take() else {
            return Ok(());
        };
        sweeper.token.cancel();
        sweeper
            .handle
            .await
            .map_err(|e| CoreError::Repository(format!("cache sweeper: {e}")))
    }

    /// Whether a sweeper is currently attached.
    pub async fn is_running(&self) -> bool {
        self.sweeper.lock().await.is_some()
    }
}
