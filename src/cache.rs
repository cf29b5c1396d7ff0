//! Channel Cache (C2): TTL'd read-through cache over the Store for the hot
//! selection path ("enabled channels advertising model M", "this channel's
//! keys"). Implements the narrow `CacheInvalidator` port the Store writes
//! through, per the design note resolving the cache/store cyclic reference.

use crate::error::StoreError;
use crate::models::{ApiKeyRow, Channel};
use crate::store::Store;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};

const TTL: Duration = Duration::from_secs(60);
const WARMUP_TOP_N: usize = 20;

struct Entry<T> {
    value: T,
    loaded_at: Instant,
}

impl<T> Entry<T> {
    fn is_fresh(&self) -> bool {
        self.loaded_at.elapsed() < TTL
    }
}

/// Per-key singleflight: at most one concurrent load per cache key.
struct LoadGate {
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl LoadGate {
    fn new() -> Self {
        Self {
            gates: Mutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, key: &str) -> tokio::sync::OwnedSemaphorePermit {
        let sem = {
            let mut gates = self.gates.lock().await;
            Arc::clone(gates.entry(key.to_string()).or_insert_with(|| Arc::new(Semaphore::new(1))))
        };
        sem.acquire_owned().await.expect("semaphore never closed")
    }
}

pub struct ChannelCache {
    store: Arc<dyn Store>,
    candidates: Mutex<HashMap<String, Entry<Vec<Channel>>>>,
    keys: Mutex<HashMap<i64, Entry<Vec<ApiKeyRow>>>>,
    load_gate: LoadGate,
}

fn candidate_key(model: &str, channel_type: Option<&str>) -> String {
    format!("{}::{}", channel_type.unwrap_or(""), model)
}

impl ChannelCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            candidates: Mutex::new(HashMap::new()),
            keys: Mutex::new(HashMap::new()),
            load_gate: LoadGate::new(),
        }
    }

    /// Warm up the top-N highest-priority channels' key lists at startup.
    pub async fn warm_up(&self) {
        let channels = match self.store.list_channels().await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "channel cache warm-up failed to list channels");
                return;
            }
        };
        for channel in channels.into_iter().take(WARMUP_TOP_N) {
            if let Err(e) = self.keys_for(channel.id).await {
                tracing::warn!(channel_id = channel.id, error = %e, "warm-up failed for channel");
            }
        }
    }

    /// Read-through: enabled channels advertising `model`, snapshot-filtered
    /// to `enabled && cooldown_until <= now` at cache-populate time. Callers
    /// must still re-check cooldown in real time before use (§4.2).
    pub async fn candidates_for(
        &self,
        model: &str,
        channel_type: Option<&str>,
    ) -> Result<Vec<Channel>, StoreError> {
        let key = candidate_key(model, channel_type);
        {
            let cache = self.candidates.lock().await;
            if let Some(entry) = cache.get(&key) {
                if entry.is_fresh() {
                    return Ok(entry.value.clone());
                }
            }
        }

        let _permit = self.load_gate.acquire(&key).await;
        // Re-check after acquiring the gate: another task may have just populated it.
        {
            let cache = self.candidates.lock().await;
            if let Some(entry) = cache.get(&key) {
                if entry.is_fresh() {
                    return Ok(entry.value.clone());
                }
            }
        }

        let now = now_epoch();
        let loaded = self.store.candidate_channels(model, channel_type, now).await?;
        let mut cache = self.candidates.lock().await;
        cache.insert(
            key,
            Entry {
                value: loaded.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(loaded)
    }

    pub async fn keys_for(&self, channel_id: i64) -> Result<Vec<ApiKeyRow>, StoreError> {
        {
            let cache = self.keys.lock().await;
            if let Some(entry) = cache.get(&channel_id) {
                if entry.is_fresh() {
                    return Ok(entry.value.clone());
                }
            }
        }

        let gate_key = format!("keys::{channel_id}");
        let _permit = self.load_gate.acquire(&gate_key).await;
        {
            let cache = self.keys.lock().await;
            if let Some(entry) = cache.get(&channel_id) {
                if entry.is_fresh() {
                    return Ok(entry.value.clone());
                }
            }
        }

        let loaded = self.store.list_keys(channel_id).await?;
        let mut cache = self.keys.lock().await;
        cache.insert(
            channel_id,
            Entry {
                value: loaded.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(loaded)
    }

    /// Explicit invalidation on any channel/key write. The Store calls this
    /// through the narrow invalidator port; it never imports the cache type
    /// itself (see design notes).
    pub async fn invalidate_all(&self) {
        self.candidates.lock().await.clear();
        self.keys.lock().await.clear();
    }

    pub async fn invalidate_channel(&self, channel_id: i64) {
        self.keys.lock().await.remove(&channel_id);
        self.candidates.lock().await.clear();
    }
}

fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Narrow port the Store depends on to invalidate the cache on write,
/// without ever importing the cache type itself.
#[async_trait::async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate_all(&self);
    async fn invalidate_channel(&self, channel_id: i64);
}

#[async_trait::async_trait]
impl CacheInvalidator for ChannelCache {
    async fn invalidate_all(&self) {
        ChannelCache::invalidate_all(self).await
    }

    async fn invalidate_channel(&self, channel_id: i64) {
        ChannelCache::invalidate_channel(self, channel_id).await
    }
}
