//! Key Selector (C4): picks a credential index from a channel's pool given
//! strategy, exclude-set, and per-key cooldowns.

use crate::models::{ApiKeyRow, KeyStrategy};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
#[error("no available key")]
pub struct NoAvailableKey;

/// Per-channel round-robin counters, in-memory only. Fairness across
/// restarts is explicitly not guaranteed (§9 design notes).
pub struct RoundRobinCounters {
    counters: RwLock<HashMap<i64, AtomicU64>>,
}

impl RoundRobinCounters {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
        }
    }

    async fn next(&self, channel_id: i64) -> u64 {
        {
            let counters = self.counters.read().await;
            if let Some(counter) = counters.get(&channel_id) {
                return counter.fetch_add(1, Ordering::Relaxed);
            }
        }
        let mut counters = self.counters.write().await;
        let counter = counters.entry(channel_id).or_insert_with(|| AtomicU64::new(0));
        counter.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RoundRobinCounters {
    fn default() -> Self {
        Self::new()
    }
}

fn is_eligible(key: &ApiKeyRow, exclude: &HashSet<i64>, now: i64) -> bool {
    !exclude.contains(&key.key_index) && key.cooldown_until <= now
}

/// Choose a credential for `channel_id` from `keys`, respecting `exclude`
/// and per-key cooldowns, per the contract in §4.4.
pub async fn select_key(
    counters: &RoundRobinCounters,
    channel_id: i64,
    keys: &[ApiKeyRow],
    exclude: &HashSet<i64>,
    now: i64,
) -> Result<ApiKeyRow, NoAvailableKey> {
    if keys.is_empty() {
        return Err(NoAvailableKey);
    }

    // Single-key channel short-circuit: the channel-level cooldown is the
    // right scope when there's nothing to rotate to.
    if keys.len() == 1 {
        if exclude.contains(&keys[0].key_index) {
            return Err(NoAvailableKey);
        }
        return Ok(keys[0].clone());
    }

    let strategy = keys[0].key_strategy;
    match strategy {
        KeyStrategy::Sequential => keys
            .iter()
            .find(|k| is_eligible(k, exclude, now))
            .cloned()
            .ok_or(NoAvailableKey),
        KeyStrategy::RoundRobin => {
            let n = keys.len() as u64;
            let start = counters.next(channel_id).await % n;
            for offset in 0..n {
                let idx = ((start + offset) % n) as usize;
                if is_eligible(&keys[idx], exclude, now) {
                    return Ok(keys[idx].clone());
                }
            }
            Err(NoAvailableKey)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(idx: i64, strategy: KeyStrategy, cooldown_until: i64) -> ApiKeyRow {
        ApiKeyRow {
            channel_id: 1,
            key_index: idx,
            api_key: format!("k{idx}"),
            key_strategy: strategy,
            cooldown_until,
            cooldown_duration_ms: 0,
        }
    }

    #[tokio::test]
    async fn single_key_channel_ignores_its_own_cooldown() {
        let counters = RoundRobinCounters::new();
        let keys = vec![key(0, KeyStrategy::Sequential, i64::MAX)];
        let picked = select_key(&counters, 1, &keys, &HashSet::new(), 0).await.unwrap();
        assert_eq!(picked.key_index, 0);
    }

    #[tokio::test]
    async fn sequential_picks_first_eligible() {
        let counters = RoundRobinCounters::new();
        let keys = vec![
            key(0, KeyStrategy::Sequential, 1_000_000),
            key(1, KeyStrategy::Sequential, 0),
            key(2, KeyStrategy::Sequential, 0),
        ];
        let picked = select_key(&counters, 1, &keys, &HashSet::new(), 0).await.unwrap();
        assert_eq!(picked.key_index, 1);
    }

    #[tokio::test]
    async fn exclude_set_is_respected() {
        let counters = RoundRobinCounters::new();
        let keys = vec![key(0, KeyStrategy::Sequential, 0), key(1, KeyStrategy::Sequential, 0)];
        let mut exclude = HashSet::new();
        exclude.insert(0);
        let picked = select_key(&counters, 1, &keys, &exclude, 0).await.unwrap();
        assert_eq!(picked.key_index, 1);
    }

    #[tokio::test]
    async fn round_robin_visits_every_index_once_per_cycle() {
        let counters = RoundRobinCounters::new();
        let keys = vec![
            key(0, KeyStrategy::RoundRobin, 0),
            key(1, KeyStrategy::RoundRobin, 0),
            key(2, KeyStrategy::RoundRobin, 0),
        ];
        let mut seen = HashSet::new();
        for _ in 0..3 {
            let picked = select_key(&counters, 7, &keys, &HashSet::new(), 0).await.unwrap();
            seen.insert(picked.key_index);
        }
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn all_cooling_returns_no_available_key() {
        let counters = RoundRobinCounters::new();
        let keys = vec![
            key(0, KeyStrategy::Sequential, i64::MAX),
            key(1, KeyStrategy::Sequential, i64::MAX),
        ];
        let result = select_key(&counters, 1, &keys, &HashSet::new(), 0).await;
        assert!(result.is_err());
    }
}
