//! Cooldown Manager (C3): computes and persists the next backoff for a
//! (scope, id) pair on failure.

use crate::error::StoreError;
use crate::models::CooldownScope;
use crate::store::Store;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;

const KEY_CEILING_MS: i64 = 60 * 60 * 1000;
const CHANNEL_CEILING_MS: i64 = 30 * 60 * 1000;

const AUTH_INITIAL_MS: i64 = 5 * 60 * 1000;
const RATE_LIMIT_INITIAL_MS: i64 = 1000;
const SERVER_FAULT_INITIAL_MS: i64 = 1000;

/// Initial penalty, in milliseconds, for a first fault at the given HTTP
/// status. Returns `None` for statuses the spec says are not cooled.
pub fn initial_penalty_ms(status: u16) -> Option<i64> {
    match status {
        401 | 402 | 403 => Some(AUTH_INITIAL_MS),
        429 => Some(RATE_LIMIT_INITIAL_MS),
        500 | 502 | 503 | 504 | 520 | 521 | 524 | 597 | 598 | 599 => Some(SERVER_FAULT_INITIAL_MS),
        _ => None,
    }
}

fn ceiling_for(scope: CooldownScope) -> i64 {
    match scope {
        CooldownScope::Key => KEY_CEILING_MS,
        CooldownScope::Channel => CHANNEL_CEILING_MS,
    }
}

/// Apply +/-10% jitter to a duration in milliseconds.
fn jitter(ms: i64) -> i64 {
    let factor = rand::thread_rng().gen_range(0.9..1.1);
    ((ms as f64) * factor).round() as i64
}

/// Compute the next `cooldown_duration_ms` given the previous value and the
/// triggering status. Returns `None` if the status does not cool this scope.
pub fn next_penalty_ms(scope: CooldownScope, previous_ms: i64, status: u16) -> Option<i64> {
    if previous_ms <= 0 {
        return initial_penalty_ms(status);
    }
    // Already cooling (possibly from a different status this time around);
    // any further fault doubles the existing penalty up to the ceiling.
    let ceiling = ceiling_for(scope);
    let doubled = (previous_ms.saturating_mul(2)).min(ceiling);
    Some(jitter(doubled).min(ceiling).max(1))
}

pub struct CooldownManager {
    store: Arc<dyn Store>,
}

impl CooldownManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Bump a channel's cooldown in response to a fault at `status`.
    /// Returns the new `cooldown_until` epoch seconds, or `None` if the
    /// status does not cool this scope.
    pub async fn bump_channel(
        &self,
        channel_id: i64,
        previous_ms: i64,
        status: u16,
        now: i64,
    ) -> Result<Option<i64>, StoreError> {
        let Some(penalty_ms) = next_penalty_ms(CooldownScope::Channel, previous_ms, status) else {
            return Ok(None);
        };
        let until = now + penalty_ms / 1000;
        self.store
            .bump_channel_cooldown(channel_id, until, penalty_ms)
            .await?;
        tracing::info!(
            scope = "channel",
            channel_id,
            prev_ms = previous_ms,
            next_ms = penalty_ms,
            status,
            "cooldown bumped"
        );
        Ok(Some(until))
    }

    /// Bump a key's cooldown in response to a fault at `status`.
    pub async fn bump_key(
        &self,
        channel_id: i64,
        key_index: i64,
        previous_ms: i64,
        status: u16,
        now: i64,
    ) -> Result<Option<i64>, StoreError> {
        let Some(penalty_ms) = next_penalty_ms(CooldownScope::Key, previous_ms, status) else {
            return Ok(None);
        };
        let until = now + penalty_ms / 1000;
        self.store
            .bump_key_cooldown(channel_id, key_index, until, penalty_ms)
            .await?;
        tracing::info!(
            scope = "key",
            channel_id,
            key_index,
            prev_ms = previous_ms,
            next_ms = penalty_ms,
            status,
            "cooldown bumped"
        );
        Ok(Some(until))
    }

    pub async fn reset_channel(&self, channel_id: i64) -> Result<(), StoreError> {
        self.store.reset_channel_cooldown(channel_id).await
    }

    pub async fn reset_key(&self, channel_id: i64, key_index: i64) -> Result<(), StoreError> {
        self.store.reset_key_cooldown(channel_id, key_index).await
    }

    pub async fn active_channel_cooldowns(&self) -> Result<HashMap<i64, i64>, StoreError> {
        self.store.active_channel_cooldowns().await
    }

    pub async fn active_key_cooldowns(&self) -> Result<HashMap<i64, HashMap<i64, i64>>, StoreError> {
        self.store.active_key_cooldowns().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fault_uses_status_driven_initial() {
        assert_eq!(
            next_penalty_ms(CooldownScope::Key, 0, 401),
            Some(AUTH_INITIAL_MS)
        );
        assert_eq!(
            next_penalty_ms(CooldownScope::Key, 0, 429),
            Some(RATE_LIMIT_INITIAL_MS)
        );
        assert_eq!(
            next_penalty_ms(CooldownScope::Channel, 0, 503),
            Some(SERVER_FAULT_INITIAL_MS)
        );
    }

    #[test]
    fn uncooled_statuses_return_none() {
        assert_eq!(next_penalty_ms(CooldownScope::Key, 0, 404), None);
        assert_eq!(next_penalty_ms(CooldownScope::Key, 0, 400), None);
    }

    #[test]
    fn subsequent_faults_double_within_jitter_bounds() {
        for _ in 0..200 {
            let next = next_penalty_ms(CooldownScope::Key, 10_000, 429).unwrap();
            assert!(next >= (10_000f64 * 0.9) as i64);
            assert!(next <= (20_000f64 * 1.1) as i64);
        }
    }

    #[test]
    fn backoff_never_exceeds_scope_ceiling() {
        let mut previous = 1000i64;
        for _ in 0..40 {
            previous = next_penalty_ms(CooldownScope::Key, previous, 429).unwrap();
            assert!(previous <= (KEY_CEILING_MS as f64 * 1.1) as i64);
        }
        let mut previous = 1000i64;
        for _ in 0..40 {
            previous = next_penalty_ms(CooldownScope::Channel, previous, 500).unwrap();
            assert!(previous <= (CHANNEL_CEILING_MS as f64 * 1.1) as i64);
        }
    }
}
