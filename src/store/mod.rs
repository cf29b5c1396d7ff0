//! Store (C1): single source of truth for channels, keys, cooldowns, auth
//! tokens, settings, admin sessions, and logs.
//!
//! Two backing engines are meant to share one logical schema (embedded file
//! vs. a remote RDBMS); the semantic differences between them (INSERT-OR-
//! REPLACE vs. ON-DUPLICATE-KEY-UPDATE, DELETE…LIMIT support) are abstracted
//! behind this trait so a second engine is an additive `impl Store`, not a
//! rewrite. This crate ships the embedded-file engine ([`sqlite::SqliteStore`]).

mod sqlite;
mod tx;

pub use sqlite::SqliteStore;
pub use tx::{retry_on_conflict, RetryConfig};

use crate::error::StoreError;
use crate::models::{ApiKeyRow, AuthToken, Channel, LogEntry, ModelEntry};
use async_trait::async_trait;
use std::collections::HashMap;

/// Filters accepted by the metrics aggregator (C9) when resolving the set
/// of channel ids a bucketed query should be restricted to.
#[derive(Debug, Clone, Default)]
pub struct ChannelFilter {
    pub channel_type: Option<String>,
    pub channel_name: Option<String>,
    pub model: Option<String>,
    pub auth_token_id: Option<i64>,
}

/// One bucketed row as produced by the aggregation query described in §4.9.
#[derive(Debug, Clone)]
pub struct MetricsBucketRow {
    pub bucket_start: i64,
    pub channel_id: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub total_count: i64,
}

#[async_trait]
pub trait Store: Send + Sync {
    // Channels
    async fn list_channels(&self) -> Result<Vec<Channel>, StoreError>;
    async fn get_channel(&self, id: i64) -> Result<Channel, StoreError>;
    async fn get_channel_by_name(&self, name: &str) -> Result<Option<Channel>, StoreError>;
    async fn create_channel(&self, channel: Channel) -> Result<Channel, StoreError>;
    async fn update_channel(&self, channel: Channel) -> Result<Channel, StoreError>;
    async fn delete_channel(&self, id: i64) -> Result<(), StoreError>;

    // Candidate selection (C5 reads through here / the cache)
    async fn candidate_channels(
        &self,
        model: &str,
        channel_type: Option<&str>,
        now_epoch: i64,
    ) -> Result<Vec<Channel>, StoreError>;

    // Model entries
    async fn list_models(&self, channel_id: i64) -> Result<Vec<ModelEntry>, StoreError>;
    async fn replace_models(
        &self,
        channel_id: i64,
        models: Vec<ModelEntry>,
    ) -> Result<(), StoreError>;

    // API keys
    async fn list_keys(&self, channel_id: i64) -> Result<Vec<ApiKeyRow>, StoreError>;
    async fn add_key(
        &self,
        channel_id: i64,
        api_key: String,
        key_strategy: crate::models::KeyStrategy,
    ) -> Result<ApiKeyRow, StoreError>;
    /// Delete the key at `key_index`, compacting higher indices down by one.
    async fn delete_key(&self, channel_id: i64, key_index: i64) -> Result<(), StoreError>;

    // Cooldowns
    async fn bump_channel_cooldown(
        &self,
        channel_id: i64,
        until: i64,
        duration_ms: i64,
    ) -> Result<(), StoreError>;
    async fn reset_channel_cooldown(&self, channel_id: i64) -> Result<(), StoreError>;
    async fn bump_key_cooldown(
        &self,
        channel_id: i64,
        key_index: i64,
        until: i64,
        duration_ms: i64,
    ) -> Result<(), StoreError>;
    async fn reset_key_cooldown(&self, channel_id: i64, key_index: i64) -> Result<(), StoreError>;
    async fn active_channel_cooldowns(&self) -> Result<HashMap<i64, i64>, StoreError>;
    async fn active_key_cooldowns(&self) -> Result<HashMap<i64, HashMap<i64, i64>>, StoreError>;

    // Auth tokens
    async fn create_auth_token(&self, token: AuthToken) -> Result<AuthToken, StoreError>;
    async fn list_auth_tokens(&self) -> Result<Vec<AuthToken>, StoreError>;
    async fn get_auth_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<AuthToken>, StoreError>;
    async fn delete_auth_token(&self, id: i64) -> Result<(), StoreError>;
    async fn record_auth_token_usage(
        &self,
        id: i64,
        success: bool,
        duration_ms: f64,
        is_streaming: bool,
        tokens: i64,
        cost_microusd: i64,
    ) -> Result<(), StoreError>;

    // Admin sessions
    async fn create_admin_session(
        &self,
        token_hash: &str,
        created_at: i64,
        expires_at: i64,
    ) -> Result<(), StoreError>;
    async fn get_admin_session(&self, token_hash: &str) -> Result<Option<i64>, StoreError>;
    async fn delete_expired_admin_sessions(&self, now: i64) -> Result<u64, StoreError>;
    async fn delete_admin_session(&self, token_hash: &str) -> Result<(), StoreError>;

    // Settings
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError>;

    // Logs
    async fn append_logs(&self, entries: Vec<LogEntry>) -> Result<usize, StoreError>;
    async fn recent_errors(&self, limit: i64) -> Result<Vec<LogEntry>, StoreError>;
    async fn prune_logs_older_than(&self, cutoff_ms: i64, batch_size: u32) -> Result<u64, StoreError>;
    async fn metrics_buckets(
        &self,
        since_ms: i64,
        until_ms: i64,
        bucket_secs: i64,
        filter: ChannelFilter,
    ) -> Result<Vec<MetricsBucketRow>, StoreError>;
    async fn rpm_peak_and_recent(&self, since_ms: i64, until_ms: i64) -> Result<(i64, i64), StoreError>;
}
