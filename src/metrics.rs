//! Metrics Aggregator (C9): bucketed success/error counts and RPM summaries
//! for the admin dashboard, enriched with channel names and zero-filled
//! across the full requested range.

use crate::error::StoreError;
use crate::models::Channel;
use crate::store::{ChannelFilter, MetricsBucketRow, Store};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct MetricsBucket {
    pub bucket_start: i64,
    pub channel_id: i64,
    pub channel_name: String,
    pub success_count: i64,
    pub error_count: i64,
    pub total_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub buckets: Vec<MetricsBucket>,
    pub rpm_peak: i64,
    pub rpm_recent: i64,
}

pub struct MetricsAggregator {
    store: Arc<dyn Store>,
}

impl MetricsAggregator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Bucketed series over `[since_ms, until_ms)`, zero-filled so gaps in
    /// the underlying data don't produce gaps in the chart, plus RPM peak
    /// and recent-window figures.
    pub async fn summary(
        &self,
        since_ms: i64,
        until_ms: i64,
        bucket_secs: i64,
        filter: ChannelFilter,
    ) -> Result<MetricsSummary, StoreError> {
        let rows = self
            .store
            .metrics_buckets(since_ms, until_ms, bucket_secs, filter)
            .await?;
        let channels = self.store.list_channels().await?;
        let names: HashMap<i64, String> = channels.into_iter().map(|c: Channel| (c.id, c.name)).collect();

        let mut by_bucket_channel: HashMap<(i64, i64), MetricsBucketRow> = HashMap::new();
        let mut channel_ids: Vec<i64> = Vec::new();
        for row in rows {
            if !channel_ids.contains(&row.channel_id) {
                channel_ids.push(row.channel_id);
            }
            by_bucket_channel.insert((row.bucket_start, row.channel_id), row);
        }

        let bucket_ms = bucket_secs * 1000;
        let mut buckets = Vec::new();
        let mut start = since_ms - (since_ms % bucket_ms.max(1));
        while start < until_ms {
            for &channel_id in &channel_ids {
                let row = by_bucket_channel.get(&(start, channel_id));
                buckets.push(MetricsBucket {
                    bucket_start: start,
                    channel_id,
                    channel_name: names.get(&channel_id).cloned().unwrap_or_default(),
                    success_count: row.map(|r| r.success_count).unwrap_or(0),
                    error_count: row.map(|r| r.error_count).unwrap_or(0),
                    total_count: row.map(|r| r.total_count).unwrap_or(0),
                });
            }
            start += bucket_ms;
        }

        let (rpm_peak, rpm_recent) = self.store.rpm_peak_and_recent(since_ms, until_ms).await?;

        Ok(MetricsSummary { buckets, rpm_peak, rpm_recent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChannelType;
    use crate::store::SqliteStore;

    #[tokio::test]
    async fn empty_store_yields_empty_series_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(dir.path().join("t.db")).await.unwrap());
        let aggregator = MetricsAggregator::new(store);
        let summary = aggregator
            .summary(0, 60_000, 60, ChannelFilter::default())
            .await
            .unwrap();
        assert!(summary.buckets.is_empty());
        assert_eq!(summary.rpm_peak, 0);
    }

    #[tokio::test]
    async fn buckets_carry_channel_names() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(dir.path().join("t.db")).await.unwrap());
        let channel = store
            .create_channel(Channel {
                id: 0,
                name: "primary".into(),
                url: "https://x".into(),
                priority: 1,
                channel_type: ChannelType::Anthropic,
                enabled: true,
                cooldown_until: 0,
                cooldown_duration_ms: 0,
                created_at: 0,
                updated_at: 0,
            })
            .await
            .unwrap();
        store
            .append_logs(vec![crate::models::LogEntry {
                id: None,
                time_ms: 1000,
                model: "gpt-4".into(),
                channel_id: channel.id,
                status_code: 200,
                message: "ok".into(),
                duration_secs: 0.2,
                is_streaming: false,
                first_byte_secs: None,
                api_key_used: None,
                input_tokens: 0,
                output_tokens: 0,
                cache_read_tokens: 0,
                cache_creation_tokens: 0,
                cost_microusd: 0,
                auth_token_id: None,
                client_ip: None,
            }])
            .await
            .unwrap();
        let aggregator = MetricsAggregator::new(store);
        let summary = aggregator
            .summary(0, 60_000, 60, ChannelFilter::default())
            .await
            .unwrap();
        assert!(summary.buckets.iter().any(|b| b.channel_name == "primary"));
    }
}
