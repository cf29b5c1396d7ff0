//! Selector (C5): produces an ordered candidate channel list for
//! `(model_name, channel_type_filter)`.

use crate::cache::ChannelCache;
use crate::error::StoreError;
use crate::models::Channel;
use std::sync::Arc;

pub struct Selector {
    cache: Arc<ChannelCache>,
}

impl Selector {
    pub fn new(cache: Arc<ChannelCache>) -> Self {
        Self { cache }
    }

    /// Ordered candidates: descending priority, ascending id tie-break,
    /// filtered to enabled + not-cooling + model-match (exact or `*`).
    /// The cache row is a snapshot; the caller must tolerate cooldowns that
    /// advance between selection and attempt.
    pub async fn candidates(
        &self,
        model: &str,
        channel_type_filter: Option<&str>,
    ) -> Result<Vec<Channel>, StoreError> {
        let mut candidates = self.cache.candidates_for(model, channel_type_filter).await?;
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Channel, ChannelType, ModelEntry};
    use crate::store::{SqliteStore, Store};

    async fn seeded_store() -> Arc<dyn Store> {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("t.db")).await.unwrap();
        let a = store
            .create_channel(Channel {
                id: 0,
                name: "a".into(),
                url: "https://a".into(),
                priority: 5,
                channel_type: ChannelType::Anthropic,
                enabled: true,
                cooldown_until: 0,
                cooldown_duration_ms: 0,
                created_at: 0,
                updated_at: 0,
            })
            .await
            .unwrap();
        let b = store
            .create_channel(Channel {
                id: 0,
                name: "b".into(),
                url: "https://b".into(),
                priority: 10,
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
            .replace_models(a.id, vec![ModelEntry { channel_id: a.id, model: "gpt-4".into(), redirect_model: None }])
            .await
            .unwrap();
        store
            .replace_models(b.id, vec![ModelEntry { channel_id: b.id, model: "*".into(), redirect_model: None }])
            .await
            .unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn orders_by_priority_desc_then_id_asc() {
        let store = seeded_store().await;
        let cache = Arc::new(ChannelCache::new(store));
        let selector = Selector::new(cache);
        let candidates = selector.candidates("gpt-4", None).await.unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].name, "b");
        assert_eq!(candidates[1].name, "a");
    }

    #[tokio::test]
    async fn wildcard_model_entry_matches_anything() {
        let store = seeded_store().await;
        let cache = Arc::new(ChannelCache::new(store));
        let selector = Selector::new(cache);
        let candidates = selector.candidates("some-other-model", None).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "b");
    }
}
