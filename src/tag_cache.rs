//! Read-through cache for the "all tags" listing.
//!
//! A single entry with a fixed TTL. [`TagCache::get`] serves the cached list
//! while it is fresh and reloads from the store otherwise.
//! [`TagCache::refresh`] reloads unconditionally; the scheduler calls it after
//! every cycle so new tags show up without waiting for expiry. There is no
//! invalidation on individual tag creation, so readers may see a list that is
//! up to one scheduler interval old.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use hack_timeline_core::models::Tag;
use hack_timeline_core::store::RecordStore;

struct Entry {
    tags: Arc<Vec<Tag>>,
    loaded_at: Instant,
}

pub struct TagCache {
    store: Arc<dyn RecordStore>,
    ttl: Duration,
    entry: RwLock<Option<Entry>>,
}

impl TagCache {
    pub fn new(store: Arc<dyn RecordStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            entry: RwLock::new(None),
        }
    }

    /// Cached tags if fresh, otherwise load from the store and cache them.
    pub async fn get(&self) -> Result<Arc<Vec<Tag>>> {
        {
            let entry = self.entry.read().await;
            if let Some(e) = entry.as_ref() {
                if e.loaded_at.elapsed() < self.ttl {
                    return Ok(e.tags.clone());
                }
            }
        }

        debug!("tag cache miss");
        self.load().await
    }

    /// Reload from the store regardless of freshness.
    pub async fn refresh(&self) -> Result<()> {
        self.load().await.map(|_| ())
    }

    /// Replace the cached list.
    pub async fn set(&self, tags: Vec<Tag>) -> Arc<Vec<Tag>> {
        let tags = Arc::new(tags);
        *self.entry.write().await = Some(Entry {
            tags: tags.clone(),
            loaded_at: Instant::now(),
        });
        tags
    }

    /// Drop the cached list; the next `get` goes to the store.
    pub async fn invalidate(&self) {
        *self.entry.write().await = None;
    }

    async fn load(&self) -> Result<Arc<Vec<Tag>>> {
        let tags = self.store.list_all_tags().await?;
        Ok(self.set(tags).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hack_timeline_core::models::{NewRecord, RecordFields};
    use hack_timeline_core::store::memory::InMemoryStore;

    async fn add(store: &InMemoryStore, message_id: i64, tag: &str) {
        let record = NewRecord {
            channel: "whales".into(),
            message_id,
            report_time: Utc::now(),
            fields: RecordFields::Transfer {
                token: "ETH".into(),
                amount: "1".into(),
                from: "0xa".into(),
                to: "0xb".into(),
            },
        };
        store
            .insert_record(&record, &[tag.to_string()])
            .await
            .unwrap();
    }

    fn names(tags: &[Tag]) -> Vec<&str> {
        tags.iter().map(|t| t.name.as_str()).collect()
    }

    #[tokio::test]
    async fn serves_stale_list_until_refresh() {
        let store = Arc::new(InMemoryStore::new());
        add(&store, 1, "eth").await;
        let cache = TagCache::new(store.clone(), Duration::from_secs(900));

        assert_eq!(names(&cache.get().await.unwrap()), vec!["eth"]);

        add(&store, 2, "bridge").await;
        assert_eq!(names(&cache.get().await.unwrap()), vec!["eth"]);

        cache.refresh().await.unwrap();
        assert_eq!(names(&cache.get().await.unwrap()), vec!["bridge", "eth"]);
    }

    #[tokio::test]
    async fn reloads_after_ttl() {
        let store = Arc::new(InMemoryStore::new());
        let cache = TagCache::new(store.clone(), Duration::from_millis(30));
        assert!(cache.get().await.unwrap().is_empty());

        add(&store, 1, "curve").await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(names(&cache.get().await.unwrap()), vec!["curve"]);
    }

    #[tokio::test]
    async fn invalidate_forces_reload() {
        let store = Arc::new(InMemoryStore::new());
        let cache = TagCache::new(store.clone(), Duration::from_secs(900));
        cache.set(vec![]).await;

        add(&store, 1, "sonne").await;
        assert!(cache.get().await.unwrap().is_empty());

        cache.invalidate().await;
        assert_eq!(names(&cache.get().await.unwrap()), vec!["sonne"]);
    }
}
