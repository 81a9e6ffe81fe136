//! In-memory [`RecordStore`] implementation for tests and embedders.
//!
//! All state sits behind one `std::sync::RwLock`, so every insert is atomic
//! with respect to readers. Fault injection hooks let tests simulate a failure
//! between the record write and the tag-link write.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::models::{normalize_tag_names, NewRecord, Record, RecordKind, Tag, Watermark};

use super::RecordStore;

struct StoredRecord {
    id: i64,
    record: NewRecord,
    tag_ids: Vec<i64>,
}

#[derive(Default)]
struct State {
    records: HashMap<RecordKind, Vec<StoredRecord>>,
    next_record_id: HashMap<RecordKind, i64>,
    tags_by_name: BTreeMap<String, i64>,
    next_tag_id: i64,
    watermarks: BTreeMap<(RecordKind, String), Watermark>,
}

/// In-memory store for tests and embedded use.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
    fail_tag_links: AtomicUsize,
    fail_inserts: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` inserts fail after the record row is written but
    /// before its tag links are, exercising rollback.
    pub fn fail_next_tag_links(&self, n: usize) {
        self.fail_tag_links.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` inserts fail outright.
    pub fn fail_next_inserts(&self, n: usize) {
        self.fail_inserts.store(n, Ordering::SeqCst);
    }

    /// Number of stored records of `kind`.
    pub fn record_count(&self, kind: RecordKind) -> usize {
        let state = self.state.read().unwrap();
        state.records.get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Number of tag links across all records of `kind`.
    pub fn tag_link_count(&self, kind: RecordKind) -> usize {
        let state = self.state.read().unwrap();
        state
            .records
            .get(&kind)
            .map(|rs| rs.iter().map(|r| r.tag_ids.len()).sum())
            .unwrap_or(0)
    }

    /// Message ids stored for one channel, in insertion order.
    pub fn message_ids(&self, kind: RecordKind, channel: &str) -> Vec<i64> {
        let state = self.state.read().unwrap();
        state
            .records
            .get(&kind)
            .map(|rs| {
                rs.iter()
                    .filter(|r| r.record.channel == channel)
                    .map(|r| r.record.message_id)
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn take_fault(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn insert_record(&self, record: &NewRecord, tag_names: &[String]) -> Result<i64> {
        if take_fault(&self.fail_inserts) {
            bail!("injected insert failure");
        }

        let names = normalize_tag_names(tag_names);
        let kind = record.kind();
        let mut state = self.state.write().unwrap();

        // Stage everything against local copies and commit at the end.
        let id = state.next_record_id.get(&kind).copied().unwrap_or(0) + 1;
        let mut next_tag_id = state.next_tag_id;
        let mut new_tags = Vec::new();
        let mut tag_ids = Vec::with_capacity(names.len());
        for name in &names {
            match state.tags_by_name.get(name) {
                Some(tag_id) => tag_ids.push(*tag_id),
                None => {
                    next_tag_id += 1;
                    new_tags.push((name.clone(), next_tag_id));
                    tag_ids.push(next_tag_id);
                }
            }
        }

        if take_fault(&self.fail_tag_links) {
            bail!("injected tag link failure for record {}", id);
        }

        state.next_record_id.insert(kind, id);
        state.next_tag_id = next_tag_id;
        state.tags_by_name.extend(new_tags);
        state.records.entry(kind).or_default().push(StoredRecord {
            id,
            record: record.clone(),
            tag_ids,
        });
        Ok(id)
    }

    async fn list_by_tags_before(
        &self,
        kind: RecordKind,
        tag_names: &[String],
        cursor_id: i64,
        limit: i64,
    ) -> Result<Vec<Record>> {
        let names = normalize_tag_names(tag_names);
        let state = self.state.read().unwrap();
        let wanted: Vec<i64> = names
            .iter()
            .filter_map(|n| state.tags_by_name.get(n).copied())
            .collect();
        if !names.is_empty() && wanted.is_empty() {
            return Ok(Vec::new());
        }

        let names_by_id: HashMap<i64, &String> =
            state.tags_by_name.iter().map(|(n, id)| (*id, n)).collect();

        let mut matched: Vec<&StoredRecord> = state
            .records
            .get(&kind)
            .map(|rs| {
                rs.iter()
                    .filter(|r| cursor_id <= 0 || r.id < cursor_id)
                    .filter(|r| names.is_empty() || r.tag_ids.iter().any(|t| wanted.contains(t)))
                    .collect()
            })
            .unwrap_or_default();
        matched.sort_by(|a, b| b.id.cmp(&a.id));
        matched.truncate(limit.max(0) as usize);

        Ok(matched
            .into_iter()
            .map(|r| {
                let mut tags: Vec<Tag> = r
                    .tag_ids
                    .iter()
                    .filter_map(|id| {
                        names_by_id.get(id).map(|n| Tag {
                            id: *id,
                            name: (*n).clone(),
                        })
                    })
                    .collect();
                tags.sort_by(|a, b| a.name.cmp(&b.name));
                Record {
                    id: r.id,
                    kind,
                    channel: r.record.channel.clone(),
                    message_id: r.record.message_id,
                    report_time: r.record.report_time,
                    fields: r.record.fields.clone(),
                    tags,
                }
            })
            .collect())
    }

    async fn list_all_tags(&self) -> Result<Vec<Tag>> {
        let state = self.state.read().unwrap();
        Ok(state
            .tags_by_name
            .iter()
            .map(|(name, id)| Tag {
                id: *id,
                name: name.clone(),
            })
            .collect())
    }

    async fn get_watermark(&self, kind: RecordKind, channel: &str) -> Result<Option<Watermark>> {
        let state = self.state.read().unwrap();
        Ok(state.watermarks.get(&(kind, channel.to_string())).cloned())
    }

    async fn insert_watermark(
        &self,
        kind: RecordKind,
        channel: &str,
        last_message_id: i64,
    ) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let key = (kind, channel.to_string());
        if state.watermarks.contains_key(&key) {
            bail!("watermark already exists for {}:{}", kind, channel);
        }
        state.watermarks.insert(
            key,
            Watermark {
                kind,
                channel: channel.to_string(),
                last_message_id,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn update_watermark(
        &self,
        kind: RecordKind,
        channel: &str,
        last_message_id: i64,
    ) -> Result<()> {
        let mut state = self.state.write().unwrap();
        match state.watermarks.get_mut(&(kind, channel.to_string())) {
            Some(wm) => {
                wm.last_message_id = wm.last_message_id.max(last_message_id);
                wm.updated_at = Utc::now();
                Ok(())
            }
            None => bail!("no watermark for {}:{}", kind, channel),
        }
    }

    async fn list_watermarks(&self) -> Result<Vec<Watermark>> {
        let state = self.state.read().unwrap();
        Ok(state.watermarks.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordFields;

    fn hack(channel: &str, message_id: i64) -> NewRecord {
        NewRecord {
            channel: channel.to_string(),
            message_id,
            report_time: Utc::now(),
            fields: RecordFields::Hacking {
                protocol: "Onyx Protocol".to_string(),
                network: "ethereum".to_string(),
                amount: "3800000".to_string(),
                tx_hash: format!("0x{:x}", message_id),
            },
        }
    }

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn shared_tag_is_created_once() {
        let store = InMemoryStore::new();
        store.insert_record(&hack("a", 1), &tags(&["Bridge"])).await.unwrap();
        store.insert_record(&hack("a", 2), &tags(&["bridge", "eth"])).await.unwrap();

        let all = store.list_all_tags().await.unwrap();
        let names: Vec<&str> = all.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["bridge", "eth"]);
        assert_eq!(store.tag_link_count(RecordKind::Hacking), 3);
    }

    #[tokio::test]
    async fn failed_tag_link_leaves_nothing_behind() {
        let store = InMemoryStore::new();
        store.fail_next_tag_links(1);
        assert!(store.insert_record(&hack("a", 1), &tags(&["new"])).await.is_err());

        assert_eq!(store.record_count(RecordKind::Hacking), 0);
        assert!(store.list_all_tags().await.unwrap().is_empty());

        let id = store.insert_record(&hack("a", 1), &tags(&["new"])).await.unwrap();
        let page = store.list_by_tags(RecordKind::Hacking, &[], 10).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, id);
    }

    #[tokio::test]
    async fn tag_filter_and_cursor() {
        let store = InMemoryStore::new();
        for i in 1..=6 {
            let t = if i % 2 == 0 { "even" } else { "odd" };
            store.insert_record(&hack("a", i), &tags(&[t])).await.unwrap();
        }
        let even = store
            .list_by_tags(RecordKind::Hacking, &tags(&["EVEN"]), 10)
            .await
            .unwrap();
        assert_eq!(even.iter().map(|r| r.id).collect::<Vec<_>>(), vec![6, 4, 2]);

        let older = store
            .list_by_tags_before(RecordKind::Hacking, &tags(&["even"]), 4, 10)
            .await
            .unwrap();
        assert_eq!(older.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2]);

        let unknown = store
            .list_by_tags(RecordKind::Hacking, &tags(&["nope"]), 10)
            .await
            .unwrap();
        assert!(unknown.is_empty());
    }

    #[tokio::test]
    async fn watermark_never_decreases() {
        let store = InMemoryStore::new();
        assert!(store.get_watermark(RecordKind::Hacking, "a").await.unwrap().is_none());
        store.insert_watermark(RecordKind::Hacking, "a", 0).await.unwrap();
        store.update_watermark(RecordKind::Hacking, "a", 50).await.unwrap();
        store.update_watermark(RecordKind::Hacking, "a", 10).await.unwrap();
        let wm = store.get_watermark(RecordKind::Hacking, "a").await.unwrap().unwrap();
        assert_eq!(wm.last_message_id, 50);
        assert!(store.update_watermark(RecordKind::Transfer, "a", 1).await.is_err());
    }
}
