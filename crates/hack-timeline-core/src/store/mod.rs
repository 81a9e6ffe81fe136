//! Storage abstraction for Hack Timeline.
//!
//! The [`RecordStore`] trait covers everything the scrape pipeline and the
//! query API need from persistence: the atomic record+tags insert, tag-scoped
//! cursor pagination, the tag listing, and the per-channel watermark table.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{NewRecord, Record, RecordKind, Tag, Watermark};

/// Abstract storage backend for records, tags, and watermarks.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_record`](RecordStore::insert_record) | Insert a record and its tags in one transaction |
/// | [`list_by_tags`](RecordStore::list_by_tags) | Newest records matching any of the tags |
/// | [`list_by_tags_before`](RecordStore::list_by_tags_before) | Same, strictly older than a cursor id |
/// | [`list_all_tags`](RecordStore::list_all_tags) | Every tag, ordered by name |
/// | [`get_watermark`](RecordStore::get_watermark) | Watermark for one channel (`None` if never seen) |
/// | [`insert_watermark`](RecordStore::insert_watermark) | Create a channel's watermark row |
/// | [`update_watermark`](RecordStore::update_watermark) | Raise a channel's watermark |
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert `record`, resolve or create each tag, and link them.
    ///
    /// Tag names are normalized first. Either everything becomes visible or
    /// nothing does. Returns the new record id. A concurrent creator of the
    /// same tag name must not cause an error.
    async fn insert_record(&self, record: &NewRecord, tag_names: &[String]) -> Result<i64>;

    /// Up to `limit` records of `kind` whose tag set intersects `tag_names`,
    /// newest id first. An empty `tag_names` disables the tag filter.
    async fn list_by_tags(
        &self,
        kind: RecordKind,
        tag_names: &[String],
        limit: i64,
    ) -> Result<Vec<Record>> {
        self.list_by_tags_before(kind, tag_names, 0, limit).await
    }

    /// Like [`list_by_tags`](RecordStore::list_by_tags) but restricted to
    /// ids strictly below `cursor_id`. `cursor_id <= 0` means no bound.
    async fn list_by_tags_before(
        &self,
        kind: RecordKind,
        tag_names: &[String],
        cursor_id: i64,
        limit: i64,
    ) -> Result<Vec<Record>>;

    /// All tags ordered by name.
    async fn list_all_tags(&self) -> Result<Vec<Tag>>;

    /// The persisted watermark, or `None` when the channel was never seen.
    async fn get_watermark(&self, kind: RecordKind, channel: &str) -> Result<Option<Watermark>>;

    /// Create the watermark row for a channel.
    async fn insert_watermark(
        &self,
        kind: RecordKind,
        channel: &str,
        last_message_id: i64,
    ) -> Result<()>;

    /// Update a channel's watermark. The stored value never decreases.
    async fn update_watermark(
        &self,
        kind: RecordKind,
        channel: &str,
        last_message_id: i64,
    ) -> Result<()>;

    /// Every persisted watermark, ordered by kind then channel.
    async fn list_watermarks(&self) -> Result<Vec<Watermark>>;
}
