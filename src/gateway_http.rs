//! HTTP JSON feed gateway.
//!
//! Polls `GET {url}?min_id={n}&limit={k}` and expects
//!
//! ```json
//! { "posts": [ { "message_id": 101, "report_time": "2024-05-01T12:00:00Z",
//!                "text": "...", "fields": { "network": "ethereum" },
//!                "tag_hints": ["eth"] } ] }
//! ```
//!
//! Requests larger than the channel's `page_size` are split into pages, each
//! continuing from the highest id seen so far. Feeds are not trusted to
//! honour `min_id`: anything at or below the requested minimum is dropped,
//! duplicates collapse, and the result is capped at `limit`.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use hack_timeline_core::models::{Post, RecordKind};

use crate::config::FeedChannelConfig;
use crate::traits::SourceGateway;

#[derive(Debug, Deserialize)]
struct FeedPage {
    #[serde(default)]
    posts: Vec<Post>,
}

pub struct HttpFeedGateway {
    channel: String,
    kind: RecordKind,
    config: FeedChannelConfig,
    client: reqwest::Client,
}

impl HttpFeedGateway {
    pub fn new(channel: String, kind: RecordKind, config: FeedChannelConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            channel,
            kind,
            config,
            client,
        })
    }

    async fn fetch_page(&self, min_id: i64, limit: usize) -> Result<Vec<Post>> {
        let response = self
            .client
            .get(&self.config.url)
            .query(&[("min_id", min_id.to_string()), ("limit", limit.to_string())])
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.config.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("feed {} returned {}: {}", self.config.url, status, body);
        }

        let page: FeedPage = response
            .json()
            .await
            .with_context(|| format!("invalid feed payload from {}", self.config.url))?;
        Ok(page.posts)
    }
}

/// Keep posts strictly above `min_id` that were not seen yet, stamped with
/// the gateway's channel name.
fn accept_posts(
    posts: Vec<Post>,
    min_id: i64,
    channel: &str,
    seen: &mut HashSet<i64>,
) -> Vec<Post> {
    posts
        .into_iter()
        .filter(|p| p.message_id > min_id)
        .filter(|p| seen.insert(p.message_id))
        .map(|mut p| {
            p.channel = channel.to_string();
            p
        })
        .collect()
}

#[async_trait]
impl SourceGateway for HttpFeedGateway {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn kind(&self) -> RecordKind {
        self.kind
    }

    async fn fetch_new_posts(&self, min_message_id: i64, limit: usize) -> Result<Vec<Post>> {
        let mut collected = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = min_message_id;

        while collected.len() < limit {
            let want = (limit - collected.len()).min(self.config.page_size);
            let raw = self.fetch_page(cursor, want).await?;
            let raw_len = raw.len();

            let page = accept_posts(raw, min_message_id, &self.channel, &mut seen);
            let Some(highest) = page.iter().map(|p| p.message_id).max() else {
                break;
            };
            debug!(
                channel = %self.channel,
                cursor,
                received = page.len(),
                "fetched feed page"
            );
            collected.extend(page);

            if raw_len < want || highest <= cursor {
                break;
            }
            cursor = highest;
        }

        collected.sort_by_key(|p| p.message_id);
        collected.truncate(limit);
        Ok(collected)
    }
}
