//! In-process gateways and extractors shared by the integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use hack_timeline::models::{Extraction, Post, RecordFields, RecordKind};
use hack_timeline::traits::{Extractor, SourceGateway};

pub fn post(channel: &str, message_id: i64, tags: &[&str]) -> Post {
    Post {
        channel: channel.to_string(),
        message_id,
        report_time: Utc.timestamp_opt(1_700_000_000 + message_id, 0).unwrap(),
        text: format!("alert {} from {}", message_id, channel),
        fields: BTreeMap::new(),
        tag_hints: tags.iter().map(|t| t.to_string()).collect(),
    }
}

/// A channel backed by a map of posts; honours `min_id` and `limit`.
pub struct ScriptedGateway {
    channel: String,
    kind: RecordKind,
    posts: Mutex<BTreeMap<i64, Post>>,
    fail: AtomicBool,
    pub fetches: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new(channel: &str, kind: RecordKind) -> Arc<Self> {
        Arc::new(Self {
            channel: channel.to_string(),
            kind,
            posts: Mutex::new(BTreeMap::new()),
            fail: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn publish(&self, ids: &[i64]) {
        let mut posts = self.posts.lock().unwrap();
        for id in ids {
            posts.insert(*id, post(&self.channel, *id, &["eth"]));
        }
    }

    pub fn publish_post(&self, post: Post) {
        self.posts.lock().unwrap().insert(post.message_id, post);
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SourceGateway for ScriptedGateway {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn kind(&self) -> RecordKind {
        self.kind
    }

    async fn fetch_new_posts(&self, min_message_id: i64, limit: usize) -> Result<Vec<Post>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            bail!("channel {} unreachable", self.channel);
        }
        let posts = self.posts.lock().unwrap();
        Ok(posts
            .range(min_message_id + 1..)
            .take(limit)
            .map(|(_, p)| p.clone())
            .collect())
    }
}

/// Extractor that fails for chosen message ids and tracks concurrency.
pub struct ScriptedExtractor {
    kind: RecordKind,
    failing: Mutex<HashSet<i64>>,
    stalled: Mutex<HashSet<i64>>,
    delay: Option<Duration>,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
}

impl ScriptedExtractor {
    pub fn new(kind: RecordKind) -> Arc<Self> {
        Self::with_delay(kind, None)
    }

    pub fn with_delay(kind: RecordKind, delay: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            failing: Mutex::new(HashSet::new()),
            stalled: Mutex::new(HashSet::new()),
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn fail_on(&self, message_id: i64) {
        self.failing.lock().unwrap().insert(message_id);
    }

    /// Extraction of `message_id` hangs for a minute.
    pub fn stall_on(&self, message_id: i64) {
        self.stalled.lock().unwrap().insert(message_id);
    }

    pub fn heal(&self, message_id: i64) {
        self.failing.lock().unwrap().remove(&message_id);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn extract(&self, post: &Post) -> Result<Extraction> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let stalled = self.stalled.lock().unwrap().contains(&post.message_id);
        if stalled {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.lock().unwrap().contains(&post.message_id) {
            bail!("could not understand post {}", post.message_id);
        }

        let fields = match self.kind {
            RecordKind::Hacking => RecordFields::Hacking {
                protocol: format!("Protocol {}", post.message_id),
                network: "ethereum".into(),
                amount: "1000000".into(),
                tx_hash: format!("0x{:x}", post.message_id),
            },
            RecordKind::Transfer => RecordFields::Transfer {
                token: "USDT".into(),
                amount: "5000000".into(),
                from: "0xfrom".into(),
                to: "0xto".into(),
            },
        };
        Ok(Extraction {
            fields,
            tag_names: post.tag_hints.clone(),
        })
    }
}
