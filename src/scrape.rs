//! Scrape orchestrator: fetch → extract → store for one record kind.
//!
//! A cycle runs in two fan-out stages:
//!
//! ```text
//! channels ──join_all──► fetch gate ──► per channel: retry queue ∪ fresh posts
//!                        (any error                     │
//!                         aborts all)     join_all, max_in_flight permits
//!                                                       ▼
//!                                      extract → insert_record (one tx)
//!                                                       │
//!                                  commit: watermark = max(wm, best success),
//!                                          retry queue = failures
//! ```
//!
//! Each channel's new watermark and retry queue are computed from the
//! resolved posts and committed in one step. If the cycle future is dropped
//! (for instance at a timeout) before a channel commits, that channel's
//! in-memory state is exactly what it was before the cycle.
//!
//! The in-memory watermarks are loaded by [`ScrapeOrchestrator::prime_watermarks`]
//! and written back by [`ScrapeOrchestrator::persist_watermarks`]; the
//! scheduler calls both around cycles.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use futures::future::join_all;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

use hack_timeline_core::models::{NewRecord, Post, RecordKind};
use hack_timeline_core::store::RecordStore;

use crate::config::{Config, ScrapeConfig};
use crate::error::ScrapeError;
use crate::extract::build_extractor;
use crate::traits::{Extractor, GatewayRegistry, SourceGateway};

/// Tunables for one orchestrator.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorOptions {
    /// Concurrent extract+store tasks per channel.
    pub max_in_flight: usize,
    /// Drop a post after this many failed attempts; `0` never drops.
    pub max_attempts: u32,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            max_in_flight: 16,
            max_attempts: 0,
        }
    }
}

impl From<&ScrapeConfig> for OrchestratorOptions {
    fn from(config: &ScrapeConfig) -> Self {
        Self {
            max_in_flight: config.max_in_flight,
            max_attempts: config.max_attempts,
        }
    }
}

/// Outcome of one cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub stored: usize,
    pub errors: Vec<ScrapeError>,
}

impl CycleReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Errors and nothing stored.
    pub fn made_no_progress(&self) -> bool {
        self.stored == 0 && !self.errors.is_empty()
    }
}

#[derive(Debug, Clone)]
struct RetryEntry {
    post: Post,
    attempts: u32,
}

#[derive(Debug, Default)]
struct ChannelState {
    watermark: i64,
    retry_queue: Vec<RetryEntry>,
    /// Ids given up on after `max_attempts`. Only ids above the watermark
    /// are kept; anything lower is never fetched again.
    dead_letters: BTreeSet<i64>,
}

struct ChannelSlot {
    gateway: Arc<dyn SourceGateway>,
    state: Mutex<ChannelState>,
}

impl ChannelSlot {
    fn name(&self) -> &str {
        self.gateway.channel()
    }
}

pub struct ScrapeOrchestrator {
    kind: RecordKind,
    channels: Vec<ChannelSlot>,
    extractor: Arc<dyn Extractor>,
    store: Arc<dyn RecordStore>,
    options: OrchestratorOptions,
    cycle_lock: Mutex<()>,
    primed: AtomicBool,
}

impl ScrapeOrchestrator {
    pub fn new(
        kind: RecordKind,
        gateways: Vec<Arc<dyn SourceGateway>>,
        extractor: Arc<dyn Extractor>,
        store: Arc<dyn RecordStore>,
        options: OrchestratorOptions,
    ) -> Result<Self> {
        let mut channels: Vec<ChannelSlot> = Vec::with_capacity(gateways.len());
        for gateway in gateways {
            if gateway.kind() != kind {
                bail!(
                    "channel '{}' produces {} posts, not {}",
                    gateway.channel(),
                    gateway.kind(),
                    kind
                );
            }
            if channels.iter().any(|c| c.name() == gateway.channel()) {
                bail!("duplicate {} channel '{}'", kind, gateway.channel());
            }
            channels.push(ChannelSlot {
                gateway,
                state: Mutex::new(ChannelState::default()),
            });
        }

        Ok(Self {
            kind,
            channels,
            extractor,
            store,
            options: OrchestratorOptions {
                max_in_flight: options.max_in_flight.max(1),
                ..options
            },
            cycle_lock: Mutex::new(()),
            primed: AtomicBool::new(false),
        })
    }

    /// Orchestrator for `kind` over the registry's gateways and the
    /// configured extractor.
    pub fn from_config(
        kind: RecordKind,
        config: &Config,
        registry: &GatewayRegistry,
        store: Arc<dyn RecordStore>,
    ) -> Result<Self> {
        Self::new(
            kind,
            registry.for_kind(kind),
            build_extractor(kind, config)?,
            store,
            OrchestratorOptions::from(&config.scrape),
        )
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    /// Load persisted watermarks; channels never seen get a zero row.
    pub async fn prime_watermarks(&self) -> Result<()> {
        for slot in &self.channels {
            let persisted = self.store.get_watermark(self.kind, slot.name()).await?;
            let value = match persisted {
                Some(wm) => wm.last_message_id,
                None => {
                    self.store.insert_watermark(self.kind, slot.name(), 0).await?;
                    0
                }
            };
            slot.state.lock().await.watermark = value;
            debug!(kind = %self.kind, channel = slot.name(), watermark = value, "primed watermark");
        }
        self.primed.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_primed(&self) -> bool {
        self.primed.load(Ordering::SeqCst)
    }

    /// Write every in-memory watermark back to the store.
    pub async fn persist_watermarks(&self) -> Result<()> {
        for slot in &self.channels {
            let value = slot.state.lock().await.watermark;
            match self.store.get_watermark(self.kind, slot.name()).await? {
                Some(_) => {
                    self.store
                        .update_watermark(self.kind, slot.name(), value)
                        .await?
                }
                None => {
                    self.store
                        .insert_watermark(self.kind, slot.name(), value)
                        .await?
                }
            }
        }
        Ok(())
    }

    /// In-memory watermark per channel, in configuration order.
    pub async fn watermarks(&self) -> Vec<(String, i64)> {
        let mut out = Vec::with_capacity(self.channels.len());
        for slot in &self.channels {
            out.push((slot.name().to_string(), slot.state.lock().await.watermark));
        }
        out
    }

    pub async fn retry_queue_len(&self, channel: &str) -> Option<usize> {
        let slot = self.channels.iter().find(|c| c.name() == channel)?;
        let len = slot.state.lock().await.retry_queue.len();
        Some(len)
    }

    /// Message ids waiting in a channel's retry queue, ascending.
    pub async fn retry_queue_ids(&self, channel: &str) -> Option<Vec<i64>> {
        let slot = self.channels.iter().find(|c| c.name() == channel)?;
        let state = slot.state.lock().await;
        Some(state.retry_queue.iter().map(|e| e.post.message_id).collect())
    }

    /// Message ids given up on and not yet passed by the watermark, ascending.
    pub async fn dead_letter_ids(&self, channel: &str) -> Option<Vec<i64>> {
        let slot = self.channels.iter().find(|c| c.name() == channel)?;
        let state = slot.state.lock().await;
        Some(state.dead_letters.iter().copied().collect())
    }

    /// [`run_cycle`](Self::run_cycle) bounded by a deadline. On expiry the
    /// report carries a single [`ScrapeError::Timeout`] and counts only the
    /// records of channels that committed before the deadline.
    pub async fn run_cycle_with_timeout(&self, fetch_limit: usize, after: Duration) -> CycleReport {
        let committed = AtomicUsize::new(0);
        match tokio::time::timeout(after, self.cycle(fetch_limit, &committed)).await {
            Ok(report) => report,
            Err(_) => {
                let stored = committed.load(Ordering::SeqCst);
                error!(kind = %self.kind, ?after, stored, "scrape cycle timed out");
                CycleReport {
                    stored,
                    errors: vec![ScrapeError::Timeout {
                        kind: self.kind,
                        after,
                    }],
                }
            }
        }
    }

    /// Run one fetch → extract → store cycle over every channel.
    pub async fn run_cycle(&self, fetch_limit: usize) -> CycleReport {
        self.cycle(fetch_limit, &AtomicUsize::new(0)).await
    }

    /// `committed` grows by each channel's stored count as that channel
    /// commits, so it stays meaningful if the cycle is dropped part way.
    async fn cycle(&self, fetch_limit: usize, committed: &AtomicUsize) -> CycleReport {
        let _cycle = self.cycle_lock.lock().await;
        let started = Instant::now();

        let fetches = join_all(
            self.channels
                .iter()
                .map(|slot| self.fetch_channel(slot, fetch_limit)),
        )
        .await;

        let mut batches = Vec::with_capacity(self.channels.len());
        let mut errors = Vec::new();
        for (slot, fetched) in self.channels.iter().zip(fetches) {
            match fetched {
                Ok(posts) => batches.push((slot, posts)),
                Err(err) => {
                    error!(kind = %self.kind, channel = slot.name(), "{}", err);
                    errors.push(err);
                }
            }
        }
        if !errors.is_empty() {
            error!(
                kind = %self.kind,
                failed = errors.len(),
                "fetch stage failed, nothing processed this cycle"
            );
            return CycleReport { stored: 0, errors };
        }

        let outcomes = join_all(
            batches
                .into_iter()
                .map(|(slot, posts)| self.run_channel(slot, posts, committed)),
        )
        .await;

        let mut report = CycleReport::default();
        for (stored, channel_errors) in outcomes {
            report.stored += stored;
            report.errors.extend(channel_errors);
        }

        info!(
            kind = %self.kind,
            stored = report.stored,
            errors = report.errors.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "scrape cycle finished"
        );
        report
    }

    /// Process one channel's retry queue plus fresh posts and commit the result.
    async fn run_channel(
        &self,
        slot: &ChannelSlot,
        fresh: Vec<Post>,
        committed: &AtomicUsize,
    ) -> (usize, Vec<ScrapeError>) {
        let pending = {
            let state = slot.state.lock().await;
            merge_pending(&state.retry_queue, fresh, &state.dead_letters)
        };
        if pending.is_empty() {
            return (0, Vec::new());
        }

        let permits = Semaphore::new(self.options.max_in_flight);
        let outcomes = join_all(
            pending
                .into_iter()
                .map(|entry| self.process_entry(slot, entry, &permits)),
        )
        .await;

        let mut stored = 0;
        let mut highest: Option<i64> = None;
        let mut errors = Vec::new();
        let mut still_failing = Vec::new();
        let mut given_up = Vec::new();

        for (mut entry, outcome) in outcomes {
            let message_id = entry.post.message_id;
            match outcome {
                Ok(record_id) => {
                    stored += 1;
                    highest = Some(highest.map_or(message_id, |h| h.max(message_id)));
                    debug!(channel = slot.name(), message_id, record_id, "stored record");
                }
                Err(err) => {
                    entry.attempts += 1;
                    warn!(
                        channel = slot.name(),
                        message_id,
                        attempts = entry.attempts,
                        "{}",
                        err
                    );
                    if self.options.max_attempts > 0 && entry.attempts >= self.options.max_attempts
                    {
                        warn!(
                            channel = slot.name(),
                            message_id,
                            attempts = entry.attempts,
                            "giving up on post, dropped from retry queue"
                        );
                        given_up.push(message_id);
                    } else {
                        still_failing.push(entry);
                    }
                    errors.push(err);
                }
            }
        }
        still_failing.sort_by_key(|e| e.post.message_id);

        let mut state = slot.state.lock().await;
        if let Some(h) = highest {
            state.watermark = state.watermark.max(h);
        }
        state.retry_queue = still_failing;
        state.dead_letters.extend(given_up);
        let watermark = state.watermark;
        state.dead_letters.retain(|id| *id > watermark);
        committed.fetch_add(stored, Ordering::SeqCst);

        (stored, errors)
    }

    async fn fetch_channel(
        &self,
        slot: &ChannelSlot,
        fetch_limit: usize,
    ) -> Result<Vec<Post>, ScrapeError> {
        let min_id = slot.state.lock().await.watermark;
        slot.gateway
            .fetch_new_posts(min_id, fetch_limit)
            .await
            .map_err(|source| ScrapeError::Fetch {
                channel: slot.name().to_string(),
                source,
            })
    }

    async fn process_entry(
        &self,
        slot: &ChannelSlot,
        entry: RetryEntry,
        permits: &Semaphore,
    ) -> (RetryEntry, Result<i64, ScrapeError>) {
        // `permits` is never closed.
        let _permit = permits.acquire().await.ok();
        let outcome = self.process_post(slot.name(), &entry.post).await;
        (entry, outcome)
    }

    async fn process_post(&self, channel: &str, post: &Post) -> Result<i64, ScrapeError> {
        let extraction_error = |source| ScrapeError::Extraction {
            channel: channel.to_string(),
            message_id: post.message_id,
            source,
        };

        let extraction = self
            .extractor
            .extract(post)
            .await
            .map_err(extraction_error)?;

        let record = NewRecord {
            channel: channel.to_string(),
            message_id: post.message_id,
            report_time: post.report_time,
            fields: extraction.fields,
        };
        if record.kind() != self.kind {
            return Err(extraction_error(anyhow::anyhow!(
                "extractor produced {} fields for a {} channel",
                record.kind(),
                self.kind
            )));
        }

        self.store
            .insert_record(&record, &extraction.tag_names)
            .await
            .map_err(|source| ScrapeError::Store {
                channel: channel.to_string(),
                message_id: post.message_id,
                source,
            })
    }
}

/// Queued posts first, then fresh ones. A fresh copy of a queued message
/// replaces the queued post but keeps its attempt count. Dead-lettered ids
/// are skipped.
fn merge_pending(
    queue: &[RetryEntry],
    fresh: Vec<Post>,
    dead_letters: &BTreeSet<i64>,
) -> Vec<RetryEntry> {
    let mut by_id: BTreeMap<i64, RetryEntry> = queue
        .iter()
        .map(|e| (e.post.message_id, e.clone()))
        .collect();
    for post in fresh {
        if dead_letters.contains(&post.message_id) {
            continue;
        }
        by_id
            .entry(post.message_id)
            .and_modify(|e| e.post = post.clone())
            .or_insert(RetryEntry { post, attempts: 0 });
    }
    by_id.into_values().collect()
}
