//! Periodic scrape scheduling.
//!
//! ```text
//! Priming:  prime watermarks → cycle(initial_fetch_limit) → persist → refresh tag cache
//!    │ (always, even if the cycle reported errors)
//!    ▼
//! Steady:   every interval_secs: cycle(fetch_limit) → persist → refresh tag cache
//!           until the shutdown token is cancelled
//! ```
//!
//! Every cycle is bounded by `cycle_timeout_secs`, and cancelling the
//! shutdown token abandons a pass in progress. Errors are logged and
//! never stop the loop. A kind whose watermarks could not be primed sits out
//! cycles until priming succeeds on a later tick, so it never scrapes from a
//! zero watermark by accident.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use hack_timeline_core::models::RecordKind;
use hack_timeline_core::store::RecordStore;

use crate::config::{Config, ScrapeConfig};
use crate::scrape::{CycleReport, ScrapeOrchestrator};
use crate::sqlite_store::SqliteStore;
use crate::tag_cache::TagCache;
use crate::traits::GatewayRegistry;

#[derive(Debug, Clone, Copy)]
pub struct ScheduleSettings {
    pub interval: Duration,
    pub initial_fetch_limit: usize,
    pub fetch_limit: usize,
    pub cycle_timeout: Duration,
}

impl From<&ScrapeConfig> for ScheduleSettings {
    fn from(config: &ScrapeConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs),
            initial_fetch_limit: config.initial_fetch_limit,
            fetch_limit: config.fetch_limit,
            cycle_timeout: Duration::from_secs(config.cycle_timeout_secs),
        }
    }
}

pub struct Scheduler {
    orchestrators: Vec<Arc<ScrapeOrchestrator>>,
    tag_cache: Arc<TagCache>,
    settings: ScheduleSettings,
}

impl Scheduler {
    pub fn new(
        orchestrators: Vec<Arc<ScrapeOrchestrator>>,
        tag_cache: Arc<TagCache>,
        settings: ScheduleSettings,
    ) -> Self {
        Self {
            orchestrators,
            tag_cache,
            settings,
        }
    }

    /// One orchestrator per record kind over the configured channels.
    pub fn from_config(
        config: &Config,
        registry: &GatewayRegistry,
        store: Arc<dyn RecordStore>,
        tag_cache: Arc<TagCache>,
    ) -> Result<Self> {
        let orchestrators = RecordKind::ALL
            .into_iter()
            .map(|kind| {
                ScrapeOrchestrator::from_config(kind, config, registry, store.clone())
                    .map(Arc::new)
                    .with_context(|| format!("failed to set up {} orchestrator", kind))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(
            orchestrators,
            tag_cache,
            ScheduleSettings::from(&config.scrape),
        ))
    }

    pub fn orchestrator(&self, kind: RecordKind) -> Option<&Arc<ScrapeOrchestrator>> {
        self.orchestrators.iter().find(|o| o.kind() == kind)
    }

    pub fn tag_cache(&self) -> &Arc<TagCache> {
        &self.tag_cache
    }

    pub fn settings(&self) -> ScheduleSettings {
        self.settings
    }

    /// Prime every orchestrator that is not primed yet.
    pub async fn prime(&self) {
        for orchestrator in self.orchestrators.iter().filter(|o| !o.is_primed()) {
            if let Err(e) = orchestrator.prime_watermarks().await {
                error!(kind = %orchestrator.kind(), "failed to prime watermarks: {:#}", e);
            }
        }
    }

    /// Run one cycle for every primed kind, persist watermarks, refresh the
    /// tag cache.
    pub async fn tick(&self, fetch_limit: usize) -> Vec<(RecordKind, CycleReport)> {
        let active: Vec<&Arc<ScrapeOrchestrator>> =
            self.orchestrators.iter().filter(|o| o.is_primed()).collect();

        let reports = join_all(active.iter().map(|o| {
            o.run_cycle_with_timeout(fetch_limit, self.settings.cycle_timeout)
        }))
        .await;

        let mut out = Vec::with_capacity(reports.len());
        for (orchestrator, report) in active.into_iter().zip(reports) {
            if !report.is_clean() {
                warn!(
                    kind = %orchestrator.kind(),
                    stored = report.stored,
                    errors = report.errors.len(),
                    "scrape cycle finished with errors"
                );
            }
            if let Err(e) = orchestrator.persist_watermarks().await {
                error!(kind = %orchestrator.kind(), "failed to persist watermarks: {:#}", e);
            }
            out.push((orchestrator.kind(), report));
        }

        if let Err(e) = self.tag_cache.refresh().await {
            error!("failed to refresh tag cache: {:#}", e);
        }
        out
    }

    /// Ad-hoc cycle for one kind, bypassing the timer. Watermarks are
    /// persisted and the tag cache refreshed afterwards.
    pub async fn trigger(&self, kind: RecordKind, fetch_limit: usize) -> Result<CycleReport> {
        let orchestrator = self
            .orchestrator(kind)
            .with_context(|| format!("no orchestrator for {}", kind))?;
        if !orchestrator.is_primed() {
            orchestrator.prime_watermarks().await?;
        }

        let report = orchestrator
            .run_cycle_with_timeout(fetch_limit, self.settings.cycle_timeout)
            .await;
        orchestrator.persist_watermarks().await?;
        if let Err(e) = self.tag_cache.refresh().await {
            error!("failed to refresh tag cache: {:#}", e);
        }
        Ok(report)
    }

    /// Priming phase, then one tick per interval until `shutdown` fires.
    ///
    /// A pass in progress when `shutdown` fires is dropped: channels that had
    /// not committed keep their state, as with a timeout. Watermarks are
    /// persisted once more before returning.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            "scheduler priming"
        );

        if self
            .pass(self.settings.initial_fetch_limit, &shutdown)
            .await
        {
            let mut interval = tokio::time::interval(self.settings.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // first tick fires immediately

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if !self.pass(self.settings.fetch_limit, &shutdown).await {
                            break;
                        }
                    }
                }
            }
        }

        self.persist_all().await;
        info!("scheduler stopped");
    }

    /// Prime and tick, unless `shutdown` fires first. Returns `false` when
    /// the pass was cut short.
    async fn pass(&self, fetch_limit: usize, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown during scrape pass, abandoning it");
                false
            }
            _ = async {
                self.prime().await;
                self.tick(fetch_limit).await
            } => true,
        }
    }

    async fn persist_all(&self) {
        for orchestrator in self.orchestrators.iter().filter(|o| o.is_primed()) {
            if let Err(e) = orchestrator.persist_watermarks().await {
                error!(kind = %orchestrator.kind(), "failed to persist watermarks: {:#}", e);
            }
        }
    }
}

/// `htl scrape <kind>`: prime, run one cycle, persist, and print the report.
pub async fn run_scrape(config: &Config, kind: RecordKind, limit: Option<usize>) -> Result<()> {
    let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open(config).await?);
    let registry = GatewayRegistry::from_config(config)?;
    let orchestrator = ScrapeOrchestrator::from_config(kind, config, &registry, store.clone())?;
    if orchestrator.channel_names().is_empty() {
        anyhow::bail!("no {} channels configured", kind);
    }

    let tag_cache = Arc::new(TagCache::new(
        store,
        Duration::from_secs(config.cache.tag_ttl_secs),
    ));
    let scheduler = Scheduler::new(
        vec![Arc::new(orchestrator)],
        tag_cache,
        ScheduleSettings::from(&config.scrape),
    );

    let limit = limit.unwrap_or(config.scrape.fetch_limit);
    let report = scheduler.trigger(kind, limit).await?;

    println!("stored {} {} records", report.stored, kind);
    for err in &report.errors {
        println!("  error: {}", err);
    }
    if let Some(orchestrator) = scheduler.orchestrator(kind) {
        for (channel, watermark) in orchestrator.watermarks().await {
            let queued = orchestrator.retry_queue_len(&channel).await.unwrap_or(0);
            println!("  {:<24} watermark {:<12} retry queue {}", channel, watermark, queued);
        }
    }

    if report.made_no_progress() {
        anyhow::bail!("scrape failed with {} errors", report.errors.len());
    }
    Ok(())
}
