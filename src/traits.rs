//! Capability traits at the edges of the scrape pipeline.
//!
//! The orchestrator only talks to these traits, so tests can plug in
//! in-process gateways and extractors and embedders can add their own.
//!
//! ```text
//! ┌────────────────────────────┐
//! │      GatewayRegistry       │
//! │  ┌──────────┐ ┌─────────┐  │
//! │  │ HTTP feed│ │ Custom  │  │
//! │  │ channels │ │ (Rust)  │  │
//! │  └──────────┘ └─────────┘  │
//! └─────────────┬──────────────┘
//!               ▼
//!     ScrapeOrchestrator ──► Extractor ──► RecordStore
//! ```
//!
//! # Usage
//!
//! ```rust
//! use hack_timeline::traits::GatewayRegistry;
//!
//! let mut gateways = GatewayRegistry::new();
//! // gateways.register(Arc::new(MyGateway::new()));
//! assert!(gateways.is_empty());
//! ```

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use hack_timeline_core::models::{Extraction, Post, RecordKind};

use crate::config::Config;

/// One source channel of raw posts.
///
/// A gateway is bound to a single channel and a single record kind. The
/// orchestrator asks it for posts newer than the channel's watermark.
#[async_trait]
pub trait SourceGateway: Send + Sync {
    /// Channel name; keys the watermark row.
    fn channel(&self) -> &str;

    fn kind(&self) -> RecordKind;

    /// Up to `limit` posts with `message_id > min_message_id`.
    ///
    /// Order is not significant. An empty result is not an error.
    async fn fetch_new_posts(&self, min_message_id: i64, limit: usize) -> Result<Vec<Post>>;
}

/// Turns a raw post into record fields plus tag names.
///
/// Must be safe to call concurrently and idempotent per post: a post that
/// failed once is extracted again on the next cycle.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, post: &Post) -> Result<Extraction>;
}

/// Registry of source gateways (configured and custom).
///
/// Use [`GatewayRegistry::from_config`] to build every configured HTTP feed
/// channel, then optionally [`register`](GatewayRegistry::register) more.
pub struct GatewayRegistry {
    gateways: Vec<Arc<dyn SourceGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self {
            gateways: Vec::new(),
        }
    }

    /// Create a registry with one [`HttpFeedGateway`](crate::gateway_http::HttpFeedGateway)
    /// per `[channels.<kind>.<name>]` table.
    pub fn from_config(config: &Config) -> Result<Self> {
        use crate::gateway_http::HttpFeedGateway;

        let mut registry = Self::new();
        for kind in RecordKind::ALL {
            for (name, cfg) in config.channels.for_kind(kind) {
                registry.register(Arc::new(HttpFeedGateway::new(
                    name.clone(),
                    kind,
                    cfg.clone(),
                )?));
            }
        }
        Ok(registry)
    }

    pub fn register(&mut self, gateway: Arc<dyn SourceGateway>) {
        self.gateways.push(gateway);
    }

    pub fn gateways(&self) -> &[Arc<dyn SourceGateway>] {
        &self.gateways
    }

    /// Gateways producing records of `kind`, in registration order.
    pub fn for_kind(&self, kind: RecordKind) -> Vec<Arc<dyn SourceGateway>> {
        self.gateways
            .iter()
            .filter(|g| g.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }

    pub fn len(&self) -> usize {
        self.gateways.len()
    }
}

impl Default for GatewayRegistry {
    fn default() -> Self {
        Self::new()
    }
}
