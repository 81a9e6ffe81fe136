//! # Hack Timeline
//!
//! Continuously scrapes DeFi exploit and large-transfer alerts from many
//! channels, turns each post into a structured, tagged record, and serves
//! the result as a paginated timeline.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────────┐   ┌──────────────┐
//! │   Channels   │──▶│ ScrapeOrchestrator │──▶│    SQLite    │
//! │ (HTTP feeds) │   │  extract + retry   │   │ records/tags │
//! └──────────────┘   └─────────▲──────────┘   └──────┬───────┘
//!                              │                      │
//!                        ┌─────┴──────┐         ┌─────┴──────┐
//!                        │ Scheduler  │────────▶│  TagCache  │
//!                        └────────────┘         └─────┬──────┘
//!                                                     ▼
//!                                              ┌────────────┐
//!                                              │ HTTP API / │
//!                                              │    CLI     │
//!                                              └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! htl init                          # create database
//! htl scrape hacking --limit 200    # one cycle by hand
//! htl timeline hacking --tags eth   # newest records tagged "eth"
//! htl serve                         # scheduler + HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite [`RecordStore`](hack_timeline_core::store::RecordStore) |
//! | [`traits`] | `SourceGateway`, `Extractor`, gateway registry |
//! | [`gateway_http`] | JSON feed channel |
//! | [`extract`] | Field and chat-completion extractors |
//! | [`scrape`] | Scrape orchestrator and retry queue |
//! | [`scheduler`] | Priming and periodic cycles |
//! | [`tag_cache`] | Read-through tag cache |
//! | [`server`] | HTTP query API |
//! | [`timeline`] | Read-only CLI commands |

pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod gateway_http;
pub mod migrate;
pub mod scheduler;
pub mod scrape;
pub mod server;
pub mod sqlite_store;
pub mod tag_cache;
pub mod timeline;
pub mod traits;

pub use hack_timeline_core::models;
pub use hack_timeline_core::store;
