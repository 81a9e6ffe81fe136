//! # Hack Timeline Core
//!
//! Shared logic for Hack Timeline: record and tag models, tag-name
//! normalization, the [`store::RecordStore`] abstraction, and an in-memory
//! store implementation.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem dependencies.
//! Everything that talks to the outside world lives in the `hack-timeline`
//! crate.

pub mod models;
pub mod store;
