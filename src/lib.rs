//! # Screenshot Archive
//!
//! Website screenshots on demand, with full version history.
//!
//! A client submits a batch of URLs. The [`Dispatcher`] publishes one capture
//! job per URL on a message bus and waits for exactly one reply (or a
//! timeout) per URL. Capture workers in one or more processes compete for the
//! jobs as a consumer group: each job is rendered by headless Chrome, the
//! bytes go to a blob store and a new metadata record is saved. Every save
//! takes the next version of its URL from an atomic per-URL counter, so
//! concurrent captures of one URL never share a version.
//!
//! ## Architecture
//!
//! ```text
//! HTTP API ──► Dispatcher ──publish──► bus (shot_request) ──group "capture"──► WorkerPool
//!                  ▲                                                            │
//!                  └──────────────── reply (one-off address) ◄──────────────────┤
//!                                                                               ▼
//!                                       Renderer ─► BlobStore ─► MetadataStore (version++)
//! ```
//!
//! ## Backends
//!
//! | Concern | In-process | Shared |
//! |---------|------------|--------|
//! | Message bus | [`MemoryBus`] | [`RedisBus`] (pub/sub replies, stream consumer groups) |
//! | Metadata | [`MemoryMetadataStore`] | [`RedisMetadataStore`] (`INCR` counters) |
//! | Blobs | [`MemoryBlobStore`] | [`FsBlobStore`] |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use screenshot_archive::{Dispatcher, MemoryBus};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = Arc::new(MemoryBus::new(64));
//!     let dispatcher = Dispatcher::new(bus, Duration::from_secs(30));
//!
//!     let outcomes = dispatcher
//!         .submit(vec!["https://example.com".to_string()], &CancellationToken::new())
//!         .await;
//!     for outcome in outcomes {
//!         println!("{}: {}", outcome.url, outcome.success);
//!     }
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! # API and capture workers in one process
//! screenshot-archive serve --mode standalone
//!
//! # Separate processes sharing Redis
//! screenshot-archive --queue-url redis://localhost --database-url redis://localhost serve --mode api
//! screenshot-archive --queue-url redis://localhost --database-url redis://localhost serve --mode capture
//!
//! # Client commands
//! screenshot-archive request --urls "https://example.com;https://example.org"
//! screenshot-archive versions --url https://example.com
//! screenshot-archive fetch --url https://example.com --version 2 --output example.png
//! ```

/// Configuration and settings
pub mod config;

/// Error types for the bus, stores and capture pipeline
pub mod error;

/// Message bus abstraction: publish with reply, subscribe, group subscribe, reply
pub mod bus;

/// In-process message bus
pub mod memory_bus;

/// Redis message bus
pub mod redis_bus;

/// Job and reply wire payloads
pub mod protocol;

/// Versioned screenshot metadata and stores
pub mod metadata;

/// Redis metadata store
pub mod redis_store;

/// Screenshot byte storage
pub mod blob_store;

/// Browser pool management for concurrent Chrome instances
pub mod browser_pool;

/// Page rendering
pub mod renderer;

/// Capture-and-persist pipeline
pub mod capture;

/// Request side: fan-out of jobs and fan-in of replies
pub mod dispatcher;

/// Capture workers competing for jobs
pub mod worker;

/// Read side: screenshots and version history
pub mod query;

/// HTTP API
pub mod api;

/// HTTP client for the API
pub mod client;

/// Command-line interface implementation
pub mod cli;

/// Service metrics
pub mod metrics;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod tests;

pub use api::{router, ApiError, AppState};
pub use blob_store::*;
pub use browser_pool::*;
pub use bus::*;
pub use capture::*;
pub use cli::{setup_logging, Cli, CliRunner, Commands, ServeMode};
pub use client::*;
pub use config::*;
pub use dispatcher::*;
pub use error::*;
pub use memory_bus::*;
pub use metadata::*;
pub use protocol::*;
pub use query::*;
pub use redis_bus::*;
pub use redis_store::*;
pub use renderer::*;
pub use utils::*;
pub use worker::*;
