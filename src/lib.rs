#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, TTL in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Newsgather Core
//!
//! Concurrent aggregation and distribution engine for multi-platform news
//! feeds.
//!
//! ## Overview
//!
//! The engine gathers messages from external feeds and storage-level change
//! events, coalesces multi-part posts, and fans the results out to live
//! subscribers, persisting everything along the way. All coordination is
//! built on tokio tasks and channels; durable storage, the secondary cache,
//! feed sources and media platforms sit behind narrow traits.
//!
//! ## Module Organization
//!
//! - [`cache`] - Namespaced TTL cache manager with expiry finalizers and
//!   deadline-bounded locked sections
//! - [`aggregator`] - Debounce window that coalesces message fragments into
//!   one aggregate per group
//! - [`poller`] - Per-source adaptive pollers with pluggable backoff
//! - [`fanout`] - Change-event fan-in, payload transformation and subscriber
//!   push with catch-up paging and heartbeats
//! - [`health`] - Secondary-cache degraded mode and coalesced recovery
//! - [`storage`] - Collaborator traits, shared data types, Postgres backend
//! - [`config`] - YAML-backed engine configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Tracing subscriber setup

pub mod aggregator;
pub mod cache;
pub mod config;
pub mod error;
pub mod fanout;
pub mod health;
pub mod logging;
pub mod poller;
pub mod storage;

pub use aggregator::{Aggregator, Fragment, PartRef};
pub use cache::{CacheManager, Finalizer};
pub use config::{BackoffStrategy, EngineConfig};
pub use error::{EngineError, Result};
pub use fanout::{NewsFanout, PushMessage, SubscriberConnection, SubscriberRegistry};
pub use health::HealthSupervisor;
pub use poller::{spawn_poller, PollerHandle, PollerRegistry};
pub use storage::{
    Attachment, AttachmentKind, ChangeEvent, FeedClient, FeedItem, MediaClient, NewsMessage,
    SecondaryCache, Source, SourceType, Storage,
};
