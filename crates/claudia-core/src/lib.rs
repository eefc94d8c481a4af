//! # Claudia Core
//!
//! Personal memory engine for an AI assistant: a content-addressed,
//! bi-temporally-versioned knowledge graph over SQLite with hybrid recall.
//!
//! - **Store**: WAL-journaled SQLite behind reader/writer connections,
//!   ordered migrations, content hashing, online backup, daemon lock
//! - **Write path**: hash-deduplicated memories, canonical entities with
//!   aliases, bi-temporal relationships (supersession closes the old
//!   validity interval), buffered conversation turns and episode narratives
//! - **Recall**: vector + FTS5 + graph-proximity + keyword candidates fused
//!   by Reciprocal Rank Fusion, with importance/recency weighting
//! - **Verifier**: deferred promotion of pending memories with cheap
//!   deterministic checks before optional language-model checks
//! - **Consolidator**: adaptive decay, similarity merging, pattern
//!   detection, prediction scoring, retention cleanup
//! - **Vault**: read-only markdown projection with per-note sync hashes
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use claudia_core::{
//!     config::MemoryConfig, embeddings::EmbeddingClient,
//!     remember::{FactInput, Remember}, recall::{Recall, RecallQuery},
//!     store::Store,
//! };
//!
//! let config = MemoryConfig::load(None);
//! let store = Arc::new(Store::open(&config)?);
//! let embeddings = Arc::new(EmbeddingClient::new(&config));
//!
//! let remember = Remember::new(store.clone(), embeddings.clone());
//! remember.remember_fact(FactInput::new("Sarah Chen moved to the Berlin office"))?;
//!
//! let recall = Recall::new(store, embeddings, config);
//! let hits = recall.recall(&RecallQuery::new("where is Sarah based?"))?;
//! ```

pub mod config;
pub mod consolidate;
pub mod embeddings;
pub mod extract;
pub mod guards;
pub mod language_model;
pub mod recall;
pub mod remember;
pub mod store;
pub mod vault;
pub mod verify;

pub use config::MemoryConfig;
pub use consolidate::{ConsolidationReport, Consolidator};
pub use embeddings::EmbeddingClient;
pub use language_model::LanguageModel;
pub use recall::{Recall, RecallQuery, RecallResult};
pub use remember::{FactInput, RelateInput, Remember};
pub use store::{content_hash, DaemonLock, Result, Store, StoreError};
pub use vault::VaultSync;
pub use verify::Verifier;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
