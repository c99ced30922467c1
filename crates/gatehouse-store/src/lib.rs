//! # gatehouse-store
//!
//! Persistence for Gatehouse.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  StateManager (request state machine)    │
//! ├─────────────────────────────────────────┤
//! │  Repository   (SQLite | in-memory, CAS)  │
//! │  EmbeddingStore (moka → route_embeddings)│
//! ├─────────────────────────────────────────┤
//! │  Database (rusqlite WAL, spawn_blocking) │
//! │  Migrations (versioned, transactional)   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use gatehouse_kernel::{EventBus, RequestPayload};
//! use gatehouse_store::{Database, SqliteRepository, StateManager};
//!
//! let db = Database::open_and_migrate("data/gatehouse.db").await?;
//! let states = StateManager::new(Arc::new(SqliteRepository::new(db)), EventBus::default());
//! let ctx = states.create(RequestPayload::new("reset my password")).await?;
//! ```

pub mod cache;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod migration;
pub mod repository;
pub mod state;

// ── re-exports ───────────────────────────────────────────────────────

pub use cache::{CacheLayer, CacheLayerBuilder, CacheStats};
pub use db::Database;
pub use embeddings::{EmbeddingStore, text_hash};
pub use error::{StoreError, StoreResult};
pub use repository::{ApprovalFilter, MemoryRepository, Repository, SqliteRepository};
pub use state::StateManager;
