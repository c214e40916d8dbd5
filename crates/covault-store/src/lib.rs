//! # Covault Store
//!
//! Storage abstraction for Covault. Provides a trait-based interface for
//! CoValue persistence with SQLite and in-memory implementations.
//!
//! ## Overview
//!
//! Storage keeps, per CoValue, the header and every session's
//! transactions, last signature and checkpoint signatures. It does not
//! verify anything: the node only hands it content that passed ingest.
//! Loading streams the CoValue back as [`NewContent`](covault_core::NewContent)
//! messages cut at checkpoints, exactly like content sent to a peer.
//!
//! ## Key Types
//!
//! - [`StorageAdapter`] - The async trait for all storage operations
//! - [`SqliteStorage`] - SQLite-based persistent storage
//! - [`MemoryStorage`] - In-memory storage for tests
//! - [`StoreOutcome`] - Result of storing content
//!
//! ## Usage
//!
//! ```rust,no_run
//! use covault_store::{SqliteStorage, StorageAdapter};
//!
//! async fn example() {
//!     let storage = SqliteStorage::open("covault.db").unwrap();
//!
//!     // Or use an in-memory database for testing
//!     let storage = SqliteStorage::open_memory().unwrap();
//!
//!     // let outcome = storage.store(&content).await.unwrap();
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Idempotent stores**: Transactions storage already has are skipped
//! - **Corrections**: Content that starts past the stored end is refused
//!   per session and answered with the stored known state
//! - **Tombstones**: Erasing a deleted CoValue keeps its header and
//!   deletion sessions

pub mod error;
pub mod memory;
pub mod migration;
mod model;
pub mod sqlite;
pub mod traits;

#[cfg(test)]
mod testing;

pub use error::{Result, StoreError};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use traits::{StorageAdapter, StoreOutcome};
