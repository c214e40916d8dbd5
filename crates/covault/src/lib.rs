//! # Covault
//!
//! A local-first, end-to-end encrypted CRDT sync engine.
//!
//! ## Overview
//!
//! Data lives in CoValues: content-addressed, append-only logs of signed
//! transactions, one log per session (an agent on one device). Logs merge
//! without coordination, and the same set of valid transactions always
//! materializes to the same content.
//!
//! - **CoValues**: maps, lists, plain text and streams, materialized from
//!   their valid transactions.
//! - **Groups**: CoValues assigning roles and sharing read keys. Every other
//!   CoValue is owned by a group that decides which writes count.
//! - **Sync**: peers exchange known states and whatever the other side lacks,
//!   over any connection that carries text frames.
//!
//! ## Key Concepts
//!
//! - **Transaction**: immutable once appended. Private transactions are
//!   encrypted with the owning group's current read key.
//! - **Validity**: recomputed whenever the log or the owning group changes.
//!   When a transaction becomes invalid after the fact, content is rebuilt
//!   from scratch.
//! - **First writer wins**: transactions sharing a `fww` meta key compete;
//!   only the earliest stays valid.
//! - **Tombstone**: what is left of a deleted CoValue once it is erased.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use covault::{LocalNode, NodeConfig};
//! use covault::core::{AgentSecret, CoValueKind};
//! use covault::sync::{memory, PeerRole};
//!
//! async fn example() -> covault::Result<()> {
//!     let alice = LocalNode::new(AgentSecret::generate(), NodeConfig::default());
//!     let server = LocalNode::new(AgentSecret::generate(), NodeConfig::default());
//!
//!     let (a, b) = memory::pair();
//!     alice.connect("server", PeerRole::Server, a).await;
//!     server.connect("alice", PeerRole::Client, b).await;
//!
//!     let group = alice.create_group().await?;
//!     let map = alice.create_covalue(CoValueKind::Map, &group).await?;
//!     alice.map_set(&map, "title", "hello").await?;
//!     alice.wait_for_sync(&map, Duration::from_secs(5)).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `covault::core` - IDs, crypto, transactions, CoValue logs and content
//! - `covault::perms` - Roles, groups and read keys
//! - `covault::store` - Storage adapters (memory, SQLite)
//! - `covault::sync` - Wire protocol, transport and Sync Manager

pub mod error;
pub mod node;

// Re-export component crates
pub use covault_core as core;
pub use covault_perms as perms;
pub use covault_store as store;
pub use covault_sync as sync;

pub use error::{NodeError, Result};
pub use node::{LocalNode, NodeConfig, TxOptions};

// Re-export commonly used types
pub use covault_core::{AgentId, AgentSecret, CoId, CoValueKind, Content, KnownState, SessionId};
pub use covault_perms::{Member, ParentRole, Role};
pub use covault_sync::{PeerId, PeerRole};
