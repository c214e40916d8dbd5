//! # Covault Core
//!
//! Pure primitives for Covault: CoValues, session logs with signature
//! chains, transactions, known states and content materializers.
//!
//! This crate contains no I/O, no storage, no networking. Permissions plug
//! in through the [`WriteGate`] and [`KeySource`] traits.
//!
//! ## Key Types
//!
//! - [`CoValueCore`] - A CoValue's header, session logs and derived validity
//! - [`SessionLog`] - One agent's signed, append-only session
//! - [`Transaction`] - Trusting or private unit of change
//! - [`KnownState`] - How much of a CoValue a node has
//! - [`NewContent`] - Transactions in transit between nodes
//! - [`MaterializedContent`] - Map, list, plain text or stream state
//!
//! ## Canonicalization
//!
//! Everything hashed or signed is canonical JSON. See the [`canonical`] module.

pub mod canonical;
pub mod content;
pub mod covalue;
pub mod crypto;
pub mod error;
pub mod gate;
pub mod header;
pub mod ids;
pub mod known_state;
pub mod new_content;
pub mod pack;
pub mod session;
pub mod transaction;

pub use canonical::{canonical_bytes, canonical_string};
pub use content::{CoList, CoMap, CoPlainText, CoStream, Content, MaterializedContent};
pub use covalue::{CoValueCore, DecodedTransaction, InvalidReason, OrderKey, ValidityChange};
pub use crypto::{
    AgentSecret, Blake3Hash, CryptoProvider, Ed25519PublicKey, Ed25519Signature, KeySecret,
    Keypair, NativeCrypto, X25519PublicKey, X25519Secret,
};
pub use error::{CoreError, RejectionReason, Result};
pub use gate::{AllowAll, KeySource, NoKeys, TxRef, Verdict, WriteGate};
pub use header::{CoValueHeader, CoValueKind, Priority, Ruleset};
pub use ids::{AgentId, CoId, KeyId, SessionId, TransactionId};
pub use known_state::{peer_has_all_content, sessions_behind, KnownState};
pub use new_content::{
    split_at_checkpoints, ChunkLimits, ContentChunker, NewContent, SessionNewContent,
};
pub use session::{SessionLog, CHECKPOINT_INTERVAL_BYTES};
pub use transaction::{Privacy, Transaction};
