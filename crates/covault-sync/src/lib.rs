//! # Covault Sync
//!
//! Sync protocol, peer transport and Sync Manager.
//!
//! ## Overview
//!
//! Nodes converge by exchanging known states and the transactions the
//! other side lacks. There is no session handshake: any message can come
//! at any time and every handler is idempotent.
//!
//! - **LOAD** carries the sender's known state and subscribes it to the
//!   CoValue. The answer is CONTENT for whatever it lacks (dependencies
//!   first), or a KNOWN if it lacks nothing.
//! - **CONTENT** carries new transactions per session, possibly as one
//!   chunk of a longer transfer. The receiver acknowledges with KNOWN.
//! - **KNOWN** updates what the sender is believed to have.
//! - **CORRECTION** replaces that belief after a gap, so the other side
//!   resends from the right index.
//!
//! ## Transport
//!
//! Each peer connection has an outgoing worker with a three-tier priority
//! queue, newline-delimited batching, backpressure on the connection's
//! buffered bytes and keepalive pings. See [`outgoing`] and [`peer`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use covault_core::NativeCrypto;
//! use covault_sync::{
//!     connect_peer, memory, PeerRole, Registry, SyncConfig, SyncManager, TransportConfig,
//! };
//!
//! async fn example() {
//!     let registry = Registry::new(Arc::new(NativeCrypto::new()), None);
//!     let mut manager = SyncManager::new(SyncConfig::default(), registry);
//!
//!     let (local, _remote) = memory::pair();
//!     let mut peer = connect_peer("server".into(), PeerRole::Server, local, &TransportConfig::default());
//!     manager.add_peer(peer.id.clone(), peer.role, peer.outgoing.clone());
//!
//!     while let Some(event) = peer.incoming.recv().await {
//!         manager.handle_event(&peer.id, event).await;
//!     }
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Client                              Server
//!   |-------- load {sessions} -------->|
//!   |<------- content (group) ---------|
//!   |<------- content (value) ---------|
//!   |-------- known ------------------>|
//!   |-------- content (local edit) --->|
//!   |<------- known -------------------|
//! ```

pub mod config;
pub mod error;
pub mod manager;
pub mod messages;
pub mod outgoing;
pub mod peer;
pub mod peer_state;
pub mod queue;
pub mod registry;
pub mod transport;

pub use config::{SyncConfig, TransportConfig};
pub use error::{Result, SyncError};
pub use manager::{ContentSource, SyncManager, NO_SERVER_PEER};
pub use messages::{decode_frame, ping_frame, DecodedFrame, PeerId, SyncMessage};
pub use outgoing::{spawn_outgoing, OutgoingHandle};
pub use peer::{connect_peer, Peer, PeerEvent, PeerRole};
pub use peer_state::PeerState;
pub use queue::PriorityQueue;
pub use registry::{Entry, IngestError, Ingested, Registry};
pub use transport::{memory, Connection, FrameSink, FrameSource};
