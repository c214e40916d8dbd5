//! Connecting a peer: outgoing worker, inbound reader and keepalive.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::messages::{decode_frame, PeerId, SyncMessage};
use crate::outgoing::{spawn_outgoing, OutgoingHandle};
use crate::transport::{Connection, FrameSource};

/// How the local node relates to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PeerRole {
    /// A sync server or storage shard: gets everything we have.
    Server,
    /// A client: gets only the CoValues it asked for.
    Client,
}

/// Something that happened on a peer's connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Message(SyncMessage),
    /// The connection closed or went silent past the keepalive timeout.
    Disconnected,
}

/// A connected peer, ready to be handed to the Sync Manager.
pub struct Peer {
    pub id: PeerId,
    pub role: PeerRole,
    pub outgoing: OutgoingHandle,
    pub incoming: mpsc::UnboundedReceiver<PeerEvent>,
}

/// Start the transport tasks for a connection.
pub fn connect_peer(
    id: PeerId,
    role: PeerRole,
    connection: Connection,
    config: &TransportConfig,
) -> Peer {
    let sink = Arc::from(connection.sink);
    let (outgoing, _) = spawn_outgoing(sink, config.clone());
    let (events, incoming) = mpsc::unbounded_channel();

    tokio::spawn(read_loop(
        id.clone(),
        connection.source,
        outgoing.clone(),
        events,
        config.keepalive_timeout(),
    ));

    debug!(peer = %id, ?role, "peer connected");
    Peer {
        id,
        role,
        outgoing,
        incoming,
    }
}

async fn read_loop(
    peer: PeerId,
    mut source: Box<dyn FrameSource>,
    outgoing: OutgoingHandle,
    events: mpsc::UnboundedSender<PeerEvent>,
    keepalive: Option<Duration>,
) {
    loop {
        let frame = match keepalive {
            Some(timeout) => match tokio::time::timeout(timeout, source.next_frame()).await {
                Ok(frame) => frame,
                Err(_) => {
                    warn!(peer = %peer, "keepalive timeout");
                    break;
                }
            },
            None => source.next_frame().await,
        };
        let Some(frame) = frame else {
            debug!(peer = %peer, "connection closed by peer");
            break;
        };

        let decoded = match decode_frame(&frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(peer = %peer, error = %e, "dropping undecodable frame");
                continue;
            }
        };
        if decoded.batched {
            outgoing.set_batching(true);
        }
        for msg in decoded.messages {
            if events.send(PeerEvent::Message(msg)).is_err() {
                outgoing.close();
                return;
            }
        }
    }

    if events.send(PeerEvent::Disconnected).is_err() {
        debug!(peer = %peer, "event receiver gone before disconnect");
    }
    outgoing.close();
}
