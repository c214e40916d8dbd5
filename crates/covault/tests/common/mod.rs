//! Shared setup for the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use covault::core::AgentSecret;
use covault::store::StorageAdapter;
use covault::sync::memory;
use covault::{LocalNode, NodeConfig, PeerId, PeerRole};
use covault_testkit::{init_tracing, quiet_transport};

pub const TIMEOUT: Duration = Duration::from_secs(5);

fn config() -> NodeConfig {
    NodeConfig {
        transport: quiet_transport(),
        ..NodeConfig::default()
    }
}

/// A node whose agent is derived from `seed`.
pub fn node(seed: u8) -> LocalNode {
    init_tracing();
    LocalNode::new(AgentSecret::from_seed(&[seed; 32]), config())
}

pub fn node_with_storage(seed: u8, storage: Arc<dyn StorageAdapter>) -> LocalNode {
    init_tracing();
    LocalNode::with_storage(AgentSecret::from_seed(&[seed; 32]), storage, config())
}

/// Connect `client` to `server` over an in-memory connection.
pub async fn link(client: &LocalNode, server: &LocalNode) {
    let (a, b) = memory::pair();
    client
        .connect(PeerId::new(server.agent_id().to_string()), PeerRole::Server, a)
        .await;
    server
        .connect(PeerId::new(client.agent_id().to_string()), PeerRole::Client, b)
        .await;
}

/// Poll `check` until it holds or [`TIMEOUT`] passes.
pub async fn eventually<F, Fut>(what: &str, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("timed out waiting for {}", what)
}
