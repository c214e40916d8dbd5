//! Test fixtures and helpers.
//!
//! Common setup code for unit and integration tests.

use std::sync::Arc;

use covault_core::{
    AgentId, AgentSecret, CoValueCore, CoValueHeader, CoValueKind, NativeCrypto, Privacy,
    Ruleset, SessionId, TransactionId,
};
use covault_sync::TransportConfig;
use serde_json::Value;

/// An agent with a fixed session, for writing straight into CoValue logs.
#[derive(Clone)]
pub struct TestAgent {
    pub secret: AgentSecret,
    pub session: SessionId,
}

impl TestAgent {
    /// Create a test agent with a random secret.
    pub fn new() -> Self {
        Self::from_secret(AgentSecret::generate())
    }

    /// Create with a deterministic secret from seed.
    pub fn with_seed(seed: [u8; 32]) -> Self {
        Self::from_secret(AgentSecret::from_seed(&seed))
    }

    fn from_secret(secret: AgentSecret) -> Self {
        let session = SessionId::new(&secret.id(), &[0; 8]);
        Self { secret, session }
    }

    pub fn id(&self) -> AgentId {
        self.secret.id()
    }

    /// Another session of the same agent, as if on a second device.
    pub fn other_session(&self, device: u8) -> SessionId {
        SessionId::new(&self.id(), &[device; 8])
    }

    /// Append a trusting transaction to this agent's session. Validity is
    /// left for the caller to refresh.
    pub fn append(
        &self,
        core: &mut CoValueCore,
        changes: &[Value],
        meta: Option<&Value>,
        made_at: i64,
    ) -> TransactionId {
        core.append_transaction(
            &self.secret,
            &self.session,
            changes,
            Privacy::Trusting,
            meta,
            made_at,
        )
        .expect("append to test CoValue")
    }
}

impl Default for TestAgent {
    fn default() -> Self {
        Self::new()
    }
}

/// Create multiple deterministic agents for multi-party tests.
pub fn multi_party(count: usize) -> Vec<TestAgent> {
    (0..count)
        .map(|i| {
            let mut seed = [0u8; 32];
            seed[0] = i as u8;
            seed[31] = 0xc0;
            TestAgent::with_seed(seed)
        })
        .collect()
}

/// A header anyone may write to, distinguished by `uniqueness`.
pub fn open_header(kind: CoValueKind, uniqueness: &str) -> CoValueHeader {
    CoValueHeader {
        kind,
        ruleset: Ruleset::UnsafeAllowAll,
        meta: None,
        uniqueness: Value::String(uniqueness.to_string()),
        created_at: Some(0),
    }
}

/// An empty CoValue anyone may write to.
pub fn open_covalue(kind: CoValueKind, uniqueness: &str) -> CoValueCore {
    CoValueCore::new(open_header(kind, uniqueness), Arc::new(NativeCrypto::new()))
        .expect("open header hashes")
}

/// Transport settings for tests: no timers, no batching delay.
pub fn quiet_transport() -> TransportConfig {
    TransportConfig {
        ping_interval_ms: 0,
        keepalive_timeout_ms: 0,
        batching_by_default: false,
        ..TransportConfig::default()
    }
}

/// Route `tracing` output to the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use covault_core::AllowAll;
    use serde_json::json;

    #[test]
    fn test_multi_party_is_deterministic() {
        let first = multi_party(3);
        let second = multi_party(3);

        let ids: Vec<_> = first.iter().map(TestAgent::id).collect();
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);
        assert_eq!(ids, second.iter().map(TestAgent::id).collect::<Vec<_>>());
        assert_eq!(first[0].session, second[0].session);
    }

    #[test]
    fn test_open_covalue_accepts_appends() {
        let agents = multi_party(2);
        let mut core = open_covalue(CoValueKind::Map, "fixture");
        agents[0].append(&mut core, &[json!({"op": "set", "key": "a", "value": 1})], None, 10);
        agents[1].append(&mut core, &[json!({"op": "set", "key": "a", "value": 2})], None, 20);
        core.refresh_validity(&AllowAll);

        assert_eq!(core.known_state().sessions.len(), 2);
        assert_eq!(core.valid_sorted_transactions(false).len(), 2);
    }

    #[test]
    fn test_other_session_belongs_to_agent() {
        let agent = TestAgent::with_seed([7; 32]);
        let session = agent.other_session(1);
        assert_ne!(session, agent.session);
        assert_eq!(session.agent().unwrap(), agent.id());
    }
}
