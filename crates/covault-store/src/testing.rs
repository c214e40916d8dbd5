//! Fixtures for the adapter tests.

use std::sync::Arc;

use covault_core::{
    AgentSecret, ChunkLimits, CoMap, CoValueCore, CoValueHeader, CoValueKind, KnownState,
    NativeCrypto, NewContent, Privacy, Ruleset, SessionId,
};
use serde_json::json;

/// A map CoValue with `n` transactions in one session.
pub(crate) fn sample_covalue(n: usize) -> (CoValueCore, AgentSecret) {
    let agent = AgentSecret::from_seed(&[0x42; 32]);
    let header = CoValueHeader {
        kind: CoValueKind::Map,
        ruleset: Ruleset::UnsafeAllowAll,
        meta: None,
        uniqueness: json!("store-test"),
        created_at: None,
    };
    let mut core = CoValueCore::new(header, Arc::new(NativeCrypto::new())).unwrap();
    let session = SessionId::new(&agent.id(), &[1; 8]);
    for i in 0..n {
        core.append_transaction(
            &agent,
            &session,
            &[CoMap::set_change(format!("k{}", i), json!(i))],
            Privacy::Trusting,
            None,
            i as i64,
        )
        .unwrap();
    }
    (core, agent)
}

pub(crate) fn content_for(core: &CoValueCore, known: Option<&KnownState>) -> Vec<NewContent> {
    core.new_content_since(known, ChunkLimits::default())
}
