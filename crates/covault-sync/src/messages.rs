//! Sync protocol message types and their newline-delimited JSON framing.
//!
//! Every message is a JSON object tagged by `action`. A physical frame
//! carries one message, or several joined by `\n` once batching is on.
//! Lines without an `action` (keepalive pings) are accepted and dropped.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use covault_core::{CoId, KnownState, NewContent, Priority};

use crate::error::{Result, SyncError};

/// Identifier of a connected peer, chosen by whoever adds the peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random peer ID.
    pub fn random() -> Self {
        Self(format!("peer_{:016x}", rand::random::<u64>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Sync protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum SyncMessage {
    /// "Here is what I have; send me what I lack." Subscribes the sender.
    #[serde(rename = "load")]
    Load(KnownState),

    /// Acknowledges content, or answers a LOAD that needs no content.
    #[serde(rename = "known")]
    Known(KnownState),

    /// Sent instead of KNOWN when the other side assumed a log position we
    /// do not have. Carries our true state so it can resend from there.
    #[serde(rename = "corr")]
    Correction(KnownState),

    /// New transactions, possibly one chunk of a longer transfer.
    #[serde(rename = "content")]
    Content(NewContent),
}

impl SyncMessage {
    pub fn id(&self) -> CoId {
        match self {
            SyncMessage::Load(known)
            | SyncMessage::Known(known)
            | SyncMessage::Correction(known) => known.id,
            SyncMessage::Content(content) => content.id,
        }
    }

    /// Content travels at its CoValue's priority; control messages go first.
    pub fn priority(&self) -> Priority {
        match self {
            SyncMessage::Content(content) => content.priority,
            _ => Priority::High,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            SyncMessage::Load(_) => "load",
            SyncMessage::Known(_) => "known",
            SyncMessage::Correction(_) => "corr",
            SyncMessage::Content(_) => "content",
        }
    }

    /// One line of JSON.
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// The messages of one inbound frame.
#[derive(Debug, Default)]
pub struct DecodedFrame {
    pub messages: Vec<SyncMessage>,
    /// The frame held more than one line: the peer batches.
    pub batched: bool,
}

/// Split a frame into lines and decode each. A line that fails to decode
/// fails the whole frame.
pub fn decode_frame(frame: &str) -> Result<DecodedFrame> {
    let lines: Vec<&str> = frame.split('\n').filter(|l| !l.trim().is_empty()).collect();
    let mut messages = Vec::with_capacity(lines.len());

    for line in &lines {
        let value: Value = serde_json::from_str(line)?;
        if value.get("action").is_none() {
            continue;
        }
        let msg = serde_json::from_value(value)
            .map_err(|e| SyncError::InvalidMessage(format!("{}: {}", e, truncate(line))))?;
        messages.push(msg);
    }

    Ok(DecodedFrame {
        messages,
        batched: lines.len() > 1,
    })
}

/// A keepalive frame. It carries no `action`, so receivers only use it to
/// reset their inactivity timer.
pub fn ping_frame(now_millis: i64) -> String {
    serde_json::json!({ "type": "ping", "time": now_millis }).to_string()
}

fn truncate(line: &str) -> &str {
    match line.char_indices().nth(120) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covault_core::{
        AgentSecret, ChunkLimits, CoMap, CoValueCore, CoValueHeader, CoValueKind, NativeCrypto,
        Privacy, Ruleset, SessionId,
    };
    use serde_json::json;
    use std::sync::Arc;

    fn sample_content() -> NewContent {
        let agent = AgentSecret::from_seed(&[0x42; 32]);
        let header = CoValueHeader {
            kind: CoValueKind::Map,
            ruleset: Ruleset::UnsafeAllowAll,
            meta: None,
            uniqueness: json!("messages"),
            created_at: None,
        };
        let mut core = CoValueCore::new(header, Arc::new(NativeCrypto::new())).unwrap();
        let session = SessionId::new(&agent.id(), &[7; 8]);
        core.append_transaction(
            &agent,
            &session,
            &[CoMap::set_change("hello", "world")],
            Privacy::Trusting,
            None,
            1,
        )
        .unwrap();
        core.new_content_since(None, ChunkLimits::default()).remove(0)
    }

    #[test]
    fn test_wire_shape() {
        let content = sample_content();
        let line = SyncMessage::Content(content.clone()).to_line().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["action"], "content");
        assert_eq!(value["id"], content.id.to_string());
        assert_eq!(value["priority"], 3);
        let session = value["new"].as_object().unwrap().values().next().unwrap();
        assert_eq!(session["after"], 0);
        assert!(session["newTransactions"].is_array());
        assert!(session["lastSignature"].as_str().unwrap().starts_with("sig_"));

        let known = SyncMessage::Correction(KnownState::empty(content.id));
        let value: Value = serde_json::from_str(&known.to_line().unwrap()).unwrap();
        assert_eq!(value["action"], "corr");
        assert_eq!(value["header"], false);
    }

    #[test]
    fn test_decode_batched_frame() {
        let content = sample_content();
        let frame = [
            SyncMessage::Load(KnownState::empty(content.id)).to_line().unwrap(),
            ping_frame(1234),
            SyncMessage::Content(content.clone()).to_line().unwrap(),
        ]
        .join("\n");

        let decoded = decode_frame(&frame).unwrap();
        assert!(decoded.batched);
        assert_eq!(decoded.messages.len(), 2);
        assert_eq!(decoded.messages[1], SyncMessage::Content(content));
    }

    #[test]
    fn test_single_message_is_not_batched() {
        let id = sample_content().id;
        let frame = SyncMessage::Known(KnownState::empty(id)).to_line().unwrap();
        let decoded = decode_frame(&frame).unwrap();
        assert!(!decoded.batched);
        assert_eq!(decoded.messages[0].action(), "known");
    }

    #[test]
    fn test_invalid_line_fails_frame() {
        assert!(decode_frame("{\"action\":\"load\",\"id\":\"nope\"}").is_err());
        assert!(decode_frame("not json").is_err());
        assert!(decode_frame("").unwrap().messages.is_empty());
    }

    #[test]
    fn test_priority() {
        let content = sample_content();
        assert_eq!(SyncMessage::Content(content.clone()).priority(), Priority::Medium);
        assert_eq!(SyncMessage::Load(KnownState::empty(content.id)).priority(), Priority::High);
    }
}
