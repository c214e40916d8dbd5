//! The payload that moves transactions between nodes and into storage.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crypto::Ed25519Signature;
use crate::header::{CoValueHeader, Priority};
use crate::ids::{CoId, SessionId};
use crate::transaction::Transaction;

/// Transactions of one session, starting after index `after`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNewContent {
    pub after: u32,
    pub new_transactions: Vec<Transaction>,
    /// Signature over the session hash after the last transaction here.
    pub last_signature: Ed25519Signature,
}

impl SessionNewContent {
    /// Index one past the last transaction carried.
    pub fn end(&self) -> u32 {
        self.after + self.new_transactions.len() as u32
    }

    pub fn size(&self) -> usize {
        self.new_transactions.iter().map(Transaction::size).sum()
    }
}

/// New content for a CoValue.
///
/// A message with no header and no sessions only announces existence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContent {
    pub id: CoId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<CoValueHeader>,
    pub priority: Priority,
    #[serde(default)]
    pub new: BTreeMap<SessionId, SessionNewContent>,
    /// Set on the first chunk of a multi-chunk transfer: where each session
    /// will end once all chunks have arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_content_until: Option<BTreeMap<SessionId, u32>>,
}

impl NewContent {
    pub fn empty(id: CoId, priority: Priority) -> Self {
        Self {
            id,
            header: None,
            priority,
            new: BTreeMap::new(),
            expect_content_until: None,
        }
    }

    /// No header and no transactions.
    pub fn is_empty(&self) -> bool {
        self.header.is_none() && self.new.values().all(|s| s.new_transactions.is_empty())
    }

    pub fn size(&self) -> usize {
        self.new.values().map(SessionNewContent::size).sum()
    }

    pub fn transaction_count(&self) -> usize {
        self.new.values().map(|s| s.new_transactions.len()).sum()
    }
}

/// Bounds on how content is chunked for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkLimits {
    /// Sessions per message.
    pub max_sessions: usize,
    /// Soft cap on transaction bytes per message. Chunks are only cut at
    /// signature checkpoints, so a message can exceed this when a single
    /// checkpoint span is larger.
    pub max_bytes: usize,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            max_bytes: 100 * 1024,
        }
    }
}

impl ChunkLimits {
    /// No chunking: everything in one message.
    pub const UNLIMITED: Self = Self {
        max_sessions: usize::MAX,
        max_bytes: usize::MAX,
    };
}

/// Split transactions from index `from` onwards at checkpoints, so that
/// every piece ends at a position with a known signature.
pub fn split_at_checkpoints(
    transactions: &[Transaction],
    from: u32,
    checkpoints: &BTreeMap<u32, Ed25519Signature>,
    last_signature: &Ed25519Signature,
) -> Vec<SessionNewContent> {
    let len = transactions.len() as u32;
    if from >= len {
        return Vec::new();
    }
    let last = len - 1;

    let mut pieces = Vec::new();
    let mut start = from;
    for (&index, signature) in checkpoints.range(from..last) {
        pieces.push(SessionNewContent {
            after: start,
            new_transactions: transactions[start as usize..=index as usize].to_vec(),
            last_signature: *signature,
        });
        start = index + 1;
    }
    pieces.push(SessionNewContent {
        after: start,
        new_transactions: transactions[start as usize..].to_vec(),
        last_signature: *last_signature,
    });
    pieces
}

/// Packs session pieces into messages that respect [`ChunkLimits`].
#[derive(Debug)]
pub struct ContentChunker {
    id: CoId,
    priority: Priority,
    limits: ChunkLimits,
    messages: Vec<NewContent>,
    expect_until: BTreeMap<SessionId, u32>,
}

impl ContentChunker {
    pub fn new(
        id: CoId,
        header: Option<CoValueHeader>,
        priority: Priority,
        limits: ChunkLimits,
    ) -> Self {
        let mut first = NewContent::empty(id, priority);
        first.header = header;
        Self {
            id,
            priority,
            limits,
            messages: vec![first],
            expect_until: BTreeMap::new(),
        }
    }

    /// Add the pieces of one session, in order.
    pub fn push_session(&mut self, session: &SessionId, pieces: Vec<SessionNewContent>) {
        for piece in pieces {
            self.expect_until.insert(session.clone(), piece.end());
            let limits = self.limits;
            let needs_new_message = self.messages.last().map_or(true, |msg| {
                let has_content = msg.transaction_count() > 0;
                msg.new.contains_key(session)
                    || (has_content && msg.new.len() >= limits.max_sessions)
                    || (has_content && msg.size() + piece.size() > limits.max_bytes)
            });
            if needs_new_message {
                self.messages.push(NewContent::empty(self.id, self.priority));
            }
            if let Some(msg) = self.messages.last_mut() {
                msg.new.insert(session.clone(), piece);
            }
        }
    }

    /// The finished messages. When there is more than one, the first
    /// announces where each session will end.
    pub fn finish(self) -> Vec<NewContent> {
        let mut messages = self.messages;
        messages.retain(|msg| !msg.is_empty());
        if messages.len() > 1 {
            if let Some(first) = messages.first_mut() {
                first.expect_content_until = Some(self.expect_until);
            }
        }
        messages
    }
}
