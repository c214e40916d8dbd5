//! The seam between CoValues and the permission layer.
//!
//! `covault-core` does not know how roles are derived. It hands the
//! permission layer every transaction in deterministic order and gets back
//! a verdict for each one, and it asks for read keys when it needs to
//! decrypt private changes.

use crate::crypto::KeySecret;
use crate::header::CoValueHeader;
use crate::ids::{AgentId, CoId, KeyId, TransactionId};
use crate::transaction::Transaction;

/// A transaction as seen by a [`WriteGate`].
#[derive(Debug, Clone, Copy)]
pub struct TxRef<'a> {
    pub id: &'a TransactionId,
    pub author: &'a AgentId,
    pub tx: &'a Transaction,
}

/// `Err` carries a human-readable reason the transaction was refused.
pub type Verdict = Result<(), String>;

/// Decides which transactions of a CoValue are permitted.
pub trait WriteGate: Send + Sync {
    /// `txs` are sorted by `(madeAt, TransactionId)`. The returned vector
    /// has one verdict per input, in the same order.
    fn validate(
        &self,
        id: &CoId,
        header: &CoValueHeader,
        txs: &[TxRef<'_>],
    ) -> Vec<Verdict>;
}

/// Resolves read keys for private transactions.
pub trait KeySource: Send + Sync {
    /// `owner` is the group whose keys encrypt the CoValue (the CoValue
    /// itself for groups).
    fn key_secret(&self, owner: &CoId, key_id: &KeyId) -> Option<KeySecret>;
}

/// Accepts every correctly signed transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl WriteGate for AllowAll {
    fn validate(
        &self,
        _id: &CoId,
        _header: &CoValueHeader,
        txs: &[TxRef<'_>],
    ) -> Vec<Verdict> {
        vec![Ok(()); txs.len()]
    }
}

/// A key source that knows no keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKeys;

impl KeySource for NoKeys {
    fn key_secret(&self, _owner: &CoId, _key_id: &KeyId) -> Option<KeySecret> {
        None
    }
}
