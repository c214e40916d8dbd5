//! Session logs: one agent's append-only, signed stream of transactions
//! inside a CoValue.
//!
//! Each session keeps a running Blake3 hash over the canonical bytes of its
//! transactions. The owner signs the hash after every append, so a single
//! signature authenticates the whole prefix it covers. When the bytes since
//! the last checkpoint exceed [`CHECKPOINT_INTERVAL_BYTES`], the signature
//! is also remembered as a checkpoint; sync can then cut large sessions into
//! independently verifiable chunks.

use std::collections::BTreeMap;

use crate::crypto::{Blake3Hash, CryptoProvider, Ed25519PublicKey, Ed25519Signature, Keypair};
use crate::error::{RejectionReason, Result};
use crate::ids::{CoId, SessionId};
use crate::transaction::Transaction;

/// Bytes of transactions between two remembered signatures.
pub const CHECKPOINT_INTERVAL_BYTES: usize = 100 * 1024;

const SESSION_HASH_CONTEXT: &str = "covault 2024-06 session hash";
const SIGNATURE_DOMAIN: &[u8] = b"covault-session-v0:";

/// The message a session owner signs for a given running hash.
pub fn signing_message(hash: &Blake3Hash) -> Vec<u8> {
    let mut msg = Vec::with_capacity(SIGNATURE_DOMAIN.len() + 32);
    msg.extend_from_slice(SIGNATURE_DOMAIN);
    msg.extend_from_slice(hash.as_bytes());
    msg
}

/// Append-only log for a single session.
#[derive(Debug, Clone)]
pub struct SessionLog {
    session: SessionId,
    transactions: Vec<Transaction>,
    hash: Blake3Hash,
    last_signature: Option<Ed25519Signature>,
    /// Index of the last transaction covered -> signature over the prefix.
    signature_after: BTreeMap<u32, Ed25519Signature>,
    bytes_since_checkpoint: usize,
}

impl SessionLog {
    /// An empty log. The initial hash binds the chain to its CoValue and session.
    pub fn new(co_id: &CoId, session: SessionId) -> Self {
        let mut seed = Vec::with_capacity(32 + session.as_str().len());
        seed.extend_from_slice(co_id.as_bytes());
        seed.extend_from_slice(session.as_str().as_bytes());

        Self {
            session,
            transactions: Vec::new(),
            hash: Blake3Hash::derive(SESSION_HASH_CONTEXT, &seed),
            last_signature: None,
            signature_after: BTreeMap::new(),
            bytes_since_checkpoint: 0,
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn len(&self) -> u32 {
        self.transactions.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn hash(&self) -> Blake3Hash {
        self.hash
    }

    pub fn last_signature(&self) -> Option<&Ed25519Signature> {
        self.last_signature.as_ref()
    }

    pub fn signature_after(&self) -> &BTreeMap<u32, Ed25519Signature> {
        &self.signature_after
    }

    /// The running hash this log would have after appending `txs`.
    pub fn hash_after(&self, txs: &[Transaction]) -> Result<Blake3Hash> {
        let mut hash = self.hash;
        for tx in txs {
            hash = chain(&hash, &tx.canonical_bytes()?);
        }
        Ok(hash)
    }

    /// Verify and append transactions received from elsewhere.
    ///
    /// `signature` must cover the running hash after the last transaction in
    /// `txs`. On failure the log is unchanged.
    pub fn try_add(
        &mut self,
        txs: Vec<Transaction>,
        signature: &Ed25519Signature,
        signer: &Ed25519PublicKey,
        crypto: &dyn CryptoProvider,
    ) -> std::result::Result<(), RejectionReason> {
        if txs.is_empty() {
            return Ok(());
        }

        let new_hash = self
            .hash_after(&txs)
            .map_err(|_| RejectionReason::SignatureInvalid)?;

        if !crypto.verify(signature, &signing_message(&new_hash), signer) {
            return Err(RejectionReason::SignatureInvalid);
        }

        self.commit(txs, new_hash, *signature);
        Ok(())
    }

    /// Append a locally authored transaction and sign the new head.
    pub fn append_signed(
        &mut self,
        tx: Transaction,
        signer: &Keypair,
        crypto: &dyn CryptoProvider,
    ) -> Result<Ed25519Signature> {
        let new_hash = chain(&self.hash, &tx.canonical_bytes()?);
        let signature = crypto.sign(signer, &signing_message(&new_hash));
        self.commit(vec![tx], new_hash, signature);
        Ok(signature)
    }

    /// Restore a checkpoint signature recorded by storage.
    pub fn record_checkpoint(&mut self, index: u32, signature: Ed25519Signature) {
        if index < self.len() {
            self.signature_after.insert(index, signature);
        }
    }

    fn commit(&mut self, txs: Vec<Transaction>, new_hash: Blake3Hash, signature: Ed25519Signature) {
        for tx in txs {
            self.bytes_since_checkpoint += tx.size();
            self.transactions.push(tx);
        }
        self.hash = new_hash;
        self.last_signature = Some(signature);

        if self.bytes_since_checkpoint > CHECKPOINT_INTERVAL_BYTES {
            self.signature_after.insert(self.len() - 1, signature);
            self.bytes_since_checkpoint = 0;
        }
    }
}

fn chain(prev: &Blake3Hash, tx_bytes: &[u8]) -> Blake3Hash {
    let mut hasher = blake3::Hasher::new_derive_key(SESSION_HASH_CONTEXT);
    hasher.update(prev.as_bytes());
    hasher.update(tx_bytes);
    Blake3Hash(*hasher.finalize().as_bytes())
}
