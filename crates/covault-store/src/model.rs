//! Storage-side bookkeeping shared by the adapters.

use covault_core::{SessionNewContent, Transaction, CHECKPOINT_INTERVAL_BYTES};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, StoreError};

/// How a received session piece relates to what storage has.
#[derive(Debug, PartialEq)]
pub(crate) enum SessionAppend<'a> {
    /// The piece starts past the stored end.
    Gap,
    /// Nothing in the piece is new.
    UpToDate,
    Append {
        first_index: u32,
        transactions: &'a [Transaction],
        new_len: u32,
        bytes_since_checkpoint: usize,
        /// Record the piece's signature after this index.
        checkpoint: Option<u32>,
    },
}

pub(crate) fn plan_append(
    stored_len: u32,
    bytes_since_checkpoint: usize,
    piece: &SessionNewContent,
) -> SessionAppend<'_> {
    if piece.after > stored_len {
        return SessionAppend::Gap;
    }
    let overlap = (stored_len - piece.after) as usize;
    let Some(transactions) = piece.new_transactions.get(overlap..).filter(|t| !t.is_empty()) else {
        return SessionAppend::UpToDate;
    };

    let new_len = stored_len + transactions.len() as u32;
    let size: usize = transactions.iter().map(Transaction::size).sum();
    let (bytes_since_checkpoint, checkpoint) =
        if bytes_since_checkpoint + size > CHECKPOINT_INTERVAL_BYTES {
            (0, Some(new_len - 1))
        } else {
            (bytes_since_checkpoint + size, None)
        };

    SessionAppend::Append {
        first_index: stored_len,
        transactions,
        new_len,
        bytes_since_checkpoint,
        checkpoint,
    }
}

pub(crate) fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

pub(crate) fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}
