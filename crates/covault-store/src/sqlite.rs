//! SQLite implementation of the StorageAdapter trait.
//!
//! This is the primary storage backend. It uses rusqlite with bundled
//! SQLite, wrapped in async via tokio::spawn_blocking.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::mpsc;
use tracing::debug;

use covault_core::{
    split_at_checkpoints, ChunkLimits, CoId, CoValueHeader, ContentChunker, Ed25519Signature,
    KnownState, NewContent, SessionId, Transaction,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::model::{from_cbor, plan_append, to_cbor, SessionAppend};
use crate::traits::{StorageAdapter, StoreOutcome};

/// SQLite-based storage.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` on the connection in a blocking task.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Unavailable(format!("mutex poisoned: {}", e)))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("spawn_blocking failed: {}", e)))?
    }
}

fn covalue_row(conn: &Connection, id: &CoId) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT row_id FROM covalues WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()?)
}

fn parse_signature(s: &str) -> Result<Ed25519Signature> {
    s.parse()
        .map_err(|_| StoreError::InvalidData(format!("bad signature {:?}", s)))
}

fn known_state_of(conn: &Connection, row_id: i64, id: CoId) -> Result<KnownState> {
    let mut stmt = conn.prepare("SELECT session_id, last_idx FROM sessions WHERE covalue = ?1")?;
    let sessions = stmt
        .query_map(params![row_id], |row| {
            let session: String = row.get(0)?;
            let last_idx: u32 = row.get(1)?;
            Ok((SessionId::from_raw(session), last_idx))
        })?
        .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
    Ok(KnownState {
        id,
        header: true,
        sessions,
    })
}

struct SessionRow {
    row_id: i64,
    last_idx: u32,
    bytes_since_checkpoint: usize,
}

fn session_row(conn: &Connection, covalue: i64, session: &SessionId) -> Result<Option<SessionRow>> {
    Ok(conn
        .query_row(
            "SELECT row_id, last_idx, bytes_since_checkpoint FROM sessions
             WHERE covalue = ?1 AND session_id = ?2",
            params![covalue, session.as_str()],
            |row| {
                Ok(SessionRow {
                    row_id: row.get(0)?,
                    last_idx: row.get(1)?,
                    bytes_since_checkpoint: row.get::<_, i64>(2)? as usize,
                })
            },
        )
        .optional()?)
}

fn store_blocking(conn: &mut Connection, content: &NewContent) -> Result<StoreOutcome> {
    let tx = conn.transaction()?;

    let row_id = match covalue_row(&tx, &content.id)? {
        Some(row_id) => row_id,
        None => {
            let Some(header) = &content.header else {
                return Ok(StoreOutcome::Correction(KnownState::empty(content.id)));
            };
            tx.execute(
                "INSERT INTO covalues (id, header) VALUES (?1, ?2)",
                params![content.id.to_string(), to_cbor(header)?],
            )?;
            tx.last_insert_rowid()
        }
    };

    let mut invalid_assumptions = false;
    for (session, piece) in &content.new {
        let existing = session_row(&tx, row_id, session)?;
        let (stored_len, bytes_since) = existing
            .as_ref()
            .map_or((0, 0), |s| (s.last_idx, s.bytes_since_checkpoint));

        let (first_index, transactions, new_len, bytes_since_checkpoint, checkpoint) =
            match plan_append(stored_len, bytes_since, piece) {
                SessionAppend::Gap => {
                    invalid_assumptions = true;
                    continue;
                }
                SessionAppend::UpToDate => continue,
                SessionAppend::Append {
                    first_index,
                    transactions,
                    new_len,
                    bytes_since_checkpoint,
                    checkpoint,
                } => (first_index, transactions, new_len, bytes_since_checkpoint, checkpoint),
            };

        let signature = piece.last_signature.to_string();
        let ses = match existing {
            Some(row) => {
                tx.execute(
                    "UPDATE sessions SET last_idx = ?1, last_signature = ?2, bytes_since_checkpoint = ?3
                     WHERE row_id = ?4",
                    params![new_len, signature, bytes_since_checkpoint as i64, row.row_id],
                )?;
                row.row_id
            }
            None => {
                tx.execute(
                    "INSERT INTO sessions (covalue, session_id, last_idx, last_signature, bytes_since_checkpoint)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        row_id,
                        session.as_str(),
                        new_len,
                        signature,
                        bytes_since_checkpoint as i64
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };

        if let Some(index) = checkpoint {
            tx.execute(
                "INSERT OR REPLACE INTO signature_after (ses, idx, signature) VALUES (?1, ?2, ?3)",
                params![ses, index, signature],
            )?;
        }

        let mut insert =
            tx.prepare_cached("INSERT OR IGNORE INTO transactions (ses, idx, tx) VALUES (?1, ?2, ?3)")?;
        for (offset, transaction) in transactions.iter().enumerate() {
            insert.execute(params![ses, first_index + offset as u32, to_cbor(transaction)?])?;
        }
    }

    let known = known_state_of(&tx, row_id, content.id)?;
    tx.commit()?;

    debug!(co = %content.id, "stored content");
    Ok(if invalid_assumptions {
        StoreOutcome::Correction(known)
    } else {
        StoreOutcome::Stored(known)
    })
}

fn load_blocking(conn: &Connection, id: &CoId, limits: ChunkLimits) -> Result<Option<Vec<NewContent>>> {
    let Some((row_id, header_blob)) = conn
        .query_row(
            "SELECT row_id, header FROM covalues WHERE id = ?1",
            params![id.to_string()],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)),
        )
        .optional()?
    else {
        return Ok(None);
    };
    let header: CoValueHeader = from_cbor(&header_blob)?;
    let priority = header.priority();
    let mut chunker = ContentChunker::new(*id, Some(header), priority, limits);

    let mut sessions = conn.prepare(
        "SELECT row_id, session_id, last_signature FROM sessions WHERE covalue = ?1 ORDER BY session_id",
    )?;
    let rows = sessions
        .query_map(params![row_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut txs = conn.prepare("SELECT tx FROM transactions WHERE ses = ?1 ORDER BY idx")?;
    let mut sigs = conn.prepare("SELECT idx, signature FROM signature_after WHERE ses = ?1")?;

    for (ses, session, last_signature) in rows {
        let transactions = txs
            .query_map(params![ses], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .iter()
            .map(|blob| from_cbor::<Transaction>(blob))
            .collect::<Result<Vec<_>>>()?;

        let checkpoints = sigs
            .query_map(params![ses], |row| {
                Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(|(idx, sig)| Ok((idx, parse_signature(&sig)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        let last_signature = parse_signature(&last_signature)?;
        let pieces = split_at_checkpoints(&transactions, 0, &checkpoints, &last_signature);
        chunker.push_session(&SessionId::from_raw(session), pieces);
    }

    Ok(Some(chunker.finish()))
}

fn parse_ids(ids: Vec<String>) -> Result<Vec<CoId>> {
    ids.iter()
        .map(|id| {
            id.parse()
                .map_err(|_| StoreError::InvalidData(format!("bad CoValue id {:?}", id)))
        })
        .collect()
}

#[async_trait]
impl StorageAdapter for SqliteStorage {
    async fn store(&self, content: &NewContent) -> Result<StoreOutcome> {
        let content = content.clone();
        self.run(move |conn| store_blocking(conn, &content)).await
    }

    async fn load(
        &self,
        id: &CoId,
        limits: ChunkLimits,
        sink: mpsc::Sender<NewContent>,
    ) -> Result<bool> {
        let id = *id;
        let Some(messages) = self.run(move |conn| load_blocking(conn, &id, limits)).await? else {
            return Ok(false);
        };
        for msg in messages {
            if sink.send(msg).await.is_err() {
                debug!(co = %id, "load receiver dropped");
                break;
            }
        }
        Ok(true)
    }

    async fn known_state(&self, id: &CoId) -> Result<KnownState> {
        let id = *id;
        self.run(move |conn| match covalue_row(conn, &id)? {
            Some(row_id) => known_state_of(conn, row_id, id),
            None => Ok(KnownState::empty(id)),
        })
        .await
    }

    async fn mark_unsynced(&self, id: &CoId, peer: &str) -> Result<()> {
        let (id, peer) = (id.to_string(), peer.to_string());
        self.run(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO unsynced_covalues (covalue_id, peer_id) VALUES (?1, ?2)",
                params![id, peer],
            )?;
            Ok(())
        })
        .await
    }

    async fn mark_synced(&self, id: &CoId, peer: &str) -> Result<()> {
        let (id, peer) = (id.to_string(), peer.to_string());
        self.run(move |conn| {
            conn.execute(
                "DELETE FROM unsynced_covalues WHERE covalue_id = ?1 AND peer_id = ?2",
                params![id, peer],
            )?;
            Ok(())
        })
        .await
    }

    async fn unsynced_covalue_ids(&self) -> Result<Vec<CoId>> {
        let ids = self
            .run(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT covalue_id FROM unsynced_covalues ORDER BY covalue_id",
                )?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(ids)
            })
            .await?;
        parse_ids(ids)
    }

    async fn enqueue_deleted(&self, id: &CoId) -> Result<()> {
        let id = id.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO deleted_covalues (covalue_id, status) VALUES (?1, 0)
                 ON CONFLICT(covalue_id) DO NOTHING",
                params![id],
            )?;
            Ok(())
        })
        .await
    }

    async fn all_deleted_pending(&self) -> Result<Vec<CoId>> {
        let ids = self
            .run(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT covalue_id FROM deleted_covalues WHERE status = 0 ORDER BY covalue_id",
                )?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(ids)
            })
            .await?;
        parse_ids(ids)
    }

    async fn erase_all_deleted_covalues(&self) -> Result<usize> {
        self.run(|conn| {
            let tx = conn.transaction()?;
            let pending = {
                let mut stmt =
                    tx.prepare("SELECT covalue_id FROM deleted_covalues WHERE status = 0")?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                ids
            };

            for id in &pending {
                // Deletion sessions end in '$' and are kept as the tombstone.
                let doomed = "SELECT s.row_id FROM sessions s JOIN covalues c ON s.covalue = c.row_id
                              WHERE c.id = ?1 AND s.session_id NOT LIKE '%$'";
                tx.execute(
                    &format!("DELETE FROM transactions WHERE ses IN ({})", doomed),
                    params![id],
                )?;
                tx.execute(
                    &format!("DELETE FROM signature_after WHERE ses IN ({})", doomed),
                    params![id],
                )?;
                tx.execute(&format!("DELETE FROM sessions WHERE row_id IN ({})", doomed), params![id])?;
                tx.execute(
                    "UPDATE deleted_covalues SET status = 1 WHERE covalue_id = ?1",
                    params![id],
                )?;
                debug!(co = %id, "erased deleted CoValue");
            }

            tx.commit()?;
            Ok(pending.len())
        })
        .await
    }
}
