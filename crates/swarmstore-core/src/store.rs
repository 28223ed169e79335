// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use rusqlite::{params, Connection, OptionalExtension};

use crate::{
    error::{Error, Result},
    ids::{AccountId, MessageHash, ACCOUNT_ID_SIZE},
    message::Message,
};

/// Recommended period for calling [`MessageStore::clean_expired`].
pub const CLEANUP_PERIOD: Duration = Duration::from_secs(10);

pub const PAGE_SIZE: u64 = 4096;
pub const SIZE_LIMIT: u64 = 3584 * 1024 * 1024; // 3.5 GiB
pub const PAGE_LIMIT: u64 = SIZE_LIMIT / PAGE_SIZE;

pub const DEFAULT_RETRIEVE_LIMIT: usize = 256;
pub const MAX_RETRIEVE_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateHandling {
    /// A colliding hash is an error.
    Fail,
    /// A colliding hash keeps the existing row and reports success.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The row was inserted and durably committed.
    Stored,
    /// An identical hash was already present (duplicate policy `Ignore`).
    AlreadyStored,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub message_count: u64,
    pub page_count: u64,
}

/// Durable per-account message storage.  Every operation opens its own
/// SQLite connection on a blocking thread; SQLite serializes writers, so a
/// store acknowledged to one client is visible to that client's next
/// retrieve.
pub struct MessageStore {
    path: PathBuf,
    page_limit: u64,
}

impl MessageStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        Self::open_with_limit(path, PAGE_LIMIT)
    }

    /// Open with a non-default page budget.  Mainly for capacity tests.
    pub fn open_with_limit(path: impl AsRef<Path>, page_limit: u64) -> Result<Arc<Self>> {
        let store = Arc::new(Self {
            path: path.as_ref().to_path_buf(),
            page_limit,
        });
        let conn = store.open_connection()?;
        ensure_schema(&conn)?;
        Ok(store)
    }

    fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    async fn run_blocking<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            conn.busy_timeout(Duration::from_secs(5))?;
            job(&conn)
        })
        .await?
    }

    /// Insert one message.  The capacity budget is checked before the
    /// insert; a full database fails with `CapacityExceeded` rather than
    /// evicting.
    pub async fn store(
        &self,
        message: Message,
        duplicates: DuplicateHandling,
    ) -> Result<StoreOutcome> {
        let page_limit = self.page_limit;
        self.run_blocking(move |conn| store_sync(conn, &message, duplicates, page_limit))
            .await
    }

    /// Transactional batch insert with duplicates ignored; either every
    /// message lands or none do.  Used by replication catch-up.
    pub async fn bulk_store(&self, messages: Vec<Message>) -> Result<()> {
        let page_limit = self.page_limit;
        self.run_blocking(move |conn| {
            if used_pages(conn)? >= page_limit {
                return Err(Error::CapacityExceeded);
            }
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO messages \
                     (hash, account, namespace, data, timestamp_ms, expiry_ms) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for msg in &messages {
                    stmt.execute(params![
                        msg.hash.0.to_vec(),
                        msg.account.0.to_vec(),
                        msg.namespace,
                        msg.data,
                        msg.timestamp_ms,
                        msg.expiry_ms,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Messages for `(account, namespace)` strictly newer than `since_hash`
    /// (all, when absent), ascending by timestamp with the hash as
    /// tie-break.  Expired rows are never returned.  An unknown
    /// `since_hash` retrieves from the start of the stream.
    pub async fn retrieve(
        &self,
        account: AccountId,
        namespace: i16,
        since_hash: Option<MessageHash>,
        limit: Option<usize>,
        now_ms: i64,
    ) -> Result<Vec<Message>> {
        let limit = limit
            .unwrap_or(DEFAULT_RETRIEVE_LIMIT)
            .min(MAX_RETRIEVE_LIMIT);
        self.run_blocking(move |conn| {
            let anchor = match since_hash {
                Some(hash) => conn
                    .query_row(
                        "SELECT timestamp_ms, hash FROM messages WHERE hash = ?1",
                        params![hash.0.to_vec()],
                        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)),
                    )
                    .optional()?,
                None => None,
            };
            let (anchor_ts, anchor_hash) = anchor.unwrap_or((i64::MIN, Vec::new()));
            let mut stmt = conn.prepare(
                "SELECT hash, account, namespace, data, timestamp_ms, expiry_ms \
                 FROM messages \
                 WHERE account = ?1 AND namespace = ?2 AND expiry_ms > ?3 \
                   AND (timestamp_ms > ?4 OR (timestamp_ms = ?4 AND hash > ?5)) \
                 ORDER BY timestamp_ms ASC, hash ASC \
                 LIMIT ?6",
            )?;
            let rows = stmt.query_map(
                params![
                    account.0.to_vec(),
                    namespace,
                    now_ms,
                    anchor_ts,
                    anchor_hash,
                    limit as i64,
                ],
                row_to_raw,
            )?;
            let mut messages = Vec::new();
            for row in rows {
                messages.push(raw_to_message(row?)?);
            }
            Ok(messages)
        })
        .await
    }

    pub async fn retrieve_by_hash(&self, hash: MessageHash) -> Result<Option<Message>> {
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT hash, account, namespace, data, timestamp_ms, expiry_ms \
                 FROM messages WHERE hash = ?1",
                params![hash.0.to_vec()],
                row_to_raw,
            )
            .optional()?
            .map(raw_to_message)
            .transpose()
        })
        .await
    }

    /// Uniform-random row sample for the peer storage test; `None` only
    /// when the store is empty.
    pub async fn retrieve_random(&self) -> Result<Option<Message>> {
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT hash, account, namespace, data, timestamp_ms, expiry_ms \
                 FROM messages ORDER BY RANDOM() LIMIT 1",
                [],
                row_to_raw,
            )
            .optional()?
            .map(raw_to_message)
            .transpose()
        })
        .await
    }

    pub async fn get_stats(&self) -> Result<StoreStats> {
        self.run_blocking(move |conn| {
            let message_count =
                conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
            Ok(StoreStats {
                message_count,
                page_count: used_pages(conn)?,
            })
        })
        .await
    }

    /// Delete every row with `expiry_ms <= now_ms`; returns the number of
    /// rows removed.  Idempotent; meant to run every [`CLEANUP_PERIOD`].
    pub async fn clean_expired(&self, now_ms: i64) -> Result<u64> {
        let deleted = self
            .run_blocking(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM messages WHERE expiry_ms <= ?1",
                    params![now_ms],
                )? as u64)
            })
            .await?;
        if deleted > 0 {
            tracing::debug!(deleted, "removed expired messages");
        }
        Ok(deleted)
    }

    /// Remove the listed hashes owned by `account`; returns the hashes that
    /// were actually present and deleted.
    pub async fn delete_by_hash(
        &self,
        account: AccountId,
        hashes: Vec<MessageHash>,
    ) -> Result<Vec<MessageHash>> {
        self.run_blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let mut deleted = Vec::new();
            {
                let mut stmt =
                    tx.prepare("DELETE FROM messages WHERE account = ?1 AND hash = ?2")?;
                for hash in &hashes {
                    if stmt.execute(params![account.0.to_vec(), hash.0.to_vec()])? > 0 {
                        deleted.push(*hash);
                    }
                }
            }
            tx.commit()?;
            Ok(deleted)
        })
        .await
    }

    /// Remove all of an account's messages in the given namespaces (every
    /// namespace when `None`) with `timestamp_ms <= before_ms`.  Returns
    /// the deleted hashes.
    pub async fn delete_all_before(
        &self,
        account: AccountId,
        namespaces: Option<Vec<i16>>,
        before_ms: i64,
    ) -> Result<Vec<MessageHash>> {
        self.run_blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let mut deleted = Vec::new();
            {
                let mut select = tx.prepare(
                    "SELECT hash FROM messages \
                     WHERE account = ?1 AND timestamp_ms <= ?2 \
                       AND (?3 IS NULL OR namespace = ?3)",
                )?;
                let mut delete = tx.prepare(
                    "DELETE FROM messages \
                     WHERE account = ?1 AND timestamp_ms <= ?2 \
                       AND (?3 IS NULL OR namespace = ?3)",
                )?;
                let selectors: Vec<Option<i16>> = match &namespaces {
                    Some(list) => list.iter().copied().map(Some).collect(),
                    None => vec![None],
                };
                for ns in selectors {
                    let rows = select.query_map(
                        params![account.0.to_vec(), before_ms, ns],
                        |row| row.get::<_, Vec<u8>>(0),
                    )?;
                    for row in rows {
                        deleted.push(MessageHash::from_bytes(&row?)?);
                    }
                    delete.execute(params![account.0.to_vec(), before_ms, ns])?;
                }
            }
            tx.commit()?;
            deleted.sort();
            Ok(deleted)
        })
        .await
    }

    /// Replace the expiry on the listed hashes owned by `account`, capped
    /// at `timestamp_ms + max_ttl_ms` per row.  Returns the hashes whose
    /// expiry changed.
    pub async fn update_expiry(
        &self,
        account: AccountId,
        hashes: Vec<MessageHash>,
        new_expiry_ms: i64,
        max_ttl_ms: i64,
    ) -> Result<Vec<MessageHash>> {
        self.run_blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let mut updated = Vec::new();
            {
                let mut stmt = tx.prepare(
                    "UPDATE messages \
                     SET expiry_ms = MIN(?3, timestamp_ms + ?4) \
                     WHERE account = ?1 AND hash = ?2 \
                       AND expiry_ms != MIN(?3, timestamp_ms + ?4)",
                )?;
                for hash in &hashes {
                    let changed = stmt.execute(params![
                        account.0.to_vec(),
                        hash.0.to_vec(),
                        new_expiry_ms,
                        max_ttl_ms,
                    ])?;
                    if changed > 0 {
                        updated.push(*hash);
                    }
                }
            }
            tx.commit()?;
            Ok(updated)
        })
        .await
    }
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!("PRAGMA page_size = {PAGE_SIZE};"))?;
    // Returns the resulting mode as a row, so execute() is not usable here.
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
             hash BLOB PRIMARY KEY NOT NULL,
             account BLOB NOT NULL,
             namespace INTEGER NOT NULL,
             data BLOB NOT NULL,
             timestamp_ms INTEGER NOT NULL,
             expiry_ms INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_messages_stream
             ON messages(account, namespace, timestamp_ms, hash);
         CREATE INDEX IF NOT EXISTS idx_messages_expiry
             ON messages(expiry_ms);",
    )?;
    Ok(())
}

/// Pages in use: total minus freelist.  Compared against the page budget
/// before every insert.
fn used_pages(conn: &Connection) -> Result<u64> {
    let total: u64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
    let free: u64 = conn.query_row("PRAGMA freelist_count", [], |row| row.get(0))?;
    Ok(total.saturating_sub(free))
}

fn store_sync(
    conn: &Connection,
    message: &Message,
    duplicates: DuplicateHandling,
    page_limit: u64,
) -> Result<StoreOutcome> {
    if used_pages(conn)? >= page_limit {
        return Err(Error::CapacityExceeded);
    }
    let sql = match duplicates {
        DuplicateHandling::Fail => {
            "INSERT INTO messages (hash, account, namespace, data, timestamp_ms, expiry_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
        }
        DuplicateHandling::Ignore => {
            "INSERT OR IGNORE INTO messages (hash, account, namespace, data, timestamp_ms, expiry_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
        }
    };
    let inserted = conn.execute(
        sql,
        params![
            message.hash.0.to_vec(),
            message.account.0.to_vec(),
            message.namespace,
            message.data,
            message.timestamp_ms,
            message.expiry_ms,
        ],
    );
    match inserted {
        Ok(0) => Ok(StoreOutcome::AlreadyStored),
        Ok(_) => Ok(StoreOutcome::Stored),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(Error::Duplicate)
        }
        Err(err) => Err(err.into()),
    }
}

type RawRow = (Vec<u8>, Vec<u8>, i16, Vec<u8>, i64, i64);

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn raw_to_message(raw: RawRow) -> Result<Message> {
    let (hash, account, namespace, data, timestamp_ms, expiry_ms) = raw;
    let account: [u8; ACCOUNT_ID_SIZE] = account
        .try_into()
        .map_err(|_| Error::Internal("corrupt account column".into()))?;
    Ok(Message {
        account: AccountId(account),
        namespace,
        hash: MessageHash::from_bytes(&hash)?,
        data,
        timestamp_ms,
        expiry_ms,
    })
}
