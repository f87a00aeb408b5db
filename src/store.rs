// Durable queue store backed by SQLite

use crate::entry::{EntryId, MutationKind, NewEntry, QueueEntry};
use crate::error::StoreError;
use fs2::FileExt;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

const CURRENT_VERSION: u32 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type Result<T> = std::result::Result<T, StoreError>;

/// Persistent, ordered queue of pending mutations
///
/// Cloning is cheap: clones share one connection and serialize on it. A
/// second execution context (another process, or the background
/// coordinator) opens its own handle on the same path; SQLite arbitrates
/// between them.
#[derive(Clone)]
pub struct QueueStore {
    inner: Arc<Inner>,
}

struct Inner {
    base_path: PathBuf,
    db: Mutex<Connection>,
}

/// Exclusive hold on the right to drain this store, across contexts.
///
/// Released when dropped.
#[derive(Debug)]
pub struct DrainLock {
    file: File,
}

impl Drop for DrainLock {
    fn drop(&mut self) {
        // Closing the file releases the lock as well; this just makes it prompt
        let _ = FileExt::unlock(&self.file);
    }
}

impl QueueStore {
    /// Open or create a store at the given path
    ///
    /// The store lives in a `.tasksync` subdirectory of the given path.
    /// Opening an existing store reuses it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let base_path = path.as_ref().join(".tasksync");

        fs::create_dir_all(&base_path).map_err(|e| unavailable(&base_path, e))?;

        let db_path = base_path.join("queue.db");
        let db = Connection::open(&db_path).map_err(|e| unavailable(&db_path, e))?;

        let store = Self {
            inner: Arc::new(Inner {
                base_path,
                db: Mutex::new(db),
            }),
        };

        store.configure()?;
        store.create_schema()?;
        store.check_version()?;

        info!(path = ?store.base_path(), pending = store.count()?, "Opened queue store");
        Ok(store)
    }

    /// Get the base path of this store
    pub fn base_path(&self) -> &Path {
        &self.inner.base_path
    }

    fn db(&self) -> Result<MutexGuard<'_, Connection>> {
        self.inner.db.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Keep the connection busy on the calling thread, as a slow disk would.
    /// Signals `locked` once the connection is held.
    #[cfg(test)]
    pub(crate) fn hold_connection(&self, duration: Duration, locked: std::sync::mpsc::Sender<()>) {
        let _db = self.inner.db.lock();
        let _ = locked.send(());
        std::thread::sleep(duration);
    }

    fn configure(&self) -> Result<()> {
        let db = self.db()?;
        db.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| unavailable(&self.inner.base_path, e))?;
        let mode: String = db
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| unavailable(&self.inner.base_path, e))?;
        db.execute_batch("PRAGMA synchronous = FULL;")
            .map_err(|e| unavailable(&self.inner.base_path, e))?;
        debug!(journal_mode = %mode, "Configured queue database");
        Ok(())
    }

    /// Create database schema
    fn create_schema(&self) -> Result<()> {
        debug!("Creating queue schema");

        self.db()?
            .execute_batch(
                r#"
                -- Pending mutations, one row per queued entry
                CREATE TABLE IF NOT EXISTS queue_entries (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    kind TEXT NOT NULL,
                    payload_json TEXT NOT NULL,
                    client_ref TEXT NOT NULL,
                    enqueued_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_queue_entries_order ON queue_entries(enqueued_at, id);

                -- One queued entry per client reference
                CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_entries_client_ref ON queue_entries(client_ref);
                "#,
            )
            .map_err(|e| unavailable(&self.inner.base_path, e))?;

        Ok(())
    }

    /// Write the version file, or refuse a store written by a newer schema
    fn check_version(&self) -> Result<()> {
        let version_path = self.inner.base_path.join(".version");
        if !version_path.exists() {
            fs::write(&version_path, CURRENT_VERSION.to_string()).map_err(|e| unavailable(&version_path, e))?;
            return Ok(());
        }

        let raw = fs::read_to_string(&version_path).map_err(|e| unavailable(&version_path, e))?;
        let version: u32 = raw.trim().parse().map_err(|_| StoreError::Unavailable {
            path: version_path.clone(),
            reason: format!("unreadable store version: {:?}", raw.trim()),
        })?;

        if version > CURRENT_VERSION {
            return Err(StoreError::Unavailable {
                path: version_path,
                reason: format!("store version {} is newer than supported {}", version, CURRENT_VERSION),
            });
        }

        Ok(())
    }

    // ========================================================================
    // Queue API
    // ========================================================================

    /// Append an entry. Durable once this returns.
    ///
    /// A `client_ref` that is already queued is refused as an invalid entry.
    pub fn enqueue(&self, entry: NewEntry) -> Result<EntryId> {
        match self.insert(&entry, "INSERT")? {
            Some(id) => Ok(id),
            None => Err(StoreError::InvalidEntry(format!(
                "client_ref {} is already queued",
                entry.client_ref
            ))),
        }
    }

    /// Append an entry unless one with the same `client_ref` is already queued.
    ///
    /// Returns `None` when the entry was skipped.
    pub fn enqueue_if_absent(&self, entry: NewEntry) -> Result<Option<EntryId>> {
        self.insert(&entry, "INSERT OR IGNORE")
    }

    fn insert(&self, entry: &NewEntry, verb: &str) -> Result<Option<EntryId>> {
        entry.validate()?;

        let payload_json = serde_json::to_string(&entry.payload)?;

        let mut db = self.db()?;
        let tx = db
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::sqlite("enqueue"))?;

        let sql = format!(
            "{} INTO queue_entries (kind, payload_json, client_ref, enqueued_at) VALUES (?1, ?2, ?3, ?4)",
            verb
        );
        let inserted = match tx.execute(
            &sql,
            rusqlite::params![entry.kind.as_str(), payload_json, entry.client_ref, entry.enqueued_at],
        ) {
            Ok(n) => n,
            Err(e) if e.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation) => 0,
            Err(e) => return Err(StoreError::sqlite("enqueue")(e)),
        };

        if inserted == 0 {
            debug!(client_ref = %entry.client_ref, "Entry already queued");
            return Ok(None);
        }

        let id = tx.last_insert_rowid();
        tx.commit().map_err(StoreError::sqlite("enqueue"))?;

        debug!(id, kind = %entry.kind, "Enqueued entry");
        Ok(Some(id))
    }

    /// All pending entries in replay order (oldest first)
    pub fn list_all(&self) -> Result<Vec<QueueEntry>> {
        let db = self.db()?;
        let mut stmt = db
            .prepare(
                "SELECT id, kind, payload_json, client_ref, enqueued_at
                 FROM queue_entries ORDER BY enqueued_at ASC, id ASC",
            )
            .map_err(StoreError::sqlite("list_all"))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .map_err(StoreError::sqlite("list_all"))?;

        let mut results = Vec::new();
        for row_result in rows {
            let (id, kind, payload_json, client_ref, enqueued_at) = row_result.map_err(StoreError::sqlite("list_all"))?;
            results.push(QueueEntry {
                id,
                kind: kind.parse::<MutationKind>()?,
                payload: serde_json::from_str(&payload_json)?,
                client_ref,
                enqueued_at,
            });
        }

        Ok(results)
    }

    /// Get one entry by id
    pub fn get(&self, id: EntryId) -> Result<Option<QueueEntry>> {
        let db = self.db()?;
        let row = db
            .query_row(
                "SELECT kind, payload_json, client_ref, enqueued_at FROM queue_entries WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(StoreError::sqlite("get"))?;

        match row {
            Some((kind, payload_json, client_ref, enqueued_at)) => Ok(Some(QueueEntry {
                id,
                kind: kind.parse()?,
                payload: serde_json::from_str(&payload_json)?,
                client_ref,
                enqueued_at,
            })),
            None => Ok(None),
        }
    }

    /// Number of pending entries
    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .db()?
            .query_row("SELECT COUNT(*) FROM queue_entries", [], |row| row.get(0))
            .map_err(StoreError::sqlite("count"))?;
        Ok(count as usize)
    }

    /// Remove an entry. Removing an absent id is not an error.
    pub fn remove_by_id(&self, id: EntryId) -> Result<()> {
        let removed = self
            .db()?
            .execute("DELETE FROM queue_entries WHERE id = ?1", [id])
            .map_err(StoreError::sqlite("remove_by_id"))?;

        if removed == 0 {
            debug!(id, "Entry already gone");
        }
        Ok(())
    }

    /// Ids currently queued, in replay order
    pub fn snapshot_ids(&self) -> Result<Vec<EntryId>> {
        let db = self.db()?;
        let mut stmt = db
            .prepare("SELECT id FROM queue_entries ORDER BY enqueued_at ASC, id ASC")
            .map_err(StoreError::sqlite("snapshot_ids"))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .map_err(StoreError::sqlite("snapshot_ids"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::sqlite("snapshot_ids"))?;
        Ok(ids)
    }

    /// Remove exactly the given ids in one transaction. Returns how many existed.
    pub fn remove_many(&self, ids: &[EntryId]) -> Result<usize> {
        let mut db = self.db()?;
        let tx = db
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::sqlite("remove_many"))?;

        let mut removed = 0;
        {
            let mut stmt = tx
                .prepare("DELETE FROM queue_entries WHERE id = ?1")
                .map_err(StoreError::sqlite("remove_many"))?;
            for id in ids {
                removed += stmt.execute([id]).map_err(StoreError::sqlite("remove_many"))?;
            }
        }

        tx.commit().map_err(StoreError::sqlite("remove_many"))?;
        Ok(removed)
    }

    /// Remove everything queued at the time of the call.
    ///
    /// Takes a snapshot of ids and deletes by id, so an entry enqueued by
    /// another caller after the snapshot survives.
    pub fn clear_all(&self) -> Result<usize> {
        let ids = self.snapshot_ids()?;
        let removed = self.remove_many(&ids)?;
        info!(removed, "Cleared queue");
        Ok(removed)
    }

    // ========================================================================
    // Cross-context drain exclusion
    // ========================================================================

    fn drain_lock_file(&self) -> Result<File> {
        let path = self.inner.base_path.join("drain.lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        Ok(file)
    }

    /// Block until this context holds the drain lock
    pub fn lock_drain(&self) -> Result<DrainLock> {
        let file = self.drain_lock_file()?;
        file.lock_exclusive()?;
        Ok(DrainLock { file })
    }

    /// Take the drain lock if nobody else holds it
    pub fn try_lock_drain(&self) -> Result<Option<DrainLock>> {
        let file = self.drain_lock_file()?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(DrainLock { file })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn unavailable(path: &Path, err: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}
