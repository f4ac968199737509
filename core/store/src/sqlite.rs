//! SQLite-backed durable queue store.
//!
//! Persists pending actions in a single table so they survive process
//! restarts, with a second table holding the recent drops. Every statement
//! runs on the blocking thread pool behind a mutex, which serializes access
//! from interleaved async callers.
//!
//! A row that cannot be decoded (a type this build does not know, a
//! corrupt payload or priority) is moved to the drop history as soon as it
//! is read, so one bad row never blocks the rest of the queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use outbox_common::{ActionId, ActionType, DropReason, DroppedAction, Error, PendingAction, Priority, Result};

use crate::store::{QueueStore, DEFAULT_DROP_HISTORY};

/// Schema version recorded in `PRAGMA user_version`.
const SCHEMA_VERSION: i64 = 2;

const SELECT_COLUMNS: &str =
    "SELECT seq, id, action_type, payload, enqueued_at, retry_count, priority FROM pending_actions";

/// Durable queue store using SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    drop_history: usize,
}

impl SqliteStore {
    /// Create or open a queue database.
    ///
    /// Parent directories are created as needed. Rows that cannot be
    /// decoded are moved to the drop history.
    ///
    /// # Errors
    /// - Directory creation, database open or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path).map_err(storage_err)?;
        let store = Self::init(conn)?;
        info!("Queue database opened at {}", db_path.display());
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::init(conn)
    }

    /// Keep at most `limit` drops.
    ///
    /// Older drops already stored are pruned on the next recorded drop and
    /// are never returned by [`QueueStore::recent_drops`].
    pub fn with_drop_history(mut self, limit: usize) -> Self {
        self.drop_history = limit;
        self
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS pending_actions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                action_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                enqueued_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                priority INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_pending_actions_type
                ON pending_actions(action_type);
            CREATE INDEX IF NOT EXISTS idx_pending_actions_priority
                ON pending_actions(priority DESC, seq ASC);

            CREATE TABLE IF NOT EXISTS dropped_actions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                action_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                reason TEXT NOT NULL,
                dropped_at TEXT NOT NULL
            );
            "#,
        )
        .map_err(storage_err)?;

        conn.execute_batch(&format!("PRAGMA user_version = {};", SCHEMA_VERSION))
            .map_err(storage_err)?;

        let readable = query_actions(&conn, SELECT_COLUMNS, [], DEFAULT_DROP_HISTORY)?;
        debug!("{} queued actions on open", readable.len());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            drop_history: DEFAULT_DROP_HISTORY,
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| Error::Storage("queue database lock poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| Error::Storage(format!("queue database task failed: {}", e)))?
    }
}

fn storage_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

fn row_to_action(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        seq: row.get(0)?,
        id: row.get(1)?,
        action_type: row.get(2)?,
        payload: row.get(3)?,
        enqueued_at: row.get(4)?,
        retry_count: row.get(5)?,
        priority: row.get(6)?,
    })
}

/// Row as stored, before decoding into the domain type.
struct RawRow {
    seq: i64,
    id: String,
    action_type: String,
    payload: String,
    enqueued_at: String,
    retry_count: i64,
    priority: i64,
}

impl RawRow {
    fn decode(&self) -> Result<PendingAction> {
        let enqueued_at = DateTime::parse_from_rfc3339(&self.enqueued_at)
            .map_err(|e| Error::Serialization(format!("bad enqueued_at for {}: {}", self.id, e)))?
            .with_timezone(&Utc);
        let retry_count = u32::try_from(self.retry_count)
            .map_err(|_| Error::InvalidInput(format!("Invalid retry count: {}", self.retry_count)))?;
        let priority = u8::try_from(self.priority)
            .map_err(|_| Error::InvalidInput(format!("Invalid priority value: {}", self.priority)))?;

        Ok(PendingAction {
            id: ActionId::new(self.id.clone())?,
            action_type: self.action_type.parse()?,
            payload: serde_json::from_str(&self.payload)?,
            enqueued_at,
            retry_count,
            priority: Priority::try_from(priority)?,
        })
    }

    /// Drop record for a row that failed to decode.
    fn into_unreadable(self, err: &Error) -> Result<DroppedAction> {
        let id = ActionId::new(self.id).or_else(|_| ActionId::new(format!("row-{}", self.seq)))?;
        let payload = serde_json::from_str(&self.payload).unwrap_or(Value::String(self.payload));
        Ok(DroppedAction {
            id,
            action_type: self.action_type,
            payload,
            retry_count: u32::try_from(self.retry_count).unwrap_or(0),
            reason: DropReason::Unreadable {
                detail: err.to_string(),
            },
            dropped_at: Utc::now(),
        })
    }
}

/// Run a select over `pending_actions`, moving undecodable rows to the
/// drop history.
fn query_actions(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    drop_history: usize,
) -> Result<Vec<PendingAction>> {
    let rows = {
        let mut stmt = conn.prepare(sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(params, row_to_action)
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;
        rows
    };

    let mut actions = Vec::with_capacity(rows.len());
    for raw in rows {
        match raw.decode() {
            Ok(action) => actions.push(action),
            Err(e) => {
                let seq = raw.seq;
                let dropped = raw.into_unreadable(&e)?;
                warn!("Dropping unreadable queued action {} ({}): {}", dropped.id, dropped.action_type, e);
                let tx = conn.unchecked_transaction().map_err(storage_err)?;
                tx.execute("DELETE FROM pending_actions WHERE seq = ?1", [seq])
                    .map_err(storage_err)?;
                insert_drop(&tx, &dropped, drop_history)?;
                tx.commit().map_err(storage_err)?;
            }
        }
    }
    Ok(actions)
}

/// Append a drop and prune the history to `drop_history` entries.
fn insert_drop(conn: &Connection, dropped: &DroppedAction, drop_history: usize) -> Result<()> {
    if drop_history == 0 {
        return Ok(());
    }
    conn.execute(
        r#"
        INSERT INTO dropped_actions
        (id, action_type, payload, retry_count, reason, dropped_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            dropped.id.as_str(),
            dropped.action_type,
            serde_json::to_string(&dropped.payload)?,
            dropped.retry_count,
            serde_json::to_string(&dropped.reason)?,
            dropped.dropped_at.to_rfc3339(),
        ],
    )
    .map_err(storage_err)?;
    conn.execute(
        "DELETE FROM dropped_actions WHERE seq NOT IN (SELECT seq FROM dropped_actions ORDER BY seq DESC LIMIT ?1)",
        [drop_history as i64],
    )
    .map_err(storage_err)?;
    Ok(())
}

/// Drop history row as stored.
struct RawDrop {
    id: String,
    action_type: String,
    payload: String,
    retry_count: u32,
    reason: String,
    dropped_at: String,
}

impl RawDrop {
    fn decode(self) -> Result<DroppedAction> {
        let dropped_at = DateTime::parse_from_rfc3339(&self.dropped_at)
            .map_err(|e| Error::Serialization(format!("bad dropped_at for {}: {}", self.id, e)))?
            .with_timezone(&Utc);
        Ok(DroppedAction {
            id: ActionId::new(self.id)?,
            action_type: self.action_type,
            payload: serde_json::from_str(&self.payload)?,
            retry_count: self.retry_count,
            reason: serde_json::from_str(&self.reason)?,
            dropped_at,
        })
    }
}

#[async_trait]
impl QueueStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn add(&self, action: &PendingAction) -> Result<()> {
        let action = action.clone();
        let payload = serde_json::to_string(&action.payload)?;
        self.with_conn(move |conn| {
            debug!("Inserting action {} ({})", action.id, action.action_type);
            conn.execute(
                r#"
                INSERT INTO pending_actions
                (id, action_type, payload, enqueued_at, retry_count, priority)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    action.id.as_str(),
                    action.action_type.as_str(),
                    payload,
                    action.enqueued_at.to_rfc3339(),
                    action.retry_count,
                    action.priority.value(),
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(ref f, _) if f.code == ErrorCode::ConstraintViolation => {
                    Error::AlreadyExists(format!("Action {} is already queued", action.id))
                }
                other => storage_err(other),
            })?;
            Ok(())
        })
        .await
    }

    async fn get_all(&self) -> Result<Vec<PendingAction>> {
        let keep = self.drop_history;
        self.with_conn(move |conn| query_actions(conn, SELECT_COLUMNS, [], keep))
            .await
    }

    async fn get_all_by_priority(&self) -> Result<Vec<PendingAction>> {
        let keep = self.drop_history;
        self.with_conn(move |conn| {
            let sql = format!("{} ORDER BY priority DESC, seq ASC", SELECT_COLUMNS);
            query_actions(conn, &sql, [], keep)
        })
        .await
    }

    async fn get_by_type(&self, action_type: ActionType) -> Result<Vec<PendingAction>> {
        let keep = self.drop_history;
        self.with_conn(move |conn| {
            let sql = format!("{} WHERE action_type = ?1 ORDER BY seq ASC", SELECT_COLUMNS);
            query_actions(conn, &sql, [action_type.as_str()], keep)
        })
        .await
    }

    async fn delete(&self, id: &ActionId) -> Result<()> {
        let id = id.clone();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM pending_actions WHERE id = ?1", [id.as_str()])
                .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    async fn put(&self, action: &PendingAction) -> Result<()> {
        let action = action.clone();
        let payload = serde_json::to_string(&action.payload)?;
        self.with_conn(move |conn| {
            // UPDATE rather than REPLACE: REPLACE would allocate a new seq.
            let updated = conn
                .execute(
                    r#"
                    UPDATE pending_actions
                    SET action_type = ?2, payload = ?3, enqueued_at = ?4,
                        retry_count = ?5, priority = ?6
                    WHERE id = ?1
                    "#,
                    params![
                        action.id.as_str(),
                        action.action_type.as_str(),
                        payload,
                        action.enqueued_at.to_rfc3339(),
                        action.retry_count,
                        action.priority.value(),
                    ],
                )
                .map_err(storage_err)?;
            if updated == 0 {
                return Err(Error::NotFound(format!("Action not queued: {}", action.id)));
            }
            Ok(())
        })
        .await
    }

    async fn count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let count: Option<i64> = conn
                .query_row("SELECT COUNT(*) FROM pending_actions", [], |row| row.get(0))
                .optional()
                .map_err(storage_err)?;
            Ok(count.unwrap_or(0) as usize)
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM pending_actions", [])
                .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    async fn record_drop(&self, dropped: &DroppedAction) -> Result<()> {
        let dropped = dropped.clone();
        let keep = self.drop_history;
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().map_err(storage_err)?;
            tx.execute("DELETE FROM pending_actions WHERE id = ?1", [dropped.id.as_str()])
                .map_err(storage_err)?;
            insert_drop(&tx, &dropped, keep)?;
            tx.commit().map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    async fn recent_drops(&self) -> Result<Vec<DroppedAction>> {
        let keep = self.drop_history as i64;
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT id, action_type, payload, retry_count, reason, dropped_at FROM (
                        SELECT * FROM dropped_actions ORDER BY seq DESC LIMIT ?1
                    ) ORDER BY seq ASC
                    "#,
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map([keep], |row| {
                    Ok(RawDrop {
                        id: row.get(0)?,
                        action_type: row.get(1)?,
                        payload: row.get(2)?,
                        retry_count: row.get(3)?,
                        reason: row.get(4)?,
                        dropped_at: row.get(5)?,
                    })
                })
                .map_err(storage_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_err)?;

            let mut drops = Vec::with_capacity(rows.len());
            for raw in rows {
                match raw.decode() {
                    Ok(dropped) => drops.push(dropped),
                    Err(e) => warn!("Skipping unreadable drop record: {}", e),
                }
            }
            Ok(drops)
        })
        .await
    }

    async fn clear_drops(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM dropped_actions", [])
                .map_err(storage_err)?;
            Ok(())
        })
        .await
    }
}
