use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use tokio_rusqlite::Connection;

use crate::record::{ExecutionRecord, ExecutionStatus, RecordError};
use crate::store::{
    ChangeNotifier, ChangeQuery, PlanFrame, StateStore, StoreChange, StoreError, Subscription,
};

/// Async SQLite-backed state store.
///
/// Records keep the queried fields in columns and the full record as JSON
/// in `body`, so adding record fields never needs a migration.
pub struct SqliteStore {
    conn: Connection,
    notifier: ChangeNotifier,
}

enum UpdateCheck {
    Applied,
    Missing,
    Rejected(ExecutionStatus),
}

impl SqliteStore {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self {
            conn,
            notifier: ChangeNotifier::new(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self {
            conn,
            notifier: ChangeNotifier::new(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS kv (
                        key        TEXT PRIMARY KEY,
                        value      TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS execution_records (
                        id                TEXT PRIMARY KEY,
                        run_id            TEXT NOT NULL,
                        node_path         TEXT NOT NULL,
                        status            TEXT NOT NULL,
                        result            TEXT,
                        result_structured TEXT,
                        error             TEXT,
                        tokens_input      INTEGER NOT NULL DEFAULT 0,
                        tokens_output     INTEGER NOT NULL DEFAULT 0,
                        duration_ms       INTEGER NOT NULL DEFAULT 0,
                        created_at        TEXT NOT NULL,
                        body              TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_records_run ON execution_records(run_id);

                    CREATE TABLE IF NOT EXISTS frames (
                        run_id     TEXT NOT NULL,
                        sequence   INTEGER NOT NULL,
                        xml        TEXT NOT NULL,
                        created_at TEXT NOT NULL,
                        PRIMARY KEY (run_id, sequence)
                    );
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    fn record_change(record: &ExecutionRecord) -> StoreChange {
        StoreChange::Record {
            id: record.id.clone(),
            run_id: record.run_id.clone(),
            status: record.status,
        }
    }
}

/// Column values for one record row.
struct RecordRow {
    id: String,
    run_id: String,
    node_path: String,
    status: String,
    result: Option<String>,
    result_structured: Option<String>,
    error: Option<String>,
    tokens_input: i64,
    tokens_output: i64,
    duration_ms: i64,
    created_at: String,
    body: String,
}

impl RecordRow {
    fn from_record(record: &ExecutionRecord) -> Result<Self, StoreError> {
        Ok(Self {
            id: record.id.clone(),
            run_id: record.run_id.clone(),
            node_path: record.node_path.clone(),
            status: record.status.as_str().to_string(),
            result: record.result.clone(),
            result_structured: record.result_structured.as_ref().map(Value::to_string),
            error: record.error.clone(),
            tokens_input: record.usage.input_tokens as i64,
            tokens_output: record.usage.output_tokens as i64,
            duration_ms: record.duration_ms as i64,
            created_at: record.created_at.to_rfc3339(),
            body: serde_json::to_string(record)?,
        })
    }
}

fn decode_bodies(bodies: Vec<String>) -> Result<Vec<ExecutionRecord>, StoreError> {
    bodies
        .iter()
        .map(|b| serde_json::from_str(b).map_err(StoreError::from))
        .collect()
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let key = key.to_string();
        let raw: Option<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT value FROM kv WHERE key = ?1")?;
                let mut rows = stmt.query(rusqlite::params![key])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get(0)?)),
                    None => Ok(None),
                }
            })
            .await?;
        raw.map(|r| serde_json::from_str(&r).map_err(StoreError::from))
            .transpose()
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let owned = key.to_string();
        let raw = value.to_string();
        let now = chrono::Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at",
                    rusqlite::params![owned, raw, now],
                )?;
                Ok(())
            })
            .await?;
        self.notifier.notify(StoreChange::Key {
            key: key.to_string(),
        });
        Ok(())
    }

    async fn snapshot(&self) -> Result<BTreeMap<String, Value>, StoreError> {
        let rows: Vec<(String, String)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT key, value FROM kv")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter()
            .map(|(k, v)| -> Result<(String, Value), StoreError> {
                Ok((k, serde_json::from_str(&v)?))
            })
            .collect()
    }

    async fn insert_record(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let row = RecordRow::from_record(record)?;
        let inserted = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "INSERT OR IGNORE INTO execution_records (id, run_id, node_path, status,
                        result, result_structured, error, tokens_input, tokens_output,
                        duration_ms, created_at, body)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                    rusqlite::params![
                        row.id,
                        row.run_id,
                        row.node_path,
                        row.status,
                        row.result,
                        row.result_structured,
                        row.error,
                        row.tokens_input,
                        row.tokens_output,
                        row.duration_ms,
                        row.created_at,
                        row.body,
                    ],
                )?;
                Ok(n == 1)
            })
            .await?;
        if !inserted {
            return Err(StoreError::DuplicateRecord(record.id.clone()));
        }
        self.notifier.notify(Self::record_change(record));
        Ok(())
    }

    async fn update_record(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let row = RecordRow::from_record(record)?;
        let next = record.status;
        let check = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current: Option<String> = {
                    let mut stmt =
                        tx.prepare("SELECT status FROM execution_records WHERE id = ?1")?;
                    let mut rows = stmt.query(rusqlite::params![row.id])?;
                    match rows.next()? {
                        Some(r) => Some(r.get(0)?),
                        None => None,
                    }
                };
                let Some(current) = current else {
                    return Ok(UpdateCheck::Missing);
                };
                let current = ExecutionStatus::parse(&current).unwrap_or(ExecutionStatus::Pending);
                if current != next && !current.can_transition_to(&next) {
                    return Ok(UpdateCheck::Rejected(current));
                }
                tx.execute(
                    "UPDATE execution_records SET status=?2, result=?3, result_structured=?4,
                        error=?5, tokens_input=?6, tokens_output=?7, duration_ms=?8, body=?9
                     WHERE id=?1",
                    rusqlite::params![
                        row.id,
                        row.status,
                        row.result,
                        row.result_structured,
                        row.error,
                        row.tokens_input,
                        row.tokens_output,
                        row.duration_ms,
                        row.body,
                    ],
                )?;
                tx.commit()?;
                Ok(UpdateCheck::Applied)
            })
            .await?;

        match check {
            UpdateCheck::Applied => {
                self.notifier.notify(Self::record_change(record));
                Ok(())
            }
            UpdateCheck::Missing => Err(StoreError::RecordNotFound(record.id.clone())),
            UpdateCheck::Rejected(from) => Err(StoreError::Transition(
                RecordError::InvalidTransition {
                    id: record.id.clone(),
                    from,
                    to: next,
                },
            )),
        }
    }

    async fn get_record(&self, id: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        let id = id.to_string();
        let body: Option<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT body FROM execution_records WHERE id = ?1")?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get(0)?)),
                    None => Ok(None),
                }
            })
            .await?;
        body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
            .transpose()
    }

    async fn records_for_run(&self, run_id: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
        let run_id = run_id.to_string();
        let bodies: Vec<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT body FROM execution_records WHERE run_id = ?1
                     ORDER BY created_at ASC, rowid ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![run_id], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(rows)
            })
            .await?;
        decode_bodies(bodies)
    }

    async fn save_frame(&self, frame: &PlanFrame) -> Result<(), StoreError> {
        let run_id = frame.run_id.clone();
        let sequence = frame.sequence as i64;
        let xml = frame.xml.clone();
        let created_at = frame.created_at.to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO frames (run_id, sequence, xml, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![run_id, sequence, xml, created_at],
                )?;
                Ok(())
            })
            .await?;
        self.notifier.notify(StoreChange::Frame {
            run_id: frame.run_id.clone(),
            sequence: frame.sequence,
        });
        Ok(())
    }

    async fn latest_frame(&self, run_id: &str) -> Result<Option<PlanFrame>, StoreError> {
        let run_id = run_id.to_string();
        let row: Option<(String, i64, String, String)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT run_id, sequence, xml, created_at FROM frames
                     WHERE run_id = ?1 ORDER BY sequence DESC LIMIT 1",
                )?;
                let mut rows = stmt.query(rusqlite::params![run_id])?;
                match rows.next()? {
                    Some(r) => Ok(Some((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(row.map(|(run_id, sequence, xml, created_at)| PlanFrame {
            run_id,
            sequence: sequence.max(0) as u64,
            xml,
            created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                .map(|d| d.with_timezone(&chrono::Utc))
                .unwrap_or_else(|_| chrono::Utc::now()),
        }))
    }

    fn subscribe(&self, query: ChangeQuery) -> Subscription {
        self.notifier.subscribe(query)
    }
}
