//! Weft Layered Transport - Persistent Message Log
//!
//! Append-only ordered store backing the polling transport and the
//! signaling hub's envelope persistence. Entries are immutable once
//! appended; retrieval is indexed by (room, kind, timestamp).

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use thiserror::Error;

use crate::wlt_transport::unix_seconds;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// Schema
// =============================================================================

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS events (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        room      TEXT    NOT NULL,
        peer_id   TEXT    NOT NULL,
        timestamp INTEGER NOT NULL,
        kind      TEXT    NOT NULL,
        payload   BLOB    NOT NULL,
        filename  TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_events_room_kind_ts
        ON events(room, kind, timestamp)",
    "CREATE TABLE IF NOT EXISTS peers (
        peer_id   TEXT PRIMARY KEY,
        last_seen INTEGER NOT NULL
    )",
];

// =============================================================================
// Log Entry
// =============================================================================

/// One appended event. `filename` is set only for file-transfer payloads.
#[derive(Clone, Debug, FromRow)]
pub struct LogEntry {
    pub room: String,
    pub peer_id: String,
    pub timestamp: i64,
    pub kind: String,
    pub payload: Vec<u8>,
    pub filename: Option<String>,
}

// =============================================================================
// Message Store
// =============================================================================

/// SQLite-backed message log. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    /// Opens (or creates) the log at `path` and applies the schema.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::migrate(&pool).await?;
        log::info!("message log opened at {}", path.display());
        Ok(Self { pool })
    }

    /// Volatile store for tests. A single connection keeps the in-memory
    /// database alive and shared.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(sqlx::Error::from)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> StoreResult<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(pool).await?;
        }
        Ok(())
    }

    /// Appends an event stamped with server time and returns the stamp.
    pub async fn append(
        &self,
        room: &str,
        peer_id: &str,
        kind: &str,
        payload: &[u8],
        filename: Option<&str>,
    ) -> StoreResult<i64> {
        let timestamp = unix_seconds();
        self.append_at(room, peer_id, kind, payload, filename, timestamp)
            .await?;
        Ok(timestamp)
    }

    pub(crate) async fn append_at(
        &self,
        room: &str,
        peer_id: &str,
        kind: &str,
        payload: &[u8],
        filename: Option<&str>,
        timestamp: i64,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO events(room, peer_id, timestamp, kind, payload, filename)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(room)
        .bind(peer_id)
        .bind(timestamp)
        .bind(kind)
        .bind(payload)
        .bind(filename)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Entries of `kind` in `room` strictly newer than `since`, ascending
    /// by timestamp.
    pub async fn read(&self, room: &str, kind: &str, since: i64) -> StoreResult<Vec<LogEntry>> {
        let entries = sqlx::query_as::<_, LogEntry>(
            "SELECT room, peer_id, timestamp, kind, payload, filename
             FROM events
             WHERE room = ? AND kind = ? AND timestamp > ?
             ORDER BY timestamp ASC, id ASC",
        )
        .bind(room)
        .bind(kind)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    /// Records that a peer was seen now.
    pub async fn touch_peer(&self, peer_id: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO peers(peer_id, last_seen) VALUES (?, ?)
             ON CONFLICT(peer_id) DO UPDATE SET last_seen = excluded.last_seen",
        )
        .bind(peer_id)
        .bind(unix_seconds())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn peer_last_seen(&self, peer_id: &str) -> StoreResult<Option<i64>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_seen FROM peers WHERE peer_id = ?")
                .bind(peer_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(ts,)| ts))
    }
}

// =============================================================================
// Tests
// =============================================================================
