//! SQLite-backed session store.

use crate::error::{TrackerError, TrackerResult};
use crate::store::{SessionStore, check_recordable, plan_finish};
use async_trait::async_trait;
use quilt_core::{ChunkReadiness, SessionHeader, SessionState, UploadId, UploadSession};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;

const SESSION_COLUMNS: &str = "upload_id, total_chunks, received_count, state, file_name, \
     created_at, updated_at, expires_at, failure_reason";

/// Row shape of `upload_sessions`.
#[derive(Debug, Clone, sqlx::FromRow)]
struct SessionRow {
    upload_id: String,
    total_chunks: i64,
    received_count: i64,
    state: String,
    file_name: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    expires_at: OffsetDateTime,
    failure_reason: Option<String>,
}

impl SessionRow {
    fn state(&self) -> TrackerResult<SessionState> {
        self.state
            .parse()
            .map_err(|_| TrackerError::Corrupt(format!("unknown state {:?}", self.state)))
    }

    fn total_chunks(&self) -> TrackerResult<u32> {
        u32::try_from(self.total_chunks).map_err(|_| {
            TrackerError::Corrupt(format!("total_chunks out of range: {}", self.total_chunks))
        })
    }

    fn into_header(self) -> TrackerResult<SessionHeader> {
        let state = self.state()?;
        let total_chunks = self.total_chunks()?;
        let id = UploadId::parse(&self.upload_id)
            .map_err(|e| TrackerError::Corrupt(e.to_string()))?;
        let received_count = u32::try_from(self.received_count).map_err(|_| {
            TrackerError::Corrupt(format!(
                "received_count out of range: {}",
                self.received_count
            ))
        })?;
        Ok(SessionHeader {
            id,
            total_chunks,
            received_count,
            state,
            file_name: self.file_name,
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
            failure_reason: self.failure_reason,
        })
    }

    fn into_session(self, received: BTreeSet<u32>) -> TrackerResult<UploadSession> {
        let header = self.into_header()?;
        if received.len() as u32 != header.received_count {
            return Err(TrackerError::Corrupt(format!(
                "session {} counts {} chunks but lists {}",
                header.id,
                header.received_count,
                received.len()
            )));
        }
        Ok(UploadSession {
            id: header.id,
            total_chunks: header.total_chunks,
            received,
            state: header.state,
            file_name: header.file_name,
            created_at: header.created_at,
            updated_at: header.updated_at,
            expires_at: header.expires_at,
            failure_reason: header.failure_reason,
        })
    }
}

async fn fetch_row(
    conn: &mut SqliteConnection,
    upload_id: &UploadId,
) -> TrackerResult<Option<SessionRow>> {
    let row = sqlx::query_as::<_, SessionRow>(&format!(
        "SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE upload_id = ?"
    ))
    .bind(upload_id.as_str())
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

async fn fetch_received(conn: &mut SqliteConnection, upload_id: &str) -> TrackerResult<BTreeSet<u32>> {
    let indices: Vec<i64> = sqlx::query_scalar(
        "SELECT chunk_index FROM upload_chunks WHERE upload_id = ? ORDER BY chunk_index",
    )
    .bind(upload_id)
    .fetch_all(conn)
    .await?;

    indices
        .into_iter()
        .map(|i| {
            u32::try_from(i)
                .map_err(|_| TrackerError::Corrupt(format!("chunk index out of range: {i}")))
        })
        .collect()
}

async fn load(
    conn: &mut SqliteConnection,
    upload_id: &UploadId,
) -> TrackerResult<Option<UploadSession>> {
    let Some(row) = fetch_row(&mut *conn, upload_id).await? else {
        return Ok(None);
    };
    let received = fetch_received(conn, &row.upload_id).await?;
    row.into_session(received).map(Some)
}

async fn load_rows(
    conn: &mut SqliteConnection,
    rows: Vec<SessionRow>,
) -> TrackerResult<Vec<UploadSession>> {
    let mut sessions = Vec::with_capacity(rows.len());
    for row in rows {
        let received = fetch_received(&mut *conn, &row.upload_id).await?;
        sessions.push(row.into_session(received)?);
    }
    Ok(sessions)
}

/// SQLite-based session store.
///
/// Received indices live in `upload_chunks`; `received_count` on the session
/// row makes the completeness check a single comparison.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and run migrations.
    pub async fn new(path: impl AsRef<Path>, busy_timeout_secs: u64) -> TrackerResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(busy_timeout_secs));

        let pool = SqlitePoolOptions::new()
            // One connection serializes every transaction in this process.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::debug!(path = %path.display(), "Opened SQLite session store");
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn migrate(&self) -> TrackerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS upload_sessions (
                upload_id TEXT PRIMARY KEY NOT NULL,
                total_chunks INTEGER NOT NULL CHECK (total_chunks > 0),
                received_count INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL,
                file_name TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                expires_at_unix INTEGER NOT NULL,
                failure_reason TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_upload_sessions_state ON upload_sessions (state, expires_at_unix)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS upload_chunks (
                upload_id TEXT NOT NULL REFERENCES upload_sessions (upload_id) ON DELETE CASCADE,
                chunk_index INTEGER NOT NULL,
                received_at TEXT NOT NULL,
                PRIMARY KEY (upload_id, chunk_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn health_check(&self) -> TrackerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn insert_if_absent(
        &self,
        session: UploadSession,
    ) -> TrackerResult<(SessionHeader, bool)> {
        let mut tx = self.pool.begin().await?;

        let created = sqlx::query(
            r#"
            INSERT OR IGNORE INTO upload_sessions (
                upload_id, total_chunks, received_count, state, file_name,
                created_at, updated_at, expires_at, expires_at_unix, failure_reason
            ) VALUES (?, ?, 0, ?, ?, ?, ?, ?, ?, NULL)
            "#,
        )
        .bind(session.id.as_str())
        .bind(i64::from(session.total_chunks))
        .bind(session.state.as_str())
        .bind(&session.file_name)
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(session.expires_at)
        .bind(session.expires_at.unix_timestamp())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        let stored = fetch_row(&mut tx, &session.id)
            .await?
            .ok_or_else(|| TrackerError::SessionNotFound(session.id.clone()))?
            .into_header()?;
        tx.commit().await?;
        Ok((stored, created))
    }

    async fn get(&self, upload_id: &UploadId) -> TrackerResult<Option<UploadSession>> {
        let mut conn = self.pool.acquire().await?;
        load(&mut conn, upload_id).await
    }

    async fn record_chunk(
        &self,
        upload_id: &UploadId,
        index: u32,
        now: OffsetDateTime,
    ) -> TrackerResult<ChunkReadiness> {
        let mut tx = self.pool.begin().await?;

        let row = fetch_row(&mut tx, upload_id)
            .await?
            .ok_or_else(|| TrackerError::SessionNotFound(upload_id.clone()))?;
        let total_chunks = row.total_chunks()?;
        check_recordable(
            upload_id,
            row.state()?,
            row.failure_reason.as_deref(),
            index,
            total_chunks,
        )?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO upload_chunks (upload_id, chunk_index, received_at) VALUES (?, ?, ?)",
        )
        .bind(upload_id.as_str())
        .bind(i64::from(index))
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !inserted {
            tx.commit().await?;
            return Ok(ChunkReadiness::StillOpen);
        }

        let received_count = row.received_count + 1;
        let ready = received_count >= i64::from(total_chunks);
        let next_state = if ready {
            SessionState::Merging
        } else {
            SessionState::Open
        };

        let result = sqlx::query(
            "UPDATE upload_sessions SET received_count = ?, state = ?, updated_at = ? WHERE upload_id = ? AND state = 'open'",
        )
        .bind(received_count)
        .bind(next_state.as_str())
        .bind(now)
        .bind(upload_id.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            // Row was checked open above inside this transaction.
            return Err(TrackerError::Corrupt(format!(
                "session {upload_id} changed state during record"
            )));
        }

        tx.commit().await?;
        Ok(if ready {
            ChunkReadiness::ReadyToMerge
        } else {
            ChunkReadiness::StillOpen
        })
    }

    async fn finish(
        &self,
        upload_id: &UploadId,
        to: SessionState,
        reason: Option<&str>,
        now: OffsetDateTime,
    ) -> TrackerResult<SessionHeader> {
        let mut tx = self.pool.begin().await?;

        let row = fetch_row(&mut tx, upload_id)
            .await?
            .ok_or_else(|| TrackerError::SessionNotFound(upload_id.clone()))?;
        let current = row.state()?;

        if plan_finish(current, to)? {
            let reason = if to == SessionState::Failed {
                reason
            } else {
                row.failure_reason.as_deref()
            };
            sqlx::query(
                "UPDATE upload_sessions SET state = ?, failure_reason = ?, updated_at = ? WHERE upload_id = ? AND state = ?",
            )
            .bind(to.as_str())
            .bind(reason)
            .bind(now)
            .bind(upload_id.as_str())
            .bind(current.as_str())
            .execute(&mut *tx)
            .await?;
        }

        let header = fetch_row(&mut tx, upload_id)
            .await?
            .ok_or_else(|| TrackerError::SessionNotFound(upload_id.clone()))?
            .into_header()?;
        tx.commit().await?;
        Ok(header)
    }

    async fn list_in_state(
        &self,
        state: SessionState,
        limit: u32,
    ) -> TrackerResult<Vec<UploadSession>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE state = ? ORDER BY rowid LIMIT ?"
        ))
        .bind(state.as_str())
        .bind(i64::from(limit))
        .fetch_all(&mut *conn)
        .await?;
        load_rows(&mut conn, rows).await
    }

    async fn list_expired(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> TrackerResult<Vec<UploadSession>> {
        let mut conn = self.pool.acquire().await?;
        // Second granularity in SQL, exact comparison below.
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions \
             WHERE state = 'open' AND expires_at_unix <= ? ORDER BY expires_at_unix LIMIT ?"
        ))
        .bind(now.unix_timestamp())
        .bind(i64::from(limit))
        .fetch_all(&mut *conn)
        .await?;
        let sessions = load_rows(&mut conn, rows).await?;
        Ok(sessions
            .into_iter()
            .filter(|s| s.is_expired_at(now))
            .collect())
    }
}
