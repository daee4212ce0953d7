//! Pause session log
//!
//! SQLite-backed record of every pause session, open and closed. The store
//! is an audit log plus the restore source after a restart; the single-open-
//! session invariant is enforced by the coordinator's per-extension lock,
//! with an `active_session` recheck before each insert.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::EngineResult;

/// One pause session, open while `end_time` is `None`
#[derive(Debug, Clone, Serialize)]
pub struct PauseSession {
    pub id: Uuid,
    pub extension: String,
    pub reason_code: String,
    pub reason_label: String,
    /// Queues the agent was paused in
    pub queues: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub auto_unpaused: bool,
}

impl PauseSession {
    pub fn open_now(
        extension: impl Into<String>,
        reason_code: impl Into<String>,
        reason_label: impl Into<String>,
        queues: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            extension: extension.into(),
            reason_code: reason_code.into(),
            reason_label: reason_label.into(),
            queues,
            start_time: Utc::now(),
            end_time: None,
            duration_seconds: None,
            auto_unpaused: false,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    extension: String,
    reason_code: String,
    reason_label: String,
    queues: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    duration_seconds: Option<i64>,
    auto_unpaused: bool,
}

impl TryFrom<SessionRow> for PauseSession {
    type Error = sqlx::Error;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&row.id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let queues = serde_json::from_str(&row.queues)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        Ok(Self {
            id,
            extension: row.extension,
            reason_code: row.reason_code,
            reason_label: row.reason_label,
            queues,
            start_time: row.start_time,
            end_time: row.end_time,
            duration_seconds: row.duration_seconds,
            auto_unpaused: row.auto_unpaused,
        })
    }
}

const SELECT_COLUMNS: &str = "id, extension, reason_code, reason_label, queues, \
                              start_time, end_time, duration_seconds, auto_unpaused";

/// SQLite-backed session log
#[derive(Clone)]
pub struct PauseSessionStore {
    pool: SqlitePool,
}

impl PauseSessionStore {
    /// Open (creating if missing) and ensure the schema exists
    pub async fn connect(url: &str) -> EngineResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // A single connection keeps `sqlite::memory:` coherent and is
        // plenty for an audit log.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pause_sessions (
                id TEXT PRIMARY KEY,
                extension TEXT NOT NULL,
                reason_code TEXT NOT NULL,
                reason_label TEXT NOT NULL,
                queues TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                duration_seconds INTEGER,
                auto_unpaused INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pause_sessions_ext \
             ON pause_sessions(extension, start_time)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist a freshly opened session
    pub async fn open(&self, session: &PauseSession) -> EngineResult<()> {
        let queues = serde_json::to_string(&session.queues)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        sqlx::query(
            "INSERT INTO pause_sessions \
             (id, extension, reason_code, reason_label, queues, start_time) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(session.id.to_string())
        .bind(&session.extension)
        .bind(&session.reason_code)
        .bind(&session.reason_label)
        .bind(queues)
        .bind(session.start_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Close a session with its end time and computed duration
    pub async fn close(
        &self,
        id: Uuid,
        end_time: DateTime<Utc>,
        duration_seconds: i64,
        auto_unpaused: bool,
    ) -> EngineResult<()> {
        sqlx::query(
            "UPDATE pause_sessions \
             SET end_time = ?, duration_seconds = ?, auto_unpaused = ? \
             WHERE id = ? AND end_time IS NULL",
        )
        .bind(end_time)
        .bind(duration_seconds)
        .bind(auto_unpaused)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The open session for an extension, if any
    pub async fn active_session(&self, extension: &str) -> EngineResult<Option<PauseSession>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM pause_sessions \
             WHERE extension = ? AND end_time IS NULL \
             ORDER BY start_time DESC LIMIT 1"
        ))
        .bind(extension)
        .fetch_optional(&self.pool)
        .await?;
        row.map(PauseSession::try_from)
            .transpose()
            .map_err(Into::into)
    }

    /// All open sessions (restart restore path)
    pub async fn open_sessions(&self) -> EngineResult<Vec<PauseSession>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM pause_sessions \
             WHERE end_time IS NULL ORDER BY start_time"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| PauseSession::try_from(r).map_err(Into::into))
            .collect()
    }

    /// Recent sessions for an extension, newest first
    pub async fn history(&self, extension: &str, limit: u32) -> EngineResult<Vec<PauseSession>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM pause_sessions \
             WHERE extension = ? ORDER BY start_time DESC LIMIT ?"
        ))
        .bind(extension)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| PauseSession::try_from(r).map_err(Into::into))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> PauseSessionStore {
        PauseSessionStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn open_then_close_round_trips() {
        let store = memory_store().await;
        let session = PauseSession::open_now(
            "1016",
            "LUNCH",
            "Lunch Break",
            vec!["support".to_string(), "sales".to_string()],
        );
        store.open(&session).await.unwrap();

        let active = store.active_session("1016").await.unwrap().unwrap();
        assert_eq!(active.id, session.id);
        assert_eq!(active.queues, vec!["support", "sales"]);
        assert!(active.end_time.is_none());

        store.close(session.id, Utc::now(), 120, false).await.unwrap();
        assert!(store.active_session("1016").await.unwrap().is_none());

        let history = store.history("1016", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].duration_seconds, Some(120));
        assert!(!history[0].auto_unpaused);
    }

    #[tokio::test]
    async fn open_sessions_lists_only_unclosed() {
        let store = memory_store().await;
        let open = PauseSession::open_now("1016", "BREAK", "Short Break", vec![]);
        let closed = PauseSession::open_now("1017", "BREAK", "Short Break", vec![]);
        store.open(&open).await.unwrap();
        store.open(&closed).await.unwrap();
        store.close(closed.id, Utc::now(), 10, true).await.unwrap();

        let sessions = store.open_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].extension, "1016");
    }

    #[tokio::test]
    async fn closing_twice_is_a_no_op() {
        let store = memory_store().await;
        let session = PauseSession::open_now("1016", "BREAK", "Short Break", vec![]);
        store.open(&session).await.unwrap();
        store.close(session.id, Utc::now(), 10, true).await.unwrap();
        // Second close must not overwrite the recorded outcome.
        store.close(session.id, Utc::now(), 999, false).await.unwrap();

        let history = store.history("1016", 1).await.unwrap();
        assert_eq!(history[0].duration_seconds, Some(10));
        assert!(history[0].auto_unpaused);
    }
}
