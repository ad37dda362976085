//! SQLite member join/leave log.
//!
//! One table, `member_events(guild_id, user_id, kind, at)`. Snowflakes are
//! stored as `INTEGER` (bit-cast to `i64`) and times as Unix milliseconds.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::types::{GuildId, UserId};

pub const DEFAULT_DB_PATH: &str = "data/chad.db";

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS member_events (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    guild_id INTEGER NOT NULL,
    user_id  INTEGER NOT NULL,
    kind     TEXT    NOT NULL,
    at       INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_member_events_guild ON member_events (guild_id, at);
";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    Sqlx(sqlx::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "database directory error: {}", e),
            StorageError::Sqlx(e) => write!(f, "database error: {}", e),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            StorageError::Sqlx(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Sqlx(e)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberEventKind {
    Joined,
    Left,
}

impl MemberEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MemberEventKind::Joined => "join",
            MemberEventKind::Left => "leave",
        }
    }
}

// ---------------------------------------------------------------------------
// MemberLog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MemberLog {
    pool: SqlitePool,
}

impl MemberLog {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let log = Self { pool };
        log.migrate().await?;
        info!(path = %path.display(), "member log opened");
        Ok(log)
    }

    /// A private in-memory database. Pinned to one connection that never
    /// expires, since each SQLite memory connection is its own database.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let log = Self { pool };
        log.migrate().await?;
        Ok(log)
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn record(
        &self,
        guild: GuildId,
        user: UserId,
        kind: MemberEventKind,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO member_events (guild_id, user_id, kind, at) VALUES (?, ?, ?, ?)")
            .bind(guild.get() as i64)
            .bind(user.get() as i64)
            .bind(kind.as_str())
            .bind(at.timestamp_millis())
            .execute(&self.pool)
            .await?;
        debug!(guild = %guild, user = %user, kind = kind.as_str(), "member event recorded");
        Ok(())
    }

    pub async fn record_join(&self, guild: GuildId, user: UserId) -> Result<(), StorageError> {
        self.record(guild, user, MemberEventKind::Joined, Utc::now())
            .await
    }

    pub async fn record_leave(&self, guild: GuildId, user: UserId) -> Result<(), StorageError> {
        self.record(guild, user, MemberEventKind::Left, Utc::now())
            .await
    }

    pub async fn count(&self, guild: GuildId, kind: MemberEventKind) -> Result<u64, StorageError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM member_events WHERE guild_id = ? AND kind = ?")
                .bind(guild.get() as i64)
                .bind(kind.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
