use std::path::Path;

use chrono::{DateTime, Utc};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::crypto::EncryptedCredential;
use crate::repository::{InstanceRepository, RepositoryError, RepositoryStats, Result};
use crate::types::{AssistantSettings, InstanceConfig, InstanceRecord, InstanceStatus};

/// Async SQLite-backed [`InstanceRepository`].
pub struct SqliteRepository {
    conn: Connection,
}

/// Column values as stored, decoded outside the connection thread.
struct RawRow {
    id: String,
    name: String,
    credential: String,
    channels: String,
    assistant: Option<String>,
    rate_limit: i64,
    status: String,
    created_at: String,
    updated_at: String,
}

const SELECT_COLUMNS: &str = "SELECT id, name, credential, channels, assistant, rate_limit,
                                     status, created_at, updated_at
                              FROM instances";

impl SqliteRepository {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS instances (
                        id          TEXT PRIMARY KEY,
                        name        TEXT NOT NULL,
                        credential  TEXT NOT NULL,
                        channels    TEXT NOT NULL,
                        assistant   TEXT,
                        rate_limit  INTEGER NOT NULL,
                        status      TEXT NOT NULL,
                        created_at  TEXT NOT NULL,
                        updated_at  TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_instances_status ON instances(status);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl InstanceRepository for SqliteRepository {
    async fn save(&self, config: &InstanceConfig) -> Result<()> {
        let id = config.id.to_string();
        let name = config.name.clone();
        let credential = to_json(&config.credential)?;
        let channels = to_json(&config.channels)?;
        let assistant = config.assistant.as_ref().map(to_json).transpose()?;
        let rate_limit = i64::from(config.rate_limit_per_minute);
        let status = InstanceStatus::Registered.as_str();
        let created_at = config.created_at.to_rfc3339();
        let updated_at = config.updated_at.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO instances (id, name, credential, channels, assistant,
                        rate_limit, status, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
                     ON CONFLICT(id) DO UPDATE SET
                        name=excluded.name, credential=excluded.credential,
                        channels=excluded.channels, assistant=excluded.assistant,
                        rate_limit=excluded.rate_limit, updated_at=excluded.updated_at",
                    rusqlite::params![
                        id, name, credential, channels, assistant, rate_limit, status,
                        created_at, updated_at,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<InstanceRecord>> {
        let id_str = id.to_string();
        let raw = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(read_row(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        raw.map(decode_row).transpose()
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let id_str = id.to_string();
        let affected = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM instances WHERE id = ?1",
                    rusqlite::params![id_str],
                )?;
                Ok(n)
            })
            .await?;
        Ok(affected > 0)
    }

    async fn list_all(&self) -> Result<Vec<InstanceRecord>> {
        let raw = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY created_at ASC"))?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(read_row(row)?);
                }
                Ok(out)
            })
            .await?;
        raw.into_iter().map(decode_row).collect()
    }

    async fn update_status(&self, id: Uuid, status: InstanceStatus) -> Result<()> {
        let id_str = id.to_string();
        let status = status.as_str();
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE instances SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id_str, status, now],
                )?;
                Ok(n)
            })
            .await?;
        if affected == 0 {
            return Err(RepositoryError::NotFound(id));
        }
        Ok(())
    }

    async fn statistics(&self) -> Result<RepositoryStats> {
        let records = self.list_all().await?;
        Ok(RepositoryStats::from_records(records.iter()))
    }
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        name: row.get(1)?,
        credential: row.get(2)?,
        channels: row.get(3)?,
        assistant: row.get(4)?,
        rate_limit: row.get(5)?,
        status: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn decode_row(raw: RawRow) -> Result<InstanceRecord> {
    let id = Uuid::parse_str(&raw.id)
        .map_err(|e| RepositoryError::Serialization(format!("bad id `{}`: {e}", raw.id)))?;
    let credential: EncryptedCredential = from_json(&raw.credential)?;
    let channels = from_json(&raw.channels)?;
    let assistant: Option<AssistantSettings> =
        raw.assistant.as_deref().map(from_json).transpose()?;
    let rate_limit_per_minute = u32::try_from(raw.rate_limit).map_err(|_| {
        RepositoryError::Serialization(format!("bad rate limit {}", raw.rate_limit))
    })?;
    let status = raw
        .status
        .parse::<InstanceStatus>()
        .map_err(|e| RepositoryError::Serialization(e.to_string()))?;

    Ok(InstanceRecord {
        config: InstanceConfig {
            id,
            name: raw.name,
            credential,
            channels,
            assistant,
            rate_limit_per_minute,
            created_at: parse_time(&raw.created_at)?,
            updated_at: parse_time(&raw.updated_at)?,
        },
        status,
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| RepositoryError::Serialization(e.to_string()))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Serialization(format!("bad timestamp `{raw}`: {e}")))
}
