//! Persistence seam for instance configuration.
//!
//! The orchestration core never owns durable state. It talks to an
//! [`InstanceRepository`]; implementations are expected to apply their own
//! retry/backoff and only surface an error once those are exhausted.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::FleetError;
use crate::types::{InstanceConfig, InstanceRecord, InstanceStatus};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("record not found: {0}")]
    NotFound(Uuid),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<RepositoryError> for FleetError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(id) => FleetError::NotFound(id),
            other => FleetError::Storage(other.to_string()),
        }
    }
}

impl From<tokio_rusqlite::Error> for RepositoryError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        RepositoryError::Backend(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryStats {
    pub total_instances: usize,
    pub by_status: BTreeMap<String, usize>,
    pub assistant_enabled: usize,
    pub total_channels: usize,
}

impl RepositoryStats {
    pub(crate) fn from_records<'a>(records: impl Iterator<Item = &'a InstanceRecord>) -> Self {
        let mut stats = RepositoryStats::default();
        for record in records {
            stats.total_instances += 1;
            *stats
                .by_status
                .entry(record.status.as_str().to_string())
                .or_insert(0) += 1;
            if record.config.assistant_enabled() {
                stats.assistant_enabled += 1;
            }
            stats.total_channels += record.config.channels.len();
        }
        stats
    }
}

// ---------------------------------------------------------------------------
// InstanceRepository trait
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Insert or replace a config. New records start as `Registered`;
    /// replacing keeps the stored status.
    async fn save(&self, config: &InstanceConfig) -> Result<()>;

    async fn load(&self, id: Uuid) -> Result<Option<InstanceRecord>>;

    /// Returns `false` when nothing was stored under `id`.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Every stored record, oldest first.
    async fn list_all(&self) -> Result<Vec<InstanceRecord>>;

    async fn update_status(&self, id: Uuid, status: InstanceStatus) -> Result<()>;

    async fn statistics(&self) -> Result<RepositoryStats>;
}

// ---------------------------------------------------------------------------
// InMemoryRepository
// ---------------------------------------------------------------------------

/// Process-local repository; state is lost on exit.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    records: RwLock<HashMap<Uuid, InstanceRecord>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl InstanceRepository for InMemoryRepository {
    async fn save(&self, config: &InstanceConfig) -> Result<()> {
        let mut records = self.records.write().await;
        let status = records
            .get(&config.id)
            .map(|r| r.status)
            .unwrap_or(InstanceStatus::Registered);
        records.insert(
            config.id,
            InstanceRecord {
                config: config.clone(),
                status,
            },
        );
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<InstanceRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.records.write().await.remove(&id).is_some())
    }

    async fn list_all(&self) -> Result<Vec<InstanceRecord>> {
        let mut all: Vec<InstanceRecord> = self.records.read().await.values().cloned().collect();
        all.sort_by_key(|r| r.config.created_at);
        Ok(all)
    }

    async fn update_status(&self, id: Uuid, status: InstanceStatus) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(RepositoryError::NotFound(id))?;
        record.status = status;
        Ok(())
    }

    async fn statistics(&self) -> Result<RepositoryStats> {
        let records = self.records.read().await;
        Ok(RepositoryStats::from_records(records.values()))
    }
}
