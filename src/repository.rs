// Secondary store for detail records: fallback source and sync target

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use crate::{error::ApiError, models::GameDetailRecord};

#[async_trait]
pub trait GameRepository: Send + Sync {
    async fn find_by_external_id(&self, id: u64) -> Result<Option<GameDetailRecord>, ApiError>;

    // Inserts or replaces the record and returns what was stored
    async fn upsert(&self, record: GameDetailRecord) -> Result<GameDetailRecord, ApiError>;
}

// Never synced, or synced longer ago than `threshold`
pub fn is_stale(record: &GameDetailRecord, threshold: Duration) -> bool {
    let Some(synced) = record.last_synced else {
        return true;
    };
    match chrono::Duration::from_std(threshold) {
        Ok(threshold) => Utc::now().signed_duration_since(synced) > threshold,
        Err(_) => false,
    }
}

#[derive(Debug, Default)]
pub struct InMemoryGameRepository {
    records: DashMap<u64, GameDetailRecord>,
}

impl InMemoryGameRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl GameRepository for InMemoryGameRepository {
    async fn find_by_external_id(&self, id: u64) -> Result<Option<GameDetailRecord>, ApiError> {
        Ok(self.records.get(&id).map(|r| r.value().clone()))
    }

    async fn upsert(&self, record: GameDetailRecord) -> Result<GameDetailRecord, ApiError> {
        self.records.insert(record.id, record.clone());
        Ok(record)
    }
}
