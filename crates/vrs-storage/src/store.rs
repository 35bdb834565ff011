//! Storage contracts used by the sync pipeline.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;
use vrs_core::{
    ContentIdentity, EnrichmentSummary, Entity, EntityId, HistoryRecord, Review, RunLogEntry,
    SummaryUpdate, Watermark,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("persistence conflict for entity {entity_id}: {detail}")]
    PersistenceConflict { entity_id: EntityId, detail: String },
    #[error("entity {0} is locked by another writer")]
    EntityLocked(EntityId),
    #[error("entity {0} not found")]
    EntityNotFound(EntityId),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::PersistenceConflict { .. })
    }
}

/// Proof of holding the per-entity write lock. Hand it back to `unlock_entity`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityLock {
    pub entity_id: EntityId,
    pub token: Uuid,
}

impl EntityLock {
    pub fn new(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            token: Uuid::new_v4(),
        }
    }
}

/// Everything written by the persist transaction of one entity pass.
#[derive(Debug, Clone)]
pub struct ReviewBatch {
    pub entity_id: EntityId,
    pub reviews: Vec<Review>,
    pub history: HistoryRecord,
    pub reported_total: Option<i64>,
    pub rating: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistOutcome {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Everything written by the finalize transaction of one entity pass.
#[derive(Debug, Clone)]
pub struct FinalizeEntity {
    pub entity_id: EntityId,
    pub summary: SummaryUpdate,
    /// New watermark; `None` keeps the stored one.
    pub watermark: Option<Watermark>,
    /// Watermark identity read when the pass started.
    pub expected_watermark: Option<ContentIdentity>,
    pub synced_at: DateTime<Utc>,
}

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get_watermark(&self, entity_id: EntityId) -> Result<Option<Watermark>, StoreError>;

    /// Compare-and-set: fails with `PersistenceConflict` when the stored identity is not `expected`.
    async fn set_watermark(
        &self,
        entity_id: EntityId,
        watermark: &Watermark,
        expected: Option<&ContentIdentity>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SyncStore: WatermarkStore {
    /// Active entities, least recently synchronized first.
    async fn list_entities(&self, limit: usize) -> Result<Vec<Entity>, StoreError>;

    async fn upsert_entity(&self, entity: &Entity) -> Result<(), StoreError>;

    async fn try_lock_entity(&self, entity_id: EntityId) -> Result<EntityLock, StoreError>;

    async fn unlock_entity(&self, lock: EntityLock) -> Result<(), StoreError>;

    async fn known_identities(
        &self,
        entity_id: EntityId,
    ) -> Result<HashSet<ContentIdentity>, StoreError>;

    async fn review_count(&self, entity_id: EntityId) -> Result<i64, StoreError>;

    /// Newest first.
    async fn recent_history(
        &self,
        entity_id: EntityId,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, StoreError>;

    /// Inserts new reviews idempotently, appends the history record and raises the
    /// pending-enrichment marker when anything was inserted, all in one transaction.
    async fn persist_batch(&self, batch: &ReviewBatch) -> Result<PersistOutcome, StoreError>;

    /// Stored reviews, most recently published first.
    async fn recent_reviews(
        &self,
        entity_id: EntityId,
        limit: usize,
    ) -> Result<Vec<Review>, StoreError>;

    async fn reviews_scraped_since(
        &self,
        entity_id: EntityId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Review>, StoreError>;

    async fn load_summary(
        &self,
        entity_id: EntityId,
    ) -> Result<Option<EnrichmentSummary>, StoreError>;

    /// Applies the summary update, the watermark compare-and-set, clears the pending
    /// marker and stamps `last_synced_at`, all in one transaction.
    async fn finalize_entity(&self, finalize: &FinalizeEntity) -> Result<(), StoreError>;

    async fn append_run_log(&self, entry: &RunLogEntry) -> Result<(), StoreError>;
}

pub(crate) fn watermark_conflict(
    entity_id: EntityId,
    expected: Option<&ContentIdentity>,
    found: Option<&ContentIdentity>,
) -> StoreError {
    let show = |id: Option<&ContentIdentity>| {
        id.map(ContentIdentity::to_string)
            .unwrap_or_else(|| "<none>".to_string())
    };
    StoreError::PersistenceConflict {
        entity_id,
        detail: format!(
            "watermark moved: expected {}, found {}",
            show(expected),
            show(found)
        ),
    }
}
