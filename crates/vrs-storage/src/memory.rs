//! In-memory store used by tests and `sync --memory` dry runs.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;
use vrs_core::{
    ContentIdentity, EnrichmentSummary, Entity, EntityId, EntityStatus, HistoryRecord, Review,
    RunLogEntry, SummaryUpdate, Watermark,
};

use crate::store::watermark_conflict;
use crate::{
    EntityLock, FinalizeEntity, PersistOutcome, ReviewBatch, StoreError, SyncStore, VectorStore,
    WatermarkStore,
};

#[derive(Debug, Default)]
struct MemoryState {
    entities: BTreeMap<EntityId, Entity>,
    reviews: Vec<Review>,
    watermarks: HashMap<EntityId, Watermark>,
    history: Vec<HistoryRecord>,
    run_logs: Vec<RunLogEntry>,
    summaries: HashMap<EntityId, EnrichmentSummary>,
    locks: HashMap<EntityId, Uuid>,
    failing_persist: HashSet<EntityId>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_reviews(&self, reviews: impl IntoIterator<Item = Review>) {
        let mut state = self.state.lock().await;
        for review in reviews {
            let exists = state
                .reviews
                .iter()
                .any(|r| r.entity_id == review.entity_id && r.identity == review.identity);
            if !exists {
                state.reviews.push(review);
            }
        }
    }

    pub async fn seed_history(&self, record: HistoryRecord) {
        self.state.lock().await.history.push(record);
    }

    pub async fn seed_summary(&self, summary: EnrichmentSummary) {
        self.state
            .lock()
            .await
            .summaries
            .insert(summary.entity_id, summary);
    }

    /// Makes every later `persist_batch` for `entity_id` fail.
    pub async fn fail_persist_for(&self, entity_id: EntityId) {
        self.state.lock().await.failing_persist.insert(entity_id);
    }

    pub async fn entity(&self, entity_id: EntityId) -> Option<Entity> {
        self.state.lock().await.entities.get(&entity_id).cloned()
    }

    pub async fn reviews_of(&self, entity_id: EntityId) -> Vec<Review> {
        self.state
            .lock()
            .await
            .reviews
            .iter()
            .filter(|r| r.entity_id == Some(entity_id))
            .cloned()
            .collect()
    }

    pub async fn history_of(&self, entity_id: EntityId) -> Vec<HistoryRecord> {
        self.state
            .lock()
            .await
            .history
            .iter()
            .filter(|h| h.entity_id == entity_id)
            .cloned()
            .collect()
    }

    pub async fn run_logs(&self) -> Vec<RunLogEntry> {
        self.state.lock().await.run_logs.clone()
    }

    pub async fn is_locked(&self, entity_id: EntityId) -> bool {
        self.state.lock().await.locks.contains_key(&entity_id)
    }
}

fn newest_published_first(reviews: &mut [Review]) {
    reviews.sort_by(|a, b| {
        b.published_at
            .is_some()
            .cmp(&a.published_at.is_some())
            .then_with(|| b.published_at.cmp(&a.published_at))
            .then_with(|| b.scraped_at.cmp(&a.scraped_at))
    });
}

#[async_trait]
impl WatermarkStore for MemoryStore {
    async fn get_watermark(&self, entity_id: EntityId) -> Result<Option<Watermark>, StoreError> {
        Ok(self.state.lock().await.watermarks.get(&entity_id).cloned())
    }

    async fn set_watermark(
        &self,
        entity_id: EntityId,
        watermark: &Watermark,
        expected: Option<&ContentIdentity>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let current = state.watermarks.get(&entity_id).map(|w| &w.identity);
        if current != expected {
            return Err(watermark_conflict(entity_id, expected, current));
        }
        state.watermarks.insert(entity_id, watermark.clone());
        Ok(())
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn list_entities(&self, limit: usize) -> Result<Vec<Entity>, StoreError> {
        let state = self.state.lock().await;
        let mut entities = state
            .entities
            .values()
            .filter(|e| e.status != EntityStatus::Retired)
            .cloned()
            .collect::<Vec<_>>();
        // `None` sorts before `Some`, which gives NULLS FIRST.
        entities.sort_by(|a, b| {
            a.last_synced_at
                .cmp(&b.last_synced_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        entities.truncate(limit);
        Ok(entities)
    }

    async fn upsert_entity(&self, entity: &Entity) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match state.entities.get_mut(&entity.id) {
            Some(existing) => {
                existing.name = entity.name.clone();
                existing.zone = entity.zone.clone().or(existing.zone.take());
                existing.neighborhood = entity
                    .neighborhood
                    .clone()
                    .or(existing.neighborhood.take());
                existing.address = entity.address.clone().or(existing.address.take());
                existing.latitude = entity.latitude.or(existing.latitude);
                existing.longitude = entity.longitude.or(existing.longitude);
                existing.source_url = entity.source_url.clone().or(existing.source_url.take());
                existing.status = entity.status;
                existing.reported_total = match (existing.reported_total, entity.reported_total) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => b.or(a),
                };
                existing.rating = entity.rating.or(existing.rating);
            }
            None => {
                state.entities.insert(entity.id, entity.clone());
            }
        }
        Ok(())
    }

    async fn try_lock_entity(&self, entity_id: EntityId) -> Result<EntityLock, StoreError> {
        let mut state = self.state.lock().await;
        if state.locks.contains_key(&entity_id) {
            return Err(StoreError::EntityLocked(entity_id));
        }
        let lock = EntityLock::new(entity_id);
        state.locks.insert(entity_id, lock.token);
        Ok(lock)
    }

    async fn unlock_entity(&self, lock: EntityLock) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.locks.get(&lock.entity_id) == Some(&lock.token) {
            state.locks.remove(&lock.entity_id);
        }
        Ok(())
    }

    async fn known_identities(
        &self,
        entity_id: EntityId,
    ) -> Result<HashSet<ContentIdentity>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .reviews
            .iter()
            .filter(|r| r.entity_id == Some(entity_id))
            .map(|r| r.identity.clone())
            .collect())
    }

    async fn review_count(&self, entity_id: EntityId) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .reviews
            .iter()
            .filter(|r| r.entity_id == Some(entity_id))
            .count() as i64)
    }

    async fn recent_history(
        &self,
        entity_id: EntityId,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut records = state
            .history
            .iter()
            .filter(|h| h.entity_id == entity_id)
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn persist_batch(&self, batch: &ReviewBatch) -> Result<PersistOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if state.failing_persist.contains(&batch.entity_id) {
            return Err(StoreError::InvalidInput(format!(
                "persistence disabled for entity {}",
                batch.entity_id
            )));
        }
        if !state.entities.contains_key(&batch.entity_id) {
            return Err(StoreError::EntityNotFound(batch.entity_id));
        }
        let duplicate_history = state
            .history
            .iter()
            .any(|h| h.entity_id == batch.entity_id && h.run_id == batch.history.run_id);
        if duplicate_history {
            return Err(StoreError::PersistenceConflict {
                entity_id: batch.entity_id,
                detail: format!("history already recorded for run {}", batch.history.run_id),
            });
        }

        // Validate everything before mutating so the batch applies atomically.
        let mut outcome = PersistOutcome::default();
        let mut fresh = Vec::with_capacity(batch.reviews.len());
        for review in &batch.reviews {
            let exists = state
                .reviews
                .iter()
                .chain(fresh.iter())
                .any(|r: &Review| {
                    r.entity_id == Some(batch.entity_id) && r.identity == review.identity
                });
            if exists {
                outcome.duplicates += 1;
            } else {
                let mut review = review.clone();
                review.entity_id = Some(batch.entity_id);
                fresh.push(review);
            }
        }
        outcome.inserted = fresh.len();
        state.reviews.extend(fresh);
        state.history.push(batch.history.clone());

        let recorded_at = batch.history.recorded_at;
        if let Some(entity) = state.entities.get_mut(&batch.entity_id) {
            if outcome.inserted > 0 && entity.enrichment_pending_since.is_none() {
                entity.enrichment_pending_since = Some(recorded_at);
            }
            if let Some(total) = batch.reported_total {
                entity.reported_total = Some(entity.reported_total.map_or(total, |t| t.max(total)));
            }
            entity.rating = batch.rating.or(entity.rating);
        }
        Ok(outcome)
    }

    async fn recent_reviews(
        &self,
        entity_id: EntityId,
        limit: usize,
    ) -> Result<Vec<Review>, StoreError> {
        let mut reviews = self.reviews_of(entity_id).await;
        newest_published_first(&mut reviews);
        reviews.truncate(limit);
        Ok(reviews)
    }

    async fn reviews_scraped_since(
        &self,
        entity_id: EntityId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Review>, StoreError> {
        let mut reviews = self
            .reviews_of(entity_id)
            .await
            .into_iter()
            .filter(|r| r.scraped_at >= since)
            .collect::<Vec<_>>();
        newest_published_first(&mut reviews);
        Ok(reviews)
    }

    async fn load_summary(
        &self,
        entity_id: EntityId,
    ) -> Result<Option<EnrichmentSummary>, StoreError> {
        Ok(self.state.lock().await.summaries.get(&entity_id).cloned())
    }

    async fn finalize_entity(&self, finalize: &FinalizeEntity) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let entity_id = finalize.entity_id;
        if !state.entities.contains_key(&entity_id) {
            return Err(StoreError::EntityNotFound(entity_id));
        }
        let current = state.watermarks.get(&entity_id).map(|w| &w.identity);
        if current != finalize.expected_watermark.as_ref() {
            return Err(watermark_conflict(
                entity_id,
                finalize.expected_watermark.as_ref(),
                current,
            ));
        }

        match &finalize.summary {
            SummaryUpdate::Touch { at } => {
                if let Some(summary) = state.summaries.get_mut(&entity_id) {
                    summary.refreshed_at = *at;
                }
            }
            SummaryUpdate::Replace(summary) => {
                state.summaries.insert(entity_id, summary.clone());
            }
        }
        if let Some(watermark) = &finalize.watermark {
            state.watermarks.insert(entity_id, watermark.clone());
        }
        if let Some(entity) = state.entities.get_mut(&entity_id) {
            entity.enrichment_pending_since = None;
            entity.last_synced_at = Some(finalize.synced_at);
        }
        Ok(())
    }

    async fn append_run_log(&self, entry: &RunLogEntry) -> Result<(), StoreError> {
        self.state.lock().await.run_logs.push(entry.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredVector {
    pub embedding: Vec<f32>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Default)]
pub struct MemoryVectorStore {
    vectors: Mutex<HashMap<EntityId, StoredVector>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, entity_id: EntityId) -> Option<StoredVector> {
        self.vectors.lock().await.get(&entity_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.vectors.lock().await.len()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn replace_entity_vector(
        &self,
        entity_id: EntityId,
        embedding: Vec<f32>,
        metadata: serde_json::Value,
    ) -> Result<(), StoreError> {
        if embedding.is_empty() {
            return Err(StoreError::InvalidInput("empty embedding".to_string()));
        }
        self.vectors.lock().await.insert(
            entity_id,
            StoredVector {
                embedding,
                metadata,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vrs_core::DeltaClassification;

    fn review(entity: i64, id: &str, published: &str) -> Review {
        Review {
            entity_id: Some(EntityId(entity)),
            identity: ContentIdentity::from_stored(id),
            author: "Ana".into(),
            rating: Some(4.0),
            body: format!("review {id}"),
            published_at: Some(published.into()),
            scraped_at: Utc::now(),
        }
    }

    fn history(entity: i64, run_id: Uuid, count: i64) -> HistoryRecord {
        HistoryRecord {
            entity_id: EntityId(entity),
            run_id,
            review_count: count,
            reported_total: None,
            delta: count,
            classification: DeltaClassification::Initialization,
            recorded_at: Utc::now(),
        }
    }

    fn watermark(id: &str) -> Watermark {
        Watermark {
            identity: ContentIdentity::from_stored(id),
            published_at: None,
            committed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn persist_is_idempotent_per_identity() {
        let store = MemoryStore::new();
        store.upsert_entity(&Entity::new(1, "Bar Uno")).await.unwrap();

        let batch = ReviewBatch {
            entity_id: EntityId(1),
            reviews: vec![review(1, "h1", "2026-01-01"), review(1, "h1", "2026-01-01")],
            history: history(1, Uuid::new_v4(), 1),
            reported_total: Some(10),
            rating: Some(4.5),
        };
        let outcome = store.persist_batch(&batch).await.unwrap();
        assert_eq!(outcome, PersistOutcome { inserted: 1, duplicates: 1 });

        let again = ReviewBatch {
            history: history(1, Uuid::new_v4(), 1),
            ..batch.clone()
        };
        let outcome = store.persist_batch(&again).await.unwrap();
        assert_eq!(outcome.inserted, 0);
        assert_eq!(store.review_count(EntityId(1)).await.unwrap(), 1);

        let entity = store.entity(EntityId(1)).await.unwrap();
        assert!(entity.enrichment_pending_since.is_some());
        assert_eq!(entity.reported_total, Some(10));
    }

    #[tokio::test]
    async fn history_is_recorded_once_per_run() {
        let store = MemoryStore::new();
        store.upsert_entity(&Entity::new(1, "Bar Uno")).await.unwrap();
        let run_id = Uuid::new_v4();
        let batch = ReviewBatch {
            entity_id: EntityId(1),
            reviews: vec![],
            history: history(1, run_id, 0),
            reported_total: None,
            rating: None,
        };
        store.persist_batch(&batch).await.unwrap();
        let err = store.persist_batch(&batch).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.history_of(EntityId(1)).await.len(), 1);
    }

    #[tokio::test]
    async fn watermark_compare_and_set_detects_concurrent_writers() {
        let store = MemoryStore::new();
        let id = EntityId(3);
        assert!(store.get_watermark(id).await.unwrap().is_none());

        store.set_watermark(id, &watermark("h7"), None).await.unwrap();
        let stale = store.set_watermark(id, &watermark("h8"), None).await;
        assert!(matches!(stale, Err(StoreError::PersistenceConflict { .. })));

        let h7 = ContentIdentity::from_stored("h7");
        store.set_watermark(id, &watermark("h9"), Some(&h7)).await.unwrap();
        assert_eq!(
            store.get_watermark(id).await.unwrap().unwrap().identity.as_str(),
            "h9"
        );
    }

    #[tokio::test]
    async fn finalize_touch_keeps_summary_text_and_clears_pending() {
        let store = MemoryStore::new();
        let id = EntityId(5);
        store.upsert_entity(&Entity::new(5, "Café")).await.unwrap();
        let old = Utc::now() - chrono::Duration::days(3);
        store
            .seed_summary(EnrichmentSummary {
                entity_id: id,
                summary: "Buen café, servicio lento.".into(),
                regenerated_at: old,
                refreshed_at: old,
                source_review_count: 12,
            })
            .await;

        let now = Utc::now();
        store
            .finalize_entity(&FinalizeEntity {
                entity_id: id,
                summary: SummaryUpdate::Touch { at: now },
                watermark: Some(watermark("h1")),
                expected_watermark: None,
                synced_at: now,
            })
            .await
            .unwrap();

        let summary = store.load_summary(id).await.unwrap().unwrap();
        assert_eq!(summary.summary, "Buen café, servicio lento.");
        assert_eq!(summary.regenerated_at, old);
        assert_eq!(summary.refreshed_at, now);
        let entity = store.entity(id).await.unwrap();
        assert_eq!(entity.last_synced_at, Some(now));
        assert!(entity.enrichment_pending_since.is_none());
    }

    #[tokio::test]
    async fn entities_are_listed_least_recently_synced_first() {
        let store = MemoryStore::new();
        let mut synced = Entity::new(1, "synced");
        synced.last_synced_at = Some(Utc::now());
        let mut retired = Entity::new(3, "retired");
        retired.status = EntityStatus::Retired;
        store.upsert_entity(&synced).await.unwrap();
        store.upsert_entity(&Entity::new(2, "never")).await.unwrap();
        store.upsert_entity(&retired).await.unwrap();

        let listed = store.list_entities(10).await.unwrap();
        let ids = listed.iter().map(|e| e.id.0).collect::<Vec<_>>();
        assert_eq!(ids, vec![2, 1]);
    }

    #[tokio::test]
    async fn locks_are_exclusive_until_released() {
        let store = MemoryStore::new();
        let lock = store.try_lock_entity(EntityId(9)).await.unwrap();
        assert!(matches!(
            store.try_lock_entity(EntityId(9)).await,
            Err(StoreError::EntityLocked(EntityId(9)))
        ));
        store.unlock_entity(lock).await.unwrap();
        assert!(store.try_lock_entity(EntityId(9)).await.is_ok());
    }

    #[tokio::test]
    async fn vector_replace_leaves_one_vector_per_entity() {
        let vectors = MemoryVectorStore::new();
        vectors
            .replace_entity_vector(EntityId(1), vec![0.1, 0.2], serde_json::json!({"v": 1}))
            .await
            .unwrap();
        vectors
            .replace_entity_vector(EntityId(1), vec![0.3, 0.4], serde_json::json!({"v": 2}))
            .await
            .unwrap();
        assert_eq!(vectors.len().await, 1);
        assert_eq!(vectors.get(EntityId(1)).await.unwrap().embedding, vec![0.3, 0.4]);
    }
}
