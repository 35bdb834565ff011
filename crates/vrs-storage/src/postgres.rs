//! Postgres implementation of the store contracts.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};
use uuid::Uuid;
use vrs_core::{
    ContentIdentity, DeltaClassification, EnrichmentSummary, Entity, EntityId, EntityStatus,
    HistoryRecord, Review, RunLogEntry, SummaryUpdate, Watermark,
};

use crate::store::watermark_conflict;
use crate::{
    EntityLock, FinalizeEntity, PersistOutcome, ReviewBatch, StoreError, SyncStore, VectorStore,
    WatermarkStore,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

const UNIQUE_VIOLATION: &str = "23505";

/// `published_at` is free text; only a leading ISO date is ever compared.
/// Zero-padded ISO dates order correctly as text, so no cast can fail on a bad row.
const PUBLISHED_DATE_SQL: &str =
    "CASE WHEN published_at ~ '^[0-9]{4}-[0-9]{2}-[0-9]{2}' THEN substring(published_at from 1 for 10) END";

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    Ok(PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

/// Relational store. Entity locks are session advisory locks held on a dedicated
/// pooled connection until released.
pub struct PgStore {
    pool: PgPool,
    locks: Mutex<HashMap<Uuid, PoolConnection<Postgres>>>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

fn entity_from_row(row: &PgRow) -> Result<Entity, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Entity {
        id: EntityId(row.try_get("id")?),
        name: row.try_get("name")?,
        zone: row.try_get("zone")?,
        neighborhood: row.try_get("neighborhood")?,
        address: row.try_get("address")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        source_url: row.try_get("source_url")?,
        status: EntityStatus::parse(&status),
        reported_total: row.try_get("reported_total")?,
        rating: row.try_get("rating")?,
        enrichment_pending_since: row.try_get("enrichment_pending_since")?,
        last_synced_at: row.try_get("last_synced_at")?,
    })
}

fn review_from_row(row: &PgRow) -> Result<Review, StoreError> {
    let venue_id: Option<i64> = row.try_get("venue_id")?;
    let content_id: String = row.try_get("content_id")?;
    Ok(Review {
        entity_id: venue_id.map(EntityId),
        identity: ContentIdentity::from_stored(content_id),
        author: row.try_get("author")?,
        rating: row.try_get("rating")?,
        body: row.try_get("body")?,
        published_at: row.try_get("published_at")?,
        scraped_at: row.try_get("scraped_at")?,
    })
}

fn history_from_row(row: &PgRow) -> Result<HistoryRecord, StoreError> {
    let label: String = row.try_get("classification")?;
    let reason: Option<String> = row.try_get("reason")?;
    Ok(HistoryRecord {
        entity_id: EntityId(row.try_get("venue_id")?),
        run_id: row.try_get("run_id")?,
        review_count: row.try_get("review_count")?,
        reported_total: row.try_get("reported_total")?,
        delta: row.try_get("delta")?,
        classification: DeltaClassification::from_parts(&label, reason),
        recorded_at: row.try_get("recorded_at")?,
    })
}

async fn current_watermark_for_update(
    tx: &mut Transaction<'_, Postgres>,
    entity_id: EntityId,
) -> Result<Option<ContentIdentity>, StoreError> {
    let row = sqlx::query("SELECT content_id FROM watermarks WHERE venue_id = $1 FOR UPDATE")
        .bind(entity_id.0)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(match row {
        Some(row) => Some(ContentIdentity::from_stored(
            row.try_get::<String, _>("content_id")?,
        )),
        None => None,
    })
}

async fn compare_and_set_watermark(
    tx: &mut Transaction<'_, Postgres>,
    entity_id: EntityId,
    watermark: Option<&Watermark>,
    expected: Option<&ContentIdentity>,
) -> Result<(), StoreError> {
    let current = current_watermark_for_update(tx, entity_id).await?;
    if current.as_ref() != expected {
        return Err(watermark_conflict(entity_id, expected, current.as_ref()));
    }
    let Some(watermark) = watermark else {
        return Ok(());
    };

    let result = sqlx::query(
        r#"
        INSERT INTO watermarks (venue_id, content_id, published_at, committed_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (venue_id) DO UPDATE
           SET content_id = EXCLUDED.content_id,
               published_at = EXCLUDED.published_at,
               committed_at = EXCLUDED.committed_at
        "#,
    )
    .bind(entity_id.0)
    .bind(watermark.identity.as_str())
    .bind(&watermark.published_at)
    .bind(watermark.committed_at)
    .execute(&mut **tx)
    .await;

    match result {
        Ok(_) => Ok(()),
        // A first-time insert raced with another writer's first-time insert.
        Err(err) if is_unique_violation(&err) => {
            Err(watermark_conflict(entity_id, expected, None))
        }
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl WatermarkStore for PgStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_watermark(&self, entity_id: EntityId) -> Result<Option<Watermark>, StoreError> {
        let row = sqlx::query(
            "SELECT content_id, published_at, committed_at FROM watermarks WHERE venue_id = $1",
        )
        .bind(entity_id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Watermark {
            identity: ContentIdentity::from_stored(row.try_get::<String, _>("content_id")?),
            published_at: row.try_get("published_at")?,
            committed_at: row.try_get("committed_at")?,
        }))
    }

    #[tracing::instrument(level = "debug", skip(self, watermark))]
    async fn set_watermark(
        &self,
        entity_id: EntityId,
        watermark: &Watermark,
        expected: Option<&ContentIdentity>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        compare_and_set_watermark(&mut tx, entity_id, Some(watermark), expected).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl SyncStore for PgStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_entities(&self, limit: usize) -> Result<Vec<Entity>, StoreError> {
        let limit = i64::try_from(limit)
            .map_err(|_| StoreError::InvalidInput("entity limit too large".to_string()))?;
        let rows = sqlx::query(
            r#"
            SELECT id, name, zone, neighborhood, address, latitude, longitude, source_url,
                   status, reported_total, rating, enrichment_pending_since, last_synced_at
              FROM venues
             WHERE status <> 'retired'
             ORDER BY last_synced_at ASC NULLS FIRST, id ASC
             LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entity_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity_id = %entity.id))]
    async fn upsert_entity(&self, entity: &Entity) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO venues
              (id, name, zone, neighborhood, address, latitude, longitude, source_url,
               status, reported_total, rating)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE
               SET name = EXCLUDED.name,
                   zone = COALESCE(EXCLUDED.zone, venues.zone),
                   neighborhood = COALESCE(EXCLUDED.neighborhood, venues.neighborhood),
                   address = COALESCE(EXCLUDED.address, venues.address),
                   latitude = COALESCE(EXCLUDED.latitude, venues.latitude),
                   longitude = COALESCE(EXCLUDED.longitude, venues.longitude),
                   source_url = COALESCE(EXCLUDED.source_url, venues.source_url),
                   status = EXCLUDED.status,
                   reported_total = GREATEST(venues.reported_total, EXCLUDED.reported_total),
                   rating = COALESCE(EXCLUDED.rating, venues.rating),
                   updated_at = NOW()
            "#,
        )
        .bind(entity.id.0)
        .bind(&entity.name)
        .bind(&entity.zone)
        .bind(&entity.neighborhood)
        .bind(&entity.address)
        .bind(entity.latitude)
        .bind(entity.longitude)
        .bind(&entity.source_url)
        .bind(entity.status.as_str())
        .bind(entity.reported_total)
        .bind(entity.rating)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_lock_entity(&self, entity_id: EntityId) -> Result<EntityLock, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(entity_id.0)
            .fetch_one(&mut *conn)
            .await?;
        if !acquired {
            return Err(StoreError::EntityLocked(entity_id));
        }
        let lock = EntityLock::new(entity_id);
        self.locks.lock().await.insert(lock.token, conn);
        debug!(entity_id = %entity_id, "entity lock acquired");
        Ok(lock)
    }

    async fn unlock_entity(&self, lock: EntityLock) -> Result<(), StoreError> {
        let Some(mut conn) = self.locks.lock().await.remove(&lock.token) else {
            warn!(entity_id = %lock.entity_id, "unlock requested for unknown lock token");
            return Ok(());
        };
        let released: bool = match sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(lock.entity_id.0)
            .fetch_one(&mut *conn)
            .await
        {
            Ok(released) => released,
            Err(err) => {
                // Closing the session drops every advisory lock it holds.
                conn.close_on_drop();
                return Err(err.into());
            }
        };
        if !released {
            warn!(entity_id = %lock.entity_id, "advisory lock was not held at release");
        }
        Ok(())
    }

    async fn known_identities(
        &self,
        entity_id: EntityId,
    ) -> Result<HashSet<ContentIdentity>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT content_id FROM reviews WHERE venue_id = $1")
            .bind(entity_id.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().map(ContentIdentity::from_stored).collect())
    }

    async fn review_count(&self, entity_id: EntityId) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reviews WHERE venue_id = $1")
            .bind(entity_id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn recent_history(
        &self,
        entity_id: EntityId,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        let limit = i64::try_from(limit)
            .map_err(|_| StoreError::InvalidInput("history window too large".to_string()))?;
        let rows = sqlx::query(
            r#"
            SELECT venue_id, run_id, review_count, reported_total, delta,
                   classification, reason, recorded_at
              FROM review_history
             WHERE venue_id = $1
             ORDER BY recorded_at DESC
             LIMIT $2
            "#,
        )
        .bind(entity_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(history_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self, batch), fields(entity_id = %batch.entity_id, reviews = batch.reviews.len()))]
    async fn persist_batch(&self, batch: &ReviewBatch) -> Result<PersistOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = PersistOutcome::default();

        for review in &batch.reviews {
            let result = sqlx::query(
                r#"
                INSERT INTO reviews
                  (venue_id, content_id, author, rating, body, published_at, scraped_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (venue_id, content_id) DO NOTHING
                "#,
            )
            .bind(batch.entity_id.0)
            .bind(review.identity.as_str())
            .bind(&review.author)
            .bind(review.rating)
            .bind(&review.body)
            .bind(&review.published_at)
            .bind(review.scraped_at)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 1 {
                outcome.inserted += 1;
            } else {
                outcome.duplicates += 1;
            }
        }

        let history = &batch.history;
        let inserted = sqlx::query(
            r#"
            INSERT INTO review_history
              (venue_id, run_id, review_count, reported_total, delta, classification, reason, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(batch.entity_id.0)
        .bind(history.run_id)
        .bind(history.review_count)
        .bind(history.reported_total)
        .bind(history.delta)
        .bind(history.classification.label())
        .bind(history.classification.reason())
        .bind(history.recorded_at)
        .execute(&mut *tx)
        .await;
        if let Err(err) = inserted {
            if is_unique_violation(&err) {
                return Err(StoreError::PersistenceConflict {
                    entity_id: batch.entity_id,
                    detail: format!("history already recorded for run {}", history.run_id),
                });
            }
            return Err(err.into());
        }

        let updated = sqlx::query(
            r#"
            UPDATE venues
               SET enrichment_pending_since = CASE
                       WHEN $2 THEN COALESCE(enrichment_pending_since, $3)
                       ELSE enrichment_pending_since
                   END,
                   reported_total = GREATEST(reported_total, $4),
                   rating = COALESCE($5, rating),
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(batch.entity_id.0)
        .bind(outcome.inserted > 0)
        .bind(history.recorded_at)
        .bind(batch.reported_total)
        .bind(batch.rating)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::EntityNotFound(batch.entity_id));
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn recent_reviews(
        &self,
        entity_id: EntityId,
        limit: usize,
    ) -> Result<Vec<Review>, StoreError> {
        let limit = i64::try_from(limit)
            .map_err(|_| StoreError::InvalidInput("review limit too large".to_string()))?;
        let sql = format!(
            r#"
            SELECT venue_id, content_id, author, rating, body, published_at, scraped_at
              FROM reviews
             WHERE venue_id = $1
             ORDER BY {PUBLISHED_DATE_SQL} DESC NULLS LAST, scraped_at DESC
             LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(entity_id.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(review_from_row).collect()
    }

    async fn reviews_scraped_since(
        &self,
        entity_id: EntityId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Review>, StoreError> {
        let sql = format!(
            r#"
            SELECT venue_id, content_id, author, rating, body, published_at, scraped_at
              FROM reviews
             WHERE venue_id = $1
               AND scraped_at >= $2::timestamptz
             ORDER BY {PUBLISHED_DATE_SQL} DESC NULLS LAST, scraped_at DESC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(entity_id.0)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(review_from_row).collect()
    }

    async fn load_summary(
        &self,
        entity_id: EntityId,
    ) -> Result<Option<EnrichmentSummary>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT summary, regenerated_at, refreshed_at, source_review_count
              FROM venue_summaries
             WHERE venue_id = $1
            "#,
        )
        .bind(entity_id.0)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(EnrichmentSummary {
            entity_id,
            summary: row.try_get("summary")?,
            regenerated_at: row.try_get("regenerated_at")?,
            refreshed_at: row.try_get("refreshed_at")?,
            source_review_count: row.try_get("source_review_count")?,
        }))
    }

    #[tracing::instrument(level = "debug", skip(self, finalize), fields(entity_id = %finalize.entity_id))]
    async fn finalize_entity(&self, finalize: &FinalizeEntity) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let entity_id = finalize.entity_id;

        compare_and_set_watermark(
            &mut tx,
            entity_id,
            finalize.watermark.as_ref(),
            finalize.expected_watermark.as_ref(),
        )
        .await?;

        match &finalize.summary {
            SummaryUpdate::Touch { at } => {
                sqlx::query("UPDATE venue_summaries SET refreshed_at = $2 WHERE venue_id = $1")
                    .bind(entity_id.0)
                    .bind(*at)
                    .execute(&mut *tx)
                    .await?;
            }
            SummaryUpdate::Replace(summary) => {
                sqlx::query(
                    r#"
                    INSERT INTO venue_summaries
                      (venue_id, summary, regenerated_at, refreshed_at, source_review_count)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (venue_id) DO UPDATE
                       SET summary = EXCLUDED.summary,
                           regenerated_at = EXCLUDED.regenerated_at,
                           refreshed_at = EXCLUDED.refreshed_at,
                           source_review_count = EXCLUDED.source_review_count
                    "#,
                )
                .bind(entity_id.0)
                .bind(&summary.summary)
                .bind(summary.regenerated_at)
                .bind(summary.refreshed_at)
                .bind(summary.source_review_count)
                .execute(&mut *tx)
                .await?;
            }
        }

        let updated = sqlx::query(
            r#"
            UPDATE venues
               SET enrichment_pending_since = NULL,
                   last_synced_at = $2,
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(entity_id.0)
        .bind(finalize.synced_at)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::EntityNotFound(entity_id));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn append_run_log(&self, entry: &RunLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_run_logs
              (run_id, venue_id, status, message, observed, new_reviews, skipped_known,
               malformed, attempts, duration_ms, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(entry.run_id)
        .bind(entry.entity_id.map(|id| id.0))
        .bind(entry.status.as_str())
        .bind(&entry.message)
        .bind(i64::from(entry.observed))
        .bind(i64::from(entry.new_reviews))
        .bind(i64::from(entry.skipped_known))
        .bind(i64::from(entry.malformed))
        .bind(i64::from(entry.attempts))
        .bind(i64::try_from(entry.duration_ms).unwrap_or(i64::MAX))
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// pgvector-backed entity embeddings, one row per venue.
#[derive(Debug)]
pub struct PgVectorStore {
    pool: PgPool,
    dimension: usize,
    initialized: OnceCell<()>,
}

impl PgVectorStore {
    pub fn new(pool: PgPool, dimension: usize) -> Self {
        Self {
            pool,
            dimension,
            initialized: OnceCell::new(),
        }
    }

    fn embedding_literal(dimension: usize, embedding: &[f32]) -> Result<String, StoreError> {
        if embedding.len() != dimension {
            return Err(StoreError::InvalidInput(format!(
                "embedding dimension mismatch: expected {dimension}, got {}",
                embedding.len()
            )));
        }
        let mut literal = String::with_capacity(embedding.len() * 12 + 2);
        literal.push('[');
        for (i, value) in embedding.iter().enumerate() {
            if i > 0 {
                literal.push(',');
            }
            let _ = write!(&mut literal, "{value:.8}");
        }
        literal.push(']');
        Ok(literal)
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.initialized
            .get_or_try_init(|| async {
                let dim = self.dimension;
                let ddl = format!(
                    r#"
CREATE EXTENSION IF NOT EXISTS vector;
CREATE TABLE IF NOT EXISTS venue_embeddings (
    venue_id BIGINT PRIMARY KEY REFERENCES venues(id),
    embedding vector({dim}) NOT NULL,
    metadata JSONB NOT NULL DEFAULT '{{}}'::jsonb,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#
                );
                for stmt in ddl.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                    sqlx::query(stmt).execute(&self.pool).await?;
                }
                Ok::<(), StoreError>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    #[tracing::instrument(level = "debug", skip(self, embedding, metadata))]
    async fn replace_entity_vector(
        &self,
        entity_id: EntityId,
        embedding: Vec<f32>,
        metadata: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        let literal = Self::embedding_literal(self.dimension, &embedding)?;

        sqlx::query(
            r#"
            INSERT INTO venue_embeddings (venue_id, embedding, metadata)
            VALUES ($1, $2::vector, $3::jsonb)
            ON CONFLICT (venue_id) DO UPDATE
               SET embedding = EXCLUDED.embedding,
                   metadata = EXCLUDED.metadata,
                   updated_at = NOW()
            "#,
        )
        .bind(entity_id.0)
        .bind(literal)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
