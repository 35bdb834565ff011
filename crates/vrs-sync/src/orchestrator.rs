//! Per-entity synchronization pipeline and the concurrent run driver.

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;
use vrs_adapters::{open_with_retry, CaptureMeta, ExtractionError, ExtractionSource, RetryingCursor};
use vrs_core::{
    Entity, HistoryRecord, Review, RunLogEntry, RunStatus, SummaryUpdate, SyncErrorKind, Watermark,
};
use vrs_storage::{BackoffPolicy, FinalizeEntity, ReviewBatch, StoreError, SyncStore};

use crate::auditor::{AuditRecord, DeltaAuditor};
use crate::config::Policy;
use crate::coordinator::{EarlyStopCoordinator, ScanOutcome};
use crate::gate::{EnrichmentError, EnrichmentGate};
use crate::report::{EntityOutcome, RunReport};

/// Stored reviews offered to the sampler when regenerating a summary.
const SAMPLE_POOL_LIMIT: usize = 1_000;

/// Why an entity pass stopped early.
#[derive(Debug)]
struct PassFailure {
    status: RunStatus,
    kind: SyncErrorKind,
    message: String,
}

impl PassFailure {
    fn cancelled() -> Self {
        Self {
            status: RunStatus::Cancelled,
            kind: SyncErrorKind::Cancelled,
            message: "run budget exhausted before commit; pass discarded".to_string(),
        }
    }

    fn panicked(payload: Box<dyn Any + Send>) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self {
            status: RunStatus::Failed,
            kind: SyncErrorKind::Internal,
            message: format!("entity pass panicked: {detail}"),
        }
    }
}

impl From<ExtractionError> for PassFailure {
    fn from(err: ExtractionError) -> Self {
        let kind = if err.is_transient() {
            SyncErrorKind::ExtractionTransient
        } else {
            SyncErrorKind::ExtractionFatal
        };
        Self {
            status: RunStatus::Failed,
            kind,
            message: err.to_string(),
        }
    }
}

impl From<StoreError> for PassFailure {
    fn from(err: StoreError) -> Self {
        if err.is_conflict() {
            Self {
                status: RunStatus::Conflict,
                kind: SyncErrorKind::PersistenceConflict,
                message: err.to_string(),
            }
        } else {
            Self {
                status: RunStatus::Failed,
                kind: SyncErrorKind::Storage,
                message: err.to_string(),
            }
        }
    }
}

impl From<EnrichmentError> for PassFailure {
    fn from(err: EnrichmentError) -> Self {
        Self {
            status: RunStatus::Failed,
            kind: SyncErrorKind::Enrichment,
            message: format!("{err}; reviews kept, enrichment pending"),
        }
    }
}

/// Everything gathered before the first write of a pass.
struct PreparedPass {
    watermark: Option<Watermark>,
    meta: CaptureMeta,
    scan: ScanOutcome,
    retries: u32,
    audit: AuditRecord,
    recorded_at: DateTime<Utc>,
}

pub struct SyncOrchestrator {
    store: Arc<dyn SyncStore>,
    source: Arc<dyn ExtractionSource>,
    gate: Arc<EnrichmentGate>,
    coordinator: EarlyStopCoordinator,
    auditor: DeltaAuditor,
    backoff: BackoffPolicy,
    call_timeout: Duration,
    concurrency: usize,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn SyncStore>,
        source: Arc<dyn ExtractionSource>,
        gate: Arc<EnrichmentGate>,
        policy: &Policy,
    ) -> Self {
        Self {
            store,
            source,
            gate,
            coordinator: EarlyStopCoordinator::new(policy.identity, policy.scan),
            auditor: DeltaAuditor::new(policy.audit),
            backoff: policy.retry.backoff(),
            call_timeout: policy.retry.call_timeout(),
            concurrency: 4,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Synchronizes up to `limit` entities from the catalogue.
    pub async fn run_catalogue(
        &self,
        limit: usize,
        budget: Option<Duration>,
    ) -> Result<RunReport, StoreError> {
        let entities = self.store.list_entities(limit).await?;
        Ok(self.run(entities, budget).await)
    }

    /// Processes entities concurrently; one entity's failure never affects another.
    pub async fn run(&self, entities: Vec<Entity>, budget: Option<Duration>) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let deadline = budget.map(|b| Instant::now() + b);
        let span = info_span!("sync_run", %run_id);

        let mut outcomes = async {
            info!(entities = entities.len(), concurrency = self.concurrency, "sync run started");
            stream::iter(
                entities
                    .into_iter()
                    .map(|entity| self.sync_entity(run_id, entity, deadline)),
            )
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await
        }
        .instrument(span)
        .await;
        outcomes.sort_by_key(|o| o.entity_id);

        let report = RunReport::new(run_id, started_at, Utc::now(), outcomes);
        info!(
            %run_id,
            updated = report.totals.updated,
            unchanged = report.totals.unchanged,
            failed = report.totals.failed,
            conflicts = report.totals.conflicts,
            anomalies = report.totals.anomalies,
            "sync run finished"
        );
        report
    }

    pub async fn sync_entity(
        &self,
        run_id: Uuid,
        entity: Entity,
        deadline: Option<Instant>,
    ) -> EntityOutcome {
        let span = info_span!("entity_sync", entity_id = %entity.id, %run_id);
        async {
            let started = Instant::now();
            let mut outcome = EntityOutcome::new(&entity);

            let result = if deadline.is_some_and(|d| Instant::now() >= d) {
                Err(PassFailure::cancelled())
            } else {
                match self.store.try_lock_entity(entity.id).await {
                    Ok(lock) => {
                        let result =
                            AssertUnwindSafe(self.locked_pass(run_id, &entity, deadline, &mut outcome))
                                .catch_unwind()
                                .await
                                .unwrap_or_else(|payload| Err(PassFailure::panicked(payload)));
                        if let Err(err) = self.store.unlock_entity(lock).await {
                            warn!(error = %err, "failed to release entity lock");
                        }
                        result
                    }
                    Err(StoreError::EntityLocked(_)) => Err(PassFailure {
                        status: RunStatus::Locked,
                        kind: SyncErrorKind::PersistenceConflict,
                        message: "another writer holds the entity lock; skipped".to_string(),
                    }),
                    Err(err) => Err(err.into()),
                }
            };

            match result {
                Ok(()) => info!(
                    status = outcome.status.as_str(),
                    inserted = outcome.inserted,
                    gate = outcome.gate.map(|g| g.as_str()).unwrap_or("-"),
                    "entity synced"
                ),
                Err(failure) => {
                    match failure.status {
                        RunStatus::Locked | RunStatus::Cancelled => {
                            info!(status = failure.status.as_str(), "{}", failure.message)
                        }
                        _ => error!(
                            status = failure.status.as_str(),
                            kind = failure.kind.as_str(),
                            error = %failure.message,
                            "entity sync failed"
                        ),
                    }
                    outcome.status = failure.status;
                    outcome.error_kind = Some(failure.kind);
                    outcome.message = failure.message;
                    outcome.watermark_advanced = false;
                }
            }
            outcome.duration_ms = started.elapsed().as_millis() as u64;
            self.append_run_log(run_id, &outcome).await;
            outcome
        }
        .instrument(span)
        .await
    }

    async fn locked_pass(
        &self,
        run_id: Uuid,
        entity: &Entity,
        deadline: Option<Instant>,
        outcome: &mut EntityOutcome,
    ) -> Result<(), PassFailure> {
        // Only the read-only phase is cancellable; nothing is written before it completes.
        let prepared = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.prepare(entity))
                .await
                .map_err(|_| PassFailure::cancelled())??,
            None => self.prepare(entity).await?,
        };
        let PreparedPass {
            watermark,
            meta,
            scan,
            retries,
            audit,
            recorded_at,
        } = prepared;

        outcome.observed = scan.stats.observed;
        outcome.skipped_known = scan.stats.skipped_known;
        outcome.malformed = scan.stats.malformed;
        outcome.new_reviews = scan.new_reviews.len() as u32;
        outcome.retries = retries;
        outcome.stop = Some(scan.stop);
        outcome.truncated = scan.truncated();
        outcome.audit = Some(audit.clone());

        let reviews = scan
            .new_reviews
            .iter()
            .cloned()
            .map(|r| r.into_review(entity.id, recorded_at))
            .collect::<Vec<_>>();
        let batch = ReviewBatch {
            entity_id: entity.id,
            reviews: reviews.clone(),
            history: HistoryRecord {
                entity_id: entity.id,
                run_id,
                review_count: audit.new_total,
                reported_total: meta.reported_total,
                delta: audit.delta,
                classification: audit.classification.clone(),
                recorded_at,
            },
            reported_total: meta.reported_total,
            rating: meta.rating,
        };
        let persisted = self.store.persist_batch(&batch).await?;
        outcome.inserted = persisted.inserted as u32;
        outcome.accepted = reviews.clone();

        let gate_input = self.gate_input(entity, reviews).await?;
        let current = self.store.load_summary(entity.id).await?;
        let decision = self.gate.decide(entity, current.as_ref(), &gate_input).await;
        outcome.gate = Some(decision);

        let summary = if decision.regenerates() {
            let mut pool = self.store.recent_reviews(entity.id, SAMPLE_POOL_LIMIT).await?;
            let pooled = pool.iter().map(|r| r.identity.clone()).collect::<HashSet<_>>();
            pool.extend(gate_input.into_iter().filter(|r| !pooled.contains(&r.identity)));
            let regenerated = self
                .gate
                .regenerate(entity, &pool, audit.new_total, Utc::now())
                .await?;
            SummaryUpdate::Replace(regenerated)
        } else {
            SummaryUpdate::Touch { at: Utc::now() }
        };

        let next_watermark = scan.candidate.map(|c| Watermark {
            identity: c.identity,
            published_at: c.published_at,
            committed_at: Utc::now(),
        });
        let advanced = next_watermark
            .as_ref()
            .is_some_and(|next| watermark.as_ref().map(|w| &w.identity) != Some(&next.identity));
        self.store
            .finalize_entity(&FinalizeEntity {
                entity_id: entity.id,
                summary,
                watermark: next_watermark,
                expected_watermark: watermark.map(|w| w.identity),
                synced_at: Utc::now(),
            })
            .await?;

        outcome.watermark_advanced = advanced;
        outcome.status = if persisted.inserted > 0 || decision.regenerates() {
            RunStatus::Updated
        } else {
            RunStatus::Unchanged
        };
        outcome.message = format!(
            "{} new, {} known, {} malformed; {}; gate {}",
            persisted.inserted,
            outcome.skipped_known,
            outcome.malformed,
            audit.classification.label(),
            decision.as_str()
        );
        Ok(())
    }

    /// Read-only phase: watermark, extraction with early stopping, and audit.
    async fn prepare(&self, entity: &Entity) -> Result<PreparedPass, PassFailure> {
        let watermark = self.store.get_watermark(entity.id).await?;
        let known = self.store.known_identities(entity.id).await?;

        let (opened, open_retries) =
            open_with_retry(self.source.as_ref(), entity, self.backoff, self.call_timeout).await?;
        let meta = opened.meta;
        let mut cursor = RetryingCursor::new(opened.cursor, self.backoff, self.call_timeout);
        let scan = self
            .coordinator
            .scan(&mut cursor, watermark.as_ref(), &known)
            .await?;
        let retries = open_retries + cursor.retries();

        let previous_total = self.store.review_count(entity.id).await?;
        let history = self
            .store
            .recent_history(entity.id, self.auditor.policy().history_window)
            .await?;
        let recorded_at = Utc::now();
        let new_total = previous_total + scan.new_reviews.len() as i64;
        let audit = self
            .auditor
            .classify(&history, previous_total, new_total, recorded_at);
        if let Some(reason) = audit.classification.reason() {
            warn!(
                kind = SyncErrorKind::AnomalyDetected.as_str(),
                delta = audit.delta,
                reason,
                "review delta flagged as anomaly"
            );
        }

        Ok(PreparedPass {
            watermark,
            meta,
            scan,
            retries,
            audit,
            recorded_at,
        })
    }

    /// New reviews plus anything persisted by an earlier pass whose enrichment never finished.
    async fn gate_input(&self, entity: &Entity, new: Vec<Review>) -> Result<Vec<Review>, PassFailure> {
        let Some(since) = entity.enrichment_pending_since else {
            return Ok(new);
        };
        let mut seen = new.iter().map(|r| r.identity.clone()).collect::<HashSet<_>>();
        let mut input = new;
        let pending = self.store.reviews_scraped_since(entity.id, since).await?;
        info!(pending = pending.len(), %since, "resuming pending enrichment");
        input.extend(pending.into_iter().filter(|r| seen.insert(r.identity.clone())));
        Ok(input)
    }

    async fn append_run_log(&self, run_id: Uuid, outcome: &EntityOutcome) {
        let entry = RunLogEntry {
            run_id,
            entity_id: Some(outcome.entity_id),
            status: outcome.status,
            message: outcome.message.clone(),
            observed: outcome.observed,
            new_reviews: outcome.inserted,
            skipped_known: outcome.skipped_known,
            malformed: outcome.malformed,
            attempts: outcome.retries + 1,
            duration_ms: outcome.duration_ms,
            recorded_at: Utc::now(),
        };
        if let Err(err) = self.store.append_run_log(&entry).await {
            warn!(error = %err, "failed to append run log");
        }
    }
}
