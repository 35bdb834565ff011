use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use vrs_adapters::{
    CaptureBundleSource, CaptureMeta, ExtractionError, ExtractionSource, OpenedCapture, VecCursor,
};
use vrs_core::{
    content_identity, ContentIdentity, DeltaClassification, Entity, EntityId, IdentityConfig,
    ObservedReview, RawReview, RunStatus, SyncErrorKind, Watermark,
};
use vrs_storage::{
    BackoffPolicy, MemoryStore, MemoryVectorStore, SyncStore, WatermarkStore,
};
use vrs_sync::{
    CapabilityError, Embedder, EnrichmentGate, GateDecision, Policy, RedundancyJudge, RunReport,
    StopReason, Summarizer, SyncOrchestrator,
};

#[derive(Clone)]
enum Script {
    Reviews(Vec<RawReview>),
    Fail(ExtractionError),
    Hang,
    Panic,
}

#[derive(Default)]
struct ScriptedSource {
    scripts: Mutex<HashMap<EntityId, Script>>,
    opens: AtomicUsize,
}

impl ScriptedSource {
    fn set(&self, id: i64, script: Script) {
        self.scripts.lock().unwrap().insert(EntityId(id), script);
    }
}

#[async_trait]
impl ExtractionSource for ScriptedSource {
    fn source_id(&self) -> &'static str {
        "scripted"
    }

    async fn open(&self, entity: &Entity) -> Result<OpenedCapture, ExtractionError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&entity.id)
            .cloned()
            .unwrap_or(Script::Reviews(Vec::new()));
        match script {
            Script::Reviews(items) => Ok(OpenedCapture {
                meta: CaptureMeta::now("scripted-v1"),
                cursor: Box::new(VecCursor::new(items)),
            }),
            Script::Fail(err) => Err(err),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Err(ExtractionError::Transient("hung".into()))
            }
            Script::Panic => panic!("capture layout table is corrupt"),
        }
    }
}

/// Moves the watermark behind the orchestrator's back, like an overlapping writer
/// that ignored the entity lock.
struct RacingSource {
    inner: ScriptedSource,
    store: Arc<MemoryStore>,
    racer_watermark: Watermark,
}

#[async_trait]
impl ExtractionSource for RacingSource {
    fn source_id(&self) -> &'static str {
        "racing"
    }

    async fn open(&self, entity: &Entity) -> Result<OpenedCapture, ExtractionError> {
        let current = self.store.get_watermark(entity.id).await.unwrap();
        self.store
            .set_watermark(
                entity.id,
                &self.racer_watermark,
                current.as_ref().map(|w| &w.identity),
            )
            .await
            .unwrap();
        self.inner.open(entity).await
    }
}

#[derive(Default)]
struct CountingJudge {
    /// `None` makes the judge fail.
    verdict: Mutex<Option<bool>>,
    calls: AtomicUsize,
}

#[async_trait]
impl RedundancyJudge for CountingJudge {
    async fn is_redundant(
        &self,
        _summary: &str,
        _new_reviews: &[String],
    ) -> Result<bool, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.verdict
            .lock()
            .unwrap()
            .ok_or_else(|| CapabilityError::Unavailable("judge timed out".into()))
    }
}

#[derive(Default)]
struct CountingSummarizer {
    fail: AtomicBool,
    calls: AtomicUsize,
}

#[async_trait]
impl Summarizer for CountingSummarizer {
    async fn summarize(&self, entity: &Entity, samples: &[String]) -> Result<String, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(CapabilityError::Unavailable("rate limited".into()));
        }
        Ok(format!("Resumen de {} con {} reseñas", entity.name, samples.len()))
    }
}

struct UnitEmbedder;

#[async_trait]
impl Embedder for UnitEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, CapabilityError> {
        Ok(vec![1.0, 0.0, 0.0])
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    vectors: Arc<MemoryVectorStore>,
    judge: Arc<CountingJudge>,
    summarizer: Arc<CountingSummarizer>,
    policy: Policy,
}

impl Harness {
    async fn new(ids: &[i64]) -> Self {
        let store = Arc::new(MemoryStore::new());
        for id in ids {
            store
                .upsert_entity(&Entity::new(*id, format!("Lugar {id}")))
                .await
                .unwrap();
        }
        let judge = Arc::new(CountingJudge::default());
        *judge.verdict.lock().unwrap() = Some(true);
        Self {
            store,
            vectors: Arc::new(MemoryVectorStore::new()),
            judge,
            summarizer: Arc::new(CountingSummarizer::default()),
            policy: Policy::default(),
        }
    }

    fn orchestrator(&self, source: Arc<dyn ExtractionSource>) -> SyncOrchestrator {
        let gate = EnrichmentGate::new(
            self.policy.gate,
            self.judge.clone(),
            self.summarizer.clone(),
            Arc::new(UnitEmbedder),
            self.vectors.clone(),
        );
        SyncOrchestrator::new(self.store.clone(), source, Arc::new(gate), &self.policy)
            .with_backoff(BackoffPolicy::none())
            .with_concurrency(3)
    }

    async fn run(&self, source: Arc<dyn ExtractionSource>) -> RunReport {
        self.orchestrator(source)
            .run_catalogue(100, None)
            .await
            .unwrap()
    }

    async fn identities(&self, id: i64) -> HashSet<ContentIdentity> {
        self.store.known_identities(EntityId(id)).await.unwrap()
    }

    async fn watermark(&self, id: i64) -> Option<ContentIdentity> {
        self.store
            .get_watermark(EntityId(id))
            .await
            .unwrap()
            .map(|w| w.identity)
    }
}

fn raw(tag: &str, date: &str) -> RawReview {
    RawReview {
        author: Some(format!("Autor {tag}")),
        rating: Some(4.0),
        body: Some(format!("Reseña {tag}: comida abundante y atención muy cordial")),
        published_at: Some(date.to_string()),
        published_raw: None,
    }
}

fn h(n: u32) -> RawReview {
    raw(&format!("h{n}"), &format!("2026-03-{n:02}"))
}

fn id_of(review: &RawReview) -> ContentIdentity {
    content_identity(review, &IdentityConfig::default()).unwrap()
}

fn outcome(report: &RunReport, id: i64) -> &vrs_sync::EntityOutcome {
    report
        .outcomes
        .iter()
        .find(|o| o.entity_id == EntityId(id))
        .expect("outcome for entity")
}

#[tokio::test]
async fn watermark_stops_extraction_and_advances_to_newest() {
    let harness = Harness::new(&[1]).await;
    let source = Arc::new(ScriptedSource::default());

    source.set(1, Script::Reviews(vec![h(7), h(6)]));
    let first = harness.run(source.clone()).await;
    assert_eq!(harness.watermark(1).await, Some(id_of(&h(7))));
    assert_eq!(
        outcome(&first, 1).audit.as_ref().unwrap().classification,
        DeltaClassification::Initialization
    );

    source.set(1, Script::Reviews(vec![h(9), h(8), h(7), h(6)]));
    let second = harness.run(source.clone()).await;
    let o = outcome(&second, 1);
    assert_eq!(o.status, RunStatus::Updated);
    assert_eq!(o.inserted, 2);
    assert_eq!(o.observed, 3, "h6 lies past the watermark and is never pulled");
    assert_eq!(o.stop, Some(StopReason::WatermarkReached));
    assert!(o.watermark_advanced);
    assert_eq!(
        o.audit.as_ref().unwrap().classification,
        DeltaClassification::Organic
    );

    let accepted = o.accepted.iter().map(|r| r.identity.clone()).collect::<Vec<_>>();
    assert_eq!(accepted, vec![id_of(&h(9)), id_of(&h(8))]);
    assert_eq!(harness.watermark(1).await, Some(id_of(&h(9))));
    assert_eq!(harness.identities(1).await.len(), 4);
}

#[tokio::test]
async fn reordered_source_skips_known_items_until_the_watermark() {
    let harness = Harness::new(&[1]).await;
    let config = IdentityConfig::default();
    let seeded = [h(9), h(7)]
        .into_iter()
        .map(|r| {
            ObservedReview::from_raw(r, &config)
                .unwrap()
                .into_review(EntityId(1), Utc::now())
        })
        .collect::<Vec<_>>();
    harness.store.seed_reviews(seeded).await;
    harness
        .store
        .set_watermark(
            EntityId(1),
            &Watermark {
                identity: id_of(&h(7)),
                published_at: Some("2026-03-07".into()),
                committed_at: Utc::now(),
            },
            None,
        )
        .await
        .unwrap();

    let source = Arc::new(ScriptedSource::default());
    source.set(1, Script::Reviews(vec![h(8), h(9), h(7)]));
    let report = harness.run(source).await;
    let o = outcome(&report, 1);

    assert_eq!(o.inserted, 1);
    assert_eq!(o.skipped_known, 1);
    assert_eq!(o.accepted[0].identity, id_of(&h(8)));
    assert_eq!(o.stop, Some(StopReason::WatermarkReached));
    assert_eq!(harness.watermark(1).await, Some(id_of(&h(9))));
    assert_eq!(harness.identities(1).await.len(), 3);
}

#[tokio::test]
async fn first_sync_is_initialization_regardless_of_size() {
    let mut harness = Harness::new(&[6]).await;
    harness.policy.scan.max_depth = 2_000;
    let items = (0..1_200)
        .map(|i| raw(&format!("f{i}"), "2026-02-01"))
        .collect::<Vec<_>>();
    let source = Arc::new(ScriptedSource::default());
    source.set(6, Script::Reviews(items));

    let report = harness.run(source).await;
    let o = outcome(&report, 6);
    let audit = o.audit.as_ref().unwrap();
    assert_eq!(audit.delta, 1_200);
    assert!(audit.delta > harness.policy.audit.absolute_ceiling);
    assert_eq!(audit.classification, DeltaClassification::Initialization);
    assert_eq!(report.totals.anomalies, 0);
    assert_eq!(harness.store.history_of(EntityId(6)).await.len(), 1);
}

#[tokio::test]
async fn backfill_after_baseline_is_flagged_but_not_blocking() {
    let harness = Harness::new(&[2]).await;
    let source = Arc::new(ScriptedSource::default());
    source.set(2, Script::Reviews(vec![h(1)]));
    harness.run(source.clone()).await;

    let backfill = (0..40)
        .map(|i| raw(&format!("b{i}"), "2026-03-20"))
        .chain([h(1)])
        .collect::<Vec<_>>();
    source.set(2, Script::Reviews(backfill));
    let report = harness.run(source).await;
    let o = outcome(&report, 2);

    assert!(o.anomaly_reason().is_some());
    assert_eq!(o.status, RunStatus::Updated);
    assert_eq!(o.inserted, 40);
    assert_eq!(report.totals.anomalies, 1);
}

#[tokio::test]
async fn unchanged_entity_is_touched_without_judgment_and_stays_idempotent() {
    let harness = Harness::new(&[1]).await;
    let source = Arc::new(ScriptedSource::default());
    source.set(1, Script::Reviews(vec![h(3), h(2), h(1)]));

    let first = harness.run(source.clone()).await;
    assert_eq!(outcome(&first, 1).gate, Some(GateDecision::MissingSummary));
    let identities_after_first = harness.identities(1).await;
    let summary_after_first = harness.store.load_summary(EntityId(1)).await.unwrap().unwrap();

    let second = harness.run(source.clone()).await;
    let o = outcome(&second, 1);
    assert_eq!(o.status, RunStatus::Unchanged);
    assert_eq!(o.inserted, 0);
    assert_eq!(o.gate, Some(GateDecision::NoNewReviews));
    assert_eq!(o.observed, 1);
    assert!(!o.watermark_advanced);

    assert_eq!(harness.identities(1).await, identities_after_first);
    assert_eq!(harness.judge.calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.summarizer.calls.load(Ordering::SeqCst), 1);

    let summary = harness.store.load_summary(EntityId(1)).await.unwrap().unwrap();
    assert_eq!(summary.summary, summary_after_first.summary);
    assert_eq!(summary.regenerated_at, summary_after_first.regenerated_at);
    assert!(summary.refreshed_at >= summary_after_first.refreshed_at);
    assert_eq!(harness.store.history_of(EntityId(1)).await.len(), 2);
}

#[tokio::test]
async fn redundant_reviews_only_touch_the_summary() {
    let harness = Harness::new(&[1]).await;
    let source = Arc::new(ScriptedSource::default());
    source.set(1, Script::Reviews(vec![h(1)]));
    harness.run(source.clone()).await;

    source.set(1, Script::Reviews(vec![h(2), h(1)]));
    let report = harness.run(source).await;
    let o = outcome(&report, 1);
    assert_eq!(o.gate, Some(GateDecision::JudgedRedundant));
    assert_eq!(harness.judge.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.summarizer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(o.status, RunStatus::Updated, "a new review was still stored");
}

#[tokio::test]
async fn judge_failure_falls_back_to_regeneration() {
    let harness = Harness::new(&[1]).await;
    let source = Arc::new(ScriptedSource::default());
    source.set(1, Script::Reviews(vec![h(1)]));
    harness.run(source.clone()).await;

    *harness.judge.verdict.lock().unwrap() = None;
    source.set(1, Script::Reviews(vec![h(2), h(1)]));
    let report = harness.run(source).await;
    let o = outcome(&report, 1);

    assert_eq!(o.gate, Some(GateDecision::JudgmentUnavailable));
    assert_eq!(o.status, RunStatus::Updated);
    assert_eq!(harness.judge.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.summarizer.calls.load(Ordering::SeqCst), 2);
    assert_eq!(harness.vectors.len().await, 1);
}

#[tokio::test]
async fn one_entity_failure_does_not_affect_siblings() {
    let harness = Harness::new(&[1, 2, 3]).await;
    harness.store.fail_persist_for(EntityId(2)).await;
    let source = Arc::new(ScriptedSource::default());
    source.set(1, Script::Reviews(vec![h(1)]));
    source.set(2, Script::Reviews(vec![h(1)]));
    source.set(3, Script::Fail(ExtractionError::Fatal("layout changed".into())));

    let report = harness.run(source).await;
    assert_eq!(outcome(&report, 1).status, RunStatus::Updated);

    let storage = outcome(&report, 2);
    assert_eq!(storage.status, RunStatus::Failed);
    assert_eq!(storage.error_kind, Some(SyncErrorKind::Storage));

    let fatal = outcome(&report, 3);
    assert_eq!(fatal.error_kind, Some(SyncErrorKind::ExtractionFatal));

    assert!(harness.watermark(1).await.is_some());
    assert!(harness.watermark(2).await.is_none());
    assert!(harness.watermark(3).await.is_none());
    assert_eq!(report.totals.failed, 2);

    let logs = harness.store.run_logs().await;
    assert_eq!(logs.len(), 3);
    assert!(logs.iter().all(|l| l.run_id == report.run_id));
    for id in [1, 2, 3] {
        assert!(!harness.store.is_locked(EntityId(id)).await);
    }
}

#[tokio::test]
async fn transient_errors_surface_after_bounded_retries() {
    let harness = Harness::new(&[4]).await;
    let source = Arc::new(ScriptedSource::default());
    source.set(4, Script::Fail(ExtractionError::Transient("navigation timeout".into())));

    let backoff = BackoffPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    };
    let report = harness
        .orchestrator(source.clone())
        .with_backoff(backoff)
        .run_catalogue(10, None)
        .await
        .unwrap();
    let o = outcome(&report, 4);
    assert_eq!(o.error_kind, Some(SyncErrorKind::ExtractionTransient));
    assert_eq!(source.opens.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn locked_entity_is_skipped_not_failed() {
    let harness = Harness::new(&[1, 2]).await;
    let held = harness.store.try_lock_entity(EntityId(1)).await.unwrap();
    let source = Arc::new(ScriptedSource::default());
    source.set(1, Script::Reviews(vec![h(1)]));
    source.set(2, Script::Reviews(vec![h(1)]));

    let report = harness.run(source).await;
    assert_eq!(outcome(&report, 1).status, RunStatus::Locked);
    assert_eq!(outcome(&report, 2).status, RunStatus::Updated);
    assert!(harness.identities(1).await.is_empty());
    assert!(harness.store.is_locked(EntityId(1)).await, "foreign lock is left alone");
    assert_eq!(report.totals.locked, 1);

    harness.store.unlock_entity(held).await.unwrap();
}

#[tokio::test]
async fn concurrent_watermark_move_is_a_persistence_conflict() {
    let harness = Harness::new(&[1]).await;
    let inner = ScriptedSource::default();
    inner.set(1, Script::Reviews(vec![h(5), h(4)]));
    let racer = Watermark {
        identity: ContentIdentity::from_stored("racer"),
        published_at: None,
        committed_at: Utc::now(),
    };
    let source = Arc::new(RacingSource {
        inner,
        store: harness.store.clone(),
        racer_watermark: racer.clone(),
    });

    let report = harness.run(source).await;
    let o = outcome(&report, 1);
    assert_eq!(o.status, RunStatus::Conflict);
    assert_eq!(o.error_kind, Some(SyncErrorKind::PersistenceConflict));
    assert!(!o.watermark_advanced);
    assert_eq!(harness.watermark(1).await, Some(racer.identity));
    assert_eq!(report.totals.conflicts, 1);
}

#[tokio::test]
async fn run_budget_cancels_in_flight_entities_without_partial_commits() {
    let harness = Harness::new(&[1]).await;
    let source = Arc::new(ScriptedSource::default());
    source.set(1, Script::Hang);

    let report = harness
        .orchestrator(source)
        .run_catalogue(10, Some(Duration::from_millis(50)))
        .await
        .unwrap();
    let o = outcome(&report, 1);
    assert_eq!(o.status, RunStatus::Cancelled);
    assert_eq!(o.error_kind, Some(SyncErrorKind::Cancelled));
    assert!(harness.store.history_of(EntityId(1)).await.is_empty());
    assert!(harness.watermark(1).await.is_none());
    assert!(!harness.store.is_locked(EntityId(1)).await);
}

#[tokio::test]
async fn failed_enrichment_is_resumed_on_the_next_pass() {
    let harness = Harness::new(&[1]).await;
    let source = Arc::new(ScriptedSource::default());
    source.set(1, Script::Reviews(vec![h(2), h(1)]));

    harness.summarizer.fail.store(true, Ordering::SeqCst);
    let first = harness.run(source.clone()).await;
    let o = outcome(&first, 1);
    assert_eq!(o.status, RunStatus::Failed);
    assert_eq!(o.error_kind, Some(SyncErrorKind::Enrichment));
    assert_eq!(o.inserted, 2, "reviews stay persisted");
    assert!(harness.watermark(1).await.is_none());
    let entity = harness.store.entity(EntityId(1)).await.unwrap();
    assert!(entity.enrichment_pending_since.is_some());

    harness.summarizer.fail.store(false, Ordering::SeqCst);
    let second = harness.run(source).await;
    let o = outcome(&second, 1);
    assert_eq!(o.inserted, 0);
    assert_eq!(o.skipped_known, 2);
    assert_eq!(o.gate, Some(GateDecision::MissingSummary));
    assert_eq!(o.status, RunStatus::Updated);
    assert_eq!(harness.watermark(1).await, Some(id_of(&h(2))));

    let entity = harness.store.entity(EntityId(1)).await.unwrap();
    assert!(entity.enrichment_pending_since.is_none());
    assert!(entity.last_synced_at.is_some());
    let summary = harness.store.load_summary(EntityId(1)).await.unwrap().unwrap();
    assert_eq!(summary.summary, "Resumen de Lugar 1 con 2 reseñas");
}

#[tokio::test]
async fn malformed_records_are_counted_and_skipped() {
    let harness = Harness::new(&[1]).await;
    let mut anonymous = h(4);
    anonymous.author = None;
    let source = Arc::new(ScriptedSource::default());
    source.set(1, Script::Reviews(vec![anonymous, h(3)]));

    let report = harness.run(source).await;
    let o = outcome(&report, 1);
    assert_eq!(o.malformed, 1);
    assert_eq!(o.inserted, 1);
    assert_eq!(harness.watermark(1).await, Some(id_of(&h(3))));
    assert_eq!(report.totals.malformed, 1);
}

#[tokio::test]
async fn hung_source_is_bounded_without_a_run_budget() {
    let harness = Harness::new(&[1, 2]).await;
    let source = Arc::new(ScriptedSource::default());
    source.set(1, Script::Hang);
    source.set(2, Script::Reviews(vec![h(1)]));

    let started = tokio::time::Instant::now();
    let report = harness
        .orchestrator(source)
        .with_call_timeout(Duration::from_millis(50))
        .run_catalogue(10, None)
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    let hung = outcome(&report, 1);
    assert_eq!(hung.status, RunStatus::Failed);
    assert_eq!(hung.error_kind, Some(SyncErrorKind::ExtractionTransient));
    assert!(hung.message.contains("timed out"));
    assert!(harness.watermark(1).await.is_none());
    assert!(!harness.store.is_locked(EntityId(1)).await);
    assert_eq!(outcome(&report, 2).status, RunStatus::Updated);
}

#[tokio::test]
async fn panicking_pass_fails_only_its_entity() {
    let harness = Harness::new(&[1, 2]).await;
    let source = Arc::new(ScriptedSource::default());
    source.set(1, Script::Panic);
    source.set(2, Script::Reviews(vec![h(2), h(1)]));

    let report = harness.run(source).await;
    let broken = outcome(&report, 1);
    assert_eq!(broken.status, RunStatus::Failed);
    assert_eq!(broken.error_kind, Some(SyncErrorKind::Internal));
    assert!(broken.message.contains("capture layout table is corrupt"));
    assert!(!harness.store.is_locked(EntityId(1)).await);

    assert_eq!(outcome(&report, 2).status, RunStatus::Updated);
    assert_eq!(harness.identities(2).await.len(), 2);
    assert_eq!(harness.store.run_logs().await.len(), 2);
}

#[tokio::test]
async fn out_of_range_relative_date_does_not_disturb_siblings() {
    let harness = Harness::new(&[1, 2]).await;
    let dir = tempfile::tempdir().unwrap();
    let block = |author: &str, date: &str, body: &str| {
        format!(
            r#"<div class="jftiEf"><div class="d4r55">{author}</div><span class="rsqaWe">{date}</span><span class="wiI7pd">{body}</span></div>"#
        )
    };
    let bundles = [
        (1, block("Rocío", "Hace 300000 años", "Fecha imposible pero reseña genuina.")),
        (2, block("Tomás", "Hace 2 días", "Milanesa enorme y cerveza bien fría.")),
    ];
    for (id, html) in bundles {
        let bundle = serde_json::json!({
            "entity_id": id,
            "source_url": null,
            "fetched_at": "2026-03-31T10:00:00Z",
            "extractor_version": "maps-reviews-v3",
            "raw_artifact": {
                "content_type": "text/html",
                "path": null,
                "inline_text": format!("<html><body>{html}</body></html>"),
            }
        });
        tokio::fs::write(dir.path().join(format!("{id}.json")), bundle.to_string())
            .await
            .unwrap();
    }

    let report = harness
        .run(Arc::new(CaptureBundleSource::new(dir.path())))
        .await;
    for id in [1, 2] {
        let o = outcome(&report, id);
        assert_eq!(o.status, RunStatus::Updated, "entity {id}: {}", o.message);
        assert_eq!(o.inserted, 1);
    }

    let stored = harness.store.reviews_of(EntityId(1)).await;
    assert_eq!(stored[0].published_at, None);
    assert_eq!(
        harness.store.reviews_of(EntityId(2)).await[0].published_at.as_deref(),
        Some("2026-03-29")
    );
}
