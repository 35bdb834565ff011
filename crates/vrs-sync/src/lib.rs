//! Incremental review synchronization: early stopping, delta auditing, enrichment gating.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;
use vrs_adapters::{discover_captured_entities, CaptureBundleSource};
use vrs_storage::{
    postgres, ArtifactStore, HttpClient, HttpClientConfig, MemoryStore, MemoryVectorStore, PgStore,
    PgVectorStore, SyncStore, VectorStore,
};

pub mod auditor;
pub mod config;
pub mod coordinator;
pub mod gate;
pub mod llm;
pub mod notify;
pub mod orchestrator;
pub mod report;

pub use auditor::{AuditPolicy, AuditRecord, DeltaAuditor};
pub use config::{Policy, SyncConfig};
pub use coordinator::{EarlyStopCoordinator, ScanOutcome, ScanPolicy, StopReason};
pub use gate::{
    CapabilityError, Embedder, EnrichmentGate, GateDecision, GatePolicy, RedundancyJudge,
    Summarizer,
};
pub use notify::{notify_best_effort, DiscordNotifier, NoopNotifier, Notifier};
pub use orchestrator::SyncOrchestrator;
pub use report::{report_markdown, write_run_report, EntityOutcome, RunReport, RunTotals};

pub const CRATE_NAME: &str = "vrs-sync";

const PG_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Postgres,
    /// Entities seeded from the capture bundles; nothing outlives the process.
    Memory,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub totals: RunTotals,
    pub reports_dir: String,
}

struct Capabilities {
    judge: Arc<dyn RedundancyJudge>,
    summarizer: Arc<dyn Summarizer>,
    embedder: Arc<dyn Embedder>,
}

fn http_client(config: &SyncConfig, policy: &Policy) -> Result<Arc<HttpClient>> {
    let client = HttpClient::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        backoff: policy.retry.backoff(),
        token_bucket: policy.rate_limit.token_bucket(),
        ..Default::default()
    })?;
    Ok(Arc::new(client))
}

/// Remote capabilities when keys are configured. Memory runs fall back to offline
/// stand-ins; Postgres runs refuse to start without them.
fn capabilities(config: &SyncConfig, http: &Arc<HttpClient>, mode: StoreMode) -> Result<Capabilities> {
    let offline = mode == StoreMode::Memory;

    let (judge, summarizer): (Arc<dyn RedundancyJudge>, Arc<dyn Summarizer>) =
        match llm::ChatCompletionsClient::new(http.clone(), &config.llm) {
            Ok(client) => {
                let client = Arc::new(client);
                (client.clone(), client)
            }
            Err(err) if offline => {
                warn!(error = %err, "using offline judge and extractive summarizer");
                (
                    Arc::new(llm::UnavailableJudge),
                    Arc::new(llm::ExtractiveSummarizer::default()),
                )
            }
            Err(err) => {
                return Err(err).context("LLM_API_KEY or DEEPSEEK_API_KEY is required for sync")
            }
        };

    let embedder: Arc<dyn Embedder> =
        match llm::EmbeddingsClient::new(http.clone(), &config.embedding) {
            Ok(client) => Arc::new(client),
            Err(err) if offline => {
                warn!(error = %err, "using offline hashing embedder");
                Arc::new(llm::HashingEmbedder {
                    dimension: config.embedding.dimension,
                })
            }
            Err(err) => {
                return Err(err)
                    .context("EMBEDDING_API_KEY or OPENAI_API_KEY is required for sync")
            }
        };

    Ok(Capabilities {
        judge,
        summarizer,
        embedder,
    })
}

async fn open_stores(
    config: &SyncConfig,
    mode: StoreMode,
) -> Result<(Arc<dyn SyncStore>, Arc<dyn VectorStore>)> {
    match mode {
        StoreMode::Postgres => {
            let pool = postgres::connect(&config.database_url, PG_MAX_CONNECTIONS)
                .await
                .context("connecting to postgres")?;
            Ok((
                Arc::new(PgStore::new(pool.clone())),
                Arc::new(PgVectorStore::new(pool, config.embedding.dimension)),
            ))
        }
        StoreMode::Memory => {
            let store = MemoryStore::new();
            for entity in discover_captured_entities(&config.captures_dir).await? {
                store.upsert_entity(&entity).await?;
            }
            Ok((Arc::new(store), Arc::new(MemoryVectorStore::new())))
        }
    }
}

/// Runs one full synchronization pass, writes the report and notifies.
pub async fn run_sync_once(config: &SyncConfig, mode: StoreMode) -> Result<SyncRunSummary> {
    let policy = Policy::load(&config.policy_path).await?;
    let http = http_client(config, &policy)?;
    let capabilities = capabilities(config, &http, mode)?;
    let (store, vectors) = open_stores(config, mode).await?;

    let source = CaptureBundleSource::new(config.captures_dir.clone())
        .with_artifact_store(ArtifactStore::new(config.artifacts_dir.clone()));
    let gate = EnrichmentGate::new(
        policy.gate,
        capabilities.judge,
        capabilities.summarizer,
        capabilities.embedder,
        vectors,
    );
    let orchestrator = SyncOrchestrator::new(store, Arc::new(source), Arc::new(gate), &policy)
        .with_concurrency(config.concurrency);

    let report = orchestrator
        .run_catalogue(config.entity_limit, config.run_budget)
        .await
        .context("listing entities")?;
    let reports_dir = write_run_report(&report, &config.reports_root()).await?;

    let notifier: Box<dyn Notifier> = match &config.discord_webhook_url {
        Some(url) => Box::new(DiscordNotifier::new(http.clone(), url.clone())),
        None => Box::new(NoopNotifier),
    };
    notify_best_effort(notifier.as_ref(), &report).await;

    Ok(SyncRunSummary {
        run_id: report.run_id,
        totals: report.totals.clone(),
        reports_dir: reports_dir.display().to_string(),
    })
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    run_sync_once(&SyncConfig::from_env(), StoreMode::Postgres).await
}

/// Applies the SQL migrations.
pub async fn migrate(config: &SyncConfig) -> Result<()> {
    let pool = postgres::connect(&config.database_url, 1)
        .await
        .context("connecting to postgres")?;
    postgres::run_migrations(&pool)
        .await
        .context("running migrations")?;
    Ok(())
}

/// Upserts every entity described by the capture bundles into the catalogue.
pub async fn register_captured_entities(config: &SyncConfig) -> Result<usize> {
    let entities = discover_captured_entities(&config.captures_dir).await?;
    let pool = postgres::connect(&config.database_url, 2)
        .await
        .context("connecting to postgres")?;
    let store = PgStore::new(pool);
    for entity in &entities {
        store
            .upsert_entity(entity)
            .await
            .with_context(|| format!("registering entity {}", entity.id))?;
    }
    Ok(entities.len())
}

/// Cron-driven full syncs; `None` when the scheduler is disabled.
pub async fn maybe_build_scheduler(config: &SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let shared = Arc::new(config.clone());
    let job = Job::new_async(config.sync_cron.as_str(), move |_uuid, _l| {
        let config = shared.clone();
        Box::pin(async move {
            match run_sync_once(&config, StoreMode::Postgres).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    updated = summary.totals.updated,
                    failed = summary.totals.failed,
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.sync_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub fn report_latest_runs(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    report_markdown(runs, &root.join("reports"))
}
