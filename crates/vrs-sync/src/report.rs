//! Run reports: per-entity outcomes, markdown brief, JSON and Parquet snapshots.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;
use vrs_core::{Entity, EntityId, Review, RunStatus, SyncErrorKind};

use crate::auditor::AuditRecord;
use crate::coordinator::StopReason;
use crate::gate::GateDecision;

#[derive(Debug, Clone, Serialize)]
pub struct EntityOutcome {
    pub entity_id: EntityId,
    pub entity_name: String,
    pub status: RunStatus,
    pub error_kind: Option<SyncErrorKind>,
    pub message: String,
    pub observed: u32,
    pub new_reviews: u32,
    pub inserted: u32,
    pub skipped_known: u32,
    pub malformed: u32,
    pub retries: u32,
    pub stop: Option<StopReason>,
    pub truncated: bool,
    pub audit: Option<AuditRecord>,
    pub gate: Option<GateDecision>,
    pub watermark_advanced: bool,
    pub duration_ms: u64,
    /// Reviews accepted this pass; exported to Parquet, kept out of the JSON report.
    #[serde(skip)]
    pub accepted: Vec<Review>,
}

impl EntityOutcome {
    pub fn new(entity: &Entity) -> Self {
        Self {
            entity_id: entity.id,
            entity_name: entity.name.clone(),
            status: RunStatus::Unchanged,
            error_kind: None,
            message: String::new(),
            observed: 0,
            new_reviews: 0,
            inserted: 0,
            skipped_known: 0,
            malformed: 0,
            retries: 0,
            stop: None,
            truncated: false,
            audit: None,
            gate: None,
            watermark_advanced: false,
            duration_ms: 0,
            accepted: Vec::new(),
        }
    }

    pub fn anomaly_reason(&self) -> Option<&str> {
        self.audit.as_ref().and_then(|a| a.classification.reason())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunTotals {
    pub entities: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub locked: usize,
    pub cancelled: usize,
    pub new_reviews: usize,
    pub malformed: usize,
    pub anomalies: usize,
    pub regenerated: usize,
    pub touched: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub totals: RunTotals,
    pub outcomes: Vec<EntityOutcome>,
}

impl RunReport {
    pub fn new(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        outcomes: Vec<EntityOutcome>,
    ) -> Self {
        let mut totals = RunTotals {
            entities: outcomes.len(),
            ..RunTotals::default()
        };
        for outcome in &outcomes {
            match outcome.status {
                RunStatus::Updated => totals.updated += 1,
                RunStatus::Unchanged => totals.unchanged += 1,
                RunStatus::Failed => totals.failed += 1,
                RunStatus::Conflict => totals.conflicts += 1,
                RunStatus::Locked => totals.locked += 1,
                RunStatus::Cancelled => totals.cancelled += 1,
            }
            totals.new_reviews += outcome.inserted as usize;
            totals.malformed += outcome.malformed as usize;
            if outcome.anomaly_reason().is_some() {
                totals.anomalies += 1;
            }
            match outcome.gate {
                Some(decision) if decision.regenerates() => totals.regenerated += 1,
                Some(_) => totals.touched += 1,
                None => {}
            }
        }
        Self {
            run_id,
            started_at,
            finished_at,
            totals,
            outcomes,
        }
    }

    pub fn anomalies(&self) -> impl Iterator<Item = (&EntityOutcome, &str)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.anomaly_reason().map(|reason| (o, reason)))
    }

    pub fn failures(&self) -> impl Iterator<Item = &EntityOutcome> {
        self.outcomes.iter().filter(|o| !o.status.is_success())
    }

    pub fn gate_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for decision in self.outcomes.iter().filter_map(|o| o.gate) {
            *counts.entry(decision.as_str()).or_default() += 1;
        }
        counts
    }

    pub fn brief_markdown(&self) -> String {
        let t = &self.totals;
        let mut lines = vec![
            "# VRS Run Brief".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Started: {}", self.started_at),
            format!("- Finished: {}", self.finished_at),
            format!(
                "- Entities: {} (updated {}, unchanged {}, failed {}, conflict {}, locked {}, cancelled {})",
                t.entities, t.updated, t.unchanged, t.failed, t.conflicts, t.locked, t.cancelled
            ),
            format!("- New reviews: {}", t.new_reviews),
            format!("- Malformed records skipped: {}", t.malformed),
            format!("- Summaries regenerated: {} (touched {})", t.regenerated, t.touched),
            String::new(),
            "## Gate Decisions".to_string(),
        ];
        let gate_counts = self.gate_counts();
        if gate_counts.is_empty() {
            lines.push("- none".to_string());
        }
        lines.extend(gate_counts.iter().map(|(k, v)| format!("- {k}: {v}")));

        lines.push(String::new());
        lines.push("## Anomalies".to_string());
        let anomalies = self
            .anomalies()
            .map(|(o, reason)| format!("- {} (`{}`): {reason}", o.entity_name, o.entity_id))
            .collect::<Vec<_>>();
        if anomalies.is_empty() {
            lines.push("- none".to_string());
        }
        lines.extend(anomalies);

        lines.push(String::new());
        lines.push("## Failures".to_string());
        let failures = self
            .failures()
            .map(|o| {
                format!(
                    "- {} (`{}`) {} [{}]: {}",
                    o.entity_name,
                    o.entity_id,
                    o.status.as_str(),
                    o.error_kind.map(|k| k.as_str()).unwrap_or("-"),
                    o.message
                )
            })
            .collect::<Vec<_>>();
        if failures.is_empty() {
            lines.push("- none".to_string());
        }
        lines.extend(failures);
        lines.push(String::new());
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `run_brief.md`, `run_report.json` and the Parquet snapshots under
/// `<reports_root>/<run_id>/`. Returns the run directory.
pub async fn write_run_report(report: &RunReport, reports_root: &Path) -> Result<PathBuf> {
    let reports_dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(reports_dir.join("run_brief.md"), report.brief_markdown())
        .await
        .context("writing run_brief.md")?;
    let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(reports_dir.join("run_report.json"), json)
        .await
        .context("writing run_report.json")?;

    export_parquet_snapshots(report, &reports_dir).await?;
    Ok(reports_dir)
}

async fn export_parquet_snapshots(report: &RunReport, reports_dir: &Path) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let outcomes_path = snapshot_dir.join("entity_outcomes.parquet");
    let reviews_path = snapshot_dir.join("new_reviews.parquet");
    write_outcomes_parquet(&outcomes_path, &report.outcomes)?;
    write_new_reviews_parquet(&reviews_path, report.run_id, &report.outcomes)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("entity_outcomes", reports_dir, &outcomes_path)?,
            manifest_entry("new_reviews", reports_dir, &reviews_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_outcomes_parquet(path: &Path, outcomes: &[EntityOutcome]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("entity_id", DataType::Int64, false),
        ArrowField::new("entity_name", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("error_kind", DataType::Utf8, true),
        ArrowField::new("observed", DataType::UInt32, false),
        ArrowField::new("inserted", DataType::UInt32, false),
        ArrowField::new("skipped_known", DataType::UInt32, false),
        ArrowField::new("malformed", DataType::UInt32, false),
        ArrowField::new("delta_class", DataType::Utf8, true),
        ArrowField::new("anomaly_reason", DataType::Utf8, true),
        ArrowField::new("gate_decision", DataType::Utf8, true),
        ArrowField::new("watermark_advanced", DataType::Boolean, false),
    ]));

    let u32_col = |f: fn(&EntityOutcome) -> u32| UInt32Array::from(outcomes.iter().map(f).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(
                outcomes.iter().map(|o| o.entity_id.0).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                outcomes
                    .iter()
                    .map(|o| Some(o.entity_name.as_str()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                outcomes
                    .iter()
                    .map(|o| Some(o.status.as_str()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                outcomes
                    .iter()
                    .map(|o| o.error_kind.map(|k| k.as_str()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(u32_col(|o| o.observed)),
            Arc::new(u32_col(|o| o.inserted)),
            Arc::new(u32_col(|o| o.skipped_known)),
            Arc::new(u32_col(|o| o.malformed)),
            Arc::new(StringArray::from(
                outcomes
                    .iter()
                    .map(|o| o.audit.as_ref().map(|a| a.classification.label()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                outcomes.iter().map(|o| o.anomaly_reason()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                outcomes
                    .iter()
                    .map(|o| o.gate.map(|g| g.as_str()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(BooleanArray::from(
                outcomes.iter().map(|o| o.watermark_advanced).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building entity_outcomes record batch")?;
    write_parquet(path, batch)
}

fn write_new_reviews_parquet(path: &Path, run_id: Uuid, outcomes: &[EntityOutcome]) -> Result<()> {
    let rows = outcomes
        .iter()
        .flat_map(|o| o.accepted.iter().map(move |r| (o.entity_id, r)))
        .collect::<Vec<_>>();
    let run_id = run_id.to_string();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("run_id", DataType::Utf8, false),
        ArrowField::new("entity_id", DataType::Int64, false),
        ArrowField::new("content_id", DataType::Utf8, false),
        ArrowField::new("author", DataType::Utf8, false),
        ArrowField::new("rating", DataType::Float64, true),
        ArrowField::new("published_at", DataType::Utf8, true),
        ArrowField::new("body", DataType::Utf8, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                rows.iter().map(|_| Some(run_id.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                rows.iter().map(|(id, _)| id.0).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter()
                    .map(|(_, r)| Some(r.identity.as_str()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|(_, r)| Some(r.author.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|(_, r)| r.rating).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter()
                    .map(|(_, r)| r.published_at.as_deref())
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|(_, r)| Some(r.body.as_str())).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building new_reviews record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

/// Summarizes the latest `runs` report directories, newest first.
pub fn report_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join("run_report.json").exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# VRS Sync Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let report_path = dir.path().join("run_report.json");
        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&report_path)
                .with_context(|| format!("reading {}", report_path.display()))?,
        )
        .with_context(|| format!("parsing {}", report_path.display()))?;

        let total = |key: &str| {
            value
                .pointer(&format!("/totals/{key}"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };
        let finished = value
            .get("finished_at")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- finished: {finished}"));
        lines.push(format!(
            "- entities: {} (updated {}, failed {}, conflict {}, locked {}, cancelled {})",
            total("entities"),
            total("updated"),
            total("failed"),
            total("conflicts"),
            total("locked"),
            total("cancelled")
        ));
        lines.push(format!("- new reviews: {}", total("new_reviews")));
        lines.push(format!("- anomalies: {}", total("anomalies")));
        lines.push(format!(
            "- regenerated: {} / touched: {}",
            total("regenerated"),
            total("touched")
        ));
        let manifest_path = dir.path().join("snapshots").join("manifest.json");
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
