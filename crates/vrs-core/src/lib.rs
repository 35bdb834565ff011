//! Core domain model, content identity and error taxonomy for VRS.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "vrs-core";

/// Hex characters kept from the SHA-256 digest of a review projection.
pub const CONTENT_IDENTITY_LEN: usize = 32;

/// Stable internal key of a venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub i64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Soft lifecycle states; venues are never hard-deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    #[default]
    Active,
    Closed,
    Retired,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Retired => "retired",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "closed" => Self::Closed,
            "retired" => Self::Retired,
            _ => Self::Active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub zone: Option<String>,
    pub neighborhood: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub source_url: Option<String>,
    pub status: EntityStatus,
    pub reported_total: Option<i64>,
    pub rating: Option<f64>,
    pub enrichment_pending_since: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Entity {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id: EntityId(id),
            name: name.into(),
            zone: None,
            neighborhood: None,
            address: None,
            latitude: None,
            longitude: None,
            source_url: None,
            status: EntityStatus::Active,
            reported_total: None,
            rating: None,
            enrichment_pending_since: None,
            last_synced_at: None,
        }
    }
}

/// Review exactly as the extraction source handed it over.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawReview {
    pub author: Option<String>,
    pub rating: Option<f64>,
    pub body: Option<String>,
    /// Approximate ISO date derived at the extraction boundary.
    pub published_at: Option<String>,
    /// Date text as rendered by the source, kept for audit.
    pub published_raw: Option<String>,
}

/// Deterministic hash standing in for the missing native review key.
///
/// The hash covers a normalized projection of author, timestamp and a bounded
/// body prefix. Collisions are improbable but not formally excluded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentIdentity(String);

impl ContentIdentity {
    /// Wraps an identity previously produced by [`content_identity`] and read back from storage.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Normalized body characters that take part in the hash.
    pub body_prefix_chars: usize,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            body_prefix_chars: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("malformed record: missing {field}")]
    MalformedRecord { field: &'static str },
}

/// Lowercases, trims and collapses internal whitespace runs to one space.
pub fn normalize_fragment(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn required<'a>(value: Option<&'a str>, field: &'static str) -> Result<String, IdentityError> {
    let normalized = value.map(normalize_fragment).unwrap_or_default();
    if normalized.is_empty() {
        return Err(IdentityError::MalformedRecord { field });
    }
    Ok(normalized)
}

/// Computes the content identity of a raw review.
///
/// Author and timestamp are required; the body may be empty (rating-only reviews).
/// The timestamp is the source's raw date text when present, else `published_at`.
pub fn content_identity(
    raw: &RawReview,
    config: &IdentityConfig,
) -> Result<ContentIdentity, IdentityError> {
    let author = required(raw.author.as_deref(), "author")?;
    // The source rendering wins over a date derived from it: derived dates shift with capture time.
    let timestamp = required(
        raw.published_raw
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or(raw.published_at.as_deref()),
        "timestamp",
    )?;
    let body: String = raw
        .body
        .as_deref()
        .map(normalize_fragment)
        .unwrap_or_default()
        .chars()
        .take(config.body_prefix_chars)
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(author.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(timestamp.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(body.trim_end().as_bytes());
    let digest = hex::encode(hasher.finalize());
    Ok(ContentIdentity(digest[..CONTENT_IDENTITY_LEN].to_string()))
}

/// Reads the leading `YYYY-MM-DD` of a published date. Impossible calendar dates yield `None`.
pub fn calendar_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    let head = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// A raw review that passed identity generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedReview {
    pub identity: ContentIdentity,
    pub author: String,
    pub rating: Option<f64>,
    pub body: String,
    pub published_at: Option<String>,
    pub published_raw: Option<String>,
}

impl ObservedReview {
    pub fn from_raw(raw: RawReview, config: &IdentityConfig) -> Result<Self, IdentityError> {
        let identity = content_identity(&raw, config)?;
        Ok(Self {
            identity,
            author: raw.author.unwrap_or_default().trim().to_string(),
            rating: raw.rating,
            body: raw.body.unwrap_or_default().trim().to_string(),
            // Only real calendar dates are kept; identity already folded in the source text.
            published_at: raw.published_at.filter(|d| calendar_date(d).is_some()),
            published_raw: raw.published_raw,
        })
    }

    pub fn into_review(self, entity_id: EntityId, scraped_at: DateTime<Utc>) -> Review {
        Review {
            entity_id: Some(entity_id),
            identity: self.identity,
            author: self.author,
            rating: self.rating,
            body: self.body,
            published_at: self.published_at,
            scraped_at,
        }
    }
}

/// Persisted review. `entity_id` is `None` only for orphaned legacy rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub entity_id: Option<EntityId>,
    pub identity: ContentIdentity,
    pub author: String,
    pub rating: Option<f64>,
    pub body: String,
    /// Unparsed ISO string; cast explicitly before comparing with typed timestamps.
    pub published_at: Option<String>,
    pub scraped_at: DateTime<Utc>,
}

/// Pointer to the most recent review stored by the previous successful pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub identity: ContentIdentity,
    pub published_at: Option<String>,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeltaClassification {
    Organic,
    Initialization,
    Anomaly { reason: String },
}

impl DeltaClassification {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Organic => "organic",
            Self::Initialization => "initialization",
            Self::Anomaly { .. } => "anomaly",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Anomaly { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn from_parts(label: &str, reason: Option<String>) -> Self {
        match label {
            "initialization" => Self::Initialization,
            "anomaly" => Self::Anomaly {
                reason: reason.unwrap_or_default(),
            },
            _ => Self::Organic,
        }
    }

    pub fn is_anomaly(&self) -> bool {
        matches!(self, Self::Anomaly { .. })
    }
}

/// Append-only per-run snapshot of an entity's review count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub entity_id: EntityId,
    pub run_id: Uuid,
    pub review_count: i64,
    pub reported_total: Option<i64>,
    pub delta: i64,
    pub classification: DeltaClassification,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Updated,
    Unchanged,
    Failed,
    Conflict,
    Locked,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Failed => "failed",
            Self::Conflict => "conflict",
            Self::Locked => "locked",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Updated | Self::Unchanged)
    }
}

/// One append-only run log row per entity processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub run_id: Uuid,
    pub entity_id: Option<EntityId>,
    pub status: RunStatus,
    pub message: String,
    pub observed: u32,
    pub new_reviews: u32,
    pub skipped_known: u32,
    pub malformed: u32,
    pub attempts: u32,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentSummary {
    pub entity_id: EntityId,
    pub summary: String,
    pub regenerated_at: DateTime<Utc>,
    /// Freshness timestamp; touched on every gate pass.
    pub refreshed_at: DateTime<Utc>,
    pub source_review_count: i64,
}

/// How the finalize step should treat the enrichment summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SummaryUpdate {
    Touch { at: DateTime<Utc> },
    Replace(EnrichmentSummary),
}

/// Failure classes surfaced in run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    MalformedRecord,
    ExtractionTransient,
    ExtractionFatal,
    PersistenceConflict,
    JudgmentUnavailable,
    AnomalyDetected,
    Storage,
    Enrichment,
    Cancelled,
    /// The pass panicked; nothing after the panic point was committed.
    Internal,
}

impl SyncErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedRecord => "malformed_record",
            Self::ExtractionTransient => "extraction_transient",
            Self::ExtractionFatal => "extraction_fatal",
            Self::PersistenceConflict => "persistence_conflict",
            Self::JudgmentUnavailable => "judgment_unavailable",
            Self::AnomalyDetected => "anomaly_detected",
            Self::Storage => "storage",
            Self::Enrichment => "enrichment",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(author: &str, date: &str, body: &str) -> RawReview {
        RawReview {
            author: Some(author.to_string()),
            rating: Some(5.0),
            body: Some(body.to_string()),
            published_at: Some(date.to_string()),
            published_raw: None,
        }
    }

    #[test]
    fn identity_is_stable_under_whitespace_and_case_drift() {
        let config = IdentityConfig::default();
        let a = content_identity(&raw("Ana Pérez", "2026-02-01", "Muy buena  pizza.\n"), &config)
            .unwrap();
        let b = content_identity(&raw("  ana pérez ", "2026-02-01", "muy buena pizza."), &config)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), CONTENT_IDENTITY_LEN);
    }

    #[test]
    fn same_author_same_day_distinct_bodies_get_distinct_identities() {
        let config = IdentityConfig::default();
        let a = content_identity(&raw("Ana", "2026-02-01", "Fuimos a almorzar, excelente"), &config)
            .unwrap();
        let b = content_identity(&raw("Ana", "2026-02-01", "Volvimos a la noche, flojo"), &config)
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn body_beyond_prefix_does_not_affect_identity() {
        let config = IdentityConfig {
            body_prefix_chars: 10,
        };
        let a = content_identity(&raw("Ana", "2026-02-01", "0123456789 first render"), &config)
            .unwrap();
        let b = content_identity(&raw("Ana", "2026-02-01", "0123456789 re-rendered… más"), &config)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn missing_author_or_timestamp_is_malformed() {
        let config = IdentityConfig::default();
        let mut no_author = raw("", "2026-02-01", "ok");
        no_author.author = None;
        assert_eq!(
            content_identity(&no_author, &config),
            Err(IdentityError::MalformedRecord { field: "author" })
        );

        let blank_date = raw("Ana", "   ", "ok");
        assert_eq!(
            content_identity(&blank_date, &config),
            Err(IdentityError::MalformedRecord { field: "timestamp" })
        );
    }

    #[test]
    fn raw_date_text_wins_over_derived_date() {
        let config = IdentityConfig::default();
        let mut monday = raw("Ana", "2026-02-09", "ok");
        monday.published_raw = Some("Hace una semana".into());
        let mut tuesday = raw("Ana", "2026-02-10", "ok");
        tuesday.published_raw = Some("hace una  semana".into());
        assert_eq!(
            content_identity(&monday, &config).unwrap(),
            content_identity(&tuesday, &config).unwrap()
        );

        let mut raw_only = raw("Ana", "", "ok");
        raw_only.published_at = None;
        raw_only.published_raw = Some("Hace una semana".into());
        assert!(content_identity(&raw_only, &config).is_ok());
    }

    #[test]
    fn impossible_published_dates_are_dropped_at_observation() {
        let config = IdentityConfig::default();
        let bad = raw("Ana", "2026-13-45", "ok");
        let bad_identity = content_identity(&bad, &config).unwrap();
        let observed = ObservedReview::from_raw(bad, &config).unwrap();
        assert_eq!(observed.published_at, None);
        assert_eq!(observed.identity, bad_identity);

        let leap = ObservedReview::from_raw(raw("Ana", "2024-02-29", "ok"), &config).unwrap();
        assert_eq!(leap.published_at.as_deref(), Some("2024-02-29"));
        assert!(ObservedReview::from_raw(raw("Ana", "2026-02-30", "ok"), &config)
            .unwrap()
            .published_at
            .is_none());
    }

    #[test]
    fn calendar_date_reads_the_leading_iso_date() {
        assert_eq!(
            calendar_date("2026-03-09T10:00:00Z"),
            NaiveDate::from_ymd_opt(2026, 3, 9)
        );
        assert_eq!(calendar_date("2026-13-45"), None);
        assert_eq!(calendar_date("Hace 3 meses"), None);
        assert_eq!(calendar_date(""), None);
    }

    #[test]
    fn classification_round_trips_through_storage_parts() {
        let anomaly = DeltaClassification::Anomaly {
            reason: "delta 900 exceeds ceiling 500".into(),
        };
        let back = DeltaClassification::from_parts(anomaly.label(), anomaly.reason().map(str::to_string));
        assert_eq!(back, anomaly);
        assert_eq!(
            DeltaClassification::from_parts("initialization", None),
            DeltaClassification::Initialization
        );
    }
}
