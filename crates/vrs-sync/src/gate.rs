//! Enrichment gate: decides between a cheap freshness touch and full regeneration.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};
use vrs_core::{EnrichmentSummary, Entity, Review};
use vrs_storage::{StoreError, VectorStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatePolicy {
    /// Reviews at or under this many trimmed characters carry no information.
    pub min_review_chars: usize,
    /// Summaries shorter than this are treated as missing.
    pub min_summary_chars: usize,
    pub judge_max_reviews: usize,
    pub judge_review_chars: usize,
    pub sample_size: usize,
    pub sample_review_chars: usize,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            min_review_chars: 20,
            min_summary_chars: 10,
            judge_max_reviews: 10,
            judge_review_chars: 200,
            sample_size: 50,
            sample_review_chars: 1_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum CapabilityError {
    /// Timeouts, throttling, missing credentials, transport failures.
    #[error("capability unavailable: {0}")]
    Unavailable(String),
    #[error("malformed capability response: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error("vector store: {0}")]
    Vector(#[from] StoreError),
}

/// External judgment: does the new text add nothing beyond the summary?
#[async_trait]
pub trait RedundancyJudge: Send + Sync {
    async fn is_redundant(
        &self,
        summary: &str,
        new_reviews: &[String],
    ) -> Result<bool, CapabilityError>;
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, entity: &Entity, samples: &[String]) -> Result<String, CapabilityError>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    NoNewReviews,
    NoSubstantiveReviews,
    JudgedRedundant,
    MissingSummary,
    NewInformation,
    /// The judge failed; regenerating is the conservative branch.
    JudgmentUnavailable,
}

impl GateDecision {
    pub fn regenerates(&self) -> bool {
        matches!(
            self,
            Self::MissingSummary | Self::NewInformation | Self::JudgmentUnavailable
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoNewReviews => "no_new_reviews",
            Self::NoSubstantiveReviews => "no_substantive_reviews",
            Self::JudgedRedundant => "judged_redundant",
            Self::MissingSummary => "missing_summary",
            Self::NewInformation => "new_information",
            Self::JudgmentUnavailable => "judgment_unavailable",
        }
    }
}

pub struct EnrichmentGate {
    policy: GatePolicy,
    judge: Arc<dyn RedundancyJudge>,
    summarizer: Arc<dyn Summarizer>,
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
}

impl EnrichmentGate {
    pub fn new(
        policy: GatePolicy,
        judge: Arc<dyn RedundancyJudge>,
        summarizer: Arc<dyn Summarizer>,
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            policy,
            judge,
            summarizer,
            embedder,
            vectors,
        }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// An empty or non-substantive set never reaches the judge.
    pub async fn decide(
        &self,
        entity: &Entity,
        current: Option<&EnrichmentSummary>,
        new_reviews: &[Review],
    ) -> GateDecision {
        if new_reviews.is_empty() {
            return GateDecision::NoNewReviews;
        }

        let judge_input = new_reviews
            .iter()
            .map(|r| r.body.trim())
            .filter(|body| body.chars().count() > self.policy.min_review_chars)
            .take(self.policy.judge_max_reviews)
            .map(|body| truncate_chars(body, self.policy.judge_review_chars))
            .collect::<Vec<_>>();
        if judge_input.is_empty() {
            return GateDecision::NoSubstantiveReviews;
        }

        let summary = current
            .map(|s| s.summary.trim())
            .filter(|s| s.chars().count() >= self.policy.min_summary_chars);
        let Some(summary) = summary else {
            return GateDecision::MissingSummary;
        };

        match self.judge.is_redundant(summary, &judge_input).await {
            Ok(true) => {
                info!(entity_id = %entity.id, reviews = judge_input.len(), "judge: redundant");
                GateDecision::JudgedRedundant
            }
            Ok(false) => {
                info!(entity_id = %entity.id, reviews = judge_input.len(), "judge: new information");
                GateDecision::NewInformation
            }
            Err(err) => {
                warn!(
                    entity_id = %entity.id,
                    error = %err,
                    fallback = "judgment_unavailable",
                    "judge failed, regenerating conservatively"
                );
                GateDecision::JudgmentUnavailable
            }
        }
    }

    /// Summarizes a deterministic sample of `pool`, embeds the result and replaces the
    /// entity's vector. The returned summary is persisted by the caller.
    pub async fn regenerate(
        &self,
        entity: &Entity,
        pool: &[Review],
        source_review_count: i64,
        at: DateTime<Utc>,
    ) -> Result<EnrichmentSummary, EnrichmentError> {
        let samples = sample_reviews(pool, &self.policy)
            .into_iter()
            .map(|r| format_sample(r, self.policy.sample_review_chars))
            .collect::<Vec<_>>();
        if samples.is_empty() {
            return Err(CapabilityError::Malformed(format!(
                "no review text to summarize for entity {}",
                entity.id
            ))
            .into());
        }

        let summary = self.summarizer.summarize(entity, &samples).await?;
        let summary = summary.trim().to_string();
        if summary.is_empty() {
            return Err(CapabilityError::Malformed("empty summary".into()).into());
        }

        let embedding = self.embedder.embed(&embedding_text(entity, &summary)).await?;
        self.vectors
            .replace_entity_vector(entity.id, embedding, vector_metadata(entity))
            .await?;

        info!(
            entity_id = %entity.id,
            samples = samples.len(),
            summary_chars = summary.chars().count(),
            "summary regenerated"
        );
        Ok(EnrichmentSummary {
            entity_id: entity.id,
            summary,
            regenerated_at: at,
            refreshed_at: at,
            source_review_count,
        })
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Picks at most `sample_size` substantive reviews from `pool` (most recent first):
/// two fifths most recent, one fifth longest, one fifth extreme ratings, then the
/// remainder in recency order.
pub fn sample_reviews<'a>(pool: &'a [Review], policy: &GatePolicy) -> Vec<&'a Review> {
    let candidates = pool
        .iter()
        .filter(|r| r.body.trim().chars().count() > policy.min_review_chars)
        .collect::<Vec<_>>();
    let target = policy.sample_size;
    if candidates.len() <= target {
        return candidates;
    }

    let mut picked = Vec::with_capacity(target);
    let mut taken = HashSet::new();
    let mut take = |idx: usize, picked: &mut Vec<usize>| {
        if picked.len() < target && taken.insert(idx) {
            picked.push(idx);
        }
    };

    let recent = target * 2 / 5;
    for idx in 0..recent {
        take(idx, &mut picked);
    }

    let longest_quota = picked.len() + target / 5;
    let mut by_length = (0..candidates.len()).collect::<Vec<_>>();
    by_length.sort_by_key(|&idx| std::cmp::Reverse(candidates[idx].body.trim().chars().count()));
    for idx in by_length {
        if picked.len() >= longest_quota {
            break;
        }
        take(idx, &mut picked);
    }

    let extreme_quota = picked.len() + target / 5;
    for idx in 0..candidates.len() {
        if picked.len() >= extreme_quota {
            break;
        }
        if is_extreme(candidates[idx].rating) {
            take(idx, &mut picked);
        }
    }

    for idx in 0..candidates.len() {
        take(idx, &mut picked);
    }

    picked.into_iter().map(|idx| candidates[idx]).collect()
}

fn is_extreme(rating: Option<f64>) -> bool {
    matches!(rating.map(|r| r.round() as i64), Some(1 | 2 | 5))
}

/// Collapses repeated punctuation, character runs of three or more, and whitespace.
pub fn clean_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        let mut run = 1usize;
        while chars.peek() == Some(&c) {
            chars.next();
            run += 1;
        }
        let keep = match c {
            '.' | '!' | '?' | '-' => 1,
            _ if run >= 3 => 1,
            _ => run,
        };
        out.extend(std::iter::repeat(c).take(keep));
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn format_sample(review: &Review, max_chars: usize) -> String {
    let rating = review
        .rating
        .map(|r| r.to_string())
        .unwrap_or_else(|| "?".to_string());
    let text = truncate_chars(&clean_text(&review.body), max_chars);
    format!("[{rating}★] {text}")
}

fn embedding_text(entity: &Entity, summary: &str) -> String {
    let place = [entity.neighborhood.as_deref(), entity.zone.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(", ");
    if place.is_empty() {
        format!("{}\n\n{summary}", entity.name)
    } else {
        format!("{} ({place})\n\n{summary}", entity.name)
    }
}

fn vector_metadata(entity: &Entity) -> serde_json::Value {
    json!({
        "name": entity.name,
        "zone": entity.zone,
        "neighborhood": entity.neighborhood,
        "rating": entity.rating,
    })
}
