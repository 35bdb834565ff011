//! Early-stopping scan over a newest-first review cursor.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vrs_adapters::{ExtractionError, ReviewCursor};
use vrs_core::{calendar_date, ContentIdentity, IdentityConfig, ObservedReview, Watermark};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanPolicy {
    /// Upper bound on items pulled from the cursor in one pass.
    pub max_depth: usize,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self { max_depth: 300 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    WatermarkReached,
    Exhausted,
    DepthLimit,
}

/// Most recent valid review seen by the scan, committed as watermark after a clean pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateWatermark {
    pub identity: ContentIdentity,
    pub published_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    pub observed: u32,
    pub skipped_known: u32,
    pub malformed: u32,
}

#[derive(Debug, Clone)]
pub struct ScanOutcome {
    /// New reviews in the order the source produced them.
    pub new_reviews: Vec<ObservedReview>,
    pub candidate: Option<CandidateWatermark>,
    pub stop: StopReason,
    pub stats: ScanStats,
}

impl ScanOutcome {
    pub fn truncated(&self) -> bool {
        self.stop == StopReason::DepthLimit
    }
}

/// Consumes a cursor until the watermark, exhaustion or the depth bound.
#[derive(Debug, Clone, Copy)]
pub struct EarlyStopCoordinator {
    identity: IdentityConfig,
    policy: ScanPolicy,
}

impl EarlyStopCoordinator {
    pub fn new(identity: IdentityConfig, policy: ScanPolicy) -> Self {
        Self { identity, policy }
    }

    /// Items matching the watermark stop the scan; items already stored are
    /// skipped without stopping, since a reordered source may still yield
    /// older unseen reviews after them.
    pub async fn scan(
        &self,
        cursor: &mut dyn ReviewCursor,
        watermark: Option<&Watermark>,
        known: &HashSet<ContentIdentity>,
    ) -> Result<ScanOutcome, ExtractionError> {
        let mut stats = ScanStats::default();
        let mut new_reviews = Vec::new();
        let mut seen = HashSet::new();
        let mut candidate: Option<CandidateWatermark> = None;
        let stop_at = watermark.map(|w| &w.identity);

        let stop = loop {
            if stats.observed as usize >= self.policy.max_depth {
                break StopReason::DepthLimit;
            }
            let Some(raw) = cursor.next_review().await? else {
                break StopReason::Exhausted;
            };
            stats.observed += 1;

            let review = match ObservedReview::from_raw(raw, &self.identity) {
                Ok(review) => review,
                Err(err) => {
                    stats.malformed += 1;
                    debug!(error = %err, position = stats.observed, "skipping malformed review");
                    continue;
                }
            };

            if candidate
                .as_ref()
                .map_or(true, |c| is_newer(&review, c))
            {
                candidate = Some(CandidateWatermark {
                    identity: review.identity.clone(),
                    published_at: review.published_at.clone(),
                });
            }

            if Some(&review.identity) == stop_at {
                break StopReason::WatermarkReached;
            }
            if known.contains(&review.identity) || !seen.insert(review.identity.clone()) {
                stats.skipped_known += 1;
                continue;
            }
            new_reviews.push(review);
        };

        if stop == StopReason::DepthLimit {
            warn!(
                max_depth = self.policy.max_depth,
                watermark = watermark.is_some(),
                "scan hit depth limit before reaching known content"
            );
        }

        Ok(ScanOutcome {
            new_reviews,
            candidate,
            stop,
            stats,
        })
    }
}

/// A later item only displaces the candidate when it carries a strictly later date.
/// Dates that do not parse count as undated.
fn is_newer(review: &ObservedReview, candidate: &CandidateWatermark) -> bool {
    match (
        review.published_at.as_deref().and_then(calendar_date),
        candidate.published_at.as_deref().and_then(calendar_date),
    ) {
        (Some(a), Some(b)) => a > b,
        (Some(_), None) => true,
        _ => false,
    }
}
