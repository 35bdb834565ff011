//! Delta auditing of review-count growth against an entity's history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vrs_core::{DeltaClassification, HistoryRecord};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditPolicy {
    /// Allowed multiple of the typical weekly growth.
    pub growth_multiplier: f64,
    /// Floor for the typical weekly growth of quiet or young entities.
    pub min_weekly_growth: f64,
    /// Any delta above this is anomalous regardless of history.
    pub absolute_ceiling: i64,
    /// History records considered when estimating typical growth.
    pub history_window: usize,
}

impl Default for AuditPolicy {
    fn default() -> Self {
        Self {
            growth_multiplier: 3.0,
            min_weekly_growth: 5.0,
            absolute_ceiling: 500,
            history_window: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub previous_total: i64,
    pub new_total: i64,
    pub delta: i64,
    pub classification: DeltaClassification,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaAuditor {
    policy: AuditPolicy,
}

impl DeltaAuditor {
    pub fn new(policy: AuditPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &AuditPolicy {
        &self.policy
    }

    /// Classifies the change from `previous_total` to `new_total`.
    ///
    /// `history` is newest first. `at` is the timestamp this run will record; no other
    /// clock is consulted.
    pub fn classify(
        &self,
        history: &[HistoryRecord],
        previous_total: i64,
        new_total: i64,
        at: DateTime<Utc>,
    ) -> AuditRecord {
        let delta = new_total - previous_total;
        let classification = self.classification(history, delta, at);
        AuditRecord {
            previous_total,
            new_total,
            delta,
            classification,
        }
    }

    fn classification(
        &self,
        history: &[HistoryRecord],
        delta: i64,
        at: DateTime<Utc>,
    ) -> DeltaClassification {
        let Some(latest) = history.first() else {
            return DeltaClassification::Initialization;
        };
        if delta < 0 {
            return DeltaClassification::Anomaly {
                reason: format!("review count decreased by {}", -delta),
            };
        }
        if delta > self.policy.absolute_ceiling {
            return DeltaClassification::Anomaly {
                reason: format!(
                    "delta {delta} exceeds absolute ceiling {}",
                    self.policy.absolute_ceiling
                ),
            };
        }

        let typical = self.typical_weekly_growth(history);
        let elapsed_days = days_between(latest.recorded_at, at).max(0.0);
        let allowed = self.policy.growth_multiplier * typical * (elapsed_days / 7.0).max(1.0);
        if delta as f64 > allowed {
            return DeltaClassification::Anomaly {
                reason: format!(
                    "delta {delta} exceeds {allowed:.1} allowed ({}x typical weekly growth {typical:.1} over {elapsed_days:.1} days)",
                    self.policy.growth_multiplier
                ),
            };
        }
        DeltaClassification::Organic
    }

    /// Weekly growth over the history window, never below the configured floor.
    pub fn typical_weekly_growth(&self, history: &[HistoryRecord]) -> f64 {
        let floor = self.policy.min_weekly_growth;
        let window = &history[..history.len().min(self.policy.history_window.max(2))];
        let (Some(newest), Some(oldest)) = (window.first(), window.last()) else {
            return floor;
        };
        if window.len() < 2 {
            return floor;
        }
        let span_days = days_between(oldest.recorded_at, newest.recorded_at);
        if span_days < 1.0 {
            return floor;
        }
        let growth = (newest.review_count - oldest.review_count).max(0) as f64;
        (growth * 7.0 / span_days).max(floor)
    }
}

fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_seconds() as f64 / 86_400.0
}
