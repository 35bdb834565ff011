//! Run-report notification boundary.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};
use vrs_storage::HttpClient;

use crate::report::RunReport;

const COLOR_OK: u32 = 0x2e_cc_71;
const COLOR_WARN: u32 = 0xf1_c4_0f;
const COLOR_FAIL: u32 = 0xe7_4c_3c;
const MAX_LISTED: usize = 5;

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, report: &RunReport) -> anyhow::Result<()>;
}

/// Used when no channel is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn notify(&self, _report: &RunReport) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct DiscordNotifier {
    http: Arc<HttpClient>,
    webhook_url: String,
}

impl DiscordNotifier {
    pub fn new(http: Arc<HttpClient>, webhook_url: impl Into<String>) -> Self {
        Self {
            http,
            webhook_url: webhook_url.into(),
        }
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn notify(&self, report: &RunReport) -> anyhow::Result<()> {
        self.http
            .post_json("discord", &self.webhook_url, None, &discord_payload(report))
            .await?;
        Ok(())
    }
}

pub fn discord_payload(report: &RunReport) -> JsonValue {
    let t = &report.totals;
    let color = if t.failed + t.conflicts > 0 {
        COLOR_FAIL
    } else if t.anomalies > 0 || t.cancelled > 0 {
        COLOR_WARN
    } else {
        COLOR_OK
    };

    let mut description = vec![
        format!(
            "**{}** entities: {} updated, {} unchanged, {} failed, {} conflict, {} locked, {} cancelled",
            t.entities, t.updated, t.unchanged, t.failed, t.conflicts, t.locked, t.cancelled
        ),
        format!(
            "**{}** new reviews, {} malformed skipped, {} summaries regenerated, {} touched",
            t.new_reviews, t.malformed, t.regenerated, t.touched
        ),
    ];

    let anomalies = report
        .anomalies()
        .take(MAX_LISTED)
        .map(|(o, reason)| format!("- {}: {reason}", o.entity_name))
        .collect::<Vec<_>>();
    if !anomalies.is_empty() {
        description.push(String::new());
        description.push("**Anomalies**".to_string());
        description.extend(anomalies);
    }

    let failures = report
        .failures()
        .take(MAX_LISTED)
        .map(|o| {
            format!(
                "- {} [{}]: {}",
                o.entity_name,
                o.error_kind.map(|k| k.as_str()).unwrap_or(o.status.as_str()),
                o.message
            )
        })
        .collect::<Vec<_>>();
    if !failures.is_empty() {
        description.push(String::new());
        description.push("**Failures**".to_string());
        description.extend(failures);
    }

    json!({
        "embeds": [{
            "title": "Venue review sync",
            "description": description.join("\n"),
            "color": color,
            "timestamp": report.finished_at.to_rfc3339(),
            "footer": { "text": format!("run {}", report.run_id) },
        }]
    })
}

/// Delivery failures are logged and never fail the run.
pub async fn notify_best_effort(notifier: &dyn Notifier, report: &RunReport) {
    match notifier.notify(report).await {
        Ok(()) => info!(notifier = notifier.name(), run_id = %report.run_id, "run report delivered"),
        Err(err) => warn!(
            notifier = notifier.name(),
            run_id = %report.run_id,
            error = %err,
            "run report notification failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;
    use vrs_core::{Entity, RunStatus, SyncErrorKind};

    use crate::report::EntityOutcome;

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn notify(&self, _report: &RunReport) -> anyhow::Result<()> {
            anyhow::bail!("webhook returned 500")
        }
    }

    fn report(failed: bool) -> RunReport {
        let mut outcome = EntityOutcome::new(&Entity::new(7, "Parrilla Don Julio"));
        if failed {
            outcome.status = RunStatus::Failed;
            outcome.error_kind = Some(SyncErrorKind::ExtractionFatal);
            outcome.message = "layout changed".into();
        }
        RunReport::new(Uuid::new_v4(), Utc::now(), Utc::now(), vec![outcome])
    }

    #[test]
    fn payload_lists_failures_and_picks_color() {
        let payload = discord_payload(&report(true));
        let embed = &payload["embeds"][0];
        assert_eq!(embed["color"], COLOR_FAIL);
        let description = embed["description"].as_str().unwrap();
        assert!(description.contains("- Parrilla Don Julio [extraction_fatal]: layout changed"));

        assert_eq!(discord_payload(&report(false))["embeds"][0]["color"], COLOR_OK);
    }

    #[tokio::test]
    async fn notification_failures_do_not_propagate() {
        notify_best_effort(&FailingNotifier, &report(false)).await;
        notify_best_effort(&NoopNotifier, &report(false)).await;
    }
}
