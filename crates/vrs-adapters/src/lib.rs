//! Extraction source contracts, capture-bundle source and retry boundary.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use vrs_core::{Entity, RawReview};
use vrs_storage::BackoffPolicy;

pub mod capture;
pub mod html;

pub use capture::{
    discover_captured_entities, load_capture_bundle, CaptureBundle, CaptureBundleSource,
    CaptureRawArtifact,
};
pub use html::{parse_relative_date, parse_review_blocks};

pub const CRATE_NAME: &str = "vrs-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    /// Navigation failures, timeouts, throttling. Worth retrying.
    #[error("transient extraction error: {0}")]
    Transient(String),
    /// The entity cannot be extracted this run.
    #[error("fatal extraction error: {0}")]
    Fatal(String),
}

impl ExtractionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Entity-level facts observed alongside the reviews.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureMeta {
    pub fetched_at: DateTime<Utc>,
    pub source_url: Option<String>,
    pub extractor_version: String,
    pub reported_total: Option<i64>,
    pub rating: Option<f64>,
}

impl CaptureMeta {
    pub fn now(extractor_version: impl Into<String>) -> Self {
        Self {
            fetched_at: Utc::now(),
            source_url: None,
            extractor_version: extractor_version.into(),
            reported_total: None,
            rating: None,
        }
    }
}

/// Lazy, newest-first sequence of raw reviews for one entity.
#[async_trait]
pub trait ReviewCursor: Send {
    async fn next_review(&mut self) -> Result<Option<RawReview>, ExtractionError>;
}

pub struct OpenedCapture {
    pub meta: CaptureMeta,
    pub cursor: Box<dyn ReviewCursor>,
}

impl fmt::Debug for OpenedCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedCapture")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ExtractionSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn open(&self, entity: &Entity) -> Result<OpenedCapture, ExtractionError>;
}

/// Cursor over reviews that are already materialized.
#[derive(Debug, Default)]
pub struct VecCursor {
    items: VecDeque<RawReview>,
}

impl VecCursor {
    pub fn new(items: impl IntoIterator<Item = RawReview>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.items.len()
    }
}

#[async_trait]
impl ReviewCursor for VecCursor {
    async fn next_review(&mut self) -> Result<Option<RawReview>, ExtractionError> {
        Ok(self.items.pop_front())
    }
}

/// Bounds one extraction call; expiry is a transient failure.
async fn within<T>(
    call_timeout: Duration,
    call: &str,
    fut: impl Future<Output = Result<T, ExtractionError>>,
) -> Result<T, ExtractionError> {
    match tokio::time::timeout(call_timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ExtractionError::Transient(format!(
            "{call} timed out after {}ms",
            call_timeout.as_millis()
        ))),
    }
}

/// Retries transient cursor failures with backoff; fatal errors pass through.
pub struct RetryingCursor {
    inner: Box<dyn ReviewCursor>,
    backoff: BackoffPolicy,
    call_timeout: Duration,
    retries: u32,
}

impl RetryingCursor {
    pub fn new(inner: Box<dyn ReviewCursor>, backoff: BackoffPolicy, call_timeout: Duration) -> Self {
        Self {
            inner,
            backoff,
            call_timeout,
            retries: 0,
        }
    }

    /// Retries spent so far across every `next_review` call.
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

#[async_trait]
impl ReviewCursor for RetryingCursor {
    async fn next_review(&mut self) -> Result<Option<RawReview>, ExtractionError> {
        let mut attempt = 0usize;
        loop {
            match within(self.call_timeout, "next_review", self.inner.next_review()).await {
                Err(err) if err.is_transient() && attempt < self.backoff.max_retries => {
                    debug!(error = %err, attempt, "retrying review cursor");
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                    self.retries += 1;
                }
                Err(err) if err.is_transient() => {
                    warn!(error = %err, attempts = attempt + 1, "review cursor retries exhausted");
                    return Err(err);
                }
                other => return other,
            }
        }
    }
}

/// Opens the entity's capture, retrying transient failures and calls that outlive
/// `call_timeout`. Returns the retry count.
pub async fn open_with_retry(
    source: &dyn ExtractionSource,
    entity: &Entity,
    backoff: BackoffPolicy,
    call_timeout: Duration,
) -> Result<(OpenedCapture, u32), ExtractionError> {
    let mut attempt = 0usize;
    loop {
        match within(call_timeout, "open", source.open(entity)).await {
            Ok(opened) => return Ok((opened, attempt as u32)),
            Err(err) if err.is_transient() && attempt < backoff.max_retries => {
                debug!(
                    source = source.source_id(),
                    entity_id = %entity.id,
                    error = %err,
                    attempt,
                    "retrying capture open"
                );
                tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
