//! Persistence contracts, raw capture artifacts and outbound HTTP for VRS.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub mod memory;
pub mod postgres;
pub mod store;
pub mod vector;

pub use memory::{MemoryStore, MemoryVectorStore};
pub use postgres::{PgStore, PgVectorStore};
pub use store::{
    EntityLock, FinalizeEntity, PersistOutcome, ReviewBatch, StoreError, SyncStore,
    WatermarkStore,
};
pub use vector::VectorStore;

pub const CRATE_NAME: &str = "vrs-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Raw capture handed to the artifact store before parsing.
#[derive(Debug, Clone, Copy)]
pub struct CaptureArtifact<'a> {
    pub captured_at: DateTime<Utc>,
    pub entity_key: &'a str,
    pub extension: &'a str,
    pub bytes: &'a [u8],
}

/// Immutable, hash-addressed store for raw extraction captures.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn capture_relative_path(
        captured_at: DateTime<Utc>,
        entity_key: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let day = captured_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(day)
            .join(entity_key)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Stores a capture once; identical bytes for the same entity and day are deduplicated.
    pub async fn put_capture(&self, capture: CaptureArtifact<'_>) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(capture.bytes);
        let relative_path = Self::capture_relative_path(
            capture.captured_at,
            capture.entity_key,
            &content_hash,
            capture.extension,
        );
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating capture directory {}", parent.display()))?;

        let stored = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: capture.bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking capture path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.capture.tmp", Uuid::new_v4()));
        write_then_flush(&temp_path, capture.bytes).await?;

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming capture {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

async fn write_then_flush(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("opening temp capture {}", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp capture {}", path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp capture {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential, capped backoff shared by every external boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_endpoint_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            global_concurrency: 8,
            per_endpoint_concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Coarse request pacing for rate-limited APIs.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after {attempts} attempt(s): {source}")]
    Request {
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempt(s)")]
    HttpStatus {
        status: u16,
        url: String,
        attempts: usize,
    },
    #[error("response from {url} was not valid JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn attempts(&self) -> usize {
        match self {
            Self::Request { attempts, .. } | Self::HttpStatus { attempts, .. } => *attempts,
            Self::Decode { .. } => 1,
        }
    }
}

/// JSON-over-HTTP client used for LLM, embedding and webhook calls.
///
/// Retries timeouts, connection failures, 5xx and 429 with [`BackoffPolicy`],
/// and bounds concurrency globally and per endpoint.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_endpoint_limit: usize,
    per_endpoint: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    rate_limit: Option<TokenBucketConfig>,
    backoff: BackoffPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_endpoint_limit: config.per_endpoint_concurrency.max(1),
            per_endpoint: Mutex::new(HashMap::new()),
            token_bucket,
            rate_limit: config.token_bucket,
            backoff: config.backoff,
        })
    }

    /// Pacing applied before every request, if any.
    pub fn rate_limit(&self) -> Option<TokenBucketConfig> {
        self.rate_limit
    }

    async fn endpoint_semaphore(&self, endpoint: &str) -> Arc<Semaphore> {
        let mut map = self.per_endpoint.lock().await;
        map.entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_endpoint_limit)))
            .clone()
    }

    /// POSTs `body` and decodes the response; an empty body decodes to `Null`.
    pub async fn post_json(
        &self,
        endpoint: &str,
        url: &str,
        bearer: Option<&str>,
        body: &JsonValue,
    ) -> Result<JsonValue, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_endpoint = self.endpoint_semaphore(endpoint).await;
        let _endpoint = per_endpoint.acquire().await.expect("semaphore not closed");

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_post", endpoint, url);
        self.post_with_retries(url, bearer, body).instrument(span).await
    }

    async fn post_with_retries(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &JsonValue,
    ) -> Result<JsonValue, FetchError> {
        let mut attempt = 0usize;
        loop {
            let mut request = self.client.post(url).json(body);
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }
            let can_retry = attempt < self.backoff.max_retries;

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let bytes = resp.bytes().await.map_err(|source| FetchError::Request {
                            attempts: attempt + 1,
                            source,
                        })?;
                        if bytes.iter().all(u8::is_ascii_whitespace) {
                            return Ok(JsonValue::Null);
                        }
                        return serde_json::from_slice(&bytes).map_err(|source| {
                            FetchError::Decode {
                                url: final_url,
                                source,
                            }
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        debug!(status = status.as_u16(), attempt, "retrying http post");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        attempts: attempt + 1,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        debug!(error = %err, attempt, "retrying http post");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request {
                        attempts: attempt + 1,
                        source: err,
                    });
                }
            }
        }
    }
}
