//! Capture bundles: one JSON file per entity holding a recorded listing page.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use vrs_core::{Entity, RawReview};
use vrs_storage::{ArtifactStore, CaptureArtifact};

use crate::html::parse_review_blocks;
use crate::{CaptureMeta, ExtractionError, ExtractionSource, OpenedCapture, VecCursor};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureBundle {
    pub entity_id: i64,
    #[serde(default)]
    pub entity_name: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    pub source_url: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub extractor_version: String,
    #[serde(default)]
    pub reported_total: Option<i64>,
    #[serde(default)]
    pub rating: Option<f64>,
    /// Pre-parsed reviews, newest first. Ignored when a raw artifact is present.
    #[serde(default)]
    pub reviews: Vec<RawReview>,
    #[serde(default)]
    pub raw_artifact: Option<CaptureRawArtifact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureRawArtifact {
    pub content_type: String,
    /// Relative to the bundle file.
    pub path: Option<String>,
    pub inline_text: Option<String>,
}

impl CaptureBundle {
    pub fn meta(&self) -> CaptureMeta {
        CaptureMeta {
            fetched_at: self.fetched_at,
            source_url: self.source_url.clone(),
            extractor_version: self.extractor_version.clone(),
            reported_total: self.reported_total,
            rating: self.rating,
        }
    }

    /// Catalogue record for the captured venue.
    pub fn entity(&self) -> Entity {
        let mut entity = Entity::new(
            self.entity_id,
            self.entity_name
                .clone()
                .unwrap_or_else(|| format!("venue-{}", self.entity_id)),
        );
        entity.zone = self.zone.clone();
        entity.source_url = self.source_url.clone();
        entity.reported_total = self.reported_total;
        entity.rating = self.rating;
        entity
    }

    pub fn raw_html(&self) -> Option<&str> {
        self.raw_artifact
            .as_ref()
            .filter(|a| a.content_type.contains("html"))
            .and_then(|a| a.inline_text.as_deref())
    }
}

/// Loads a bundle and inlines its raw artifact when it points at a sibling file.
pub async fn load_capture_bundle(path: impl AsRef<Path>) -> anyhow::Result<CaptureBundle> {
    let path = path.as_ref();
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut bundle: CaptureBundle =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    hydrate_raw_artifact(path, &mut bundle).await?;
    Ok(bundle)
}

async fn hydrate_raw_artifact(bundle_path: &Path, bundle: &mut CaptureBundle) -> anyhow::Result<()> {
    let Some(artifact) = bundle.raw_artifact.as_mut() else {
        return Ok(());
    };
    if artifact.inline_text.is_some() {
        return Ok(());
    }
    let Some(rel_path) = &artifact.path else {
        return Ok(());
    };
    let raw_path = bundle_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(rel_path);
    let raw = tokio::fs::read_to_string(&raw_path)
        .await
        .with_context(|| format!("reading raw capture {}", raw_path.display()))?;
    artifact.inline_text = Some(raw);
    Ok(())
}

/// Entities described by every bundle in `captures_dir`, ordered by id.
pub async fn discover_captured_entities(captures_dir: &Path) -> anyhow::Result<Vec<Entity>> {
    let mut entries = tokio::fs::read_dir(captures_dir)
        .await
        .with_context(|| format!("reading {}", captures_dir.display()))?;
    let mut entities = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("listing {}", captures_dir.display()))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let data = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let bundle: CaptureBundle =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        entities.push(bundle.entity());
    }
    entities.sort_by_key(|e| e.id);
    Ok(entities)
}

/// Reads `<captures_dir>/<entity_id>.json` for each entity.
#[derive(Debug, Clone)]
pub struct CaptureBundleSource {
    captures_dir: PathBuf,
    artifacts: Option<ArtifactStore>,
}

impl CaptureBundleSource {
    pub fn new(captures_dir: impl Into<PathBuf>) -> Self {
        Self {
            captures_dir: captures_dir.into(),
            artifacts: None,
        }
    }

    /// Keeps an immutable copy of every raw page before it is parsed.
    pub fn with_artifact_store(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn bundle_path(&self, entity: &Entity) -> PathBuf {
        self.captures_dir.join(format!("{}.json", entity.id))
    }
}

#[async_trait]
impl ExtractionSource for CaptureBundleSource {
    fn source_id(&self) -> &'static str {
        "capture-bundle"
    }

    async fn open(&self, entity: &Entity) -> Result<OpenedCapture, ExtractionError> {
        let path = self.bundle_path(entity);
        match tokio::fs::try_exists(&path).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(ExtractionError::Fatal(format!(
                    "no capture bundle at {}",
                    path.display()
                )))
            }
            Err(err) => return Err(ExtractionError::Transient(err.to_string())),
        }

        let bundle = load_capture_bundle(&path)
            .await
            .map_err(|err| ExtractionError::Fatal(format!("{err:#}")))?;
        if bundle.entity_id != entity.id.0 {
            return Err(ExtractionError::Fatal(format!(
                "bundle {} belongs to entity {}",
                path.display(),
                bundle.entity_id
            )));
        }

        let meta = bundle.meta();
        let reviews = match bundle.raw_html() {
            Some(html) => {
                if let Some(store) = &self.artifacts {
                    let stored = store
                        .put_capture(CaptureArtifact {
                            captured_at: bundle.fetched_at,
                            entity_key: &format!("venue-{}", entity.id),
                            extension: "html",
                            bytes: html.as_bytes(),
                        })
                        .await
                        .map_err(|err| ExtractionError::Transient(format!("{err:#}")))?;
                    debug!(
                        entity_id = %entity.id,
                        path = %stored.relative_path.display(),
                        deduplicated = stored.deduplicated,
                        "raw capture stored"
                    );
                }
                parse_review_blocks(html, bundle.fetched_at)?
            }
            None => bundle.reviews,
        };

        info!(
            entity_id = %entity.id,
            reviews = reviews.len(),
            extractor_version = %meta.extractor_version,
            "capture bundle opened"
        );
        Ok(OpenedCapture {
            meta,
            cursor: Box::new(VecCursor::new(reviews)),
        })
    }
}
