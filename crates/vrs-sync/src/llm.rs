//! Chat-completions and embeddings clients, plus offline stand-ins for dry runs.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use tracing::debug;
use vrs_core::{normalize_fragment, Entity};
use vrs_storage::{FetchError, HttpClient};

use crate::config::{EmbeddingConfig, LlmConfig};
use crate::gate::{CapabilityError, Embedder, RedundancyJudge, Summarizer};

const SAMPLE_SEPARATOR: &str = "\n---\n";

impl From<FetchError> for CapabilityError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Decode { .. } => Self::Malformed(err.to_string()),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// Reads the redundancy verdict: an answer starting with "SI"/"YES" means new information.
pub fn parse_verdict(answer: &str) -> Result<bool, CapabilityError> {
    let head = answer
        .trim_start_matches(|c: char| !c.is_alphabetic())
        .to_uppercase();
    if head.starts_with("SI") || head.starts_with("SÍ") || head.starts_with("YES") {
        Ok(false)
    } else if head.starts_with("NO") {
        Ok(true)
    } else {
        Err(CapabilityError::Malformed(format!(
            "unexpected verdict {:?}",
            answer.chars().take(40).collect::<String>()
        )))
    }
}

fn judge_prompt(summary: &str, new_reviews: &[String]) -> String {
    format!(
        "Resumen actual del lugar:\n\"{summary}\"\n\nReseñas nuevas:\n{}\n\n\
         ¿Las reseñas nuevas aportan algo importante que el resumen no refleje \
         (un servicio nuevo, una queja distinta, una característica no mencionada)?\n\
         Responde solo \"SI\" o \"NO\".",
        new_reviews.join(SAMPLE_SEPARATOR)
    )
}

fn summary_prompt(entity: &Entity, samples: &[String]) -> String {
    format!(
        "Redacta un perfil semántico del lugar \"{}\" a partir de sus reseñas. \
         El texto se convertirá en un embedding para búsqueda semántica.\n\
         - Oraciones completas, sin viñetas ni JSON.\n\
         - Incluye términos de búsqueda probables (económico, romántico, celíaco, para niños, estacionamiento).\n\
         - Expresa las carencias en forma afirmativa (\"sin estacionamiento propio\" en lugar de \"no tiene estacionamiento\").\n\
         - Si las opiniones están divididas, dilo (\"atención variable según el turno\").\n\
         - Tres párrafos sin títulos: tipo de lugar y ocasiones; fortalezas, debilidades, precio y atención; \
         características específicas y ubicación.\n\n\
         RESEÑAS:\n{}\n\nDevuelve solo el texto final.",
        entity.name,
        samples.join(SAMPLE_SEPARATOR)
    )
}

/// OpenAI-compatible `/chat/completions` client (DeepSeek by default).
pub struct ChatCompletionsClient {
    http: Arc<HttpClient>,
    api_key: String,
    url: String,
    model: String,
}

impl ChatCompletionsClient {
    pub fn new(http: Arc<HttpClient>, config: &LlmConfig) -> Result<Self, CapabilityError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| CapabilityError::Unavailable("no LLM API key configured".into()))?;
        Ok(Self {
            http,
            api_key,
            url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
        })
    }

    async fn complete(
        &self,
        prompt: String,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, CapabilityError> {
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": max_tokens,
            "temperature": temperature,
        });
        let response = self
            .http
            .post_json("llm", &self.url, Some(&self.api_key), &body)
            .await?;
        completion_text(&response)
    }
}

fn completion_text(response: &JsonValue) -> Result<String, CapabilityError> {
    response
        .pointer("/choices/0/message/content")
        .and_then(JsonValue::as_str)
        .map(|s| s.trim().to_string())
        .ok_or_else(|| CapabilityError::Malformed("missing choices[0].message.content".into()))
}

#[async_trait]
impl RedundancyJudge for ChatCompletionsClient {
    async fn is_redundant(
        &self,
        summary: &str,
        new_reviews: &[String],
    ) -> Result<bool, CapabilityError> {
        let answer = self.complete(judge_prompt(summary, new_reviews), 10, 0.1).await?;
        debug!(answer = %answer, "redundancy verdict");
        parse_verdict(&answer)
    }
}

#[async_trait]
impl Summarizer for ChatCompletionsClient {
    async fn summarize(&self, entity: &Entity, samples: &[String]) -> Result<String, CapabilityError> {
        self.complete(summary_prompt(entity, samples), 500, 0.3).await
    }
}

/// OpenAI-compatible `/embeddings` client.
pub struct EmbeddingsClient {
    http: Arc<HttpClient>,
    api_key: String,
    url: String,
    model: String,
    dimension: usize,
}

impl EmbeddingsClient {
    pub fn new(http: Arc<HttpClient>, config: &EmbeddingConfig) -> Result<Self, CapabilityError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| CapabilityError::Unavailable("no embedding API key configured".into()))?;
        Ok(Self {
            http,
            api_key,
            url: format!("{}/embeddings", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            dimension: config.dimension,
        })
    }
}

fn embedding_vector(response: &JsonValue, dimension: usize) -> Result<Vec<f32>, CapabilityError> {
    let values = response
        .pointer("/data/0/embedding")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| CapabilityError::Malformed("missing data[0].embedding".into()))?;
    let vector = values
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| CapabilityError::Malformed("non-numeric embedding component".into()))?;
    if vector.len() != dimension {
        return Err(CapabilityError::Malformed(format!(
            "embedding has {} dimensions, expected {dimension}",
            vector.len()
        )));
    }
    Ok(vector)
}

#[async_trait]
impl Embedder for EmbeddingsClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        let body = json!({
            "model": self.model,
            "input": text,
            "dimensions": self.dimension,
        });
        let response = self
            .http
            .post_json("embeddings", &self.url, Some(&self.api_key), &body)
            .await?;
        embedding_vector(&response, self.dimension)
    }
}

/// Judge for runs without an LLM key: always unavailable, so the gate regenerates.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableJudge;

#[async_trait]
impl RedundancyJudge for UnavailableJudge {
    async fn is_redundant(&self, _summary: &str, _new: &[String]) -> Result<bool, CapabilityError> {
        Err(CapabilityError::Unavailable("no judgment capability configured".into()))
    }
}

/// Offline summarizer: the leading samples joined verbatim.
#[derive(Debug, Clone, Copy)]
pub struct ExtractiveSummarizer {
    pub max_samples: usize,
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self { max_samples: 5 }
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, entity: &Entity, samples: &[String]) -> Result<String, CapabilityError> {
        let body = samples
            .iter()
            .take(self.max_samples)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        Ok(format!("{}. {body}", entity.name))
    }
}

/// Offline embedder: feature hashing of normalized tokens into a unit vector.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbedder {
    pub dimension: usize,
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        if self.dimension == 0 {
            return Err(CapabilityError::Malformed("zero embedding dimension".into()));
        }
        let mut vector = vec![0f32; self.dimension];
        for token in normalize_fragment(text).split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            let digest = Sha256::digest(token.as_bytes());
            let mut head = [0u8; 8];
            head.copy_from_slice(&digest[..8]);
            let h = u64::from_be_bytes(head);
            let slot = (h % self.dimension as u64) as usize;
            vector[slot] += if h & (1 << 63) == 0 { 1.0 } else { -1.0 };
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(vector)
    }
}
