//! Embedding provider abstraction and the batching/retry client around it.
//!
//! Providers:
//! - **[`DisabledProvider`]**: returns errors; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: calls an OpenAI-compatible `POST /embeddings` endpoint.
//! - **[`OllamaProvider`]**: calls a local Ollama instance's `/api/embed` endpoint.
//!
//! A provider performs exactly one request per call. Reliability lives in
//! [`EmbeddingClient`]:
//! - texts longer than `max_chars` characters are truncated to exactly
//!   `max_chars` before submission, independently per text;
//! - inputs are split into batches of `batch_size`;
//! - each batch is retried with exponential backoff (`base × 2^attempt`)
//!   until the attempt budget runs out, then abandoned. An abandoned batch
//!   yields an **empty** result and never an error, so callers skip it
//!   without failing the run.
//!
//! Waiting goes through the [`Sleeper`] trait so the retry loop can be
//! driven without real delays in tests.
//!
//! Also provides vector utilities for the SQLite backend:
//! - [`cosine_similarity`]: similarity between two embedding vectors
//! - [`vec_to_blob`] / [`blob_to_vec`]: little-endian `f32` BLOB encoding

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::Error;

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-large"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `3072`).
    fn dims(&self) -> usize;
    /// Embed `texts` in one request, returning one vector per text in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(Error::fatal("embedding provider is disabled").into())
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API (or any compatible endpoint).
///
/// Requires the `OPENAI_API_KEY` environment variable. The base url
/// defaults to `https://api.openai.com/v1` and can be overridden with
/// `embedding.url`.
pub struct OpenAIProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::config("embedding.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::config("OPENAI_API_KEY environment variable not set"))?;
        let base = config
            .url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1")
            .trim_end_matches('/');
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base),
            api_key,
            model,
            dims: config.dims,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dims,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::retryable(format!("OpenAI request failed: {}", e)))?;

        let json = check_status("OpenAI", response).await?;
        parse_openai_response(&json)
    }
}

/// Map a provider HTTP response to JSON, classifying failures.
///
/// - HTTP 429 and 5xx → retryable
/// - other 4xx → not retryable
async fn check_status(provider: &str, response: reqwest::Response) -> Result<serde_json::Value> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| Error::retryable(format!("{} response unreadable: {}", provider, e)).into());
    }

    let body_text = response.text().await.unwrap_or_default();
    let message = format!("{} API error {}: {}", provider, status, body_text);
    if status.as_u16() == 429 || status.is_server_error() {
        Err(Error::retryable(message).into())
    } else {
        Err(Error::fatal(message).into())
    }
}

/// Extract `data[].embedding` arrays, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;
        indexed.push((index, json_to_vec(embedding)));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured url (default `http://localhost:11434`).
pub struct OllamaProvider {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::config("embedding.model required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            model,
            dims: config.dims,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                Error::retryable(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;

        let json = check_status("Ollama", response).await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .map(|values| json_to_vec(values))
                .ok_or_else(|| anyhow!("Invalid Ollama response: embedding is not an array"))
        })
        .collect()
}

fn json_to_vec(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

/// Create the [`EmbeddingProvider`] selected by configuration.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        other => bail!(Error::config(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Retry ============

/// Waits between retry attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

/// [`Sleeper`] backed by `tokio::time::sleep`.
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// `base × 2^attempt`, with the exponent capped at 16.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16))
}

/// Progress through a bounded retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Failed attempts so far.
    pub attempt: u32,
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryState {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn next_delay(&self) -> Duration {
        backoff_delay(self.base_delay, self.attempt)
    }

    /// Record a failed attempt. Returns the delay before the next attempt,
    /// or `None` once the budget is exhausted.
    pub fn record_failure(&mut self) -> Option<Duration> {
        let delay = self.next_delay();
        self.attempt += 1;
        if self.attempt >= self.max_attempts {
            None
        } else {
            Some(delay)
        }
    }
}

/// Cut `text` to at most `max_chars` characters.
pub fn truncate_text(text: &str, max_chars: usize) -> Cow<'_, str> {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => Cow::Owned(text[..byte_idx].to_string()),
        None => Cow::Borrowed(text),
    }
}

// ============ Client ============

/// Batching, truncating, retrying wrapper around an [`EmbeddingProvider`].
#[derive(Clone)]
pub struct EmbeddingClient {
    provider: Arc<dyn EmbeddingProvider>,
    sleeper: Arc<dyn Sleeper>,
    batch_size: usize,
    max_chars: usize,
    max_attempts: u32,
    base_delay: Duration,
}

impl EmbeddingClient {
    /// Client over `provider` using the batching/retry settings of `config`.
    ///
    /// `max_retries` counts retries after the first attempt.
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self {
            provider,
            sleeper: Arc::new(TokioSleeper),
            batch_size: config.batch_size.max(1),
            max_chars: config.max_chars.max(1),
            max_attempts: config.max_retries.saturating_add(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }

    /// Build the configured provider and wrap it.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self::new(create_provider(config)?, config))
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn provider(&self) -> &dyn EmbeddingProvider {
        self.provider.as_ref()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Embed one batch with truncation and retry.
    ///
    /// Returns one vector per text, or an empty vector once the retry budget
    /// is spent or the provider reports a non-retryable failure.
    pub async fn embed_batch(&self, texts: &[String]) -> Vec<Vec<f32>> {
        if texts.is_empty() {
            return Vec::new();
        }

        let prepared: Vec<String> = texts
            .iter()
            .map(|t| truncate_text(t, self.max_chars).into_owned())
            .collect();

        let mut retry = RetryState::new(self.max_attempts, self.base_delay);
        loop {
            let err = match self.provider.embed(&prepared).await {
                Ok(vectors) => match self.check_shape(&vectors, prepared.len()) {
                    Ok(()) => return vectors,
                    Err(e) => anyhow::Error::from(e),
                },
                Err(e) => e,
            };

            if !Error::is_retryable(&err) {
                tracing::error!(
                    error = %err,
                    batch = prepared.len(),
                    "embedding batch failed permanently; skipping"
                );
                return Vec::new();
            }

            match retry.record_failure() {
                Some(delay) => {
                    tracing::warn!(
                        error = %err,
                        attempt = retry.attempt,
                        delay_ms = delay.as_millis() as u64,
                        "embedding batch failed; retrying"
                    );
                    self.sleeper.sleep(delay).await;
                }
                None => {
                    tracing::error!(
                        error = %err,
                        attempts = retry.attempt,
                        batch = prepared.len(),
                        "embedding batch abandoned after exhausting retries"
                    );
                    return Vec::new();
                }
            }
        }
    }

    /// A response must hold one vector per input, each of the provider's
    /// dimensionality. Either mismatch is a non-retryable provider error.
    fn check_shape(&self, vectors: &[Vec<f32>], expected: usize) -> Result<(), Error> {
        if vectors.len() != expected {
            return Err(Error::fatal(format!(
                "provider returned {} embeddings for {} inputs",
                vectors.len(),
                expected
            )));
        }
        let dims = self.provider.dims();
        if let Some(bad) = vectors.iter().find(|v| dims > 0 && v.len() != dims) {
            return Err(Error::fatal(format!(
                "provider returned a {}-dimensional embedding; {} expects {}",
                bad.len(),
                self.provider.model_name(),
                dims
            )));
        }
        Ok(())
    }

    /// Embed `texts` in batches of `batch_size`.
    ///
    /// Each position holds `None` when its batch was abandoned.
    pub async fn embed_all(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let vectors = self.embed_batch(batch).await;
            if vectors.is_empty() {
                out.extend(std::iter::repeat_with(|| None).take(batch.len()));
            } else {
                out.extend(vectors.into_iter().map(Some));
            }
        }
        out
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str) -> Option<Vec<f32>> {
        self.embed_batch(&[text.to_string()]).await.into_iter().next()
    }
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use docsync::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
