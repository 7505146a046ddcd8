//! Embedding provider adapter.
//!
//! Talks to one of two hosted embedding APIs:
//! - Gemini (`text-embedding-004`, 768 dimensions), the default
//! - OpenAI (`text-embedding-3-small`, 1536 dimensions), also the fallback
//!   when Gemini fails
//!
//! Both are asked for the configured dimensionality so a fallback vector can
//! be compared with vectors the active provider produced earlier.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::config::SemanticSearchConfig;
use crate::semantic::cache::EmbeddingCache;
use crate::semantic::preprocess::truncate_chars;

/// Base delay between retries, doubled on each attempt
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Longest provider error body kept in an error message
const MAX_ERROR_BODY: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProviderKind {
    #[default]
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "openai")]
    OpenAi,
}

impl ProviderKind {
    /// Native vector length of the provider's default model.
    pub fn default_dimensions(&self) -> usize {
        match self {
            ProviderKind::Gemini => 768,
            ProviderKind::OpenAi => 1536,
        }
    }

    /// Input budget in characters. Gemini's limit is 2048 tokens, taken as
    /// roughly four characters per token. Longer documents are embedded from
    /// their prefix.
    pub fn max_input_chars(&self) -> usize {
        match self {
            ProviderKind::Gemini => 2048 * 4,
            ProviderKind::OpenAi => 8000,
        }
    }

    /// Gemini does not promise a response shape, so a length mismatch is
    /// only logged unless configured otherwise.
    pub fn default_dimension_policy(&self) -> DimensionPolicy {
        match self {
            ProviderKind::Gemini => DimensionPolicy::Warn,
            ProviderKind::OpenAi => DimensionPolicy::Strict,
        }
    }

    pub fn api_key_var(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "GEMINI_API_KEY",
            ProviderKind::OpenAi => "OPENAI_API_KEY",
        }
    }

    /// Provider to try once when this one fails.
    pub fn fallback(&self) -> Option<ProviderKind> {
        match self {
            ProviderKind::Gemini => Some(ProviderKind::OpenAi),
            ProviderKind::OpenAi => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Gemini => write!(f, "gemini"),
            ProviderKind::OpenAi => write!(f, "openai"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            "openai" => Ok(ProviderKind::OpenAi),
            other => anyhow::bail!("unknown embedding provider {other:?} (expected gemini or openai)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimensionPolicy {
    /// Wrong-length vectors are an error
    Strict,
    /// Wrong-length vectors are logged and returned as-is
    Warn,
}

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("no input text to embed")]
    EmptyInput,

    #[error("{0} api key is not configured")]
    CredentialMissing(ProviderKind),

    #[error("{0} rejected the api key")]
    InvalidCredentials(ProviderKind),

    #[error("{0} rate limit exceeded")]
    RateLimited(ProviderKind),

    #[error("{0} is unavailable: {1}")]
    ProviderUnavailable(ProviderKind, String),

    #[error("{0} embedding request failed: {1}")]
    Unknown(ProviderKind, String),

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

impl EmbeddingError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            EmbeddingError::RateLimited(_) | EmbeddingError::ProviderUnavailable(..)
        )
    }
}

/// Maps a non-success provider status to an error.
pub fn classify_status(provider: ProviderKind, status: StatusCode, body: &str) -> EmbeddingError {
    let detail = format!("{status}: {}", truncate_chars(body.trim(), MAX_ERROR_BODY));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            EmbeddingError::InvalidCredentials(provider)
        }
        StatusCode::TOO_MANY_REQUESTS => EmbeddingError::RateLimited(provider),
        status if status.is_server_error() => EmbeddingError::ProviderUnavailable(provider, detail),
        _ => EmbeddingError::Unknown(provider, detail),
    }
}

fn classify_transport(provider: ProviderKind, err: &reqwest::Error) -> EmbeddingError {
    if err.is_timeout() || err.is_connect() {
        EmbeddingError::ProviderUnavailable(provider, err.to_string())
    } else {
        EmbeddingError::Unknown(provider, err.to_string())
    }
}

/// API keys, one per provider. Only ever read from the environment.
#[derive(Clone, Default)]
pub struct Credentials {
    gemini: Option<String>,
    openai: Option<String>,
}

impl Credentials {
    pub fn new(gemini: Option<String>, openai: Option<String>) -> Self {
        let clean = |key: Option<String>| key.filter(|k| !k.trim().is_empty());
        Self {
            gemini: clean(gemini),
            openai: clean(openai),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            std::env::var(ProviderKind::Gemini.api_key_var()).ok(),
            std::env::var(ProviderKind::OpenAi.api_key_var()).ok(),
        )
    }

    pub fn get(&self, provider: ProviderKind) -> Option<&str> {
        match provider {
            ProviderKind::Gemini => self.gemini.as_deref(),
            ProviderKind::OpenAi => self.openai.as_deref(),
        }
        .map(str::trim)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = |key: &Option<String>| if key.is_some() { "[REDACTED]" } else { "none" };
        write!(
            f,
            "Credentials {{ gemini: {}, openai: {} }}",
            state(&self.gemini),
            state(&self.openai)
        )
    }
}

/// Something that turns text into a vector. The search service only sees
/// this trait, which keeps it testable without network access.
pub trait TextEmbedder: Send + Sync {
    fn provider(&self) -> ProviderKind;

    /// Length of every vector this embedder is expected to return.
    fn dimensions(&self) -> usize;

    /// Whether the active provider has a credential at all.
    fn is_available(&self) -> bool;

    fn embed(&self, text: &str) -> impl Future<Output = Result<Vec<f32>, EmbeddingError>> + Send;
}

/// Cache-backed HTTP embedder with single-step provider fallback.
pub struct Embedder {
    client: reqwest::Client,
    config: SemanticSearchConfig,
    credentials: Credentials,
    cache: Arc<EmbeddingCache>,
    retry_backoff: Duration,
}

impl Embedder {
    pub fn new(
        config: &SemanticSearchConfig,
        credentials: Credentials,
        cache: Arc<EmbeddingCache>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            config: config.clone(),
            credentials,
            cache,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        })
    }

    #[cfg(test)]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    #[cfg(test)]
    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// Provider call without the cache. Falls back once when the active
    /// provider is Gemini and an OpenAI key exists.
    async fn generate(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let active = self.config.provider;

        let err = match self.generate_with(active, text).await {
            Ok(vector) => return Ok(vector),
            Err(err) => err,
        };

        let Some(fallback) = active.fallback() else {
            return Err(err);
        };

        if self.credentials.get(fallback).is_none() {
            log::warn!("{active} embedding failed and no {fallback} key is configured: {err}");
            return Err(err);
        }

        log::warn!("{active} embedding failed, falling back to {fallback}: {err}");
        self.generate_with(fallback, text).await
    }

    async fn generate_with(
        &self,
        provider: ProviderKind,
        text: &str,
    ) -> Result<Vec<f32>, EmbeddingError> {
        let key = self
            .credentials
            .get(provider)
            .ok_or(EmbeddingError::CredentialMissing(provider))?;

        let input = truncate_chars(text, provider.max_input_chars());
        if input.len() < text.len() {
            log::debug!(
                "embedding input truncated to {} chars for {provider}",
                provider.max_input_chars()
            );
        }

        let vector = self.call_with_retries(provider, key, input).await?;
        self.check_dimensions(provider, vector)
    }

    async fn call_with_retries(
        &self,
        provider: ProviderKind,
        key: &str,
        input: &str,
    ) -> Result<Vec<f32>, EmbeddingError> {
        let mut attempt = 0u32;
        loop {
            match self.call_once(provider, key, input).await {
                Ok(vector) => return Ok(vector),
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let backoff = self.retry_backoff * (1 << attempt.min(5));
                    log::debug!("{provider} attempt {attempt} failed ({err}), retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn call_once(
        &self,
        provider: ProviderKind,
        key: &str,
        input: &str,
    ) -> Result<Vec<f32>, EmbeddingError> {
        let request = match provider {
            ProviderKind::Gemini => {
                let model = &self.config.gemini_model;
                let url = format!(
                    "{}/models/{model}:embedContent",
                    self.config.gemini_base_url.trim_end_matches('/')
                );
                let body = GeminiRequest {
                    model: format!("models/{model}"),
                    content: GeminiContent {
                        parts: vec![GeminiPart { text: input }],
                    },
                    output_dimensionality: self.dimensions_hint(provider),
                };
                self.client
                    .post(url)
                    .header("x-goog-api-key", key)
                    .json(&body)
            }
            ProviderKind::OpenAi => {
                let url = format!(
                    "{}/embeddings",
                    self.config.openai_base_url.trim_end_matches('/')
                );
                let auth = HeaderValue::from_str(&format!("Bearer {key}"))
                    .map_err(|_| EmbeddingError::InvalidCredentials(provider))?;
                let body = OpenAiRequest {
                    model: &self.config.openai_model,
                    input,
                    dimensions: self.dimensions_hint(provider),
                };
                self.client
                    .post(url)
                    .header(AUTHORIZATION, auth)
                    .json(&body)
            }
        };

        let response = request
            .send()
            .await
            .map_err(|err| classify_transport(provider, &err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(classify_status(provider, status, &body));
        }

        let values = match provider {
            ProviderKind::Gemini => response
                .json::<GeminiResponse>()
                .await
                .map(|parsed| parsed.embedding.values),
            ProviderKind::OpenAi => response.json::<OpenAiResponse>().await.map(|parsed| {
                parsed
                    .data
                    .into_iter()
                    .min_by_key(|entry| entry.index)
                    .map(|entry| entry.embedding)
                    .unwrap_or_default()
            }),
        }
        .map_err(|err| EmbeddingError::Unknown(provider, format!("malformed response: {err}")))?;

        if values.is_empty() {
            return Err(EmbeddingError::Unknown(provider, "empty embedding".to_string()));
        }

        Ok(values)
    }

    /// Requested output size, sent only when it differs from the model's
    /// native size.
    fn dimensions_hint(&self, provider: ProviderKind) -> Option<usize> {
        let expected = self.config.expected_dimensions();
        (expected != provider.default_dimensions()).then_some(expected)
    }

    fn check_dimensions(
        &self,
        provider: ProviderKind,
        vector: Vec<f32>,
    ) -> Result<Vec<f32>, EmbeddingError> {
        let expected = self.config.expected_dimensions();
        if vector.len() == expected {
            return Ok(vector);
        }

        let policy = self
            .config
            .dimension_policy
            .unwrap_or_else(|| provider.default_dimension_policy());

        match policy {
            DimensionPolicy::Strict => Err(EmbeddingError::DimensionMismatch {
                expected,
                got: vector.len(),
            }),
            DimensionPolicy::Warn => {
                log::warn!(
                    "{provider} returned {} dimensions, expected {expected}",
                    vector.len()
                );
                Ok(vector)
            }
        }
    }
}

impl TextEmbedder for Embedder {
    fn provider(&self) -> ProviderKind {
        self.config.provider
    }

    fn dimensions(&self) -> usize {
        self.config.expected_dimensions()
    }

    fn is_available(&self) -> bool {
        self.credentials.get(self.config.provider).is_some()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        if let Some(vector) = self.cache.get(text) {
            log::debug!("embedding cache hit");
            return Ok(vector);
        }

        if !self.is_available() {
            return Err(EmbeddingError::CredentialMissing(self.config.provider));
        }

        let vector = self.generate(text).await?;

        if vector.len() == self.dimensions() {
            self.cache.set(text, vector.clone());
        }

        Ok(vector)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest<'a> {
    model: String,
    content: GeminiContent<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_dimensionality: Option<usize>,
}

#[derive(Serialize)]
struct GeminiContent<'a> {
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GeminiResponse {
    embedding: GeminiEmbedding,
}

#[derive(Deserialize)]
struct GeminiEmbedding {
    values: Vec<f32>,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    input: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}
