//! Embedding provider trait and implementations.
//!
//! This module defines the interface for generating embeddings, an HTTP
//! provider that speaks the OpenAI-compatible and Ollama wire formats, a
//! deterministic local fallback, and content-type detection used to pick
//! a provider for a batch.

mod gateway;
mod local;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub use gateway::{EmbeddingBatch, EmbeddingGateway, ProviderCatalog};
pub use local::LocalHashEmbeddings;

/// Errors that can occur during embedding generation.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Rate limited after {0} retries")]
    RateLimited(u32),

    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Expected {expected} embeddings, got {got}")]
    CountMismatch { expected: usize, got: usize },

    #[error("All embedding providers failed: {}", format_failures(.0))]
    AllProvidersFailed(Vec<(String, String)>),
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(name, err)| format!("{name}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// What kind of text is being embedded. Providers declare which kinds
/// they are specialised for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Code,
    Docs,
    Finance,
    Legal,
    General,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Docs => "docs",
            Self::Finance => "finance",
            Self::Legal => "legal",
            Self::General => "general",
        }
    }
}

/// Whether a text is a search query or a document being indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedIntent {
    Query,
    Document,
}

impl EmbedIntent {
    fn as_input_type(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Document => "document",
        }
    }
}

const FINANCE_TERMS: &[&str] = &[
    "revenue", "forecast", "ebitda", "earnings", "profit", "margin", "cash flow",
    "balance sheet", "invoice", "fiscal", "quarterly", "dividend", "valuation", "ledger",
    "expense", "budget", "income statement", "arr", "mrr",
];
const LEGAL_TERMS: &[&str] = &[
    "contract", "agreement", "liability", "clause", "indemnif", "warranty", "jurisdiction",
    "statute", "plaintiff", "defendant", "compliance", "gdpr", "terms of service", "hereby",
    "whereas", "licensee",
];
const DOCS_TERMS: &[&str] = &[
    "readme", "documentation", "docs", "guide", "tutorial", "how to", "overview", "explain",
    "install", "getting started", "changelog",
];
const CODE_TERMS: &[&str] = &[
    "fn", "function", "func", "def", "class", "struct", "impl", "import", "return", "const",
    "let", "var", "async", "await", "interface", "enum", "trait", "module", "method", "bug",
    "error", "handler", "api", "endpoint",
];

/// Guess the content type of a text from its vocabulary.
///
/// Ties go to code, then finance, legal and docs; no signal at all is
/// `General`.
pub fn detect_content_type(text: &str) -> ContentType {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .collect();

    let phrase_score = |terms: &[&str]| -> usize {
        terms
            .iter()
            .filter(|t| {
                if t.contains(' ') || t.len() > 6 {
                    lower.contains(*t)
                } else {
                    words.contains(t)
                }
            })
            .count()
    };

    let syntax = ["{", "}", "();", "=>", "::", "->", "!=", "=="]
        .iter()
        .filter(|s| lower.contains(*s))
        .count();
    let identifiers = text
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| is_identifier_like(w))
        .count()
        .min(3);

    let scores = [
        (ContentType::Code, phrase_score(CODE_TERMS) + syntax + identifiers),
        (ContentType::Finance, phrase_score(FINANCE_TERMS)),
        (ContentType::Legal, phrase_score(LEGAL_TERMS)),
        (ContentType::Docs, phrase_score(DOCS_TERMS)),
    ];
    let mut best = (ContentType::General, 0);
    for (ct, score) in scores {
        if score > best.1 {
            best = (ct, score);
        }
    }
    best.0
}

/// snake_case or camelCase words look like code identifiers.
fn is_identifier_like(word: &str) -> bool {
    let has_inner_upper = word.chars().skip(1).any(|c| c.is_uppercase())
        && word.chars().any(|c| c.is_lowercase());
    let snake = word.len() > 2 && word.trim_matches('_').contains('_');
    has_inner_upper || snake
}

/// Trait for embedding providers.
///
/// Implementations should be Send + Sync to allow use in async contexts.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Short name used in logs, config and statistics
    fn name(&self) -> &str;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the number of dimensions
    fn dimensions(&self) -> usize;

    /// Content types this provider is specialised for
    fn content_types(&self) -> &[ContentType];

    /// Get the maximum batch size supported.
    fn max_batch_size(&self) -> usize {
        32
    }

    /// Embed multiple texts in a batch, one vector per text in order
    async fn embed_batch(
        &self,
        texts: &[String],
        intent: EmbedIntent,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Embed a single text
    async fn embed(&self, text: &str, intent: EmbedIntent) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_batch(&[text.to_string()], intent)
            .await?
            .into_iter()
            .next()
            .ok_or(EmbeddingError::CountMismatch { expected: 1, got: 0 })
    }
}

/// Wire protocol spoken by an HTTP provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// `POST {base}/embeddings` with `{model, input}` returning `data[].embedding`
    OpenAi,
    /// `POST {base}/api/embed` with `{model, input}` returning `embeddings`
    Ollama,
}

/// Settings for one HTTP provider.
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub dimensions: usize,
    pub content_types: Vec<ContentType>,
    pub wire: WireFormat,
    /// Send `input_type` (`query` / `document`) with each request
    pub send_input_type: bool,
    pub timeout: Duration,
    pub max_retries: u32,
    pub batch_size: usize,
}

/// Request body for OpenAI-compatible embedding APIs
#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    input_type: Option<&'a str>,
}

/// Response from OpenAI-compatible embedding APIs
#[derive(Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiData>,
}

#[derive(Deserialize)]
struct OpenAiData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OllamaResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Embedding provider reached over HTTP.
pub struct HttpEmbeddingProvider {
    config: HttpProviderConfig,
    client: Client,
}

impl HttpEmbeddingProvider {
    pub fn new(config: HttpProviderConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { config, client }
    }

    fn endpoint(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        match self.config.wire {
            WireFormat::OpenAi => format!("{base}/embeddings"),
            WireFormat::Ollama => format!("{base}/api/embed"),
        }
    }

    /// Send embedding request with retry logic for rate limits.
    async fn send_request(
        &self,
        texts: &[String],
        intent: EmbedIntent,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let url = self.endpoint();
        let mut retry_count = 0;
        let mut backoff_secs = 1u64;

        loop {
            debug!(
                "Sending embedding request for {} texts to {} ({})",
                texts.len(),
                url,
                self.config.name
            );

            let mut request = self.client.post(&url);
            if let Some(key) = &self.config.api_key {
                request = request.header("Authorization", format!("Bearer {}", key));
            }
            request = match self.config.wire {
                WireFormat::OpenAi => request.json(&OpenAiRequest {
                    model: &self.config.model,
                    input: texts,
                    input_type: self
                        .config
                        .send_input_type
                        .then(|| intent.as_input_type()),
                }),
                WireFormat::Ollama => request.json(&OllamaRequest {
                    model: &self.config.model,
                    input: texts,
                }),
            };

            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    EmbeddingError::Timeout
                } else {
                    EmbeddingError::Network(e.to_string())
                }
            })?;
            let status = response.status();

            if status.is_success() {
                let vectors = self.parse_response(response).await?;
                if vectors.len() != texts.len() {
                    return Err(EmbeddingError::CountMismatch {
                        expected: texts.len(),
                        got: vectors.len(),
                    });
                }
                return Ok(vectors);
            }

            if status.as_u16() == 429 {
                retry_count += 1;
                if retry_count > self.config.max_retries {
                    return Err(EmbeddingError::RateLimited(self.config.max_retries));
                }

                let retry_after = retry_delay(
                    response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok()),
                    backoff_secs,
                );

                warn!(
                    "{} rate limited, retrying after {} seconds (attempt {}/{})",
                    self.config.name, retry_after, retry_count, self.config.max_retries
                );

                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                continue;
            }

            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EmbeddingError::Api {
                status: status.as_u16(),
                body,
            });
        }
    }

    async fn parse_response(
        &self,
        response: reqwest::Response,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let invalid = |e: reqwest::Error| EmbeddingError::InvalidResponse(e.to_string());
        match self.config.wire {
            WireFormat::OpenAi => {
                let parsed: OpenAiResponse = response.json().await.map_err(invalid)?;
                // Sort by index to ensure correct order
                let mut data = parsed.data;
                data.sort_by_key(|d| d.index);
                Ok(data.into_iter().map(|d| d.embedding).collect())
            }
            WireFormat::Ollama => {
                let parsed: OllamaResponse = response.json().await.map_err(invalid)?;
                Ok(parsed.embeddings)
            }
        }
    }
}

/// Longest wait honoured between rate-limited attempts.
const MAX_BACKOFF_SECS: u64 = 30;

/// Seconds to wait after a 429, from `Retry-After` when it parses, capped at
/// [`MAX_BACKOFF_SECS`].
fn retry_delay(retry_after: Option<&str>, backoff_secs: u64) -> u64 {
    retry_after
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(backoff_secs)
        .min(MAX_BACKOFF_SECS)
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }

    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    fn content_types(&self) -> &[ContentType] {
        &self.config.content_types
    }

    fn max_batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        intent: EmbedIntent,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        debug!("Embedding batch of {} texts with {}", texts.len(), self.config.name);
        self.send_request(texts, intent).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer, wire: WireFormat) -> HttpEmbeddingProvider {
        HttpEmbeddingProvider::new(HttpProviderConfig {
            name: "test".to_string(),
            base_url: server.uri(),
            api_key: Some("sk-test".to_string()),
            model: "m".to_string(),
            dimensions: 2,
            content_types: vec![ContentType::Code],
            wire,
            send_input_type: true,
            timeout: Duration::from_secs(5),
            max_retries: 2,
            batch_size: 8,
        })
    }

    #[test]
    fn test_detect_content_type() {
        assert_eq!(detect_content_type("revenue forecast"), ContentType::Finance);
        assert_eq!(
            detect_content_type("indemnification clause in the agreement"),
            ContentType::Legal
        );
        assert_eq!(detect_content_type("where is parse_config called"), ContentType::Code);
        assert_eq!(detect_content_type("fn main() { run(); }"), ContentType::Code);
        assert_eq!(detect_content_type("installation guide"), ContentType::Docs);
        assert_eq!(detect_content_type("hello there"), ContentType::General);
    }

    #[tokio::test]
    async fn test_openai_wire_format_orders_by_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("Authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({"model": "m", "input_type": "query"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"embedding": [0.0, 1.0], "index": 1},
                    {"embedding": [1.0, 0.0], "index": 0}
                ]
            })))
            .mount(&server)
            .await;

        let p = provider(&server, WireFormat::OpenAi);
        let out = p
            .embed_batch(&["a".to_string(), "b".to_string()], EmbedIntent::Query)
            .await
            .unwrap();
        assert_eq!(out, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_ollama_wire_format() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [[0.5, 0.5]]
            })))
            .mount(&server)
            .await;

        let p = provider(&server, WireFormat::Ollama);
        let v = p.embed("x", EmbedIntent::Document).await.unwrap();
        assert_eq!(v, vec![0.5, 0.5]);
    }

    #[tokio::test]
    async fn test_rate_limit_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [1.0, 2.0], "index": 0}]
            })))
            .mount(&server)
            .await;

        let p = provider(&server, WireFormat::OpenAi);
        let v = p.embed("x", EmbedIntent::Document).await.unwrap();
        assert_eq!(v, vec![1.0, 2.0]);
    }

    #[test]
    fn test_retry_after_is_capped() {
        assert_eq!(retry_delay(Some("3600"), 1), MAX_BACKOFF_SECS);
        assert_eq!(retry_delay(Some(" 2 "), 8), 2);
        assert_eq!(retry_delay(Some("Wed, 21 Oct 2015 07:28:00 GMT"), 4), 4);
        assert_eq!(retry_delay(None, 1 << 20), MAX_BACKOFF_SECS);
    }

    #[tokio::test]
    async fn test_errors_surface_as_typed_variants() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;
        let p = provider(&server, WireFormat::OpenAi);
        match p.embed("x", EmbedIntent::Query).await {
            Err(EmbeddingError::Api { status, body }) => {
                assert_eq!(status, 401);
                assert_eq!(body, "bad key");
            }
            other => panic!("unexpected: {:?}", other),
        }

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
            .mount(&server)
            .await;
        let p = provider(&server, WireFormat::OpenAi);
        assert!(matches!(
            p.embed_batch(&["x".to_string()], EmbedIntent::Query).await,
            Err(EmbeddingError::CountMismatch { expected: 1, got: 0 })
        ));
    }
}
