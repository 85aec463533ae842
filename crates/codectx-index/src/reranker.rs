//! Second-pass scoring for search shortlists.
//!
//! Two layers: a cheap code-first heuristic applied to every shortlisted
//! chunk, and an optional cross-encoder behind the [`Reranker`] trait that
//! rescores the top candidates over HTTP (`/v1/rerank`, as served by
//! Voyage, Jina, Cohere-compatible gateways and local rerank servers).

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunker::Chunk;
use crate::languages::{spec_for_path, LanguageFamily};

const SYMBOL_MATCH: f32 = 0.15;
const SYMBOL_MATCH_CAP: f32 = 0.3;
const PATH_MATCH: f32 = 0.05;
const PATH_MATCH_CAP: f32 = 0.15;
const DENSITY_WEIGHT: f32 = 0.1;
const DOC_PENALTY: f32 = 0.05;
const TEST_PENALTY: f32 = 0.05;

/// Heuristic adjustment favouring code whose symbols and path name the
/// query terms and whose lines mention them densely.
pub fn code_first_bonus(terms: &[String], chunk: &Chunk) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }

    let symbol_terms: Vec<Vec<String>> = chunk
        .metadata
        .symbols
        .iter()
        .map(|s| crate::search::query_terms(s))
        .collect();
    let symbol_hits = terms
        .iter()
        .filter(|t| symbol_terms.iter().any(|st| st.contains(t)))
        .count();
    let mut bonus = (symbol_hits as f32 * SYMBOL_MATCH).min(SYMBOL_MATCH_CAP);

    let path_terms = crate::search::term_set(&chunk.path);
    let path_hits = terms.iter().filter(|t| path_terms.contains(*t)).count();
    bonus += (path_hits as f32 * PATH_MATCH).min(PATH_MATCH_CAP);

    let lines: Vec<String> = chunk
        .text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_lowercase)
        .collect();
    if !lines.is_empty() {
        let dense = lines
            .iter()
            .filter(|l| terms.iter().any(|t| l.contains(t.as_str())))
            .count();
        bonus += DENSITY_WEIGHT * dense as f32 / lines.len() as f32;
    }

    if spec_for_path(Path::new(&chunk.path)).family == LanguageFamily::Doc {
        bonus -= DOC_PENALTY;
    }
    let wants_tests = terms.iter().any(|t| t.starts_with("test") || t == "spec");
    if !wants_tests && is_test_path(&chunk.path) {
        bonus -= TEST_PENALTY;
    }
    bonus
}

fn is_test_path(path: &str) -> bool {
    let lower = path.to_lowercase();
    lower.contains("/tests/")
        || lower.starts_with("tests/")
        || lower.contains("/test/")
        || lower.contains("_test.")
        || lower.contains(".test.")
        || lower.contains(".spec.")
        || Path::new(&lower)
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("test_"))
}

/// A document to be reranked.
#[derive(Debug, Clone)]
pub struct RerankerDoc {
    pub id: String,
    pub content: String,
}

/// Trait for rescoring search candidates.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// One relevance score in `0..=1` per document, in input order.
    async fn rerank(&self, query: &str, documents: &[RerankerDoc]) -> Result<Vec<f32>>;
}

/// Cross-encoder served over an HTTP rerank endpoint.
pub struct HttpCrossEncoder {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpCrossEncoder {
    pub fn new(base_url: String, model: String, api_key: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url,
            model,
            api_key,
        }
    }
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: Vec<&'a str>,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankItem>,
}

#[derive(Deserialize)]
struct RerankItem {
    index: usize,
    relevance_score: f32,
}

#[async_trait]
impl Reranker for HttpCrossEncoder {
    async fn rerank(&self, query: &str, documents: &[RerankerDoc]) -> Result<Vec<f32>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/v1/rerank", self.base_url.trim_end_matches('/'));
        let request = RerankRequest {
            model: &self.model,
            query,
            documents: documents.iter().map(|d| d.content.as_str()).collect(),
        };

        let mut req_builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            req_builder = req_builder.bearer_auth(key);
        }
        let response = req_builder
            .send()
            .await
            .context("Rerank request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Rerank endpoint returned {}: {}", status, body);
        }
        let parsed: RerankResponse = response
            .json()
            .await
            .context("Malformed rerank response")?;

        let mut scores = vec![0.0f32; documents.len()];
        for item in parsed.results {
            if let Some(slot) = scores.get_mut(item.index) {
                *slot = item.relevance_score.clamp(0.0, 1.0);
            }
        }
        debug!(docs = documents.len(), "Cross-encoder rescored candidates");
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{ChunkMetadata, ChunkSource};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chunk(path: &str, text: &str, symbols: &[&str]) -> Chunk {
        Chunk {
            id: crate::chunker::content_hash(text),
            source: ChunkSource::Repo,
            path: path.to_string(),
            title: path.to_string(),
            file_hash: "h".to_string(),
            start_line: 1,
            end_line: text.lines().count(),
            text: text.to_string(),
            metadata: ChunkMetadata {
                symbols: symbols.iter().map(|s| s.to_string()).collect(),
                language: "rust".to_string(),
                line_count: text.lines().count(),
            },
            embedding: None,
        }
    }

    fn terms(q: &str) -> Vec<String> {
        crate::search::query_terms(q)
    }

    #[test]
    fn test_symbol_match_beats_mention() {
        let q = terms("parse config");
        let defines = chunk("src/config.rs", "pub fn parse_config() {}\n", &["parse_config"]);
        let mentions = chunk("src/main.rs", "// we parse config later\nlet x = 1;\n", &[]);
        assert!(code_first_bonus(&q, &defines) > code_first_bonus(&q, &mentions));
    }

    #[test]
    fn test_doc_and_test_penalties() {
        let q = terms("parse config");
        let code = chunk("src/config.rs", "parse config\n", &[]);
        let doc = chunk("docs/config.md", "parse config\n", &[]);
        let test = chunk("tests/config_test.rs", "parse config\n", &[]);
        assert!(code_first_bonus(&q, &code) > code_first_bonus(&q, &doc));
        assert!(code_first_bonus(&q, &code) > code_first_bonus(&q, &test));

        let q = terms("config tests");
        assert!(code_first_bonus(&q, &test) >= code_first_bonus(&q, &code) - 1e-6);
    }

    #[tokio::test]
    async fn test_http_cross_encoder_orders_by_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/rerank"))
            .and(body_partial_json(serde_json::json!({"model": "rerank-2", "query": "q"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    {"index": 1, "relevance_score": 0.9},
                    {"index": 0, "relevance_score": 0.2}
                ]
            })))
            .mount(&server)
            .await;

        let reranker = HttpCrossEncoder::new(server.uri(), "rerank-2".to_string(), None);
        let docs = vec![
            RerankerDoc { id: "a".to_string(), content: "alpha".to_string() },
            RerankerDoc { id: "b".to_string(), content: "beta".to_string() },
        ];
        let scores = reranker.rerank("q", &docs).await.unwrap();
        assert_eq!(scores, vec![0.2, 0.9]);
    }

    #[tokio::test]
    async fn test_http_cross_encoder_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/rerank"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let reranker = HttpCrossEncoder::new(server.uri(), "m".to_string(), Some("k".to_string()));
        let docs = vec![RerankerDoc { id: "a".to_string(), content: "x".to_string() }];
        assert!(reranker.rerank("q", &docs).await.is_err());
    }
}
