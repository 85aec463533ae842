//! Hybrid search combining vector similarity and lexical overlap.
//!
//! Code-seeking queries are scored over every stored chunk as a weighted
//! sum of cosine similarity and query-term overlap, shortlisted, then
//! reranked with code-first heuristics, pattern boosts and an optional
//! cross-encoder. Documentation-seeking queries go to a BM25 index over
//! document records instead.

pub mod bm25;
mod quick;

pub use bm25::BM25Index;
pub use quick::QuickScanner;

use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use codectx_config::{PatternsConfig, SearchConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::chunker::{Chunk, ChunkSource};
use crate::embeddings::{detect_content_type, EmbedIntent, EmbeddingGateway};
use crate::languages::{spec_for_path, LanguageFamily};
use crate::patterns::PatternSnapshot;
use crate::reranker::{code_first_bonus, Reranker, RerankerDoc};

/// Snippets are cut to this many lines.
pub const SNIPPET_LINES: usize = 20;
/// The cross-encoder only sees this many candidates.
pub const CROSS_ENCODER_TOP: usize = 50;

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "be", "to", "of", "in", "on", "for", "and", "or",
    "it", "this", "that", "with", "as", "at", "by", "from", "how", "what", "where", "which",
    "does", "do", "i", "we", "you", "my", "our", "me", "can", "should", "there",
];

const DOC_KEYWORDS: &[&str] = &[
    "docs", "documentation", "readme", "guide", "tutorial", "explain", "overview", "install",
    "installation", "setup", "usage", "changelog", "faq", "introduction", "getting", "started",
    "license", "contributing", "manual", "notes",
];

const CODE_KEYWORDS: &[&str] = &[
    "function", "method", "class", "struct", "impl", "implementation", "interface", "trait",
    "enum", "bug", "error", "exception", "defined", "definition", "call", "calls", "callers",
    "variable", "return", "returns", "test", "tests", "module", "import", "handler", "api",
];

/// What a query is looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchIntent {
    Documentation,
    Code,
}

/// Keyword heuristic; code wins ties.
pub fn detect_intent(query: &str) -> SearchIntent {
    let lower = query.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let mut doc = words.iter().filter(|w| DOC_KEYWORDS.contains(w)).count();
    let mut code = words.iter().filter(|w| CODE_KEYWORDS.contains(w)).count();
    if lower.contains("how to") || lower.contains("what is") {
        doc += 1;
    }
    // Identifiers and call syntax are code signals.
    code += query
        .split_whitespace()
        .filter(|w| {
            w.contains("::")
                || w.contains('(')
                || w.trim_matches('_').contains('_')
                || (w.chars().next().is_some_and(|c| c.is_lowercase())
                    && w.chars().any(|c| c.is_uppercase()))
        })
        .count();
    if doc > code {
        SearchIntent::Documentation
    } else {
        SearchIntent::Code
    }
}

/// Lowercased terms, identifiers split on `_` and case changes,
/// stopwords and single characters removed. Order and repeats kept.
pub fn query_terms(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for word in text.split(|c: char| !c.is_alphanumeric()) {
        if word.is_empty() {
            continue;
        }
        let mut current = String::new();
        let mut prev_lower = false;
        for c in word.chars() {
            if c.is_uppercase() && prev_lower && !current.is_empty() {
                push_term(&mut out, std::mem::take(&mut current));
            }
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
            current.extend(c.to_lowercase());
        }
        push_term(&mut out, current);
    }
    out
}

fn push_term(out: &mut Vec<String>, term: String) {
    if term.chars().count() > 1 && !STOPWORDS.contains(&term.as_str()) {
        out.push(term);
    }
}

/// Unique terms of a text.
pub fn term_set(text: &str) -> HashSet<String> {
    query_terms(text).into_iter().collect()
}

/// Fraction of query terms present in the chunk's term set.
pub fn lexical_overlap(terms: &[String], chunk_terms: &HashSet<String>) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let hits = terms.iter().filter(|t| chunk_terms.contains(*t)).count();
    hits as f32 / terms.len() as f32
}

/// Cosine similarity; 0 for empty, zero or mismatched vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// A ranked result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Chunk id
    pub id: String,
    pub source: ChunkSource,
    pub path: String,
    pub title: String,
    /// At most [`SNIPPET_LINES`] lines
    pub snippet: String,
    pub score: f32,
    pub start_line: usize,
    pub end_line: usize,
}

impl SearchHit {
    pub fn from_chunk(chunk: &Chunk, score: f32) -> Self {
        Self {
            id: chunk.id.clone(),
            source: chunk.source,
            path: chunk.path.clone(),
            title: chunk.title.clone(),
            snippet: snippet(&chunk.text),
            score,
            start_line: chunk.start_line,
            end_line: chunk.end_line,
        }
    }
}

fn snippet(text: &str) -> String {
    text.lines().take(SNIPPET_LINES).collect::<Vec<_>>().join("\n")
}

/// Descending score, then path and line for a stable order.
pub fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.start_line.cmp(&b.start_line))
    });
}

/// Whether a chunk belongs to the document-record set.
pub fn is_document_record(chunk: &Chunk) -> bool {
    chunk.source != ChunkSource::Repo
        || spec_for_path(Path::new(&chunk.path)).family == LanguageFamily::Doc
}

/// In-memory view of the store that search runs over.
#[derive(Debug, Default)]
pub struct SearchCorpus {
    chunks: Vec<Chunk>,
    terms: Vec<HashSet<String>>,
    docs: BM25Index,
}

impl SearchCorpus {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        let terms = chunks
            .iter()
            .map(|c| {
                let mut set = term_set(&c.text);
                set.extend(term_set(&c.path));
                set
            })
            .collect();
        let mut docs = BM25Index::new();
        for chunk in chunks.iter().filter(|c| is_document_record(c)) {
            docs.add_document(chunk.id.clone(), &format!("{}\n{}", chunk.title, chunk.text));
        }
        Self { chunks, terms, docs }
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }
}

/// Tunable ranking parameters.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub vector_weight: f32,
    pub lexical_weight: f32,
    pub min_shortlist: usize,
    pub boost_weight: f32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            vector_weight: 0.8,
            lexical_weight: 0.2,
            min_shortlist: 50,
            boost_weight: 0.1,
        }
    }
}

impl SearchOptions {
    pub fn from_config(search: &SearchConfig, patterns: &PatternsConfig) -> Self {
        Self {
            vector_weight: search.vector_weight,
            lexical_weight: search.lexical_weight,
            min_shortlist: search.min_shortlist,
            boost_weight: if patterns.enabled { patterns.boost_weight } else { 0.0 },
        }
    }
}

/// The full search pipeline.
pub struct HybridSearcher {
    options: SearchOptions,
    gateway: Arc<EmbeddingGateway>,
    reranker: Option<Arc<dyn Reranker>>,
}

impl HybridSearcher {
    pub fn new(
        options: SearchOptions,
        gateway: Arc<EmbeddingGateway>,
        reranker: Option<Arc<dyn Reranker>>,
    ) -> Self {
        Self {
            options,
            gateway,
            reranker,
        }
    }

    /// Rank the corpus for a query and return the top `k`.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        corpus: &SearchCorpus,
        patterns: Option<&PatternSnapshot>,
    ) -> Vec<SearchHit> {
        let terms: Vec<String> = dedup(query_terms(query));
        if terms.is_empty() || k == 0 || corpus.is_empty() {
            return Vec::new();
        }

        if detect_intent(query) == SearchIntent::Documentation {
            let hits = self.search_documents(query, k, corpus);
            if !hits.is_empty() {
                return hits;
            }
            debug!("No document records matched, using code search");
        }
        self.search_code(query, &terms, k, corpus, patterns).await
    }

    fn search_documents(&self, query: &str, k: usize, corpus: &SearchCorpus) -> Vec<SearchHit> {
        let by_id: std::collections::HashMap<&str, &Chunk> = corpus
            .chunks
            .iter()
            .filter(|c| is_document_record(c))
            .map(|c| (c.id.as_str(), c))
            .collect();
        corpus
            .docs
            .search(query, k)
            .into_iter()
            .filter_map(|(id, score)| {
                by_id
                    .get(id.as_str())
                    .map(|c| SearchHit::from_chunk(c, score as f32))
            })
            .collect()
    }

    async fn search_code(
        &self,
        query: &str,
        terms: &[String],
        k: usize,
        corpus: &SearchCorpus,
        patterns: Option<&PatternSnapshot>,
    ) -> Vec<SearchHit> {
        let content_type = detect_content_type(query);
        let query_vector = match self
            .gateway
            .embed(&[query.to_string()], content_type, EmbedIntent::Query)
            .await
        {
            Ok(batch) => batch.vectors.into_iter().next(),
            Err(e) => {
                warn!("Query embedding failed, scoring lexically: {}", e);
                None
            }
        };

        let mut scored: Vec<(usize, f32)> = corpus
            .chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let cos = match (&query_vector, &chunk.embedding) {
                    (Some(q), Some(v)) => cosine(q, v).max(0.0),
                    _ => 0.0,
                };
                let overlap = lexical_overlap(terms, &corpus.terms[i]);
                (i, self.options.vector_weight * cos + self.options.lexical_weight * overlap)
            })
            .filter(|(_, score)| *score > 0.0)
            .collect();

        let shortlist = k.saturating_mul(10).max(self.options.min_shortlist);
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));
        scored.truncate(shortlist);

        let mut ranked: Vec<SearchHit> = scored
            .into_iter()
            .map(|(i, score)| {
                let chunk = &corpus.chunks[i];
                SearchHit::from_chunk(chunk, score + code_first_bonus(terms, chunk))
            })
            .collect();

        if let Some(snapshot) = patterns {
            snapshot.boost(&mut ranked, terms, self.options.boost_weight);
        }
        sort_hits(&mut ranked);

        if let Some(reranker) = &self.reranker {
            if self.cross_encode(reranker.as_ref(), query, &mut ranked).await {
                if let Some(snapshot) = patterns {
                    snapshot.boost(&mut ranked, terms, self.options.boost_weight);
                }
                sort_hits(&mut ranked);
            }
        }

        ranked.truncate(k);
        debug!("Search for {:?} returned {} hits", query, ranked.len());
        ranked
    }

    /// Blend cross-encoder relevance into the top candidates. Hits past the
    /// top are scaled as if scored 0 so the whole list stays comparable.
    async fn cross_encode(
        &self,
        reranker: &dyn Reranker,
        query: &str,
        ranked: &mut [SearchHit],
    ) -> bool {
        let top = ranked.len().min(CROSS_ENCODER_TOP);
        if top == 0 {
            return false;
        }
        let docs: Vec<RerankerDoc> = ranked[..top]
            .iter()
            .map(|hit| RerankerDoc {
                id: hit.id.clone(),
                content: hit.snippet.clone(),
            })
            .collect();
        match reranker.rerank(query, &docs).await {
            Ok(scores) if scores.len() == top => {
                for (hit, relevance) in ranked[..top].iter_mut().zip(scores) {
                    hit.score = 0.5 * hit.score + 0.5 * relevance;
                }
                for hit in &mut ranked[top..] {
                    hit.score *= 0.5;
                }
                true
            }
            Ok(scores) => {
                warn!(
                    "Cross-encoder returned {} scores for {} documents, ignoring",
                    scores.len(),
                    top
                );
                false
            }
            Err(e) => {
                warn!("Cross-encoder rerank failed, keeping heuristic order: {}", e);
                false
            }
        }
    }
}

fn dedup(terms: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    terms.into_iter().filter(|t| seen.insert(t.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{content_hash, CodeChunker};
    use anyhow::{bail, Result};
    use async_trait::async_trait;

    async fn corpus(files: &[(&str, &str)], gateway: &EmbeddingGateway) -> SearchCorpus {
        let chunker = CodeChunker::default();
        let mut chunks = Vec::new();
        for (path, text) in files {
            chunks.extend(chunker.chunk_file(path, text, &content_hash(text)));
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let batch = gateway
            .embed(&texts, crate::embeddings::ContentType::Code, EmbedIntent::Document)
            .await
            .unwrap();
        for (chunk, vector) in chunks.iter_mut().zip(batch.vectors) {
            chunk.embedding = Some(vector);
        }
        SearchCorpus::new(chunks)
    }

    fn files() -> Vec<(&'static str, &'static str)> {
        vec![
            (
                "src/config.rs",
                "pub fn parse_config(text: &str) -> Config {\n    toml::from_str(text)\n}\n",
            ),
            (
                "src/net.rs",
                "pub fn open_socket(addr: &str) -> Socket {\n    Socket::bind(addr)\n}\n",
            ),
            (
                "README.md",
                "# Demo\n\nInstallation guide: run the installer, then read the usage notes.\n",
            ),
        ]
    }

    fn searcher(gateway: Arc<EmbeddingGateway>, reranker: Option<Arc<dyn Reranker>>) -> HybridSearcher {
        HybridSearcher::new(SearchOptions::default(), gateway, reranker)
    }

    struct Favour(&'static str);

    #[async_trait]
    impl Reranker for Favour {
        async fn rerank(&self, _query: &str, documents: &[RerankerDoc]) -> Result<Vec<f32>> {
            Ok(documents
                .iter()
                .map(|d| if d.content.contains(self.0) { 1.0 } else { 0.0 })
                .collect())
        }
    }

    struct Broken;

    #[async_trait]
    impl Reranker for Broken {
        async fn rerank(&self, _query: &str, _documents: &[RerankerDoc]) -> Result<Vec<f32>> {
            bail!("rerank service unavailable")
        }
    }

    #[test]
    fn test_detect_intent() {
        assert_eq!(detect_intent("installation guide"), SearchIntent::Documentation);
        assert_eq!(detect_intent("where is parse_config defined"), SearchIntent::Code);
        assert_eq!(detect_intent("readme function"), SearchIntent::Code);
    }

    #[test]
    fn test_query_terms_split_identifiers() {
        assert_eq!(
            query_terms("parseConfig the file_loader"),
            vec!["parse", "config", "file", "loader"]
        );
    }

    #[test]
    fn test_cosine_dimension_mismatch_is_zero() {
        assert_eq!(cosine(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        assert!((cosine(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_code_query_ranks_defining_chunk_first() {
        let gateway = Arc::new(EmbeddingGateway::local_only(64));
        let corpus = corpus(&files(), &gateway).await;
        let hits = searcher(gateway, None)
            .search("parse_config function", 2, &corpus, None)
            .await;
        assert!(!hits.is_empty());
        assert!(hits.len() <= 2);
        assert_eq!(hits[0].path, "src/config.rs");
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_doc_query_uses_document_records() {
        let gateway = Arc::new(EmbeddingGateway::local_only(64));
        let corpus = corpus(&files(), &gateway).await;
        assert_eq!(corpus.doc_count(), 1);
        let hits = searcher(gateway, None)
            .search("installation guide", 5, &corpus, None)
            .await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "README.md");
    }

    #[tokio::test]
    async fn test_cross_encoder_reorders_and_failure_keeps_order() {
        let gateway = Arc::new(EmbeddingGateway::local_only(64));
        let corpus = corpus(&files(), &gateway).await;
        let query = "open socket or parse config function";

        let plain = searcher(gateway.clone(), None)
            .search(query, 3, &corpus, None)
            .await;
        let broken = searcher(gateway.clone(), Some(Arc::new(Broken)))
            .search(query, 3, &corpus, None)
            .await;
        assert_eq!(plain, broken);

        let favoured = searcher(gateway, Some(Arc::new(Favour("Socket::bind"))))
            .search(query, 3, &corpus, None)
            .await;
        assert_eq!(favoured[0].path, "src/net.rs");
    }

    #[tokio::test]
    async fn test_cross_encoder_tail_stays_behind_rescored_top() {
        let mut ranked: Vec<SearchHit> = (0..CROSS_ENCODER_TOP + 5)
            .map(|i| SearchHit {
                id: format!("c{i}"),
                source: ChunkSource::Repo,
                path: format!("src/m{i}.rs"),
                title: format!("m{i}"),
                snippet: String::new(),
                score: 1.0 - i as f32 * 0.01,
                start_line: 1,
                end_line: 1,
            })
            .collect();
        let before: Vec<String> = ranked.iter().map(|h| h.id.clone()).collect();

        let searcher = searcher(Arc::new(EmbeddingGateway::local_only(16)), None);
        assert!(searcher.cross_encode(&Favour("nothing"), "q", &mut ranked).await);
        sort_hits(&mut ranked);

        let after: Vec<String> = ranked.iter().map(|h| h.id.clone()).collect();
        assert_eq!(after, before);
        assert!((ranked[CROSS_ENCODER_TOP].score - 0.25).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_huge_k_does_not_overflow() {
        let gateway = Arc::new(EmbeddingGateway::local_only(64));
        let corpus = corpus(&files(), &gateway).await;
        let hits = searcher(gateway, None)
            .search("parse_config function", usize::MAX, &corpus, None)
            .await;
        assert_eq!(hits[0].path, "src/config.rs");
    }

    #[tokio::test]
    async fn test_empty_query_or_corpus() {
        let gateway = Arc::new(EmbeddingGateway::local_only(16));
        let empty = SearchCorpus::default();
        let searcher = searcher(gateway, None);
        assert!(searcher.search("anything", 5, &empty, None).await.is_empty());
        let corpus = SearchCorpus::new(Vec::new());
        assert!(searcher.search("the a", 5, &corpus, None).await.is_empty());
    }
}
