//! BM25 keyword search over document records.

use std::collections::{HashMap, HashSet};

use super::query_terms;

/// BM25 parameters
const K1: f64 = 1.2; // Term frequency saturation
const B: f64 = 0.75; // Length normalization

/// A document in the BM25 index
#[derive(Debug, Clone)]
struct Document {
    term_freqs: HashMap<String, usize>,
    length: usize,
}

/// BM25 search index
#[derive(Debug, Clone, Default)]
pub struct BM25Index {
    documents: HashMap<String, Document>,
    /// Number of documents containing each term
    doc_freq: HashMap<String, usize>,
    total_length: usize,
}

impl BM25Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a document, replacing any earlier one with the same id.
    pub fn add_document(&mut self, id: String, text: &str) {
        self.remove_document(&id);
        let tokens = query_terms(text);
        let length = tokens.len();
        let mut term_freqs: HashMap<String, usize> = HashMap::new();
        for token in tokens {
            *term_freqs.entry(token).or_insert(0) += 1;
        }
        for term in term_freqs.keys() {
            *self.doc_freq.entry(term.clone()).or_insert(0) += 1;
        }
        self.total_length += length;
        self.documents.insert(id, Document { term_freqs, length });
    }

    /// Remove a document from the index
    pub fn remove_document(&mut self, id: &str) -> bool {
        let Some(doc) = self.documents.remove(id) else {
            return false;
        };
        self.total_length -= doc.length;
        for term in doc.term_freqs.keys() {
            if let Some(count) = self.doc_freq.get_mut(term) {
                *count -= 1;
                if *count == 0 {
                    self.doc_freq.remove(term);
                }
            }
        }
        true
    }

    fn avg_doc_length(&self) -> f64 {
        if self.documents.is_empty() {
            0.0
        } else {
            self.total_length as f64 / self.documents.len() as f64
        }
    }

    /// Calculate IDF for a term
    fn idf(&self, term: &str) -> f64 {
        let doc_freq = self.doc_freq.get(term).copied().unwrap_or(0) as f64;
        if doc_freq == 0.0 {
            return 0.0;
        }
        let n = self.documents.len() as f64;
        ((n - doc_freq + 0.5) / (doc_freq + 0.5) + 1.0).ln()
    }

    fn score_document(&self, doc: &Document, query_terms: &[String]) -> f64 {
        let avg = self.avg_doc_length().max(1.0);
        let mut score = 0.0;
        for term in query_terms {
            let tf = doc.term_freqs.get(term).copied().unwrap_or(0) as f64;
            if tf > 0.0 {
                let numerator = tf * (K1 + 1.0);
                let denominator = tf + K1 * (1.0 - B + B * (doc.length as f64 / avg));
                score += self.idf(term) * (numerator / denominator);
            }
        }
        score
    }

    /// Search the index and return ranked `(id, score)` pairs.
    pub fn search(&self, query: &str, limit: usize) -> Vec<(String, f64)> {
        let terms: Vec<String> = query_terms(query)
            .into_iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if terms.is_empty() {
            return Vec::new();
        }

        let mut scores: Vec<(String, f64)> = self
            .documents
            .iter()
            .map(|(id, doc)| (id.clone(), self.score_document(doc, &terms)))
            .filter(|(_, score)| *score > 0.0)
            .collect();

        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scores.truncate(limit);
        scores
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn clear(&mut self) {
        self.documents.clear();
        self.doc_freq.clear();
        self.total_length = 0;
    }
}
