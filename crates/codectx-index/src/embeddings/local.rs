//! Deterministic local pseudo-embeddings.
//!
//! Feature hashing over lowercase tokens and token bigrams into a fixed
//! number of signed buckets, L2-normalised. Not semantic, but stable,
//! offline and good enough to keep lexically similar texts close when
//! every remote provider is unavailable.

use async_trait::async_trait;

use super::{ContentType, EmbedIntent, EmbeddingError, EmbeddingProvider};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

const ALL_TYPES: &[ContentType] = &[
    ContentType::Code,
    ContentType::Docs,
    ContentType::Finance,
    ContentType::Legal,
    ContentType::General,
];

/// Local hashing embedder. Never fails.
pub struct LocalHashEmbeddings {
    dimensions: usize,
    model: String,
}

impl LocalHashEmbeddings {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            dimensions,
            model: format!("local-hash-{dimensions}"),
        }
    }

    /// Embed one text synchronously.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions];
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();

        for token in &tokens {
            self.add_feature(&mut vector, token.as_bytes(), 1.0);
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.add_feature(&mut vector, bigram.as_bytes(), 0.5);
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    fn add_feature(&self, vector: &mut [f32], bytes: &[u8], weight: f32) {
        let hash = fnv1a(bytes);
        let bucket = (hash % self.dimensions as u64) as usize;
        let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for LocalHashEmbeddings {
    fn name(&self) -> &str {
        "local"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn content_types(&self) -> &[ContentType] {
        ALL_TYPES
    }

    fn max_batch_size(&self) -> usize {
        usize::MAX
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        _intent: EmbedIntent,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_deterministic_and_normalised() {
        let local = LocalHashEmbeddings::new(64);
        let a = local.embed_text("parse the config file");
        let b = local.embed_text("parse the config file");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert_eq!(local.model_name(), "local-hash-64");
    }

    #[test]
    fn test_similar_texts_are_closer() {
        let local = LocalHashEmbeddings::new(256);
        let q = local.embed_text("load user profile");
        let near = local.embed_text("fn load_user_profile loads the user profile");
        let far = local.embed_text("render chart axis ticks");
        assert!(cosine(&q, &near) > cosine(&q, &far));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let local = LocalHashEmbeddings::new(8);
        assert!(local.embed_text("  ").iter().all(|v| *v == 0.0));
    }
}
