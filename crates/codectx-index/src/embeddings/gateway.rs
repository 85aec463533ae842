//! Ordered, capability-tagged provider fallback.
//!
//! The gateway holds an ordered list of providers. For a batch of a given
//! content type it tries the providers tagged for that type first, then
//! the rest in configured order, and finally the local hashing embedder.
//! Each failure is recorded and the next provider is tried; the caller
//! only sees an error when every provider, local included, has failed.

use std::sync::Arc;
use std::time::Duration;

use codectx_config::EmbeddingConfig;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use super::{
    ContentType, EmbedIntent, EmbeddingError, EmbeddingProvider, HttpEmbeddingProvider,
    HttpProviderConfig, LocalHashEmbeddings, WireFormat,
};

/// Vectors for a batch and where they came from.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingBatch {
    pub vectors: Vec<Vec<f32>>,
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
}

/// Built-in provider catalog, filtered by which credentials are set.
pub struct ProviderCatalog;

impl ProviderCatalog {
    pub fn from_config(config: &EmbeddingConfig) -> Vec<Arc<dyn EmbeddingProvider>> {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let http = |name: &str,
                    base_url: &str,
                    api_key: Option<String>,
                    model: &str,
                    dimensions: usize,
                    content_types: Vec<ContentType>,
                    wire: WireFormat,
                    send_input_type: bool|
         -> Arc<dyn EmbeddingProvider> {
            Arc::new(HttpEmbeddingProvider::new(HttpProviderConfig {
                name: name.to_string(),
                base_url: base_url.to_string(),
                api_key,
                model: model.to_string(),
                dimensions,
                content_types,
                wire,
                send_input_type,
                timeout,
                max_retries: config.max_retries,
                batch_size: config.batch_size,
            }))
        };

        let mut providers: Vec<Arc<dyn EmbeddingProvider>> = Vec::new();
        if let Some(key) = &config.voyage_api_key {
            let base = config.voyage_base_url.as_str();
            providers.push(http("voyage-code", base, Some(key.clone()), "voyage-code-3", 1024, vec![ContentType::Code], WireFormat::OpenAi, true));
            providers.push(http("voyage-finance", base, Some(key.clone()), "voyage-finance-2", 1024, vec![ContentType::Finance], WireFormat::OpenAi, true));
            providers.push(http("voyage-law", base, Some(key.clone()), "voyage-law-2", 1024, vec![ContentType::Legal], WireFormat::OpenAi, true));
        }
        if let Some(key) = &config.openai_api_key {
            providers.push(http("openai", &config.openai_base_url, Some(key.clone()), &config.openai_model, 1536, vec![ContentType::General, ContentType::Docs], WireFormat::OpenAi, false));
        }
        if let Some(key) = &config.openrouter_api_key {
            providers.push(http("openrouter", "https://openrouter.ai/api/v1", Some(key.clone()), &config.openrouter_model, 4096, vec![ContentType::General], WireFormat::OpenAi, false));
        }
        if let Some(url) = &config.ollama_url {
            providers.push(http("ollama", url, None, &config.ollama_model, 768, vec![ContentType::General], WireFormat::Ollama, false));
        }

        if !config.providers.is_empty() {
            // An explicit order both filters and orders.
            providers = config
                .providers
                .iter()
                .filter_map(|name| providers.iter().find(|p| p.name() == name).cloned())
                .collect();
        }

        info!(
            "Embedding providers: [{}] + local fallback",
            providers.iter().map(|p| p.name()).collect::<Vec<_>>().join(", ")
        );
        providers
    }
}

/// Fallback gateway over an ordered provider list.
pub struct EmbeddingGateway {
    providers: Vec<Arc<dyn EmbeddingProvider>>,
    local: Arc<LocalHashEmbeddings>,
    concurrency: usize,
    batch_size: usize,
}

impl EmbeddingGateway {
    pub fn new(
        providers: Vec<Arc<dyn EmbeddingProvider>>,
        local_dimensions: usize,
        concurrency: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            providers,
            local: Arc::new(LocalHashEmbeddings::new(local_dimensions)),
            concurrency: concurrency.max(1),
            batch_size: batch_size.max(1),
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self::new(
            ProviderCatalog::from_config(config),
            config.local_dimensions,
            config.concurrency,
            config.batch_size,
        )
    }

    /// Gateway with only the local embedder.
    pub fn local_only(dimensions: usize) -> Self {
        Self::new(Vec::new(), dimensions, 1, 32)
    }

    /// Providers to try for a content type, in order.
    pub fn plan(&self, content_type: ContentType) -> Vec<Arc<dyn EmbeddingProvider>> {
        let (tagged, rest): (Vec<_>, Vec<_>) = self
            .providers
            .iter()
            .cloned()
            .partition(|p| p.content_types().contains(&content_type));
        let mut plan = tagged;
        plan.extend(rest);
        plan.push(self.local.clone() as Arc<dyn EmbeddingProvider>);
        plan
    }

    /// Model that a batch of this content type would use first.
    pub fn planned_model(&self, content_type: ContentType) -> String {
        self.plan(content_type)
            .first()
            .map(|p| p.model_name().to_string())
            .unwrap_or_else(|| self.local.model_name().to_string())
    }

    /// Embed texts, falling through the plan on failure.
    pub async fn embed(
        &self,
        texts: &[String],
        content_type: ContentType,
        intent: EmbedIntent,
    ) -> Result<EmbeddingBatch, EmbeddingError> {
        let mut failures = Vec::new();
        for provider in self.plan(content_type) {
            if texts.is_empty() {
                return Ok(EmbeddingBatch {
                    vectors: Vec::new(),
                    provider: provider.name().to_string(),
                    model: provider.model_name().to_string(),
                    dimensions: provider.dimensions(),
                });
            }
            match self.embed_with(provider.as_ref(), texts, intent).await {
                Ok(vectors) => {
                    let dimensions = vectors.first().map(Vec::len).unwrap_or(0);
                    debug!(
                        "Embedded {} texts ({}) with {}",
                        texts.len(),
                        content_type.as_str(),
                        provider.name()
                    );
                    return Ok(EmbeddingBatch {
                        vectors,
                        provider: provider.name().to_string(),
                        model: provider.model_name().to_string(),
                        dimensions,
                    });
                }
                Err(e) => {
                    warn!("Embedding provider {} failed, falling back: {}", provider.name(), e);
                    failures.push((provider.name().to_string(), e.to_string()));
                }
            }
        }
        Err(EmbeddingError::AllProvidersFailed(failures))
    }

    async fn embed_with(
        &self,
        provider: &dyn EmbeddingProvider,
        texts: &[String],
        intent: EmbedIntent,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let size = self.batch_size.min(provider.max_batch_size()).max(1);
        let owned: Vec<Vec<String>> = texts.chunks(size).map(<[String]>::to_vec).collect();
        let batches: Vec<Vec<Vec<f32>>> = stream::iter(owned)
            .map(|batch| async move {
                let vectors = provider.embed_batch(&batch, intent).await?;
                if vectors.len() != batch.len() {
                    return Err(EmbeddingError::CountMismatch {
                        expected: batch.len(),
                        got: vectors.len(),
                    });
                }
                Ok(vectors)
            })
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        let vectors: Vec<Vec<f32>> = batches.into_iter().flatten().collect();
        if let Some(first) = vectors.first() {
            if first.is_empty() || vectors.iter().any(|v| v.len() != first.len()) {
                return Err(EmbeddingError::InvalidResponse(
                    "inconsistent embedding dimensions".to_string(),
                ));
            }
        }
        Ok(vectors)
    }
}
