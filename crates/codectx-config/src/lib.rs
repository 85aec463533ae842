//! Configuration for the codectx engine.
//!
//! Values are layered: built-in defaults, then the user-level file
//! (`~/.config/codectx/config.toml`), then `<root>/.codectx.toml`, then
//! `CODECTX_*` environment variables (`__` separates nested keys, e.g.
//! `CODECTX_INDEX__TTL_SECS=600`). Credential values written as
//! `${VAR}` are expanded from the environment after loading.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-workspace config file name.
pub const WORKSPACE_CONFIG_FILE: &str = ".codectx.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "CODECTX";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    pub cache: CacheConfig,
    pub search: SearchConfig,
    pub patterns: PatternsConfig,
    pub watcher: WatcherConfig,
}

/// Embedding providers and batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Explicit provider order by name; empty keeps the built-in order.
    pub providers: Vec<String>,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub voyage_api_key: Option<String>,
    pub voyage_base_url: String,
    pub openrouter_api_key: Option<String>,
    pub openrouter_model: String,
    pub ollama_url: Option<String>,
    pub ollama_model: String,
    pub batch_size: usize,
    /// Maximum in-flight batches per provider.
    pub concurrency: usize,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub local_dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            openai_api_key: Some("${OPENAI_API_KEY}".to_string()),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_model: "text-embedding-3-small".to_string(),
            voyage_api_key: Some("${VOYAGE_API_KEY}".to_string()),
            voyage_base_url: "https://api.voyageai.com/v1".to_string(),
            openrouter_api_key: Some("${OPENROUTER_API_KEY}".to_string()),
            openrouter_model: "qwen/qwen3-embedding-8b".to_string(),
            ollama_url: None,
            ollama_model: "nomic-embed-text".to_string(),
            batch_size: 32,
            concurrency: 4,
            timeout_secs: 30,
            max_retries: 3,
            local_dimensions: 256,
        }
    }
}

/// Indexing behaviour and store limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Store directory, relative to the workspace root unless absolute.
    pub store_dir: PathBuf,
    /// A pass is skipped when the last update is younger than this.
    pub ttl_secs: u64,
    /// Files processed synchronously by a bootstrap pass.
    pub quick_file_budget: usize,
    /// Queue files beyond the budget for the background worker.
    pub background_indexing: bool,
    pub compress_chunks: bool,
    pub max_store_mb: u64,
    pub auto_cleanup: bool,
    pub max_file_bytes: u64,
    pub staleness_check_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from(".codectx"),
            ttl_secs: 300,
            quick_file_budget: 200,
            background_indexing: true,
            compress_chunks: false,
            max_store_mb: 512,
            auto_cleanup: true,
            max_file_bytes: 1024 * 1024,
            staleness_check_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub size: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: 256,
            ttl_secs: 300,
        }
    }
}

/// Hybrid search weights and rerank endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub vector_weight: f32,
    pub lexical_weight: f32,
    /// Lower bound on the shortlist handed to the reranker.
    pub min_shortlist: usize,
    pub quick_scan_files: usize,
    pub rerank_url: Option<String>,
    pub rerank_model: String,
    pub rerank_api_key: Option<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            vector_weight: 0.8,
            lexical_weight: 0.2,
            min_shortlist: 50,
            quick_scan_files: 400,
            rerank_url: None,
            rerank_model: "rerank-2".to_string(),
            rerank_api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternsConfig {
    pub enabled: bool,
    pub architecture: bool,
    pub style: bool,
    pub boost_weight: f32,
}

impl Default for PatternsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            architecture: true,
            style: true,
            boost_weight: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub enabled: bool,
    pub debounce_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 300,
        }
    }
}

impl Config {
    /// Load the layered configuration for a workspace root.
    pub fn load(root: &Path) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(dir) = dirs::config_dir() {
            let user = dir.join("codectx").join("config.toml");
            builder = builder.add_source(File::from(user).format(FileFormat::Toml).required(false));
        }
        builder = builder
            .add_source(
                File::from(root.join(WORKSPACE_CONFIG_FILE))
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(environment());
        Self::finish(builder)
    }

    /// Build from an explicit variable map instead of the process
    /// environment. Keys use the same `CODECTX_` form.
    pub fn from_env_map(vars: HashMap<String, String>) -> Result<Self> {
        let builder = config::Config::builder().add_source(environment().source(Some(vars)));
        Self::finish(builder)
    }

    /// Parse a TOML document on top of the defaults.
    pub fn from_toml(text: &str) -> Result<Self> {
        let builder =
            config::Config::builder().add_source(File::from_str(text, FileFormat::Toml));
        Self::finish(builder)
    }

    fn finish(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let mut cfg: Config = builder
            .build()
            .context("Failed to read configuration sources")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        cfg.expand_credentials();
        cfg.validate()?;
        Ok(cfg)
    }

    fn expand_credentials(&mut self) {
        let e = &mut self.embedding;
        for slot in [
            &mut e.openai_api_key,
            &mut e.voyage_api_key,
            &mut e.openrouter_api_key,
            &mut e.ollama_url,
            &mut self.search.rerank_url,
            &mut self.search.rerank_api_key,
        ] {
            *slot = resolve_optional(slot.take());
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding.batch_size == 0 {
            return Err(invalid("embedding.batch_size", "must be at least 1"));
        }
        if self.embedding.concurrency == 0 {
            return Err(invalid("embedding.concurrency", "must be at least 1"));
        }
        if self.embedding.local_dimensions == 0 {
            return Err(invalid("embedding.local_dimensions", "must be at least 1"));
        }
        if self.cache.size == 0 {
            return Err(invalid("cache.size", "must be at least 1"));
        }
        for (key, w) in [
            ("search.vector_weight", self.search.vector_weight),
            ("search.lexical_weight", self.search.lexical_weight),
            ("patterns.boost_weight", self.patterns.boost_weight),
        ] {
            if !(0.0..=1.0).contains(&w) {
                return Err(invalid(key, &format!("{w} is outside 0..=1")));
            }
        }
        Ok(())
    }

    /// Absolute store directory for a workspace root.
    pub fn store_path(&self, root: &Path) -> PathBuf {
        if self.index.store_dir.is_absolute() {
            self.index.store_dir.clone()
        } else {
            root.join(&self.index.store_dir)
        }
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("embedding.providers")
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

/// Expand `${VAR}` references. Unset variables and empty values yield
/// `None` so an unconfigured provider is simply skipped.
fn resolve_optional(value: Option<String>) -> Option<String> {
    let raw = value?;
    if raw.is_empty() {
        return None;
    }
    match shellexpand::env(&raw) {
        Ok(expanded) if !expanded.is_empty() => Some(expanded.into_owned()),
        _ => None,
    }
}
