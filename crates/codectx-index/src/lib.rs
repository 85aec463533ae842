//! Incremental code indexing and hybrid search for a local source tree.
//!
//! [`Engine`] is the entry point: it owns the chunk store, the embedding
//! gateway, the search pipeline and the background queue for one
//! workspace. [`EngineRegistry`] keeps one engine per root.

pub mod chunker;
pub mod embeddings;
pub mod engine;
pub mod graph;
pub mod graph_builder;
pub mod indexer;
pub mod languages;
pub mod manifest;
pub mod patterns;
pub mod query_cache;
pub mod queue;
pub mod reranker;
pub mod search;
pub mod storage;
pub mod symbols;
pub mod walk;
pub mod watcher;

pub use chunker::{Chunk, ChunkSource, CodeChunker};
pub use embeddings::{ContentType, EmbedIntent, EmbeddingError, EmbeddingGateway, EmbeddingProvider};
pub use engine::{Engine, EngineRegistry};
pub use graph::{ImportEdge, ImportGraph, Neighborhood};
pub use indexer::{PassReport, PassState};
pub use search::SearchHit;
pub use storage::IndexStats;
pub use symbols::{CallSite, Symbol};
