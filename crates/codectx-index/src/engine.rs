//! Engine facade for one workspace, and the registry of open engines.
//!
//! Every query operation triggers a one-time bootstrap: a budgeted quick
//! pass whose leftovers go to the background queue. Derived views (the
//! search corpus, symbol index and import graph) are built lazily from the
//! store and dropped whenever a pass changes it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use codectx_config::Config;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chunker::ChunkSource;
use crate::embeddings::EmbeddingGateway;
use crate::graph::{ImportGraph, Neighborhood};
use crate::graph_builder::GraphBuilder;
use crate::indexer::{Indexer, IndexerSettings, PassReport, PassRequest};
use crate::patterns::{PatternLearner, PatternSnapshot};
use crate::query_cache::QueryCache;
use crate::queue::{WorkHandler, WorkItem, WorkQueue, QUEUE_CAPACITY};
use crate::reranker::{HttpCrossEncoder, Reranker};
use crate::search::{HybridSearcher, QuickScanner, SearchCorpus, SearchHit, SearchOptions};
use crate::storage::{ChunkStore, IndexStats};
use crate::symbols::{CallSite, Symbol, SymbolIndex};
use crate::watcher::FileWatcher;

/// Store-derived state shared by queries until the next change.
struct Views {
    corpus: SearchCorpus,
    symbols: SymbolIndex,
    patterns: Option<PatternSnapshot>,
}

pub(crate) struct EngineInner {
    root: PathBuf,
    config: Config,
    indexer: Indexer,
    searcher: HybridSearcher,
    cache: QueryCache,
    quick: Arc<QuickScanner>,
    queue: WorkQueue,
    bootstrapped: Mutex<bool>,
    views: RwLock<Option<Arc<Views>>>,
    graph: RwLock<Option<Arc<ImportGraph>>>,
    watcher: Mutex<Option<FileWatcher>>,
}

/// Handle to one workspace's index. Clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Open with the providers named in `config`.
    pub async fn open(root: &Path, config: Config) -> Result<Self> {
        let gateway = Arc::new(EmbeddingGateway::from_config(&config.embedding));
        Self::with_gateway(root, config, gateway).await
    }

    pub async fn with_gateway(
        root: &Path,
        config: Config,
        gateway: Arc<EmbeddingGateway>,
    ) -> Result<Self> {
        config.validate()?;
        let root = std::fs::canonicalize(root)
            .with_context(|| format!("workspace root {} is not accessible", root.display()))?;
        let settings = IndexerSettings::from_config(&root, &config);
        let store = Arc::new(
            ChunkStore::open(&settings.store_dir, config.index.compress_chunks)
                .context("failed to open the chunk store")?,
        );

        let reranker = config.search.rerank_url.clone().map(|url| {
            Arc::new(HttpCrossEncoder::new(
                url,
                config.search.rerank_model.clone(),
                config.search.rerank_api_key.clone(),
            )) as Arc<dyn Reranker>
        });
        let searcher = HybridSearcher::new(
            SearchOptions::from_config(&config.search, &config.patterns),
            gateway.clone(),
            reranker,
        );
        let quick = Arc::new(QuickScanner::new(
            &root,
            &settings.store_dir,
            config.search.quick_scan_files,
        ));
        let cache = QueryCache::new(config.cache.size, Duration::from_secs(config.cache.ttl_secs));
        let indexer = Indexer::new(
            settings,
            store,
            gateway,
            PatternLearner::new(&config.patterns),
        );

        let inner = Arc::new_cyclic(|weak: &Weak<EngineInner>| {
            let handler: Weak<dyn WorkHandler> = weak.clone();
            EngineInner {
                root,
                config,
                indexer,
                searcher,
                cache,
                quick,
                queue: WorkQueue::spawn(QUEUE_CAPACITY, handler),
                bootstrapped: Mutex::new(false),
                views: RwLock::new(None),
                graph: RwLock::new(None),
                watcher: Mutex::new(None),
            }
        });
        info!("Opened engine for {}", inner.root.display());
        Ok(Self { inner })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Run the bootstrap pass if it has not run yet. Returns its report the
    /// first time only.
    pub async fn ensure_indexed(&self) -> Result<Option<PassReport>> {
        let mut done = self.inner.bootstrapped.lock().await;
        if *done {
            return Ok(None);
        }
        let inner = &self.inner;
        let budget = inner.config.index.quick_file_budget;
        let report = inner.indexer.run_pass(PassRequest::bootstrap(budget)).await?;
        inner.after_pass(&report).await;

        if !report.deferred.is_empty() {
            if inner.config.index.background_indexing {
                inner
                    .queue
                    .enqueue(WorkItem::Paths(report.deferred.clone()))
                    .await?;
            } else {
                let rest = inner.indexer.reindex_paths(&report.deferred).await?;
                inner.after_pass(&rest).await;
            }
        }
        *done = true;
        Ok(Some(report))
    }

    /// Ranked hits for a query. Results are cached per `(query, k)`.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        self.ensure_indexed().await?;
        let generation = self.inner.cache.generation();
        if let Some(hits) = self.inner.cache.get(query, k).await {
            debug!("Query cache hit for {:?}", query);
            return Ok(hits);
        }
        let views = self.inner.views().await?;
        let hits = self
            .inner
            .searcher
            .search(query, k, &views.corpus, views.patterns.as_ref())
            .await;
        self.inner.cache.put(query, k, generation, hits.clone()).await;
        Ok(hits)
    }

    /// Lexical scan over a sample of the tree. Answers without waiting for
    /// the index; the bootstrap is started in the background if needed.
    pub async fn quick_scan(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        self.start_bootstrap();
        let quick = self.inner.quick.clone();
        let query = query.to_string();
        tokio::task::spawn_blocking(move || quick.scan(&query, limit))
            .await
            .context("quick scan task failed")
    }

    /// Spawn `ensure_indexed` unless the bootstrap is done or running.
    fn start_bootstrap(&self) {
        let Ok(done) = self.inner.bootstrapped.try_lock() else {
            return;
        };
        if *done {
            return;
        }
        drop(done);
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.ensure_indexed().await {
                warn!("Background bootstrap failed: {:#}", e);
            }
        });
    }

    pub async fn import_graph(&self) -> Result<Arc<ImportGraph>> {
        self.ensure_indexed().await?;
        self.inner.graph().await
    }

    /// A file's symbols with its direct imports and importers.
    pub async fn neighborhood(&self, file: &str) -> Result<Neighborhood> {
        self.ensure_indexed().await?;
        let views = self.inner.views().await?;
        let graph = self.inner.graph().await?;
        Ok(Neighborhood::build(file, views.symbols.in_file(file), &graph))
    }

    pub async fn find_symbol(&self, name: &str) -> Result<Vec<Symbol>> {
        self.ensure_indexed().await?;
        Ok(self.inner.views().await?.symbols.find(name))
    }

    pub async fn find_callers(&self, name: &str) -> Result<Vec<CallSite>> {
        self.ensure_indexed().await?;
        let views = self.inner.views().await?;
        Ok(views.symbols.find_callers(name, views.corpus.chunks()))
    }

    /// Delete the index and every derived view. The next query rebuilds.
    pub async fn reset(&self) -> Result<()> {
        let mut done = self.inner.bootstrapped.lock().await;
        self.inner.queue.drain().await;
        self.inner.indexer.reset().await?;
        self.inner.invalidate().await;
        *done = false;
        info!("Reset index for {}", self.inner.root.display());
        Ok(())
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        self.ensure_indexed().await?;
        Ok(self.inner.indexer.store().load_stats()?)
    }

    /// Schedule a change-detection pass if the index is past its TTL.
    /// Returns whether one was scheduled.
    pub async fn refresh(&self) -> Result<bool> {
        if !self.inner.indexer.is_stale()? {
            return Ok(false);
        }
        self.inner.queue.enqueue(WorkItem::Refresh { force: false }).await?;
        Ok(true)
    }

    pub async fn reindex_paths(&self, paths: &[String]) -> Result<PassReport> {
        let report = self.inner.indexer.reindex_paths(paths).await?;
        self.inner.after_pass(&report).await;
        Ok(report)
    }

    pub async fn remove_path(&self, path: &str) -> Result<PassReport> {
        let report = self.inner.indexer.remove_paths(&[path.to_string()]).await?;
        self.inner.after_pass(&report).await;
        Ok(report)
    }

    /// Add a fetched web page or knowledge note to the searchable set.
    pub async fn ingest_document(
        &self,
        source: ChunkSource,
        path: &str,
        text: &str,
    ) -> Result<PassReport> {
        let report = self.inner.indexer.ingest_document(source, path, text).await?;
        self.inner.after_pass(&report).await;
        Ok(report)
    }

    /// Wait until background work is finished.
    pub async fn drain(&self) {
        self.inner.queue.drain().await;
    }

    /// Start the file watcher. Calling it again while running does nothing.
    pub async fn watch(&self) -> Result<()> {
        let mut slot = self.inner.watcher.lock().await;
        if slot.as_ref().is_some_and(FileWatcher::is_running) {
            return Ok(());
        }
        let mut watcher = FileWatcher::new(
            self.inner.root.clone(),
            self.inner.indexer.settings().store_dir.as_path(),
            Duration::from_millis(self.inner.config.watcher.debounce_ms),
        );
        let mut rx = watcher.start()?;
        *slot = Some(watcher);

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.queue.enqueue(item).await.is_err() {
                    break;
                }
            }
            debug!("Watcher forwarding stopped");
        });
        Ok(())
    }

    pub async fn stop_watching(&self) {
        if let Some(mut watcher) = self.inner.watcher.lock().await.take() {
            watcher.stop();
        }
    }

    /// Periodically schedule a refresh while the engine is alive.
    pub fn spawn_staleness_timer(&self, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let engine = Engine { inner };
                if let Err(e) = engine.refresh().await {
                    warn!("Staleness check failed: {:#}", e);
                }
            }
        })
    }
}

impl EngineInner {
    /// Drop cached results and views after the store changed.
    async fn after_pass(&self, report: &PassReport) {
        if report.changed() {
            self.invalidate().await;
        }
    }

    async fn invalidate(&self) {
        self.cache.clear().await;
        *self.views.write().await = None;
        *self.graph.write().await = None;
        self.quick.invalidate();
    }

    async fn views(&self) -> Result<Arc<Views>> {
        if let Some(views) = self.views.read().await.as_ref() {
            return Ok(views.clone());
        }
        let mut slot = self.views.write().await;
        if let Some(views) = slot.as_ref() {
            return Ok(views.clone());
        }
        let store = self.indexer.store();
        let chunks = store.load_chunks_with_embeddings()?;
        let symbols = SymbolIndex::build(&chunks);
        let patterns = if self.config.patterns.enabled {
            store.load_patterns()?
        } else {
            None
        };
        debug!("Loaded {} chunks and {} symbols", chunks.len(), symbols.len());
        let views = Arc::new(Views {
            corpus: SearchCorpus::new(chunks),
            symbols,
            patterns,
        });
        *slot = Some(views.clone());
        Ok(views)
    }

    async fn graph(&self) -> Result<Arc<ImportGraph>> {
        if let Some(graph) = self.graph.read().await.as_ref() {
            return Ok(graph.clone());
        }
        let mut slot = self.graph.write().await;
        if let Some(graph) = slot.as_ref() {
            return Ok(graph.clone());
        }
        let map = self.indexer.store().load_file_map()?;
        let files: Vec<String> = map.files.keys().cloned().collect();
        let graph = Arc::new(GraphBuilder::new(&self.root).build(&files));
        debug!("Built import graph with {} edges", graph.edge_count());
        *slot = Some(graph.clone());
        Ok(graph)
    }
}

#[async_trait]
impl WorkHandler for EngineInner {
    async fn handle(&self, item: WorkItem) -> Result<()> {
        let report = match item {
            WorkItem::Paths(paths) => self.indexer.reindex_paths(&paths).await?,
            WorkItem::Remove(paths) => self.indexer.remove_paths(&paths).await?,
            WorkItem::Refresh { force } => self.indexer.run_pass(PassRequest::full(force)).await?,
        };
        self.after_pass(&report).await;
        Ok(())
    }
}

/// Open engines keyed by canonical workspace root.
pub struct EngineRegistry {
    /// Used for every root when set; otherwise each root loads its own.
    config: Option<Config>,
    engines: RwLock<HashMap<PathBuf, Engine>>,
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self {
            config: None,
            engines: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            config: Some(config),
            engines: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_or_open(&self, root: &Path) -> Result<Engine> {
        let key = std::fs::canonicalize(root)
            .with_context(|| format!("workspace root {} is not accessible", root.display()))?;
        if let Some(engine) = self.engines.read().await.get(&key) {
            return Ok(engine.clone());
        }

        let mut engines = self.engines.write().await;
        if let Some(engine) = engines.get(&key) {
            return Ok(engine.clone());
        }
        let config = match &self.config {
            Some(config) => config.clone(),
            None => Config::load(&key)?,
        };
        let engine = Engine::open(&key, config).await?;
        engines.insert(key, engine.clone());
        Ok(engine)
    }

    pub async fn remove(&self, root: &Path) -> Option<Engine> {
        let key = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        self.engines.write().await.remove(&key)
    }

    pub async fn len(&self) -> usize {
        self.engines.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.engines.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{ContentType, EmbedIntent, EmbeddingError, EmbeddingProvider};
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;
    use tokio::sync::Notify;

    /// Holds the first query embedding until released.
    struct HeldQuery {
        armed: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl EmbeddingProvider for HeldQuery {
        fn name(&self) -> &str {
            "held"
        }
        fn model_name(&self) -> &str {
            "held-model"
        }
        fn dimensions(&self) -> usize {
            4
        }
        fn content_types(&self) -> &[ContentType] {
            &[ContentType::Code, ContentType::General]
        }
        async fn embed_batch(
            &self,
            texts: &[String],
            intent: EmbedIntent,
        ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            if intent == EmbedIntent::Query && self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0, 0.0]).collect())
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.embedding.local_dimensions = 64;
        config
    }

    async fn engine(root: &Path) -> Engine {
        Engine::with_gateway(root, config(), Arc::new(EmbeddingGateway::local_only(64)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_runs_once() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("lib.rs"), "pub fn answer() -> u32 {\n    42\n}\n").unwrap();
        let engine = engine(dir.path()).await;

        let first = engine.ensure_indexed().await.unwrap();
        assert_eq!(first.map(|r| r.processed), Some(1));
        assert!(engine.ensure_indexed().await.unwrap().is_none());
        assert_eq!(engine.stats().await.unwrap().files_indexed, 1);
    }

    #[tokio::test]
    async fn test_deferred_files_finish_in_background() {
        let dir = tempdir().unwrap();
        for i in 0..5 {
            fs::write(dir.path().join(format!("m{i}.py")), format!("def f{i}():\n    return {i}\n"))
                .unwrap();
        }
        let mut config = config();
        config.index.quick_file_budget = 2;
        let engine = Engine::with_gateway(dir.path(), config, Arc::new(EmbeddingGateway::local_only(64)))
            .await
            .unwrap();

        let report = engine.ensure_indexed().await.unwrap().unwrap();
        assert_eq!(report.deferred.len(), 3);
        engine.drain().await;
        assert_eq!(engine.stats().await.unwrap().files_indexed, 5);
    }

    #[tokio::test]
    async fn test_symbol_queries_and_neighborhood() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/util.js"), "export function helper() {\n  return 1;\n}\n").unwrap();
        fs::write(
            dir.path().join("src/app.js"),
            "import { helper } from './util';\n\nexport function main() {\n  helper();\n}\n",
        )
        .unwrap();
        let engine = engine(dir.path()).await;

        let symbols = engine.find_symbol("helper").await.unwrap();
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].path, "src/util.js");

        let callers = engine.find_callers("helper").await.unwrap();
        assert!(callers.iter().all(|c| c.path == "src/app.js"));
        assert!(!callers.is_empty());

        let hood = engine.neighborhood("src/util.js").await.unwrap();
        assert_eq!(hood.imported_by, vec!["src/app.js".to_string()]);
        assert!(engine.import_graph().await.unwrap().edge_count() >= 1);
    }

    #[tokio::test]
    async fn test_search_cache_cleared_by_reindex() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.rs"), "fn alpha_handler() {}\n").unwrap();
        let engine = engine(dir.path()).await;

        let hits = engine.search("beta_handler", 5).await.unwrap();
        assert!(hits.iter().all(|h| !h.snippet.contains("beta_handler")));

        fs::write(dir.path().join("b.rs"), "fn beta_handler() {}\n").unwrap();
        engine.reindex_paths(&["b.rs".to_string()]).await.unwrap();
        let hits = engine.search("beta_handler", 5).await.unwrap();
        assert_eq!(hits[0].path, "b.rs");
    }

    #[tokio::test]
    async fn test_registry_reuses_engines() {
        let dir = tempdir().unwrap();
        let registry = EngineRegistry::with_config(config());
        let a = registry.get_or_open(dir.path()).await.unwrap();
        let b = registry.get_or_open(dir.path()).await.unwrap();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
        assert_eq!(registry.len().await, 1);
        assert!(registry.remove(dir.path()).await.is_some());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_quick_scan_without_index() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("notes.md"), "the retry budget is five attempts\n").unwrap();
        let engine = engine(dir.path()).await;
        let hits = engine.quick_scan("retry budget", 3).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "notes.md");

        tokio::time::timeout(Duration::from_secs(10), async {
            while !*engine.inner.bootstrapped.lock().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(engine.stats().await.unwrap().files_indexed, 1);
    }

    #[tokio::test]
    async fn test_search_racing_reset_does_not_cache_old_hits() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/a.rs"), "fn compute_total() -> u32 {\n    1\n}\n").unwrap();
        let held = Arc::new(HeldQuery {
            armed: AtomicBool::new(true),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let provider: Arc<dyn EmbeddingProvider> = held.clone();
        let gateway = EmbeddingGateway::new(vec![provider], 64, 1, 16);
        let engine = Engine::with_gateway(dir.path(), config(), Arc::new(gateway))
            .await
            .unwrap();
        engine.ensure_indexed().await.unwrap();

        let in_flight = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.search("compute_total", 5).await })
        };
        held.entered.notified().await;

        fs::remove_file(dir.path().join("src/a.rs")).unwrap();
        fs::write(dir.path().join("src/b.rs"), "fn compute_total() -> u64 {\n    2\n}\n").unwrap();
        engine.reset().await.unwrap();
        engine.ensure_indexed().await.unwrap();

        held.release.notify_one();
        let old = in_flight.await.unwrap().unwrap();
        assert_eq!(old[0].path, "src/a.rs");

        let fresh = engine.search("compute_total", 5).await.unwrap();
        assert_eq!(fresh[0].path, "src/b.rs");
        assert!(fresh.iter().all(|h| h.path != "src/a.rs"));
    }
}
