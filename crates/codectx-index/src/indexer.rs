//! Indexing orchestration.
//!
//! A pass moves through a fixed set of states: it is either `Fresh` (the
//! index is younger than the TTL and nothing runs) or it detects changes,
//! processes up to a budget of changed files right away, defers the rest and
//! persists the file map, statistics and pattern snapshot. Change detection
//! diffs against the last indexed git commit when possible and falls back to
//! comparing modification time and size against the file map, with a content
//! hash to confirm.
//!
//! Every entry point takes the same gate, so passes never interleave.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use codectx_config::Config;
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::chunker::{content_hash, hash_bytes, Chunk, ChunkSource, CodeChunker};
use crate::embeddings::{detect_content_type, ContentType, EmbedIntent, EmbeddingGateway};
use crate::graph_builder::GraphBuilder;
use crate::languages::{has_known_extension, is_indexable, spec_for_path};
use crate::manifest::{FileEntry, FileMap, StatStamp};
use crate::patterns::{PatternLearner, PatternSnapshot};
use crate::storage::{ChunkStore, IndexStats};
use crate::symbols::SymbolIndex;
use crate::walk::collect_files;

/// Code chunks handed to the style learner.
const STYLE_SAMPLE_CHUNKS: usize = 200;

const EMBED_ORDER: [ContentType; 5] = [
    ContentType::Code,
    ContentType::Docs,
    ContentType::Finance,
    ContentType::Legal,
    ContentType::General,
];

/// Indexer settings resolved for one workspace.
#[derive(Debug, Clone)]
pub struct IndexerSettings {
    pub root: PathBuf,
    pub store_dir: PathBuf,
    /// Index age after which a pass is due
    pub ttl: Duration,
    pub max_file_bytes: u64,
    pub max_store_bytes: u64,
    pub auto_cleanup: bool,
}

impl IndexerSettings {
    pub fn from_config(root: &Path, config: &Config) -> Self {
        Self {
            root: root.to_path_buf(),
            store_dir: config.store_path(root),
            ttl: Duration::from_secs(config.index.ttl_secs),
            max_file_bytes: config.index.max_file_bytes,
            max_store_bytes: config.index.max_store_mb.saturating_mul(1024 * 1024),
            auto_cleanup: config.index.auto_cleanup,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassState {
    Fresh,
    ChangeDetection,
    QuickPass,
    Deferred,
    Persisted,
}

/// How changed files were found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Detection {
    Git,
    Stat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassRequest {
    /// Files processed now; the rest are deferred. `None` means no limit.
    pub budget: Option<usize>,
    /// Run even when the index is younger than the TTL.
    pub force: bool,
}

impl PassRequest {
    pub fn bootstrap(budget: usize) -> Self {
        Self {
            budget: Some(budget),
            force: false,
        }
    }

    pub fn full(force: bool) -> Self {
        Self {
            budget: None,
            force,
        }
    }
}

/// What a pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    pub states: Vec<PassState>,
    pub detection: Option<Detection>,
    /// Files re-chunked and written
    pub processed: usize,
    /// Candidates whose content hash had not changed
    pub unchanged: usize,
    pub removed: usize,
    /// Files skipped because of read, decode or size errors
    pub failed: usize,
    /// Changed files left for background processing
    pub deferred: Vec<String>,
    pub chunks_written: usize,
    pub embedded: usize,
    pub cache_hits: usize,
    pub duration_ms: u64,
    #[serde(skip)]
    pub patterns: Option<PatternSnapshot>,
}

impl PassReport {
    /// Whether the stored index changed.
    pub fn changed(&self) -> bool {
        self.processed > 0 || self.removed > 0
    }
}

struct ChangeSet {
    candidates: Vec<String>,
    removed: Vec<String>,
    detection: Detection,
    head: Option<String>,
}

struct PreparedFile {
    path: String,
    stamp: StatStamp,
    hash: String,
    language: String,
    chunk_ids: Vec<String>,
    chunks: Vec<Chunk>,
}

enum Prepared {
    Unchanged(StatStamp),
    Changed(PreparedFile),
}

/// Provider and model that produced the latest vectors.
struct EmbeddingUse {
    provider: String,
    model: String,
    dimensions: usize,
}

pub struct Indexer {
    settings: IndexerSettings,
    store: Arc<ChunkStore>,
    gateway: Arc<EmbeddingGateway>,
    chunker: CodeChunker,
    learner: PatternLearner,
    gate: Mutex<()>,
}

impl Indexer {
    pub fn new(
        settings: IndexerSettings,
        store: Arc<ChunkStore>,
        gateway: Arc<EmbeddingGateway>,
        learner: PatternLearner,
    ) -> Self {
        Self {
            settings,
            store,
            gateway,
            chunker: CodeChunker::default(),
            learner,
            gate: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn settings(&self) -> &IndexerSettings {
        &self.settings
    }

    /// Whether the last update is older than the TTL.
    pub fn is_stale(&self) -> Result<bool> {
        let stats = self.store.load_stats()?;
        Ok(is_stale(&stats, self.settings.ttl))
    }

    /// Detect changes and index them, deferring anything over the budget.
    pub async fn run_pass(&self, request: PassRequest) -> Result<PassReport> {
        let _gate = self.gate.lock().await;
        let started = Instant::now();
        let mut report = PassReport::default();
        let mut stats = self.store.load_stats()?;
        let mut map = self.store.load_file_map()?;

        if !request.force && !map.is_empty() && !is_stale(&stats, self.settings.ttl) {
            report.states.push(PassState::Fresh);
            debug!("Index is fresh, skipping pass");
            return Ok(report);
        }

        report.states.push(PassState::ChangeDetection);
        let changes = self.detect_changes(&map, &stats).await;
        report.detection = Some(changes.detection);
        report.removed = self.purge(&mut map, &changes.removed)?;

        let mut now = changes.candidates;
        let later = match request.budget {
            Some(budget) if now.len() > budget => now.split_off(budget),
            _ => Vec::new(),
        };

        report.states.push(PassState::QuickPass);
        let embedding = self.index_files(&mut map, &now, &mut report).await?;

        if !later.is_empty() {
            report.states.push(PassState::Deferred);
            info!("Deferring {} files to background indexing", later.len());
            report.deferred = later;
        }

        let complete = report.deferred.is_empty();
        // Moving the commit forward with work outstanding would hide that
        // work from the next diff.
        if complete {
            if let Some(head) = changes.head {
                stats.last_commit = Some(head);
            }
        }
        self.persist(&mut stats, &map, embedding, &mut report, complete)?;
        report.states.push(PassState::Persisted);
        report.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            "Index pass: {} processed, {} unchanged, {} removed, {} failed, {} deferred ({} ms)",
            report.processed,
            report.unchanged,
            report.removed,
            report.failed,
            report.deferred.len(),
            report.duration_ms
        );
        Ok(report)
    }

    /// Reindex exactly these paths. Paths that no longer exist are removed.
    pub async fn reindex_paths(&self, paths: &[String]) -> Result<PassReport> {
        let _gate = self.gate.lock().await;
        let started = Instant::now();
        let mut report = PassReport::default();
        let mut stats = self.store.load_stats()?;
        let mut map = self.store.load_file_map()?;

        let (present, missing): (Vec<String>, Vec<String>) = paths
            .iter()
            .cloned()
            .partition(|p| self.settings.root.join(p).is_file());
        report.removed = self.purge(&mut map, &missing)?;
        let max_bytes = self.settings.max_file_bytes;
        let present: Vec<String> = present
            .into_iter()
            .filter(|p| is_candidate(&self.settings.root.join(p), max_bytes))
            .collect();

        report.states.push(PassState::QuickPass);
        let embedding = self.index_files(&mut map, &present, &mut report).await?;
        self.persist(&mut stats, &map, embedding, &mut report, false)?;
        report.states.push(PassState::Persisted);
        report.duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            "Targeted reindex of {} paths: {} processed, {} removed",
            paths.len(),
            report.processed,
            report.removed
        );
        Ok(report)
    }

    /// Drop paths from the store and the file map.
    pub async fn remove_paths(&self, paths: &[String]) -> Result<PassReport> {
        let _gate = self.gate.lock().await;
        let mut report = PassReport::default();
        let mut stats = self.store.load_stats()?;
        let mut map = self.store.load_file_map()?;
        report.removed = self.purge(&mut map, paths)?;
        self.persist(&mut stats, &map, None, &mut report, false)?;
        report.states.push(PassState::Persisted);
        Ok(report)
    }

    /// Store an externally fetched document as `web` or `knowledge` chunks,
    /// replacing earlier chunks under the same path.
    pub async fn ingest_document(
        &self,
        source: ChunkSource,
        path: &str,
        text: &str,
    ) -> Result<PassReport> {
        if source == ChunkSource::Repo {
            bail!("repository files are indexed from the tree, not ingested");
        }
        let _gate = self.gate.lock().await;
        let mut report = PassReport::default();
        let mut stats = self.store.load_stats()?;
        let map = self.store.load_file_map()?;

        let mut chunks = self
            .chunker
            .chunk_with_source(source, path, text, &content_hash(text));
        self.store.remove_paths(&HashSet::from([path.to_string()]))?;
        let embedding = self.embed_chunks(&mut chunks, &mut report).await;
        self.write_chunks(&chunks)?;
        report.chunks_written = chunks.len();
        report.processed = 1;

        self.persist(&mut stats, &map, embedding, &mut report, false)?;
        report.states.push(PassState::Persisted);
        info!("Ingested {} as {} chunks", path, chunks.len());
        Ok(report)
    }

    /// Delete the whole store.
    pub async fn reset(&self) -> Result<()> {
        let _gate = self.gate.lock().await;
        self.store.clear().context("failed to clear the chunk store")?;
        Ok(())
    }

    async fn detect_changes(&self, map: &FileMap, stats: &IndexStats) -> ChangeSet {
        let root = &self.settings.root;
        let max_bytes = self.settings.max_file_bytes;
        let walked = collect_files(root, &self.settings.store_dir, u64::MAX, |p| {
            is_candidate(p, max_bytes)
        });
        let present: HashSet<String> = walked.iter().cloned().collect();
        let removed = map.find_deleted_files(&present);
        let head = git_head(root).await.ok();

        if let (Some(head), Some(last)) = (&head, &stats.last_commit) {
            if !map.is_empty() {
                match git_changed_files(root, last).await {
                    Ok(changed) => {
                        let candidates: Vec<String> = walked
                            .into_iter()
                            .filter(|p| changed.contains(p) || map.get(p).is_none())
                            .collect();
                        debug!(
                            "git diff since {}: {} candidates, {} removed",
                            last,
                            candidates.len(),
                            removed.len()
                        );
                        return ChangeSet {
                            candidates,
                            removed,
                            detection: Detection::Git,
                            head: Some(head.clone()),
                        };
                    }
                    Err(e) => debug!("git change detection unavailable: {:#}", e),
                }
            }
        }

        let candidates: Vec<String> = walked
            .into_iter()
            .filter(|p| match std::fs::metadata(root.join(p)) {
                Ok(meta) => map.stat_changed(p, StatStamp::from_metadata(&meta)),
                Err(_) => true,
            })
            .collect();
        debug!(
            "stat comparison: {} candidates, {} removed",
            candidates.len(),
            removed.len()
        );
        ChangeSet {
            candidates,
            removed,
            detection: Detection::Stat,
            head,
        }
    }

    fn purge(&self, map: &mut FileMap, paths: &[String]) -> Result<usize> {
        if paths.is_empty() {
            return Ok(0);
        }
        let set: HashSet<String> = paths.iter().cloned().collect();
        self.store.remove_paths(&set)?;
        let mut removed = 0;
        let mut chunks = 0;
        for entry in paths.iter().filter_map(|p| map.remove_file(p)) {
            removed += 1;
            chunks += entry.chunk_ids.len();
        }
        debug!("Removed {} paths ({} chunks) from the index", removed, chunks);
        Ok(removed)
    }

    async fn index_files(
        &self,
        map: &mut FileMap,
        paths: &[String],
        report: &mut PassReport,
    ) -> Result<Option<EmbeddingUse>> {
        let mut prepared = Vec::new();
        for path in paths {
            match self.prepare_file(map, path) {
                Ok(Prepared::Unchanged(stamp)) => {
                    map.touch(path, stamp);
                    report.unchanged += 1;
                }
                Ok(Prepared::Changed(file)) => prepared.push(file),
                Err(e) => {
                    warn!(path = %path, "Skipping file: {:#}", e);
                    report.failed += 1;
                }
            }
        }
        if prepared.is_empty() {
            return Ok(None);
        }

        let superseded: HashSet<String> = prepared
            .iter()
            .filter(|f| map.get(&f.path).is_some())
            .map(|f| f.path.clone())
            .collect();
        self.store.remove_paths(&superseded)?;

        let mut chunks: Vec<Chunk> = prepared
            .iter_mut()
            .flat_map(|f| std::mem::take(&mut f.chunks))
            .collect();
        let embedding = self.embed_chunks(&mut chunks, report).await;
        self.write_chunks(&chunks)?;
        report.chunks_written += chunks.len();

        let indexed_at = Utc::now();
        for file in prepared {
            debug!(path = %file.path, chunks = file.chunk_ids.len(), "Indexed file");
            map.record_indexed(
                file.path,
                FileEntry {
                    mtime_ms: file.stamp.mtime_ms,
                    size: file.stamp.size,
                    content_hash: file.hash,
                    chunk_ids: file.chunk_ids,
                    language: file.language,
                    indexed_at,
                },
            );
            report.processed += 1;
        }
        Ok(embedding)
    }

    fn prepare_file(&self, map: &FileMap, path: &str) -> Result<Prepared> {
        let abs = self.settings.root.join(path);
        let meta = std::fs::metadata(&abs).with_context(|| format!("failed to stat {path}"))?;
        if meta.len() > self.settings.max_file_bytes {
            bail!(
                "{} bytes exceeds the {} byte limit",
                meta.len(),
                self.settings.max_file_bytes
            );
        }
        let stamp = StatStamp::from_metadata(&meta);
        let bytes = std::fs::read(&abs).with_context(|| format!("failed to read {path}"))?;
        let hash = hash_bytes(&bytes);
        if !map.needs_update(path, &hash) {
            return Ok(Prepared::Unchanged(stamp));
        }
        let text = String::from_utf8(bytes).with_context(|| format!("{path} is not valid UTF-8"))?;
        let chunks = self.chunker.chunk_file(path, &text, &hash);
        Ok(Prepared::Changed(PreparedFile {
            path: path.to_string(),
            stamp,
            hash,
            language: spec_for_path(Path::new(path)).name.to_string(),
            chunk_ids: chunks.iter().map(|c| c.id.clone()).collect(),
            chunks,
        }))
    }

    /// Fill in vectors for chunks that lack one: cache first, then the
    /// gateway in batches per content type. Chunks whose batch fails on
    /// every provider are kept without a vector.
    async fn embed_chunks(&self, chunks: &mut [Chunk], report: &mut PassReport) -> Option<EmbeddingUse> {
        let mut groups: HashMap<ContentType, Vec<usize>> = HashMap::new();
        for (i, chunk) in chunks.iter().enumerate() {
            if chunk.embedding.is_none() {
                groups.entry(chunk_content_type(chunk)).or_default().push(i);
            }
        }

        let mut used = None;
        for content_type in EMBED_ORDER {
            let Some(indices) = groups.remove(&content_type) else {
                continue;
            };
            let model = self.gateway.planned_model(content_type);
            let ids: HashSet<String> = indices.iter().map(|i| chunks[*i].id.clone()).collect();
            let cached = self.store.cache_lookup(&model, &ids).unwrap_or_else(|e| {
                warn!("Embedding cache unreadable for {}: {}", model, e);
                HashMap::new()
            });

            let mut missing: Vec<usize> = Vec::new();
            let mut missing_ids = HashSet::new();
            for &i in &indices {
                if let Some(vector) = cached.get(&chunks[i].id) {
                    chunks[i].embedding = Some(vector.clone());
                    report.cache_hits += 1;
                } else if missing_ids.insert(chunks[i].id.clone()) {
                    missing.push(i);
                }
            }
            if missing.is_empty() {
                continue;
            }

            let texts: Vec<String> = missing.iter().map(|i| chunks[*i].text.clone()).collect();
            match self
                .gateway
                .embed(&texts, content_type, EmbedIntent::Document)
                .await
            {
                Ok(batch) => {
                    let entries: Vec<(String, Vec<f32>)> = missing
                        .iter()
                        .map(|i| chunks[*i].id.clone())
                        .zip(batch.vectors)
                        .collect();
                    let by_id: HashMap<&str, &Vec<f32>> =
                        entries.iter().map(|(id, v)| (id.as_str(), v)).collect();
                    for &i in &indices {
                        if chunks[i].embedding.is_none() {
                            chunks[i].embedding = by_id.get(chunks[i].id.as_str()).map(|v| (*v).clone());
                        }
                    }
                    report.embedded += entries.len();
                    if let Err(e) = self.store.cache_insert(&batch.model, &entries) {
                        warn!("Failed to write embedding cache: {}", e);
                    }
                    used = Some(EmbeddingUse {
                        provider: batch.provider,
                        model: batch.model,
                        dimensions: batch.dimensions,
                    });
                }
                Err(e) => warn!(
                    "Embedding failed for {} {} chunks, storing them without vectors: {}",
                    texts.len(),
                    content_type.as_str(),
                    e
                ),
            }
        }
        used
    }

    fn write_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        self.store.append_chunks(chunks)?;
        let mut seen = HashSet::new();
        let vectors: Vec<(String, Vec<f32>)> = chunks
            .iter()
            .filter_map(|c| c.embedding.as_ref().map(|v| (c.id.clone(), v.clone())))
            .filter(|(id, _)| seen.insert(id.clone()))
            .collect();
        self.store.append_embeddings(&vectors)?;
        Ok(())
    }

    fn persist(
        &self,
        stats: &mut IndexStats,
        map: &FileMap,
        embedding: Option<EmbeddingUse>,
        report: &mut PassReport,
        complete: bool,
    ) -> Result<()> {
        let now = Utc::now();
        self.store.save_file_map(map)?;

        if let Some(used) = embedding {
            stats.embedding_provider = Some(used.provider);
            stats.embedding_model = Some(used.model);
            stats.dimensions = Some(used.dimensions);
        }
        let mut total = 0usize;
        let mut per_source: BTreeMap<String, usize> = BTreeMap::new();
        self.store.for_each_chunk(|chunk| {
            total += 1;
            *per_source.entry(chunk.source.as_str().to_string()).or_insert(0) += 1;
        })?;
        stats.total_chunks = total;
        stats.per_source = per_source;
        stats.total_embeddings = self.store.embedded_ids()?.len();
        stats.files_indexed = map.len();
        stats.last_update = Some(now);
        if complete {
            stats.last_full_index = Some(now);
        }

        if report.changed() && self.learner.is_enabled() {
            report.patterns = Some(self.refresh_patterns(map)?);
        }

        let budget = self
            .store
            .enforce_budget(self.settings.max_store_bytes, self.settings.auto_cleanup)?;
        stats.storage_bytes = budget.size_bytes;
        self.store.save_stats(stats)?;
        Ok(())
    }

    fn refresh_patterns(&self, map: &FileMap) -> Result<PatternSnapshot> {
        let chunks = self.store.load_chunks()?;
        let symbols = SymbolIndex::build(&chunks);
        let files: Vec<String> = map.files.keys().cloned().collect();
        let graph = GraphBuilder::new(&self.settings.root).build(&files);
        let sample: Vec<Chunk> = chunks
            .into_iter()
            .filter(|c| c.source == ChunkSource::Repo && spec_for_path(Path::new(&c.path)).is_code())
            .take(STYLE_SAMPLE_CHUNKS)
            .collect();
        let snapshot = self.learner.learn(&symbols, &graph, &files, &sample);
        self.store.save_patterns(&snapshot)?;
        Ok(snapshot)
    }
}

/// Files of a known language are always candidates, so an oversize one is
/// reported as failed. Other text files over the limit are skipped.
fn is_candidate(path: &Path, max_bytes: u64) -> bool {
    if has_known_extension(path) {
        return true;
    }
    is_indexable(path) && std::fs::metadata(path).is_ok_and(|m| m.len() <= max_bytes)
}

/// Code files embed as code; everything else by vocabulary.
fn chunk_content_type(chunk: &Chunk) -> ContentType {
    if chunk.source == ChunkSource::Repo && spec_for_path(Path::new(&chunk.path)).is_code() {
        ContentType::Code
    } else {
        detect_content_type(&chunk.text)
    }
}

pub(crate) fn is_stale(stats: &IndexStats, ttl: Duration) -> bool {
    match stats.last_update {
        None => true,
        Some(at) => age(at).is_some_and(|a| a >= ttl),
    }
}

fn age(at: DateTime<Utc>) -> Option<Duration> {
    (Utc::now() - at).to_std().ok()
}

async fn git(root: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(args)
        .output()
        .await
        .context("failed to run git")?;

    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    String::from_utf8(output.stdout).context("invalid utf-8 in git output")
}

/// Current `HEAD` commit of the repository containing `root`.
pub async fn git_head(root: &Path) -> Result<String> {
    Ok(git(root, &["rev-parse", "HEAD"]).await?.trim().to_string())
}

/// Paths changed since `since` (committed or not) plus untracked files,
/// relative to `root`.
async fn git_changed_files(root: &Path, since: &str) -> Result<HashSet<String>> {
    if since.is_empty() || !since.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("not a commit id: {since}");
    }
    let mut out = HashSet::new();
    let diff = git(root, &["diff", "--name-only", "--relative", since, "--"]).await?;
    out.extend(diff.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string));
    let untracked = git(root, &["ls-files", "--others", "--exclude-standard"]).await?;
    out.extend(untracked.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{EmbeddingError, EmbeddingProvider};
    use async_trait::async_trait;
    use codectx_config::PatternsConfig;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    struct Counting {
        texts: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        fn model_name(&self) -> &str {
            "counting-v1"
        }
        fn dimensions(&self) -> usize {
            2
        }
        fn content_types(&self) -> &[ContentType] {
            &[ContentType::Code]
        }
        async fn embed_batch(
            &self,
            texts: &[String],
            _intent: EmbedIntent,
        ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn settings(root: &Path) -> IndexerSettings {
        IndexerSettings {
            root: root.to_path_buf(),
            store_dir: root.join(".codectx"),
            ttl: Duration::from_secs(300),
            max_file_bytes: 1024 * 1024,
            max_store_bytes: 512 * 1024 * 1024,
            auto_cleanup: true,
        }
    }

    fn indexer_with(dir: &TempDir, gateway: EmbeddingGateway) -> Indexer {
        let settings = settings(dir.path());
        let store = Arc::new(ChunkStore::open(&settings.store_dir, false).unwrap());
        Indexer::new(
            settings,
            store,
            Arc::new(gateway),
            PatternLearner::new(&PatternsConfig::default()),
        )
    }

    fn indexer(dir: &TempDir) -> Indexer {
        indexer_with(dir, EmbeddingGateway::local_only(32))
    }

    fn write(dir: &TempDir, rel: &str, text: &str) {
        let path = dir.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    }

    fn paths_in_store(indexer: &Indexer) -> HashSet<String> {
        indexer
            .store()
            .load_chunks()
            .unwrap()
            .into_iter()
            .map(|c| c.path)
            .collect()
    }

    #[tokio::test]
    async fn test_first_pass_then_fresh() {
        let dir = tempdir().unwrap();
        write(&dir, "src/a.rs", "pub fn alpha() -> u8 {\n    1\n}\n");
        write(&dir, "README.md", "# Title\n\nSome words about alpha.\n");
        let indexer = indexer(&dir);

        let report = indexer.run_pass(PassRequest::full(false)).await.unwrap();
        assert_eq!(
            report.states,
            vec![PassState::ChangeDetection, PassState::QuickPass, PassState::Persisted]
        );
        assert_eq!(report.processed, 2);
        assert!(report.embedded > 0);

        let stats = indexer.store().load_stats().unwrap();
        assert_eq!(stats.files_indexed, 2);
        assert_eq!(stats.embedding_model.as_deref(), Some("local-hash-32"));
        assert!(stats.last_full_index.is_some());
        assert_eq!(stats.total_embeddings, stats.total_chunks);

        let again = indexer.run_pass(PassRequest::full(false)).await.unwrap();
        assert_eq!(again.states, vec![PassState::Fresh]);
        assert!(indexer.store().load_patterns().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_budget_defers_overflow() {
        let dir = tempdir().unwrap();
        for name in ["a", "b", "c"] {
            write(&dir, &format!("{name}.py"), &format!("def {name}():\n    return 1\n"));
        }
        let indexer = indexer(&dir);
        let report = indexer.run_pass(PassRequest::bootstrap(1)).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.deferred, vec!["b.py".to_string(), "c.py".to_string()]);
        assert!(report.states.contains(&PassState::Deferred));
        assert!(indexer.store().load_stats().unwrap().last_full_index.is_none());

        let report = indexer.reindex_paths(&report.deferred).await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(indexer.store().load_file_map().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_modification_and_deletion() {
        let dir = tempdir().unwrap();
        write(&dir, "a.go", "package a\n\nfunc A() {}\n");
        write(&dir, "b.go", "package a\n\nfunc B() {}\n");
        let indexer = indexer(&dir);
        indexer.run_pass(PassRequest::full(false)).await.unwrap();
        let b_before: Vec<Chunk> = indexer
            .store()
            .load_chunks()
            .unwrap()
            .into_iter()
            .filter(|c| c.path == "b.go")
            .collect();

        write(&dir, "a.go", "package a\n\nfunc A() {}\n\nfunc A2() int { return 2 }\n");
        let report = indexer.run_pass(PassRequest::full(true)).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.detection, Some(Detection::Stat));

        let chunks = indexer.store().load_chunks().unwrap();
        assert!(chunks.iter().any(|c| c.text.contains("A2")));
        let b_after: Vec<Chunk> = chunks.into_iter().filter(|c| c.path == "b.go").collect();
        assert_eq!(b_before, b_after);

        fs::remove_file(dir.path().join("a.go")).unwrap();
        let report = indexer.run_pass(PassRequest::full(true)).await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(paths_in_store(&indexer), HashSet::from(["b.go".to_string()]));
    }

    #[tokio::test]
    async fn test_bad_file_is_counted_not_fatal() {
        let dir = tempdir().unwrap();
        write(&dir, "good.rs", "fn good() {}\n");
        fs::write(dir.path().join("bad.rs"), [0xff, 0xfe, 0x00, 0x41]).unwrap();
        let indexer = indexer(&dir);
        let report = indexer.run_pass(PassRequest::full(false)).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.processed, 1);
        assert_eq!(paths_in_store(&indexer), HashSet::from(["good.rs".to_string()]));
    }

    #[tokio::test]
    async fn test_unknown_text_files_index_as_plain() {
        let dir = tempdir().unwrap();
        write(&dir, "scripts/deploy.tpl", "render_site(1)\npublish_site(2)\n");
        fs::write(dir.path().join("blob.dat2"), [0x00, 0x01, 0x02, 0x03]).unwrap();
        write(&dir, "dump.txt2", &"x".repeat(2 * 1024 * 1024));
        let indexer = indexer(&dir);

        let report = indexer.run_pass(PassRequest::full(false)).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(paths_in_store(&indexer), HashSet::from(["scripts/deploy.tpl".to_string()]));
        let map = indexer.store().load_file_map().unwrap();
        assert_eq!(map.get("scripts/deploy.tpl").unwrap().language, "plain");
    }

    #[tokio::test]
    async fn test_identical_text_reuses_cached_embedding() {
        let dir = tempdir().unwrap();
        let body = "pub fn shared() -> u32 {\n    42\n}\n";
        write(&dir, "one.rs", body);
        let counting = Arc::new(Counting {
            texts: AtomicUsize::new(0),
        });
        let gateway = EmbeddingGateway::new(vec![counting.clone() as Arc<dyn EmbeddingProvider>], 16, 1, 8);
        let indexer = indexer_with(&dir, gateway);
        indexer.run_pass(PassRequest::full(false)).await.unwrap();
        let first = counting.texts.load(Ordering::SeqCst);
        assert!(first > 0);

        write(&dir, "two.rs", body);
        let report = indexer.reindex_paths(&["two.rs".to_string()]).await.unwrap();
        assert_eq!(counting.texts.load(Ordering::SeqCst), first);
        assert_eq!(report.embedded, 0);
        assert!(report.cache_hits > 0);

        let chunks = indexer.store().load_chunks().unwrap();
        let ids: Vec<&String> = chunks.iter().map(|c| &c.id).collect();
        assert_eq!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn test_ingest_document() {
        let dir = tempdir().unwrap();
        let indexer = indexer(&dir);
        indexer
            .ingest_document(ChunkSource::Web, "https://example.com/guide", "Install with cargo.\n\nThen run it.")
            .await
            .unwrap();
        let stats = indexer.store().load_stats().unwrap();
        assert_eq!(stats.per_source.get("web"), Some(&1));
        assert!(indexer
            .ingest_document(ChunkSource::Repo, "x.rs", "fn x() {}")
            .await
            .is_err());
    }

    #[test]
    fn test_staleness() {
        let mut stats = IndexStats::default();
        assert!(is_stale(&stats, Duration::from_secs(60)));
        stats.last_update = Some(Utc::now());
        assert!(!is_stale(&stats, Duration::from_secs(60)));
        stats.last_update = Some(Utc::now() - chrono::Duration::seconds(120));
        assert!(is_stale(&stats, Duration::from_secs(60)));
    }
}
