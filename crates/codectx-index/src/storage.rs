//! Persistence layer for chunks, embeddings and index metadata.
//!
//! Layout under the store directory:
//! - `chunks.jsonl` - one chunk record per line, append-only
//! - `embeddings.jsonl` - chunk id to vector, append-only
//! - `embedding_cache/<model>.jsonl` - content hash to vector, per model
//! - `stats.json`, `file_map.json`, `patterns.json` - whole-file documents
//!
//! Appends write whole lines and rewrites go through a temp file and a
//! rename, so concurrent readers only ever see complete records. A line
//! that fails to parse is skipped, not fatal.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::chunker::{Chunk, ChunkMetadata, ChunkSource};
use crate::manifest::FileMap;
use crate::patterns::PatternSnapshot;

pub const CHUNKS_FILE: &str = "chunks.jsonl";
pub const EMBEDDINGS_FILE: &str = "embeddings.jsonl";
pub const CACHE_DIR: &str = "embedding_cache";
pub const STATS_FILE: &str = "stats.json";
pub const FILE_MAP_FILE: &str = "file_map.json";
pub const PATTERNS_FILE: &str = "patterns.json";

/// Errors from the chunk store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persisted index statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexStats {
    pub total_chunks: usize,
    pub total_embeddings: usize,
    /// Chunk count per source kind
    pub per_source: BTreeMap<String, usize>,
    pub embedding_model: Option<String>,
    pub embedding_provider: Option<String>,
    pub dimensions: Option<usize>,
    pub last_full_index: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub storage_bytes: u64,
    /// Version-control head at the last pass
    pub last_commit: Option<String>,
    pub files_indexed: usize,
}

/// On-disk shape of a chunk line.
#[derive(Debug, Serialize, Deserialize)]
struct ChunkLine {
    id: String,
    source: ChunkSource,
    path: String,
    title: String,
    file_hash: String,
    start_line: usize,
    end_line: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    /// Gzip then base64 of the text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text_gz: Option<String>,
    #[serde(default)]
    metadata: ChunkMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
struct EmbeddingLine {
    id: String,
    vector: Vec<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheLine {
    hash: String,
    vector: Vec<f32>,
}

/// Result of removing paths from the logs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoveOutcome {
    pub chunks_removed: usize,
    pub embeddings_removed: usize,
}

/// Result of a disk budget check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BudgetOutcome {
    pub size_bytes: u64,
    pub over_budget: bool,
    pub pruned_bytes: u64,
}

/// Append-mostly JSONL store for one workspace.
pub struct ChunkStore {
    dir: PathBuf,
    compress: bool,
    write_lock: Mutex<()>,
}

impl ChunkStore {
    /// Open (creating if needed) a store directory.
    pub fn open(dir: impl AsRef<Path>, compress: bool) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join(CACHE_DIR))?;
        debug!("Opened chunk store at {:?} (compress: {})", dir, compress);
        Ok(Self {
            dir,
            compress,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append chunk records.
    pub fn append_chunks(&self, chunks: &[Chunk]) -> StoreResult<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for chunk in chunks {
            let line = self.encode_chunk(chunk)?;
            serde_json::to_writer(&mut buf, &line)?;
            buf.push(b'\n');
        }
        let _guard = self.guard();
        append_bytes(&self.dir.join(CHUNKS_FILE), &buf)
    }

    /// Append chunk id to vector records.
    pub fn append_embeddings(&self, entries: &[(String, Vec<f32>)]) -> StoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for (id, vector) in entries {
            serde_json::to_writer(
                &mut buf,
                &EmbeddingLine {
                    id: id.clone(),
                    vector: vector.clone(),
                },
            )?;
            buf.push(b'\n');
        }
        let _guard = self.guard();
        append_bytes(&self.dir.join(EMBEDDINGS_FILE), &buf)
    }

    /// Stream every readable chunk. Returns the number of skipped lines.
    pub fn for_each_chunk(&self, mut f: impl FnMut(Chunk)) -> StoreResult<usize> {
        let mut skipped = 0;
        let mut undecodable = 0;
        for_each_line::<ChunkLine>(&self.dir.join(CHUNKS_FILE), &mut skipped, |line| {
            match self.decode_chunk(line) {
                Ok(chunk) => f(chunk),
                Err(e) => {
                    warn!("Skipping undecodable chunk record: {}", e);
                    undecodable += 1;
                }
            }
        })?;
        Ok(skipped + undecodable)
    }

    pub fn load_chunks(&self) -> StoreResult<Vec<Chunk>> {
        let mut out = Vec::new();
        self.for_each_chunk(|c| out.push(c))?;
        Ok(out)
    }

    /// Chunk id to vector; later lines win.
    pub fn load_embeddings(&self) -> StoreResult<HashMap<String, Vec<f32>>> {
        let mut out = HashMap::new();
        let mut skipped = 0;
        for_each_line::<EmbeddingLine>(&self.dir.join(EMBEDDINGS_FILE), &mut skipped, |line| {
            out.insert(line.id, line.vector);
        })?;
        Ok(out)
    }

    /// Distinct chunk ids that have a stored vector.
    pub fn embedded_ids(&self) -> StoreResult<HashSet<String>> {
        let mut out = HashSet::new();
        let mut skipped = 0;
        for_each_line::<EmbeddingLine>(&self.dir.join(EMBEDDINGS_FILE), &mut skipped, |line| {
            out.insert(line.id);
        })?;
        Ok(out)
    }

    /// Chunks with their embeddings attached.
    pub fn load_chunks_with_embeddings(&self) -> StoreResult<Vec<Chunk>> {
        let mut embeddings = self.load_embeddings()?;
        let mut chunks = self.load_chunks()?;
        for chunk in &mut chunks {
            chunk.embedding = embeddings.get(&chunk.id).cloned();
        }
        embeddings.clear();
        Ok(chunks)
    }

    /// Drop every record belonging to the given paths. Embeddings go only
    /// when no remaining chunk shares their id.
    pub fn remove_paths(&self, paths: &HashSet<String>) -> StoreResult<RemoveOutcome> {
        if paths.is_empty() {
            return Ok(RemoveOutcome::default());
        }
        let _guard = self.guard();
        let mut outcome = RemoveOutcome::default();
        let mut live_ids = HashSet::new();

        let chunks_path = self.dir.join(CHUNKS_FILE);
        let mut kept = Vec::new();
        let mut skipped = 0;
        for_each_raw_line::<ChunkLine>(&chunks_path, &mut skipped, |raw, line| {
            if paths.contains(&line.path) {
                outcome.chunks_removed += 1;
            } else {
                live_ids.insert(line.id);
                kept.extend_from_slice(raw.as_bytes());
                kept.push(b'\n');
            }
        })?;
        rewrite(&chunks_path, &kept)?;

        let embeddings_path = self.dir.join(EMBEDDINGS_FILE);
        let mut kept = Vec::new();
        for_each_raw_line::<EmbeddingLine>(&embeddings_path, &mut skipped, |raw, line| {
            if live_ids.contains(&line.id) {
                kept.extend_from_slice(raw.as_bytes());
                kept.push(b'\n');
            } else {
                outcome.embeddings_removed += 1;
            }
        })?;
        rewrite(&embeddings_path, &kept)?;

        debug!(
            "Removed {} chunks and {} embeddings for {} paths",
            outcome.chunks_removed,
            outcome.embeddings_removed,
            paths.len()
        );
        Ok(outcome)
    }

    /// Look up cached vectors by content hash for one model.
    pub fn cache_lookup(
        &self,
        model: &str,
        hashes: &HashSet<String>,
    ) -> StoreResult<HashMap<String, Vec<f32>>> {
        let mut out = HashMap::new();
        if hashes.is_empty() {
            return Ok(out);
        }
        let mut skipped = 0;
        for_each_line::<CacheLine>(&self.cache_file(model), &mut skipped, |line| {
            if hashes.contains(&line.hash) {
                out.insert(line.hash, line.vector);
            }
        })?;
        Ok(out)
    }

    pub fn cache_insert(&self, model: &str, entries: &[(String, Vec<f32>)]) -> StoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for (hash, vector) in entries {
            serde_json::to_writer(
                &mut buf,
                &CacheLine {
                    hash: hash.clone(),
                    vector: vector.clone(),
                },
            )?;
            buf.push(b'\n');
        }
        let _guard = self.guard();
        append_bytes(&self.cache_file(model), &buf)
    }

    fn cache_file(&self, model: &str) -> PathBuf {
        let safe: String = model
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(CACHE_DIR).join(format!("{safe}.jsonl"))
    }

    pub fn load_stats(&self) -> StoreResult<IndexStats> {
        Ok(self.load_json(STATS_FILE)?.unwrap_or_default())
    }

    pub fn save_stats(&self, stats: &IndexStats) -> StoreResult<()> {
        self.save_json(STATS_FILE, stats)
    }

    /// Load the file map; a corrupt map is treated as empty so the next
    /// pass rebuilds it.
    pub fn load_file_map(&self) -> StoreResult<FileMap> {
        match self.load_json::<FileMap>(FILE_MAP_FILE) {
            Ok(map) => Ok(map.unwrap_or_else(FileMap::new)),
            Err(StoreError::Serialize(e)) => {
                warn!("File map unreadable, starting fresh: {}", e);
                Ok(FileMap::new())
            }
            Err(e) => Err(e),
        }
    }

    pub fn save_file_map(&self, map: &FileMap) -> StoreResult<()> {
        self.save_json(FILE_MAP_FILE, map)
    }

    pub fn load_patterns(&self) -> StoreResult<Option<PatternSnapshot>> {
        self.load_json(PATTERNS_FILE)
    }

    pub fn save_patterns(&self, snapshot: &PatternSnapshot) -> StoreResult<()> {
        self.save_json(PATTERNS_FILE, snapshot)
    }

    fn load_json<T: DeserializeOwned>(&self, name: &str) -> StoreResult<Option<T>> {
        let path = self.dir.join(name);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save_json<T: Serialize>(&self, name: &str, value: &T) -> StoreResult<()> {
        let content = serde_json::to_vec_pretty(value)?;
        let _guard = self.guard();
        rewrite(&self.dir.join(name), &content)
    }

    /// Total bytes under the store directory.
    pub fn size_bytes(&self) -> StoreResult<u64> {
        dir_size(&self.dir)
    }

    /// Keep the store under `max_bytes`. With auto-cleanup the embedding
    /// cache is pruned largest file first; the primary logs are never
    /// touched. Without it, only a warning is logged.
    pub fn enforce_budget(&self, max_bytes: u64, auto_cleanup: bool) -> StoreResult<BudgetOutcome> {
        let size = self.size_bytes()?;
        let mut outcome = BudgetOutcome {
            size_bytes: size,
            over_budget: size > max_bytes,
            pruned_bytes: 0,
        };
        if !outcome.over_budget {
            return Ok(outcome);
        }
        if !auto_cleanup {
            warn!(
                "Store at {:?} is {} bytes, over the {} byte budget (auto-cleanup disabled)",
                self.dir, size, max_bytes
            );
            return Ok(outcome);
        }

        let _guard = self.guard();
        let mut cache_files: Vec<(PathBuf, u64)> = fs::read_dir(self.dir.join(CACHE_DIR))?
            .filter_map(|e| e.ok())
            .filter_map(|e| Some((e.path(), e.metadata().ok()?.len())))
            .collect();
        cache_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut current = size;
        for (path, len) in cache_files {
            if current <= max_bytes {
                break;
            }
            fs::remove_file(&path)?;
            current = current.saturating_sub(len);
            outcome.pruned_bytes += len;
            info!("Pruned embedding cache {:?} ({} bytes)", path, len);
        }
        outcome.size_bytes = current;
        outcome.over_budget = current > max_bytes;
        if outcome.over_budget {
            warn!("Store still over budget after pruning the embedding cache");
        }
        Ok(outcome)
    }

    /// Delete everything in the store.
    pub fn clear(&self) -> StoreResult<()> {
        let _guard = self.guard();
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        fs::create_dir_all(self.dir.join(CACHE_DIR))?;
        info!("Cleared chunk store at {:?}", self.dir);
        Ok(())
    }

    fn encode_chunk(&self, chunk: &Chunk) -> StoreResult<ChunkLine> {
        let (text, text_gz) = if self.compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(chunk.text.as_bytes())?;
            (None, Some(BASE64.encode(encoder.finish()?)))
        } else {
            (Some(chunk.text.clone()), None)
        };
        Ok(ChunkLine {
            id: chunk.id.clone(),
            source: chunk.source,
            path: chunk.path.clone(),
            title: chunk.title.clone(),
            file_hash: chunk.file_hash.clone(),
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            text,
            text_gz,
            metadata: chunk.metadata.clone(),
        })
    }

    fn decode_chunk(&self, line: ChunkLine) -> StoreResult<Chunk> {
        let text = match (line.text, line.text_gz) {
            (Some(text), _) => text,
            (None, Some(encoded)) => {
                let bytes = BASE64
                    .decode(encoded)
                    .map_err(|e| StoreError::Corrupt(format!("{}: bad base64: {e}", line.id)))?;
                let mut text = String::new();
                GzDecoder::new(bytes.as_slice())
                    .read_to_string(&mut text)
                    .map_err(|e| StoreError::Corrupt(format!("{}: bad gzip: {e}", line.id)))?;
                text
            }
            (None, None) => return Err(StoreError::Corrupt(format!("{}: no text", line.id))),
        };
        Ok(Chunk {
            id: line.id,
            source: line.source,
            path: line.path,
            title: line.title,
            file_hash: line.file_hash,
            start_line: line.start_line,
            end_line: line.end_line,
            text,
            metadata: line.metadata,
            embedding: None,
        })
    }
}

fn append_bytes(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(bytes)?;
    Ok(())
}

fn rewrite(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn for_each_line<T: DeserializeOwned>(
    path: &Path,
    skipped: &mut usize,
    mut f: impl FnMut(T),
) -> StoreResult<()> {
    for_each_raw_line(path, skipped, |_, v| f(v))
}

fn for_each_raw_line<T: DeserializeOwned>(
    path: &Path,
    skipped: &mut usize,
    mut f: impl FnMut(&str, T),
) -> StoreResult<()> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("Unreadable line {} in {:?}: {}", number + 1, path, e);
                *skipped += 1;
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(value) => f(&line, value),
            Err(e) => {
                warn!("Skipping malformed line {} in {:?}: {}", number + 1, path, e);
                *skipped += 1;
            }
        }
    }
    Ok(())
}

fn dir_size(dir: &Path) -> StoreResult<u64> {
    let mut total = 0;
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}
