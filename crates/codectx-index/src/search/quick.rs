//! Lexical quick scan over a bounded file sample.
//!
//! Needs no index or embeddings, so it can answer while the first pass is
//! still running.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use super::{query_terms, sort_hits, term_set, SearchHit};
use crate::chunker::{content_hash, ChunkSource};
use crate::languages::is_indexable;
use crate::walk::collect_files;

/// Bytes read from the head of each sampled file.
pub const SAMPLE_BYTES: usize = 64 * 1024;
/// Sample age after which it is rebuilt.
pub const SAMPLE_TTL: Duration = Duration::from_secs(60);
/// Lines kept on each side of the best line.
const CONTEXT_LINES: usize = 2;

struct Sample {
    taken_at: Instant,
    files: Vec<(String, String)>,
}

pub struct QuickScanner {
    root: PathBuf,
    store_dir: PathBuf,
    max_files: usize,
    ttl: Duration,
    sample: Mutex<Option<Sample>>,
}

impl QuickScanner {
    pub fn new(root: &Path, store_dir: &Path, max_files: usize) -> Self {
        Self {
            root: root.to_path_buf(),
            store_dir: store_dir.to_path_buf(),
            max_files,
            ttl: SAMPLE_TTL,
            sample: Mutex::new(None),
        }
    }

    #[cfg(test)]
    fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Drop the sample so the next scan re-reads the tree.
    pub fn invalidate(&self) {
        if let Ok(mut guard) = self.sample.lock() {
            *guard = None;
        }
    }

    /// Rank sampled files by the fraction of query terms they contain.
    pub fn scan(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        let terms: Vec<String> = term_set(query).into_iter().collect();
        if terms.is_empty() || limit == 0 {
            return Vec::new();
        }

        let mut guard = match self.sample.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let stale = guard
            .as_ref()
            .map_or(true, |s| s.taken_at.elapsed() >= self.ttl);
        if stale {
            *guard = Some(self.take_sample());
        }
        let Some(sample) = guard.as_ref() else {
            return Vec::new();
        };

        let mut hits: Vec<SearchHit> = sample
            .files
            .iter()
            .filter_map(|(path, text)| score_file(path, text, &terms))
            .collect();
        sort_hits(&mut hits);
        hits.truncate(limit);
        hits
    }

    fn take_sample(&self) -> Sample {
        let mut paths = collect_files(&self.root, &self.store_dir, u64::MAX, is_indexable);
        paths.truncate(self.max_files);
        let files: Vec<(String, String)> = paths
            .into_iter()
            .filter_map(|rel| read_head(&self.root.join(&rel)).map(|text| (rel, text)))
            .collect();
        debug!("Quick-scan sample refreshed: {} files", files.len());
        Sample {
            taken_at: Instant::now(),
            files,
        }
    }
}

fn read_head(path: &Path) -> Option<String> {
    let mut buf = Vec::with_capacity(SAMPLE_BYTES);
    File::open(path)
        .ok()?
        .take(SAMPLE_BYTES as u64)
        .read_to_end(&mut buf)
        .ok()?;
    Some(String::from_utf8_lossy(&buf).into_owned())
}

fn score_file(path: &str, text: &str, terms: &[String]) -> Option<SearchHit> {
    let mut present = term_set(text);
    present.extend(term_set(path));
    let matched = terms.iter().filter(|t| present.contains(*t)).count();
    if matched == 0 {
        return None;
    }

    let lines: Vec<&str> = text.lines().collect();
    let (best, _) = lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            let line_terms = query_terms(line);
            (i, terms.iter().filter(|t| line_terms.contains(t)).count())
        })
        .fold((0usize, 0usize), |acc, cur| if cur.1 > acc.1 { cur } else { acc });
    let start = best.saturating_sub(CONTEXT_LINES);
    let end = (best + CONTEXT_LINES + 1).min(lines.len());
    let snippet = lines.get(start..end).unwrap_or_default().join("\n");

    Some(SearchHit {
        id: content_hash(&snippet),
        source: ChunkSource::Repo,
        path: path.to_string(),
        title: Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(path)
            .to_string(),
        snippet,
        score: matched as f32 / terms.len() as f32,
        start_line: start + 1,
        end_line: end.max(start + 1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_scan_ranks_by_overlap_with_context() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(
            root.join("src/auth.rs"),
            "use x;\n\n// helpers\nfn a() {}\nfn verify_token(token: &str) -> bool {\n    true\n}\n\nfn b() {}\n",
        )
        .unwrap();
        fs::write(root.join("src/other.rs"), "fn token() {}\n").unwrap();
        fs::write(root.join("src/none.rs"), "fn nothing() {}\n").unwrap();

        let scanner = QuickScanner::new(root, &root.join(".codectx"), 400);
        let hits = scanner.scan("verify token", 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].path, "src/auth.rs");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert_eq!(hits[0].start_line, 3);
        assert_eq!(hits[0].end_line, 7);
        assert!(hits[0].snippet.contains("verify_token"));
        assert_eq!(hits[1].path, "src/other.rs");
    }

    #[test]
    fn test_sample_refresh() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("a.py"), "def alpha():\n    pass\n").unwrap();

        let scanner = QuickScanner::new(root, &root.join(".codectx"), 10);
        assert!(scanner.scan("beta", 5).is_empty());
        fs::write(root.join("b.py"), "def beta():\n    pass\n").unwrap();
        // Still the old sample.
        assert!(scanner.scan("beta", 5).is_empty());

        let scanner = scanner.with_ttl(Duration::ZERO);
        assert_eq!(scanner.scan("beta", 5).len(), 1);
    }
}
