//! Heuristic code chunking.
//!
//! Files are split into windows that follow declaration boundaries rather
//! than arbitrary line counts. Brace languages track nesting depth;
//! indentation languages use blank lines and indent level; prose is split
//! by paragraph. The output is a pure function of the input text.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::languages::{spec_for_path, LanguageFamily, LanguageSpec};
use crate::symbols::extract_symbols;

/// Where a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkSource {
    Repo,
    Web,
    Knowledge,
}

impl ChunkSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Repo => "repo",
            Self::Web => "web",
            Self::Knowledge => "knowledge",
        }
    }
}

/// Metadata associated with a chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Names declared in this chunk
    #[serde(default)]
    pub symbols: Vec<String>,

    /// Language tag
    #[serde(default)]
    pub language: String,

    #[serde(default)]
    pub line_count: usize,
}

/// A chunk of text extracted from a file or an ingested document.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// SHA-256 hex of `text`
    pub id: String,
    pub source: ChunkSource,
    /// Workspace-relative path, `/` separated
    pub path: String,
    pub title: String,
    /// SHA-256 hex of the owning file version
    pub file_hash: String,
    /// Start line (1-indexed)
    pub start_line: usize,
    /// End line (1-indexed, inclusive)
    pub end_line: usize,
    pub text: String,
    pub metadata: ChunkMetadata,
    /// Attached from the embedding log when loaded for search.
    pub embedding: Option<Vec<f32>>,
}

/// Chunk size limits, in lines unless noted.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// A declaration may start a new chunk once the buffer holds this many lines.
    pub min_lines: usize,
    /// Past this, a chunk closes at the next natural boundary.
    pub soft_ceiling: usize,
    /// A chunk never grows past this.
    pub hard_ceiling: usize,
    /// Character budget for prose chunks.
    pub doc_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_lines: 8,
            soft_ceiling: 60,
            hard_ceiling: 120,
            doc_chars: 1500,
        }
    }
}

/// Lines that start a top-level block without being a symbol declaration.
const BOUNDARY_PREFIXES: &[&str] = &["impl ", "impl<", "describe(", "test(", "it("];

/// Heuristic chunker.
#[derive(Debug, Clone, Default)]
pub struct CodeChunker {
    config: ChunkerConfig,
}

impl CodeChunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    /// Split one file's text into repository chunks.
    pub fn chunk_file(&self, path: &str, text: &str, file_hash: &str) -> Vec<Chunk> {
        self.chunk_with_source(ChunkSource::Repo, path, text, file_hash)
    }

    /// Split text that belongs to a given source kind.
    pub fn chunk_with_source(
        &self,
        source: ChunkSource,
        path: &str,
        text: &str,
        file_hash: &str,
    ) -> Vec<Chunk> {
        let spec = spec_for_path(Path::new(path));
        let lines: Vec<&str> = text.lines().collect();
        let ranges = match spec.family {
            LanguageFamily::Brace => self.brace_ranges(spec, &lines),
            LanguageFamily::Indent => self.indent_ranges(spec, &lines),
            LanguageFamily::Doc => self.doc_ranges(&lines),
            LanguageFamily::Plain => self.window_ranges(&lines),
        };

        let file_name = path.rsplit('/').next().unwrap_or(path);
        let mut chunks = Vec::new();
        for piece in ranges {
            let Some((start, end)) = trim_blank(&lines, piece.start, piece.end) else {
                continue;
            };
            let text = match &piece.text {
                Some(t) => t.clone(),
                None => lines[start..=end].join("\n"),
            };
            if text.trim().is_empty() {
                continue;
            }
            let symbols = extract_symbols(spec, path, &text, start + 1);
            let mut names: Vec<String> = Vec::new();
            for s in &symbols {
                if !names.contains(&s.name) {
                    names.push(s.name.clone());
                }
            }
            let title = names
                .first()
                .cloned()
                .unwrap_or_else(|| file_name.to_string());
            chunks.push(Chunk {
                id: content_hash(&text),
                source,
                path: path.to_string(),
                title,
                file_hash: file_hash.to_string(),
                start_line: start + 1,
                end_line: end + 1,
                metadata: ChunkMetadata {
                    symbols: names,
                    language: spec.name.to_string(),
                    line_count: end - start + 1,
                },
                text,
                embedding: None,
            });
        }
        chunks
    }

    fn brace_ranges(&self, spec: &LanguageSpec, lines: &[&str]) -> Vec<Piece> {
        let mut out = Vec::new();
        let mut start = 0usize;
        let mut depth: i32 = 0;

        for (i, line) in lines.iter().enumerate() {
            if depth <= 0 && i - start >= self.config.min_lines && starts_block(spec, line) {
                let split = back_over_preamble(lines, start, i);
                out.push(Piece::lines(start, split - 1));
                start = split;
                depth = 0;
            }

            depth += brace_delta(line);
            let len = i + 1 - start;
            let hard = len >= self.config.hard_ceiling;
            if hard || (depth <= 0 && len >= self.config.soft_ceiling && line.contains('}')) {
                out.push(Piece::lines(start, i));
                start = i + 1;
                // A hard cut lands mid-block; the tail still has to close.
                depth = if hard { depth.max(0) } else { 0 };
            }
        }
        if start < lines.len() {
            out.push(Piece::lines(start, lines.len() - 1));
        }
        out
    }

    fn indent_ranges(&self, spec: &LanguageSpec, lines: &[&str]) -> Vec<Piece> {
        let mut out = Vec::new();
        let mut start = 0usize;

        for (i, line) in lines.iter().enumerate() {
            let len = i - start;
            let top_level = !line.trim().is_empty() && indent_of(line) == 0;
            let after_blank = i > 0 && lines[i - 1].trim().is_empty();

            let decl_split = top_level && len >= self.config.min_lines && starts_block(spec, line);
            let soft_split = top_level && after_blank && len >= self.config.soft_ceiling;
            if decl_split || soft_split {
                let split = back_over_preamble(lines, start, i);
                if split > start {
                    out.push(Piece::lines(start, split - 1));
                    start = split;
                }
            }
            if i + 1 - start >= self.config.hard_ceiling {
                out.push(Piece::lines(start, i));
                start = i + 1;
            }
        }
        if start < lines.len() {
            out.push(Piece::lines(start, lines.len() - 1));
        }
        out
    }

    fn doc_ranges(&self, lines: &[&str]) -> Vec<Piece> {
        let budget = self.config.doc_chars.max(1);
        let mut paragraphs: Vec<(usize, usize)> = Vec::new();
        let mut para_start: Option<usize> = None;
        for (i, line) in lines.iter().enumerate() {
            match (line.trim().is_empty(), para_start) {
                (true, Some(s)) => {
                    paragraphs.push((s, i - 1));
                    para_start = None;
                }
                (false, None) => para_start = Some(i),
                _ => {}
            }
        }
        if let Some(s) = para_start {
            paragraphs.push((s, lines.len() - 1));
        }

        let mut out = Vec::new();
        let mut current: Option<(usize, usize, usize)> = None;
        for (s, e) in paragraphs {
            let chars: usize = lines[s..=e].iter().map(|l| l.chars().count() + 1).sum();
            if chars > budget {
                if let Some((cs, ce, _)) = current.take() {
                    out.push(Piece::lines(cs, ce));
                }
                let joined = lines[s..=e].join("\n");
                for window in char_windows(&joined, budget) {
                    out.push(Piece {
                        start: s,
                        end: e,
                        text: Some(window),
                    });
                }
                continue;
            }
            current = match current {
                Some((cs, _, cc)) if cc + chars <= budget => Some((cs, e, cc + chars)),
                Some((cs, ce, _)) => {
                    out.push(Piece::lines(cs, ce));
                    Some((s, e, chars))
                }
                None => Some((s, e, chars)),
            };
        }
        if let Some((cs, ce, _)) = current {
            out.push(Piece::lines(cs, ce));
        }
        out
    }

    fn window_ranges(&self, lines: &[&str]) -> Vec<Piece> {
        let size = self.config.soft_ceiling.max(1);
        (0..lines.len())
            .step_by(size)
            .map(|s| Piece::lines(s, (s + size).min(lines.len()) - 1))
            .collect()
    }
}

/// A line range, with explicit text when a paragraph was windowed.
struct Piece {
    start: usize,
    end: usize,
    text: Option<String>,
}

impl Piece {
    fn lines(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            text: None,
        }
    }
}

/// Compute the SHA-256 hex digest of some text.
pub fn content_hash(text: &str) -> String {
    hash_bytes(text.as_bytes())
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn starts_block(spec: &LanguageSpec, line: &str) -> bool {
    if line.starts_with(char::is_whitespace) {
        return false;
    }
    BOUNDARY_PREFIXES.iter().any(|p| line.starts_with(p))
        || spec.decls.iter().any(|d| d.pattern.is_match(line))
}

/// Move a split point up over doc comments, attributes and decorators so
/// they stay with the declaration they describe.
fn back_over_preamble(lines: &[&str], floor: usize, mut split: usize) -> usize {
    while split > floor + 1 {
        let prev = lines[split - 1].trim_start();
        let preamble = prev.starts_with("///")
            || prev.starts_with("//")
            || prev.starts_with("#[")
            || prev.starts_with('@')
            || prev.starts_with("/*")
            || prev.starts_with("* ")
            || prev.starts_with("*/")
            || prev.starts_with("# ");
        if !preamble {
            break;
        }
        split -= 1;
    }
    split
}

/// Net brace depth change of a line, ignoring string literals and line comments.
fn brace_delta(line: &str) -> i32 {
    let mut delta = 0;
    let mut quote: Option<char> = None;
    let mut prev = '\0';
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == q && prev != '\\' {
                    quote = None;
                }
            }
            None => match c {
                '"' | '`' => quote = Some(c),
                '/' if chars.peek() == Some(&'/') => break,
                '{' => delta += 1,
                '}' => delta -= 1,
                _ => {}
            },
        }
        prev = if prev == '\\' && c == '\\' { '\0' } else { c };
    }
    delta
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn trim_blank(lines: &[&str], mut start: usize, mut end: usize) -> Option<(usize, usize)> {
    if lines.is_empty() || start > end {
        return None;
    }
    while start <= end && lines[start].trim().is_empty() {
        start += 1;
    }
    while end > start && lines[end].trim().is_empty() {
        end -= 1;
    }
    if start > end || lines[start].trim().is_empty() {
        return None;
    }
    Some((start, end))
}

/// Split text into windows of at most `budget` characters on char boundaries.
fn char_windows(text: &str, budget: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(budget)
        .map(|w| w.iter().collect::<String>())
        .filter(|w| !w.trim().is_empty())
        .collect()
}
