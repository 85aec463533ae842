//! Symbol extraction and lookup.
//!
//! Declarations are found with the per-language matcher tables. The
//! index is rebuilt from the stored chunks whenever the store changes
//! and is never patched in place.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::chunker::{Chunk, ChunkSource};
use crate::languages::{
    spec_for_path, LanguageFamily, LanguageSpec, SymbolKind, CALL_SITE, CONTROL_KEYWORDS,
};

/// A declaration found in a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    /// Owning file, workspace-relative
    pub path: String,
    /// Line (1-indexed)
    pub line: usize,
    pub exported: bool,
}

/// A line that calls a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    pub path: String,
    pub line: usize,
    pub text: String,
}

/// Extract symbols from chunk text whose first line is `first_line`.
pub fn extract_symbols(
    spec: &LanguageSpec,
    path: &str,
    text: &str,
    first_line: usize,
) -> Vec<Symbol> {
    match spec.family {
        LanguageFamily::Doc => Vec::new(),
        LanguageFamily::Plain => call_sites(path, text, first_line),
        LanguageFamily::Brace | LanguageFamily::Indent => {
            let mut out = Vec::new();
            for (offset, line) in text.lines().enumerate() {
                let Some((kind, name)) = spec.decls.iter().find_map(|d| {
                    d.pattern
                        .captures(line)
                        .and_then(|c| c.get(1))
                        .map(|m| (d.kind, m.as_str()))
                }) else {
                    continue;
                };
                if CONTROL_KEYWORDS.contains(&name) {
                    continue;
                }
                out.push(Symbol {
                    name: name.to_string(),
                    kind,
                    path: path.to_string(),
                    line: first_line + offset,
                    exported: spec.export.is_exported(line, name),
                });
            }
            out
        }
    }
}

/// Generic heuristic for unknown languages: a name followed by `(` at the
/// start of a line, first occurrence only.
fn call_sites(path: &str, text: &str, first_line: usize) -> Vec<Symbol> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (offset, line) in text.lines().enumerate() {
        let Some(name) = CALL_SITE.captures(line).and_then(|c| c.get(1)) else {
            continue;
        };
        let name = name.as_str();
        if CONTROL_KEYWORDS.contains(&name) || !seen.insert(name.to_string()) {
            continue;
        }
        out.push(Symbol {
            name: name.to_string(),
            kind: SymbolKind::Call,
            path: path.to_string(),
            line: first_line + offset,
            exported: true,
        });
    }
    out
}

/// Symbols indexed by name and by file.
#[derive(Debug, Clone, Default)]
pub struct SymbolIndex {
    by_name: BTreeMap<String, Vec<Symbol>>,
    by_file: BTreeMap<String, Vec<Symbol>>,
}

impl SymbolIndex {
    /// Build from the stored repository chunks.
    pub fn build(chunks: &[Chunk]) -> Self {
        let mut index = Self::default();
        let mut seen = HashSet::new();
        for chunk in chunks.iter().filter(|c| c.source == ChunkSource::Repo) {
            let spec = spec_for_path(Path::new(&chunk.path));
            for symbol in extract_symbols(spec, &chunk.path, &chunk.text, chunk.start_line) {
                if seen.insert((symbol.path.clone(), symbol.line, symbol.name.clone())) {
                    index.insert(symbol);
                }
            }
        }
        index
    }

    fn insert(&mut self, symbol: Symbol) {
        self.by_file
            .entry(symbol.path.clone())
            .or_default()
            .push(symbol.clone());
        self.by_name.entry(symbol.name.clone()).or_default().push(symbol);
    }

    /// Exact-name lookup, definitions before call-site guesses.
    pub fn find(&self, name: &str) -> Vec<Symbol> {
        let mut hits = self.by_name.get(name).cloned().unwrap_or_default();
        hits.sort_by(|a, b| {
            (a.kind == SymbolKind::Call)
                .cmp(&(b.kind == SymbolKind::Call))
                .then_with(|| a.path.cmp(&b.path))
                .then_with(|| a.line.cmp(&b.line))
        });
        hits
    }

    pub fn in_file(&self, path: &str) -> Vec<Symbol> {
        let mut hits = self.by_file.get(path).cloned().unwrap_or_default();
        hits.sort_by_key(|s| s.line);
        hits
    }

    pub fn all(&self) -> impl Iterator<Item = &Symbol> {
        self.by_file.values().flatten()
    }

    pub fn files(&self) -> impl Iterator<Item = &String> {
        self.by_file.keys()
    }

    pub fn len(&self) -> usize {
        self.by_file.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_file.is_empty()
    }

    /// Lines that call `name`, excluding its own declaration lines and
    /// comment lines.
    pub fn find_callers(&self, name: &str, chunks: &[Chunk]) -> Vec<CallSite> {
        let Ok(pattern) = Regex::new(&format!(r"\b{}\s*\(", regex::escape(name))) else {
            return Vec::new();
        };
        let declared: HashSet<(&str, usize)> = self
            .by_name
            .get(name)
            .map(|defs| {
                defs.iter()
                    .filter(|s| s.kind != SymbolKind::Call)
                    .map(|s| (s.path.as_str(), s.line))
                    .collect()
            })
            .unwrap_or_default();

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for chunk in chunks.iter().filter(|c| c.source == ChunkSource::Repo) {
            if !spec_for_path(Path::new(&chunk.path)).is_code() {
                continue;
            }
            for (offset, line) in chunk.text.lines().enumerate() {
                let number = chunk.start_line + offset;
                let trimmed = line.trim_start();
                if trimmed.starts_with("//") || trimmed.starts_with('*') || trimmed.starts_with('#') {
                    continue;
                }
                if !pattern.is_match(line) || declared.contains(&(chunk.path.as_str(), number)) {
                    continue;
                }
                if seen.insert((chunk.path.clone(), number)) {
                    out.push(CallSite {
                        path: chunk.path.clone(),
                        line: number,
                        text: trimmed.trim_end().to_string(),
                    });
                }
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.line.cmp(&b.line)));
        out
    }
}
