//! Import graph construction.
//!
//! Scans each file with its language's import patterns and resolves the
//! specifiers against the workspace: relative paths with extension and
//! directory-index variants, dotted module paths, `go.mod` prefixes and
//! Rust module paths. Anything left unresolved becomes an external edge.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::graph::{ImportEdge, ImportGraph};
use crate::languages::{spec_for_path, ImportStyle, LanguageSpec};

/// Resolves imports for one workspace root.
pub struct GraphBuilder {
    root: PathBuf,
    go_module: Option<String>,
}

impl GraphBuilder {
    pub fn new(root: &Path) -> Self {
        let go_module = fs::read_to_string(root.join("go.mod")).ok().and_then(|text| {
            text.lines()
                .find_map(|l| l.trim().strip_prefix("module ").map(|m| m.trim().to_string()))
        });
        Self {
            root: root.to_path_buf(),
            go_module,
        }
    }

    /// Build the graph for the given workspace-relative files.
    pub fn build<'a>(&self, files: impl IntoIterator<Item = &'a String>) -> ImportGraph {
        let mut edges = Vec::new();
        let mut scanned = 0usize;
        for file in files {
            let spec = spec_for_path(Path::new(file));
            if spec.imports.is_empty() {
                continue;
            }
            let Ok(text) = fs::read_to_string(self.root.join(file)) else {
                debug!("Skipping unreadable file for import scan: {}", file);
                continue;
            };
            scanned += 1;
            edges.extend(self.file_edges(file, spec, &text));
        }
        let graph = ImportGraph::from_edges(edges);
        debug!(
            "Built import graph from {} files: {} edges",
            scanned,
            graph.edge_count()
        );
        graph
    }

    /// Edges for one file's text.
    pub fn file_edges(&self, file: &str, spec: &LanguageSpec, text: &str) -> Vec<ImportEdge> {
        let mut out = Vec::new();
        for specifier in scan_imports(spec, text) {
            let targets = self.resolve(file, spec, &specifier);
            if targets.is_empty() {
                out.push(ImportEdge {
                    from: file.to_string(),
                    to: specifier,
                    external: true,
                });
            } else {
                for to in targets {
                    if to != file {
                        out.push(ImportEdge {
                            from: file.to_string(),
                            to,
                            external: false,
                        });
                    }
                }
            }
        }
        out
    }

    fn resolve(&self, file: &str, spec: &LanguageSpec, specifier: &str) -> Vec<String> {
        let dir = parent_dir(file);
        let first = |candidates: Vec<String>| -> Vec<String> {
            candidates
                .into_iter()
                .find(|c| self.is_file(c))
                .into_iter()
                .collect()
        };
        match spec.import_style {
            ImportStyle::Script => {
                if !specifier.starts_with('.') && !specifier.starts_with('/') {
                    return Vec::new();
                }
                let Some(base) = normalize(&join(dir, specifier.trim_start_matches('/'))) else {
                    return Vec::new();
                };
                first(with_variants(&base, spec.resolve_extensions, &["index"]))
            }
            ImportStyle::Ruby => {
                let Some(base) = normalize(&join(dir, specifier)) else {
                    return Vec::new();
                };
                first(with_variants(&base, spec.resolve_extensions, &[]))
            }
            ImportStyle::Python => first(self.python_candidates(dir, specifier)),
            ImportStyle::Include => {
                let mut candidates = Vec::new();
                if let Some(p) = normalize(&join(dir, specifier)) {
                    candidates.push(p);
                }
                candidates.push(specifier.to_string());
                candidates.push(format!("include/{specifier}"));
                first(candidates)
            }
            ImportStyle::Package => {
                let rel = specifier.replace('.', "/");
                let mut candidates = Vec::new();
                for prefix in ["", "src/main/java/", "src/main/kotlin/", "src/"] {
                    for ext in spec.resolve_extensions {
                        candidates.push(format!("{prefix}{rel}.{ext}"));
                    }
                }
                first(candidates)
            }
            ImportStyle::Go => self.go_package_files(specifier),
            ImportStyle::Rust => first(self.rust_candidates(file, specifier)),
            ImportStyle::None => Vec::new(),
        }
    }

    fn python_candidates(&self, dir: &str, specifier: &str) -> Vec<String> {
        let dots = specifier.chars().take_while(|c| *c == '.').count();
        let rest = specifier[dots..].replace('.', "/");
        let bases: Vec<String> = if dots == 0 {
            vec![rest.clone(), format!("src/{rest}")]
        } else {
            let mut base = dir.to_string();
            for _ in 1..dots {
                base = parent_dir(&base).to_string();
            }
            vec![if rest.is_empty() { base } else { join(&base, &rest) }]
        };
        let mut candidates = Vec::new();
        for base in bases {
            if rest.is_empty() {
                candidates.push(join(&base, "__init__.py"));
            } else {
                candidates.push(format!("{base}.py"));
                candidates.push(join(&base, "__init__.py"));
            }
        }
        candidates
    }

    fn go_package_files(&self, specifier: &str) -> Vec<String> {
        let Some(module) = &self.go_module else {
            return Vec::new();
        };
        let Some(rel) = specifier.strip_prefix(module.as_str()) else {
            return Vec::new();
        };
        let rel = rel.trim_start_matches('/');
        let Ok(entries) = fs::read_dir(self.root.join(rel)) else {
            return Vec::new();
        };
        let mut files: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|n| n.ends_with(".go") && !n.ends_with("_test.go"))
            .map(|n| join(rel, &n))
            .collect();
        files.sort();
        files
    }

    fn rust_candidates(&self, file: &str, specifier: &str) -> Vec<String> {
        let dir = parent_dir(file);
        let stem = Path::new(file)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        // Directory that holds this file's child modules.
        let module_dir = if matches!(stem, "mod" | "lib" | "main") {
            dir.to_string()
        } else {
            join(dir, stem)
        };

        if !specifier.contains("::") {
            // `mod x;`
            return vec![
                join(&module_dir, &format!("{specifier}.rs")),
                join(&module_dir, &format!("{specifier}/mod.rs")),
            ];
        }

        let mut parts: Vec<&str> = specifier.split("::").collect();
        let base = match parts.first().copied() {
            Some("crate") => crate_src_dir(file),
            Some("self") => module_dir,
            Some("super") => {
                let mut base = parent_dir(&module_dir).to_string();
                while parts.get(1) == Some(&"super") {
                    parts.remove(1);
                    base = parent_dir(&base).to_string();
                }
                base
            }
            _ => return Vec::new(),
        };
        let segments = &parts[1..];
        let mut candidates = Vec::new();
        for n in (1..=segments.len()).rev() {
            let rel = segments[..n].join("/");
            candidates.push(join(&base, &format!("{rel}.rs")));
            candidates.push(join(&base, &format!("{rel}/mod.rs")));
        }
        candidates
    }

    fn is_file(&self, rel: &str) -> bool {
        self.root.join(rel).is_file()
    }
}

/// Import specifiers in source order, without duplicates.
pub fn scan_imports(spec: &LanguageSpec, text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    let mut in_go_block = false;
    for line in text.lines() {
        let trimmed = line.trim();
        let patterns: &[regex::Regex] = if spec.import_style == ImportStyle::Go {
            // Block lines only count inside `import ( ... )`.
            if trimmed.starts_with("import (") || trimmed == "import(" {
                in_go_block = true;
                continue;
            }
            if in_go_block && trimmed.starts_with(')') {
                in_go_block = false;
                continue;
            }
            if in_go_block {
                &spec.imports[1..]
            } else {
                &spec.imports[..1]
            }
        } else {
            &spec.imports
        };
        for pattern in patterns {
            for caps in pattern.captures_iter(line) {
                if let Some(m) = caps.get(1) {
                    let s = m.as_str().to_string();
                    // `use crate::x` also matches the bare-crate pattern.
                    if spec.import_style == ImportStyle::Rust
                        && matches!(s.as_str(), "crate" | "self" | "super")
                    {
                        continue;
                    }
                    if !s.is_empty() && seen.insert(s.clone()) {
                        out.push(s);
                    }
                }
            }
        }
    }
    out
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}

fn join(dir: &str, rest: &str) -> String {
    if dir.is_empty() {
        rest.to_string()
    } else {
        format!("{dir}/{rest}")
    }
}

/// Lexically resolve `.` and `..`. Escaping the root yields `None`.
fn normalize(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            p => parts.push(p),
        }
    }
    Some(parts.join("/"))
}

/// The path itself, then with each extension, then `<path>/<index>.<ext>`.
fn with_variants(base: &str, exts: &[&str], index_names: &[&str]) -> Vec<String> {
    let mut out = vec![base.to_string()];
    for ext in exts {
        out.push(format!("{base}.{ext}"));
    }
    for index in index_names {
        for ext in exts {
            out.push(join(base, &format!("{index}.{ext}")));
        }
    }
    out
}

/// Nearest enclosing `src` directory, or the root.
fn crate_src_dir(file: &str) -> String {
    let mut dir = parent_dir(file);
    loop {
        if dir == "src" || dir.ends_with("/src") {
            return dir.to_string();
        }
        if dir.is_empty() {
            return String::new();
        }
        dir = parent_dir(dir);
    }
}
