//! Workspace file discovery.

use std::path::{Component, Path};

use ignore::WalkBuilder;

/// Directories never indexed or watched.
pub const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "target",
    "dist",
    "build",
    "vendor",
    "__pycache__",
    ".venv",
    "venv",
    ".next",
    ".idea",
    ".codectx",
];

/// Whether any component of a workspace-relative path is excluded.
pub fn is_excluded(rel: &Path, store_dir: &Path) -> bool {
    if rel.starts_with(store_dir) {
        return true;
    }
    rel.components().any(|c| match c {
        Component::Normal(name) => name.to_str().is_some_and(|n| EXCLUDED_DIRS.contains(&n)),
        _ => false,
    })
}

/// Workspace-relative, `/` separated form of a path under `root`.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = rel
        .components()
        .map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Walk the tree honouring `.gitignore`, returning sorted relative paths of
/// files that pass `keep` and are at most `max_bytes` long.
pub fn collect_files(
    root: &Path,
    store_dir: &Path,
    max_bytes: u64,
    keep: impl Fn(&Path) -> bool,
) -> Vec<String> {
    let store_rel = store_dir.strip_prefix(root).unwrap_or(store_dir).to_path_buf();
    let walker = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .git_global(true)
        .require_git(false)
        .filter_entry(|entry| {
            entry
                .file_name()
                .to_str()
                .map_or(true, |n| !EXCLUDED_DIRS.contains(&n))
        })
        .build();

    let mut files = Vec::new();
    for entry in walker.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !entry.file_type().is_some_and(|t| t.is_file()) || !keep(path) {
            continue;
        }
        let Some(rel) = relative_path(root, path) else {
            continue;
        };
        if is_excluded(Path::new(&rel), &store_rel) {
            continue;
        }
        if entry.metadata().map(|m| m.len() > max_bytes).unwrap_or(true) {
            continue;
        }
        files.push(rel);
    }
    files.sort();
    files
}
