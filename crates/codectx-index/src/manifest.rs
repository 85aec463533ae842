//! File map for tracking indexed files and their state.
//!
//! The file map records, per workspace-relative path, the version of the
//! file that was last indexed and which chunks it produced. Change
//! detection compares against it; removals report the chunk ids they drop.

use std::collections::{BTreeMap, HashSet};
use std::fs::Metadata;
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Map of indexed files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileMap {
    /// Version of the file map format
    pub version: u32,

    /// When the map was last changed
    pub last_updated: Option<DateTime<Utc>>,

    /// Relative path (`/` separated) to entry
    pub files: BTreeMap<String, FileEntry>,
}

/// State of an indexed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Modification time in milliseconds since the Unix epoch
    pub mtime_ms: u64,

    /// Size in bytes
    pub size: u64,

    /// SHA-256 hex of the file content
    pub content_hash: String,

    /// Ids of the chunks this file was split into
    pub chunk_ids: Vec<String>,

    /// Language tag from the chunker
    pub language: String,

    /// When the file was last indexed
    pub indexed_at: DateTime<Utc>,
}

/// Cheap stat fingerprint used before hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatStamp {
    pub mtime_ms: u64,
    pub size: u64,
}

impl StatStamp {
    pub fn from_metadata(meta: &Metadata) -> Self {
        let mtime_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            mtime_ms,
            size: meta.len(),
        }
    }
}

impl FileMap {
    /// Create a new empty map.
    pub fn new() -> Self {
        Self {
            version: 1,
            last_updated: None,
            files: BTreeMap::new(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.files.get(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Whether the stat fingerprint differs from the recorded one.
    pub fn stat_changed(&self, path: &str, stamp: StatStamp) -> bool {
        match self.files.get(path) {
            Some(entry) => entry.mtime_ms != stamp.mtime_ms || entry.size != stamp.size,
            None => true,
        }
    }

    /// Check if a file needs re-indexing.
    pub fn needs_update(&self, path: &str, current_hash: &str) -> bool {
        match self.files.get(path) {
            Some(entry) => entry.content_hash != current_hash,
            None => true,
        }
    }

    /// Record that a file was indexed.
    pub fn record_indexed(&mut self, path: String, entry: FileEntry) {
        self.files.insert(path, entry);
        self.last_updated = Some(Utc::now());
    }

    /// Refresh the stat fingerprint of an entry whose content is unchanged.
    pub fn touch(&mut self, path: &str, stamp: StatStamp) {
        if let Some(entry) = self.files.get_mut(path) {
            entry.mtime_ms = stamp.mtime_ms;
            entry.size = stamp.size;
        }
    }

    /// Remove a file from the map.
    pub fn remove_file(&mut self, path: &str) -> Option<FileEntry> {
        let removed = self.files.remove(path);
        if removed.is_some() {
            self.last_updated = Some(Utc::now());
        }
        removed
    }

    /// Paths in the map that are not in the given set.
    pub fn find_deleted_files(&self, current_files: &HashSet<String>) -> Vec<String> {
        self.files
            .keys()
            .filter(|p| !current_files.contains(*p))
            .cloned()
            .collect()
    }
}
