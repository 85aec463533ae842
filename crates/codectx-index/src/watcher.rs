//! File watcher feeding the background queue.
//!
//! Raw notifications are filtered to indexable workspace files, then
//! debounced per path. Deletions skip the debounce. A created or modified
//! file is only forwarded when its modification time or size differs from
//! the last forwarded state, which drops editor save storms and touch-only
//! events.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::languages::{has_binary_extension, is_indexable};
use crate::manifest::StatStamp;
use crate::queue::WorkItem;
use crate::walk::{is_excluded, relative_path};

const TICK: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Failed to create watcher: {0}")]
    CreateError(String),

    #[error("Failed to watch path: {0}")]
    WatchError(String),
}

/// A filtered notification for one workspace-relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawChange {
    Changed(String),
    Removed(String),
}

/// Per-path debounce state.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    /// Path to the instant of its latest event
    pending: HashMap<String, Instant>,
    /// Last forwarded stat per path
    seen: HashMap<String, StatStamp>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: HashMap::new(),
            seen: HashMap::new(),
        }
    }

    /// Record a change. Returns the path when it must be removed right away.
    pub fn observe(&mut self, change: RawChange, now: Instant) -> Option<String> {
        match change {
            RawChange::Changed(path) => {
                self.pending.insert(path, now);
                None
            }
            RawChange::Removed(path) => {
                self.pending.remove(&path);
                self.seen.remove(&path);
                Some(path)
            }
        }
    }

    /// Paths quiet for the debounce delay whose stat moved since they were
    /// last forwarded. `stat` returns `None` for files that vanished.
    pub fn due(&mut self, now: Instant, stat: impl Fn(&str) -> Option<StatStamp>) -> Vec<String> {
        let delay = self.delay;
        let mut ready: Vec<String> = Vec::new();
        self.pending.retain(|path, last| {
            if now.duration_since(*last) >= delay {
                ready.push(path.clone());
                false
            } else {
                true
            }
        });
        ready.sort();

        ready
            .into_iter()
            .filter(|path| match stat(path) {
                Some(stamp) => self.seen.insert(path.clone(), stamp) != Some(stamp),
                None => false,
            })
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Watches a workspace and emits work items.
pub struct FileWatcher {
    root: PathBuf,
    store_rel: PathBuf,
    debounce: Duration,
    // Dropping the notify watcher stops event delivery.
    watcher: Option<RecommendedWatcher>,
}

impl FileWatcher {
    pub fn new(root: PathBuf, store_dir: &Path, debounce: Duration) -> Self {
        let store_rel = store_dir
            .strip_prefix(&root)
            .unwrap_or(store_dir)
            .to_path_buf();
        Self {
            root,
            store_rel,
            debounce,
            watcher: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    /// Start watching. Removals arrive as `WorkItem::Remove` immediately,
    /// settled changes as one `WorkItem::Paths` per tick.
    pub fn start(&mut self) -> Result<mpsc::Receiver<WorkItem>, WatcherError> {
        let (raw_tx, mut raw_rx) = mpsc::channel::<RawChange>(256);
        let (work_tx, work_rx) = mpsc::channel::<WorkItem>(64);
        let root = self.root.clone();
        let store_rel = self.store_rel.clone();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                for change in convert_event(event, &root, &store_rel) {
                    // Best effort send
                    let _ = raw_tx.blocking_send(change);
                }
            }
        })
        .map_err(|e| WatcherError::CreateError(e.to_string()))?;

        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| WatcherError::WatchError(e.to_string()))?;
        self.watcher = Some(watcher);

        let root = self.root.clone();
        let mut debouncer = Debouncer::new(self.debounce);
        tokio::spawn(async move {
            loop {
                match tokio::time::timeout(TICK, raw_rx.recv()).await {
                    Ok(Some(change)) => {
                        if let Some(removed) = debouncer.observe(change, Instant::now()) {
                            debug!(path = %removed, "File removed");
                            if work_tx.send(WorkItem::Remove(vec![removed])).await.is_err() {
                                return;
                            }
                        }
                    }
                    // The notify watcher was dropped.
                    Ok(None) => break,
                    Err(_) => {}
                }

                let ready = debouncer.due(Instant::now(), |p| {
                    std::fs::metadata(root.join(p))
                        .ok()
                        .map(|m| StatStamp::from_metadata(&m))
                });
                if !ready.is_empty() {
                    debug!("Forwarding {} changed files", ready.len());
                    if work_tx.send(WorkItem::Paths(ready)).await.is_err() {
                        return;
                    }
                }
            }
        });

        info!("Started watching {:?} with {:?} debounce", self.root, self.debounce);
        Ok(work_rx)
    }

    pub fn stop(&mut self) {
        if self.watcher.take().is_some() {
            info!("Stopped watching {:?}", self.root);
        }
    }
}

fn convert_event(event: Event, root: &Path, store_rel: &Path) -> Vec<RawChange> {
    let mut out = Vec::new();
    for path in event.paths {
        let Some(rel) = relative_path(root, &path) else {
            continue;
        };
        if is_excluded(Path::new(&rel), store_rel) || has_binary_extension(&path) {
            continue;
        }
        let change = match event.kind {
            EventKind::Remove(_) => RawChange::Removed(rel),
            // Renames report both ends as modifications.
            EventKind::Create(_) | EventKind::Modify(_) if !path.exists() => RawChange::Removed(rel),
            EventKind::Create(_) | EventKind::Modify(_) if is_indexable(&path) => RawChange::Changed(rel),
            _ => continue,
        };
        out.push(change);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};
    use tempfile::tempdir;

    fn stamp(size: u64) -> StatStamp {
        StatStamp { mtime_ms: 1_000, size }
    }

    #[test]
    fn test_burst_of_events_yields_one_reindex() {
        let mut debouncer = Debouncer::new(Duration::from_millis(300));
        let t0 = Instant::now();
        for i in 0..5 {
            let at = t0 + Duration::from_millis(i * 50);
            assert!(debouncer
                .observe(RawChange::Changed("src/a.rs".into()), at)
                .is_none());
        }

        let quiet = t0 + Duration::from_millis(400);
        assert!(debouncer.due(quiet, |_| Some(stamp(10))).is_empty());
        assert_eq!(debouncer.pending_len(), 1);

        let settled = t0 + Duration::from_millis(500);
        assert_eq!(
            debouncer.due(settled, |_| Some(stamp(10))),
            vec!["src/a.rs".to_string()]
        );
        assert!(debouncer.due(settled + Duration::from_secs(1), |_| Some(stamp(10))).is_empty());
    }

    #[test]
    fn test_unchanged_stat_is_not_forwarded() {
        let mut debouncer = Debouncer::new(Duration::ZERO);
        let now = Instant::now();
        debouncer.observe(RawChange::Changed("a.py".into()), now);
        assert_eq!(debouncer.due(now, |_| Some(stamp(1))).len(), 1);

        debouncer.observe(RawChange::Changed("a.py".into()), now);
        assert!(debouncer.due(now, |_| Some(stamp(1))).is_empty());

        debouncer.observe(RawChange::Changed("a.py".into()), now);
        assert_eq!(debouncer.due(now, |_| Some(stamp(2))).len(), 1);
    }

    #[test]
    fn test_delete_bypasses_debounce_and_forgets_stat() {
        let mut debouncer = Debouncer::new(Duration::from_secs(10));
        let now = Instant::now();
        debouncer.observe(RawChange::Changed("a.go".into()), now);
        assert_eq!(
            debouncer.observe(RawChange::Removed("a.go".into()), now),
            Some("a.go".to_string())
        );
        assert_eq!(debouncer.pending_len(), 0);

        // Recreated with the old stat: still forwarded.
        let mut debouncer = Debouncer::new(Duration::ZERO);
        debouncer.observe(RawChange::Changed("a.go".into()), now);
        debouncer.due(now, |_| Some(stamp(5)));
        debouncer.observe(RawChange::Removed("a.go".into()), now);
        debouncer.observe(RawChange::Changed("a.go".into()), now);
        assert_eq!(debouncer.due(now, |_| Some(stamp(5))).len(), 1);
    }

    #[test]
    fn test_vanished_file_is_dropped() {
        let mut debouncer = Debouncer::new(Duration::ZERO);
        let now = Instant::now();
        debouncer.observe(RawChange::Changed("gone.rs".into()), now);
        assert!(debouncer.due(now, |_| None).is_empty());
    }

    #[test]
    fn test_convert_event_filters_paths() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("main.rs"), "fn main() {}").unwrap();
        std::fs::write(root.join("image.png"), [0u8; 4]).unwrap();
        std::fs::write(root.join("build.xyz"), "run_build(2)\n").unwrap();
        std::fs::write(root.join("core.dump"), [1u8, 0, 2, 0]).unwrap();
        std::fs::create_dir_all(root.join("node_modules/x")).unwrap();
        std::fs::write(root.join("node_modules/x/index.js"), "").unwrap();

        let event = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(root.join("main.rs"))
            .add_path(root.join("image.png"))
            .add_path(root.join("build.xyz"))
            .add_path(root.join("core.dump"))
            .add_path(root.join("node_modules/x/index.js"))
            .add_path(root.join(".codectx/chunks.jsonl"));
        let changes = convert_event(event, root, Path::new(".codectx"));
        assert_eq!(
            changes,
            vec![
                RawChange::Changed("main.rs".into()),
                RawChange::Changed("build.xyz".into())
            ]
        );

        let event = Event::new(EventKind::Create(CreateKind::File)).add_path(root.join("missing.rs"));
        assert_eq!(
            convert_event(event, root, Path::new(".codectx")),
            vec![RawChange::Removed("missing.rs".into())]
        );

        let event = Event::new(EventKind::Remove(RemoveKind::File)).add_path(root.join("main.rs"));
        assert_eq!(
            convert_event(event, root, Path::new(".codectx")),
            vec![RawChange::Removed("main.rs".into())]
        );
    }

    #[tokio::test]
    async fn test_start_stop() {
        let dir = tempdir().unwrap();
        let store = dir.path().join(".codectx");
        let mut watcher = FileWatcher::new(dir.path().to_path_buf(), &store, Duration::from_millis(50));
        let _rx = watcher.start().unwrap();
        assert!(watcher.is_running());
        watcher.stop();
        assert!(!watcher.is_running());
    }
}
