//! Filesystem observation for watch mode: a recursive `notify` watcher
//! fanned out over a broadcast channel, plus the debouncer that coalesces
//! event bursts into single rebuilds.

mod debouncer;

use camino::{Utf8Path, Utf8PathBuf};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub use debouncer::Debouncer;

/// Path segments that never trigger rebuilds.
const IGNORED_SEGMENTS: &[&str] = &["node_modules", ".git", "dist", ".next", ".neex"];

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("filewatching backend error: {0}")]
    Notify(#[from] notify::Error),
}

/// Watches a set of directory roots recursively and broadcasts the paths
/// of filesystem events. Receivers that fall behind miss events, which is
/// acceptable here: watch mode only needs "something under X changed".
pub struct FileSystemWatcher {
    // kept alive for the lifetime of the watch; dropping it closes the
    // OS handles
    _watcher: RecommendedWatcher,
    sender: broadcast::Sender<Utf8PathBuf>,
}

impl FileSystemWatcher {
    pub fn new(roots: &[Utf8PathBuf]) -> Result<Self, WatchError> {
        let (sender, _) = broadcast::channel(1024);
        let event_sender = sender.clone();
        let mut watcher =
            notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
                match result {
                    Ok(event) => {
                        for path in event.paths {
                            let Ok(path) = Utf8PathBuf::from_path_buf(path) else {
                                continue;
                            };
                            if is_ignored(&path) {
                                continue;
                            }
                            // no receivers yet is fine
                            event_sender.send(path).ok();
                        }
                    }
                    Err(e) => warn!("filewatch backend error: {e}"),
                }
            })?;
        for root in roots {
            watcher.watch(root.as_std_path(), RecursiveMode::Recursive)?;
            debug!("watching {root}");
        }
        Ok(Self {
            _watcher: watcher,
            sender,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Utf8PathBuf> {
        self.sender.subscribe()
    }
}

/// Whether a path falls in a tree that never retriggers builds.
pub fn is_ignored(path: &Utf8Path) -> bool {
    path.components()
        .any(|component| IGNORED_SEGMENTS.contains(&component.as_str()))
}
