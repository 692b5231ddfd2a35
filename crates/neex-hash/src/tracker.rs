use std::{collections::HashMap, sync::Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Error;

/// Bump when the on-disk shape changes; old state is discarded, not migrated.
const STATE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    files: HashMap<Utf8PathBuf, FileRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub mtime_ms: u64,
    pub size: u64,
    pub hash: u64,
}

/// Persistent `(mtime, size) -> hash` cache shared across runs. Loaded
/// lazily on first lookup, mutated in memory, and written back once at the
/// end of a run when dirty.
pub struct IncrementalTracker {
    path: Utf8PathBuf,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    files: Option<HashMap<Utf8PathBuf, FileRecord>>,
    dirty: bool,
}

impl IncrementalTracker {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(State::default()),
        }
    }

    /// A file is unchanged only when both mtime and size match the recorded
    /// pair; matching mtime with a different size still invalidates.
    pub fn lookup(&self, path: &Utf8Path, mtime_ms: u64, size: u64) -> Option<u64> {
        let mut state = self.state.lock().expect("tracker lock");
        let files = Self::loaded(&self.path, &mut state);
        files.get(path).and_then(|record| {
            (record.mtime_ms == mtime_ms && record.size == size).then_some(record.hash)
        })
    }

    pub fn record(&self, path: &Utf8Path, mtime_ms: u64, size: u64, hash: u64) {
        let mut state = self.state.lock().expect("tracker lock");
        let files = Self::loaded(&self.path, &mut state);
        let record = FileRecord {
            mtime_ms,
            size,
            hash,
        };
        if files.insert(path.to_owned(), record) != Some(record) {
            state.dirty = true;
        }
    }

    /// Write the state file if anything changed since load. Uses the
    /// write-to-temp-then-rename pattern so a crashed run never leaves a
    /// truncated state file behind.
    pub fn flush(&self) -> Result<(), Error> {
        let mut state = self.state.lock().expect("tracker lock");
        if !state.dirty {
            return Ok(());
        }
        let files = state.files.take().unwrap_or_default();
        let contents = serde_json::to_string(&StateFile {
            version: STATE_VERSION,
            files,
        })
        .expect("tracker state serializes");

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::TrackerWrite)?;
        }
        let tmp = self
            .path
            .with_file_name(format!(".state.json.{}.tmp", std::process::id()));
        std::fs::write(&tmp, contents).map_err(Error::TrackerWrite)?;
        std::fs::rename(&tmp, &self.path).map_err(Error::TrackerWrite)?;
        state.dirty = false;
        debug!("tracker state written to {}", self.path);
        Ok(())
    }

    fn loaded<'a>(
        path: &Utf8Path,
        state: &'a mut State,
    ) -> &'a mut HashMap<Utf8PathBuf, FileRecord> {
        state.files.get_or_insert_with(|| match Self::read(path) {
            Some(files) => files,
            None => HashMap::new(),
        })
    }

    fn read(path: &Utf8Path) -> Option<HashMap<Utf8PathBuf, FileRecord>> {
        let contents = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str::<StateFile>(&contents) {
            Ok(state) if state.version == STATE_VERSION => Some(state.files),
            Ok(state) => {
                debug!(
                    "tracker state version {} does not match {}, starting clean",
                    state.version, STATE_VERSION
                );
                None
            }
            Err(e) => {
                warn!("unreadable tracker state at {path}: {e}");
                None
            }
        }
    }
}
