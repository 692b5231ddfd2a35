use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::package_graph::PackageInfo;

/// Bump when the stored package shape changes; drift discards the store.
const STORE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    packages: HashMap<String, StoredPackage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPackage {
    pub mtime_ms: u64,
    pub size: u64,
    pub info: PackageInfo,
}

/// Persisted package snapshots keyed by package name, used to skip
/// re-parsing manifests whose `(mtime, size)` has not moved.
pub struct GraphStore {
    path: Utf8PathBuf,
}

impl GraphStore {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> HashMap<String, StoredPackage> {
        let Ok(contents) = std::fs::read_to_string(&self.path) else {
            return HashMap::new();
        };
        match serde_json::from_str::<StoreFile>(&contents) {
            Ok(store) if store.version == STORE_VERSION => store.packages,
            Ok(store) => {
                debug!(
                    "graph store version {} does not match {}, rebuilding",
                    store.version, STORE_VERSION
                );
                HashMap::new()
            }
            Err(e) => {
                warn!("unreadable graph store at {}: {e}", self.path);
                HashMap::new()
            }
        }
    }

    pub fn save(&self, packages: HashMap<String, StoredPackage>) {
        let contents = serde_json::to_string(&StoreFile {
            version: STORE_VERSION,
            packages,
        })
        .expect("graph store serializes");
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("could not create graph store directory: {e}");
                return;
            }
        }
        let tmp = self
            .path
            .with_file_name(format!(".project-graph.{}.tmp", std::process::id()));
        if let Err(e) =
            std::fs::write(&tmp, contents).and_then(|()| std::fs::rename(&tmp, &self.path))
        {
            warn!("could not persist graph store at {}: {e}", self.path);
        }
    }
}

pub(crate) fn store_path(repo_root: &Utf8Path) -> Utf8PathBuf {
    repo_root.join(".neex/cache/project-graph.db")
}
