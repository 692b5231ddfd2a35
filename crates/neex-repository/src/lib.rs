//! Workspace model: package manifests, package-manager detection, workspace
//! discovery, and the package dependency graph with its incremental store.

mod discovery;
pub mod package_graph;
mod package_json;
mod package_manager;
mod store;

use camino::Utf8PathBuf;
use thiserror::Error;

pub use discovery::{discover_packages, DiscoveredPackage};
pub use package_graph::{LoadStats, PackageGraph, PackageGraphBuilder, PackageInfo};
pub use package_json::PackageJson;
pub use package_manager::PackageManager;

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not read root manifest at {0}")]
    MissingRootManifest(Utf8PathBuf),
    #[error("invalid root manifest at {path}: {source}")]
    InvalidRootManifest {
        path: Utf8PathBuf,
        source: serde_json::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Graph(#[from] neex_graph_utils::Error),
}
