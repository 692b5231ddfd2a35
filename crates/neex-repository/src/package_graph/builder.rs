use std::collections::{BTreeMap, HashMap, HashSet};

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::{graph::NodeIndex, Graph};
use tracing::{debug, warn};

use super::{LoadStats, PackageGraph, PackageInfo};
use crate::{
    discovery::{discover_packages, DiscoveredPackage},
    store::{store_path, GraphStore, StoredPackage},
    Error, PackageJson, PackageManager,
};

pub struct PackageGraphBuilder<'a> {
    repo_root: &'a Utf8Path,
    root_manifest: &'a PackageJson,
    store_path: Option<Utf8PathBuf>,
}

impl<'a> PackageGraphBuilder<'a> {
    pub fn new(repo_root: &'a Utf8Path, root_manifest: &'a PackageJson) -> Self {
        Self {
            repo_root,
            root_manifest,
            store_path: None,
        }
    }

    /// Override where the incremental snapshot lives; tests point this at a
    /// scratch file.
    pub fn with_store_path(mut self, path: Utf8PathBuf) -> Self {
        self.store_path = Some(path);
        self
    }

    #[tracing::instrument(skip_all)]
    pub fn build(self) -> Result<PackageGraph, Error> {
        let discovered = discover_packages(self.repo_root, &self.root_manifest.workspaces)?;
        let store = GraphStore::new(
            self.store_path
                .unwrap_or_else(|| store_path(self.repo_root)),
        );
        let snapshot = store.load();

        let mut stats = LoadStats::default();
        let mut packages = BTreeMap::new();
        let mut next_snapshot = HashMap::new();

        for found in discovered {
            let name = found.manifest.name.clone();
            let info = match snapshot.get(&name) {
                Some(stored)
                    if stored.mtime_ms == found.manifest_mtime_ms
                        && stored.size == found.manifest_size =>
                {
                    stats.cached += 1;
                    stored.info.clone()
                }
                _ => {
                    stats.updated += 1;
                    parse_package(&found)
                }
            };
            next_snapshot.insert(
                name.clone(),
                StoredPackage {
                    mtime_ms: found.manifest_mtime_ms,
                    size: found.manifest_size,
                    info: info.clone(),
                },
            );
            packages.insert(name, info);
        }

        // The internal set depends on which packages exist right now, so it
        // is recomputed on every load rather than trusted from the store.
        let names: HashSet<String> = packages.keys().cloned().collect();
        for info in packages.values_mut() {
            info.internal_dependencies = info
                .declared_dependencies
                .iter()
                .filter(|dep| names.contains(*dep))
                .cloned()
                .collect();
            info.internal_dependencies.sort_unstable();
        }

        let mut graph: Graph<String, ()> = Graph::new();
        let mut node_lookup: HashMap<String, NodeIndex> = HashMap::new();
        for name in packages.keys() {
            node_lookup.insert(name.clone(), graph.add_node(name.clone()));
        }
        for info in packages.values() {
            let from = node_lookup[&info.name];
            for dep in &info.internal_dependencies {
                graph.add_edge(from, node_lookup[dep], ());
            }
        }

        neex_graph_utils::validate_no_self_dependencies(&graph)?;
        for cycle in neex_graph_utils::cycles(&graph) {
            warn!(
                "dependency cycle detected: {}",
                neex_graph_utils::format_cycle(&graph, &cycle)
            );
        }

        store.save(next_snapshot);
        debug!(
            "package graph loaded: {} packages ({} cached, {} re-parsed)",
            packages.len(),
            stats.cached,
            stats.updated
        );

        Ok(PackageGraph {
            repo_root: self.repo_root.to_owned(),
            packages,
            graph,
            node_lookup,
            manager: PackageManager::detect(self.repo_root),
            stats,
        })
    }
}

fn parse_package(found: &DiscoveredPackage) -> PackageInfo {
    let manifest_hash = std::fs::read(&found.manifest_path)
        .map(|bytes| neex_hash::hash_bytes(&bytes))
        .unwrap_or(0);
    let mut declared: Vec<String> = found
        .manifest
        .all_dependency_names()
        .map(str::to_string)
        .collect();
    declared.sort_unstable();
    declared.dedup();

    PackageInfo {
        name: found.manifest.name.clone(),
        dir: found.dir.clone(),
        version: found.manifest.version.clone(),
        scripts: found.manifest.scripts.clone(),
        declared_dependencies: declared,
        internal_dependencies: Vec::new(),
        manifest_hash,
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;

    use super::*;

    #[test]
    fn test_cycle_warns_but_builds() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::write(
            root.join("package.json"),
            r#"{"name": "root", "workspaces": ["packages/*"]}"#,
        )?;
        let write = |path: &str, json: &str| {
            let dir = root.join(path);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("package.json"), json).unwrap();
        };
        write(
            "packages/a",
            r#"{"name": "a", "dependencies": {"b": "workspace:*"}}"#,
        );
        write(
            "packages/b",
            r#"{"name": "b", "dependencies": {"a": "workspace:*"}}"#,
        );

        let root_manifest = PackageJson::load_root(&root.join("package.json"))?;
        let graph = PackageGraph::builder(root, &root_manifest).build()?;
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.topological_order().len(), 2);
        Ok(())
    }
}
