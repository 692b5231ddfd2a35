mod builder;

use std::collections::{BTreeMap, HashMap, HashSet};

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::{graph::NodeIndex, Graph};
use serde::{Deserialize, Serialize};

use crate::PackageManager;

pub use builder::PackageGraphBuilder;

/// A workspace package as the orchestrator sees it. `internal_dependencies`
/// is the declared dependency set intersected with the workspace's package
/// names, recomputed on every load so the intersection invariant holds even
/// when other packages appear or vanish.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageInfo {
    pub name: String,
    pub dir: Utf8PathBuf,
    pub version: String,
    pub scripts: BTreeMap<String, String>,
    pub declared_dependencies: Vec<String>,
    #[serde(default)]
    pub internal_dependencies: Vec<String>,
    pub manifest_hash: u64,
}

impl PackageInfo {
    pub fn script(&self, task: &str) -> Option<&str> {
        self.scripts.get(task).map(String::as_str)
    }
}

/// How many package nodes were served from the incremental store versus
/// re-parsed from disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub cached: usize,
    pub updated: usize,
}

pub struct PackageGraph {
    repo_root: Utf8PathBuf,
    packages: BTreeMap<String, PackageInfo>,
    graph: Graph<String, ()>,
    node_lookup: HashMap<String, NodeIndex>,
    manager: PackageManager,
    stats: LoadStats,
}

impl PackageGraph {
    pub fn builder<'a>(
        repo_root: &'a Utf8Path,
        root_manifest: &'a crate::PackageJson,
    ) -> PackageGraphBuilder<'a> {
        PackageGraphBuilder::new(repo_root, root_manifest)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn repo_root(&self) -> &Utf8Path {
        &self.repo_root
    }

    pub fn manager(&self) -> PackageManager {
        self.manager
    }

    pub fn load_stats(&self) -> LoadStats {
        self.stats
    }

    pub fn packages(&self) -> impl Iterator<Item = &PackageInfo> {
        self.packages.values()
    }

    pub fn package_info(&self, name: &str) -> Option<&PackageInfo> {
        self.packages.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    /// Internal dependencies of `name` (forward edges).
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.packages
            .get(name)
            .map(|info| info.internal_dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Packages that directly depend on `name` (reverse edges). Derived
    /// from the same graph the forward edges live in, so the two can never
    /// disagree.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        let Some(ix) = self.node_lookup.get(name) else {
            return Vec::new();
        };
        let mut dependents: Vec<&str> = self
            .graph
            .neighbors_directed(*ix, petgraph::Direction::Incoming)
            .map(|dep_ix| self.graph[dep_ix].as_str())
            .collect();
        dependents.sort_unstable();
        dependents
    }

    /// The least superset of `seeds` closed under "some dependency is in
    /// the set", i.e. the packages that must be reconsidered when the seeds
    /// change. Implemented as a breadth-first walk over reverse edges.
    pub fn dependents_closure<'a, I>(&self, seeds: I) -> HashSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut closed: HashSet<String> = HashSet::new();
        let mut queue: Vec<NodeIndex> = Vec::new();
        for seed in seeds {
            if let Some(ix) = self.node_lookup.get(seed) {
                if closed.insert(seed.to_string()) {
                    queue.push(*ix);
                }
            }
        }
        while let Some(ix) = queue.pop() {
            for dependent in self
                .graph
                .neighbors_directed(ix, petgraph::Direction::Incoming)
            {
                let name = self.graph[dependent].as_str();
                if closed.insert(name.to_string()) {
                    queue.push(dependent);
                }
            }
        }
        closed
    }

    /// Every package, dependencies before dependents. Members of a cycle
    /// appear in arbitrary relative order.
    pub fn topological_order(&self) -> Vec<&str> {
        neex_graph_utils::topological_order(&self.graph)
            .into_iter()
            .map(|ix| self.graph[ix].as_str())
            .collect()
    }

    /// The package whose directory contains `file`, by longest prefix.
    /// `file` is relative to the repository root, as VCS output is.
    pub fn package_for_file(&self, file: &Utf8Path) -> Option<&PackageInfo> {
        self.packages
            .values()
            .filter_map(|info| {
                let rel_dir = info.dir.strip_prefix(&self.repo_root).ok()?;
                file.strip_prefix(rel_dir).ok()?;
                Some((rel_dir.as_str().len(), info))
            })
            .max_by_key(|(prefix_len, _)| *prefix_len)
            .map(|(_, info)| info)
    }

    /// Packages declaring a script for `task`.
    pub fn packages_with_task<'a>(
        &'a self,
        task: &'a str,
    ) -> impl Iterator<Item = &'a PackageInfo> + 'a {
        self.packages
            .values()
            .filter(move |info| info.scripts.contains_key(task))
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::PackageJson;

    pub(crate) fn fixture_repo() -> Result<(tempfile::TempDir, Utf8PathBuf)> {
        let dir = tempdir()?;
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::write(
            root.join("package.json"),
            r#"{"name": "fixture", "workspaces": ["packages/*", "apps/*"]}"#,
        )?;
        let write = |path: &str, json: &str| {
            let dir = root.join(path);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("package.json"), json).unwrap();
        };
        write(
            "packages/core",
            r#"{"name": "core", "version": "1.0.0", "scripts": {"build": "tsc"}}"#,
        );
        write(
            "packages/ui",
            r#"{"name": "ui", "scripts": {"build": "tsc"},
                "dependencies": {"core": "workspace:*", "react": "^18.0.0"}}"#,
        );
        write(
            "apps/web",
            r#"{"name": "web", "scripts": {"build": "next build", "dev": "next dev"},
                "dependencies": {"ui": "workspace:*"},
                "devDependencies": {"core": "workspace:*"}}"#,
        );
        Ok((dir, root))
    }

    pub(crate) fn build(root: &Utf8Path) -> Result<PackageGraph> {
        let root_manifest = PackageJson::load_root(&root.join("package.json"))?;
        Ok(PackageGraph::builder(root, &root_manifest).build()?)
    }

    #[test]
    fn test_internal_dependency_intersection() -> Result<()> {
        let (_dir, root) = fixture_repo()?;
        let graph = build(&root)?;

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.dependencies("ui"), &["core".to_string()]);
        // dev-dependencies contribute edges too
        assert_eq!(
            graph.dependencies("web"),
            &["core".to_string(), "ui".to_string()]
        );
        assert_eq!(graph.dependencies("core"), &[] as &[String]);

        // every internal dependency resolves to a package node
        for info in graph.packages() {
            for dep in &info.internal_dependencies {
                assert!(graph.contains(dep), "{dep} missing");
            }
        }
        Ok(())
    }

    #[test]
    fn test_reverse_is_transpose_of_forward() -> Result<()> {
        let (_dir, root) = fixture_repo()?;
        let graph = build(&root)?;

        for info in graph.packages() {
            for dep in &info.internal_dependencies {
                assert!(
                    graph.dependents(dep).contains(&info.name.as_str()),
                    "{} -> {dep} has no reverse edge",
                    info.name
                );
            }
        }
        assert_eq!(graph.dependents("core"), vec!["ui", "web"]);
        Ok(())
    }

    #[test]
    fn test_dependents_closure() -> Result<()> {
        let (_dir, root) = fixture_repo()?;
        let graph = build(&root)?;

        let affected = graph.dependents_closure(["core"]);
        assert_eq!(
            affected,
            HashSet::from(["core".to_string(), "ui".to_string(), "web".to_string()])
        );

        let affected = graph.dependents_closure(["web"]);
        assert_eq!(affected, HashSet::from(["web".to_string()]));
        Ok(())
    }

    #[test]
    fn test_topological_order() -> Result<()> {
        let (_dir, root) = fixture_repo()?;
        let graph = build(&root)?;
        let order = graph.topological_order();
        let pos = |name| order.iter().position(|o| *o == name).unwrap();
        assert!(pos("core") < pos("ui"));
        assert!(pos("ui") < pos("web"));
        Ok(())
    }

    #[test]
    fn test_package_for_file_longest_prefix() -> Result<()> {
        let (_dir, root) = fixture_repo()?;
        let graph = build(&root)?;

        let owner = graph
            .package_for_file(Utf8Path::new("packages/ui/src/button.tsx"))
            .unwrap();
        assert_eq!(owner.name, "ui");
        assert!(graph
            .package_for_file(Utf8Path::new("README.md"))
            .is_none());
        Ok(())
    }

    #[test]
    fn test_incremental_reload_uses_store() -> Result<()> {
        let (_dir, root) = fixture_repo()?;
        let first = build(&root)?;
        assert_eq!(first.load_stats().cached, 0);
        assert_eq!(first.load_stats().updated, 3);

        let second = build(&root)?;
        assert_eq!(second.load_stats().cached, 3);
        assert_eq!(second.load_stats().updated, 0);

        // touching one manifest re-parses just that node
        // grow the manifest so at least the size component moves
        let manifest = root.join("packages/ui/package.json");
        let mut contents = std::fs::read_to_string(&manifest)?;
        contents = contents.replace(r#""name": "ui""#, r#""name": "ui", "version": "2.0.0""#);
        std::fs::write(&manifest, contents)?;

        let third = build(&root)?;
        assert_eq!(third.load_stats().cached, 2);
        assert_eq!(third.load_stats().updated, 1);
        Ok(())
    }
}
