//! Affected detection: version-control changes mapped to packages, then
//! closed over reverse dependency edges.

use std::collections::{BTreeMap, HashSet};

use camino::Utf8PathBuf;
use neex_repository::PackageGraph;
use neex_scm::Scm;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffectedReason {
    /// Files inside the package changed.
    Changed,
    /// A (transitive) dependency changed.
    Dependency,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffectedPackage {
    pub name: String,
    pub reason: AffectedReason,
    /// The changed files, for directly-changed packages.
    pub files: Vec<Utf8PathBuf>,
}

/// Packages that must be reconsidered given the VCS state, in topological
/// order (dependencies first) so the result can feed the scheduler as-is.
/// A failing VCS leaves the changed set empty, which callers interpret as
/// "nothing to do".
pub fn affected_packages(
    graph: &PackageGraph,
    scm: &Scm,
    base_ref: Option<&str>,
) -> Vec<AffectedPackage> {
    let changed = scm.changed_files(base_ref);

    let mut directly_changed: BTreeMap<String, Vec<Utf8PathBuf>> = BTreeMap::new();
    for file in &changed.files {
        if let Some(package) = graph.package_for_file(file) {
            directly_changed
                .entry(package.name.clone())
                .or_default()
                .push(file.clone());
        }
    }
    debug!(
        "{} files map onto {} packages",
        changed.files.len(),
        directly_changed.len()
    );

    let closure: HashSet<String> =
        graph.dependents_closure(directly_changed.keys().map(String::as_str));

    graph
        .topological_order()
        .into_iter()
        .filter(|name| closure.contains(*name))
        .map(|name| match directly_changed.remove(name) {
            Some(files) => AffectedPackage {
                name: name.to_string(),
                reason: AffectedReason::Changed,
                files,
            },
            None => AffectedPackage {
                name: name.to_string(),
                reason: AffectedReason::Dependency,
                files: Vec::new(),
            },
        })
        .collect()
}
