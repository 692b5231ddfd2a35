use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, trace};

use crate::{Error, PackageJson};

/// A workspace member found on disk, before it becomes a graph node.
#[derive(Debug, Clone)]
pub struct DiscoveredPackage {
    pub dir: Utf8PathBuf,
    pub manifest_path: Utf8PathBuf,
    pub manifest: PackageJson,
    pub manifest_mtime_ms: u64,
    pub manifest_size: u64,
}

/// Walk the root manifest's workspace patterns and collect every member
/// with a usable manifest. Patterns are of the `base/*` form: each
/// immediate subdirectory of `base` is probed for a `package.json`.
/// Manifests that fail to parse or lack a name are skipped silently; the
/// root manifest itself never becomes a package.
pub fn discover_packages(
    repo_root: &Utf8Path,
    patterns: &[String],
) -> Result<Vec<DiscoveredPackage>, Error> {
    let mut packages = Vec::new();
    for pattern in patterns {
        let base = match pattern.strip_suffix("/*") {
            Some(base) => base,
            // a bare directory pattern names a single member
            None => {
                if let Some(package) = probe(repo_root, &repo_root.join(pattern)) {
                    packages.push(package);
                }
                continue;
            }
        };
        let base_dir = repo_root.join(base);
        let entries = match base_dir.read_dir_utf8() {
            Ok(entries) => entries,
            Err(e) => {
                trace!("workspace base {base_dir} unreadable: {e}");
                continue;
            }
        };
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                if let Some(package) = probe(repo_root, entry.path()) {
                    packages.push(package);
                }
            }
        }
    }
    // stable order regardless of directory enumeration
    packages.sort_by(|a, b| a.manifest.name.cmp(&b.manifest.name));
    debug!("discovered {} workspace packages", packages.len());
    Ok(packages)
}

fn probe(repo_root: &Utf8Path, dir: &Utf8Path) -> Option<DiscoveredPackage> {
    let manifest_path = dir.join("package.json");
    if manifest_path == repo_root.join("package.json") {
        return None;
    }
    let metadata = manifest_path.metadata().ok()?;
    let manifest = PackageJson::load_member(&manifest_path)?;
    if manifest.name.is_empty() {
        trace!("skipping unnamed package at {dir}");
        return None;
    }
    Some(DiscoveredPackage {
        dir: dir.to_owned(),
        manifest_path,
        manifest_mtime_ms: mtime_millis(&metadata),
        manifest_size: metadata.len(),
        manifest,
    })
}

pub(crate) fn mtime_millis(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|mtime| mtime.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
