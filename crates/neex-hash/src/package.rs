use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use crate::FileHasher;

/// Directory names that never contribute to a package hash. Dot-entries are
/// excluded separately.
pub const IGNORED_DIR_NAMES: &[&str] = &[
    "node_modules",
    ".git",
    ".next",
    ".turbo",
    ".neex",
    "dist",
    "build",
    "coverage",
];

/// Extensions considered source input when the pipeline does not narrow
/// them with `inputs` globs.
pub const DEFAULT_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "json"];

/// Enumerate the files of a package source tree that participate in its
/// hash, in a deterministic order.
pub fn collect_source_files(root: &Utf8Path, extensions: &[&str]) -> Vec<Utf8PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            if entry.depth() == 0 {
                return true;
            }
            !name.starts_with('.') && !IGNORED_DIR_NAMES.contains(&name.as_ref())
        })
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("skipping unreadable entry under {root}: {e}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| Utf8PathBuf::from_path_buf(entry.into_path()).ok())
        .filter(|path| {
            path.extension()
                .map(|ext| extensions.contains(&ext))
                .unwrap_or(false)
        })
        .collect()
}

/// Hash a package's source tree: every contributing file is hashed in
/// parallel and the 64-bit results are XOR-folded. XOR keeps the
/// combination order-independent, so worker scheduling cannot change the
/// result.
///
/// `inputs`, when present, narrows the file set to paths (relative to the
/// package root) matching at least one glob.
pub async fn package_hash(
    hasher: &Arc<FileHasher>,
    root: &Utf8Path,
    inputs: Option<&[String]>,
) -> u64 {
    let mut files = collect_source_files(root, DEFAULT_EXTENSIONS);

    if let Some(globs) = inputs {
        let patterns: Vec<glob::Pattern> = globs
            .iter()
            .filter_map(|raw| match glob::Pattern::new(raw) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!("ignoring invalid input glob {raw}: {e}");
                    None
                }
            })
            .collect();
        files.retain(|path| {
            let relative = path.strip_prefix(root).unwrap_or(path);
            patterns
                .iter()
                .any(|pattern| pattern.matches(relative.as_str()))
        });
    }

    let mut folded = 0u64;
    for (path, result) in files
        .iter()
        .zip(hasher.hash_files_parallel(files.clone()).await)
    {
        match result {
            Ok(hash) => folded ^= hash,
            // A file vanishing mid-walk degrades to exclusion, same as the
            // artifact save path.
            Err(e) => warn!("could not hash {path}: {e}"),
        }
    }
    folded
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use tempfile::tempdir;

    use super::*;
    use crate::IncrementalTracker;

    fn fixture() -> Result<(tempfile::TempDir, Utf8PathBuf)> {
        let dir = tempdir()?;
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(root.join("src"))?;
        std::fs::create_dir_all(root.join("node_modules/dep"))?;
        std::fs::create_dir_all(root.join("dist"))?;
        std::fs::write(root.join("package.json"), r#"{"name":"fixture"}"#)?;
        std::fs::write(root.join("src/index.ts"), "export {};")?;
        std::fs::write(root.join("src/util.tsx"), "export const u = 1;")?;
        std::fs::write(root.join("src/notes.md"), "not source")?;
        std::fs::write(root.join("node_modules/dep/index.js"), "ignored")?;
        std::fs::write(root.join("dist/out.js"), "ignored")?;
        std::fs::write(root.join(".hidden.ts"), "ignored")?;
        Ok((dir, root))
    }

    fn hasher(root: &Utf8Path) -> Arc<FileHasher> {
        let tracker = Arc::new(IncrementalTracker::new(root.join("tracker-state.json")));
        Arc::new(FileHasher::with_pool_size(tracker, 4))
    }

    #[test]
    fn test_collect_filters_ignored_trees() -> Result<()> {
        let (_dir, root) = fixture()?;
        let files = collect_source_files(&root, DEFAULT_EXTENSIONS);
        let names: Vec<_> = files
            .iter()
            .map(|f| f.strip_prefix(&root).unwrap().as_str())
            .collect();
        assert_eq!(names, vec!["package.json", "src/index.ts", "src/util.tsx"]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_package_hash_order_independent() -> Result<()> {
        let (_dir, root) = fixture()?;

        let hasher = hasher(&root);
        let parallel = package_hash(&hasher, &root, None).await;

        // serial fold over the same file set, reversed
        let hasher = hasher_for_serial(&root);
        let mut files = collect_source_files(&root, DEFAULT_EXTENSIONS);
        files.reverse();
        let mut serial = 0u64;
        for file in &files {
            serial ^= hasher.hash_file(file)?;
        }

        assert_eq!(parallel, serial);
        Ok(())
    }

    fn hasher_for_serial(root: &Utf8Path) -> Arc<FileHasher> {
        let tracker = Arc::new(IncrementalTracker::new(root.join("tracker-serial.json")));
        Arc::new(FileHasher::with_pool_size(tracker, 1))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_inputs_globs_narrow_hash() -> Result<()> {
        let (_dir, root) = fixture()?;
        let hasher = hasher(&root);

        let full = package_hash(&hasher, &root, None).await;
        let narrowed =
            package_hash(&hasher, &root, Some(&["src/*.ts".to_string()])).await;
        assert_ne!(full, narrowed);

        // narrowing to everything reproduces the full hash
        let all = package_hash(&hasher, &root, Some(&["**/*".to_string()])).await;
        assert_eq!(full, all);
        Ok(())
    }
}
