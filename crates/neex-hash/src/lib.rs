//! Fast content hashing for task inputs: a 64-bit XXH3 file hasher with a
//! stat-keyed LRU in front of it, a persistent incremental tracker behind
//! it, and an order-independent package hash on top.

mod lru;
mod package;
mod tracker;

use std::{io, sync::Arc};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

pub use package::{collect_source_files, package_hash, DEFAULT_EXTENSIONS, IGNORED_DIR_NAMES};
pub use tracker::IncrementalTracker;

use crate::lru::LruMap;

/// Entries kept in the in-memory hash memoization layer.
const HASH_LRU_CAPACITY: usize = 10_000;

/// Pool size used when the CPU count cannot be determined.
const DEFAULT_POOL_SIZE: usize = 8;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to stat {path}: {source}")]
    Stat {
        path: Utf8PathBuf,
        source: io::Error,
    },
    #[error("unable to read {path}: {source}")]
    Read {
        path: Utf8PathBuf,
        source: io::Error,
    },
    #[error("hash worker exited before returning a result")]
    PoolClosed,
    #[error("unable to persist tracker state: {0}")]
    TrackerWrite(#[source] io::Error),
}

/// Hash raw bytes with XXH3-64. This is the content-addressing hash for
/// file bodies; fingerprints use a cryptographic digest elsewhere.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(bytes)
}

/// Fixed-width lowercase hex rendering of a 64-bit hash.
pub fn hex64(hash: u64) -> String {
    format!("{hash:016x}")
}

/// File hasher with bounded concurrency and two memoization layers: the
/// in-process LRU (keyed on `path:mtime:size`) and the on-disk incremental
/// tracker shared across runs.
pub struct FileHasher {
    lru: std::sync::Mutex<LruMap<String, u64>>,
    tracker: Arc<IncrementalTracker>,
    pool: Arc<Semaphore>,
}

impl FileHasher {
    pub fn new(tracker: Arc<IncrementalTracker>) -> Self {
        let permits = match num_cpus::get() {
            0 => DEFAULT_POOL_SIZE,
            n => n,
        };
        Self::with_pool_size(tracker, permits)
    }

    pub fn with_pool_size(tracker: Arc<IncrementalTracker>, permits: usize) -> Self {
        debug!("file hasher pool size {permits}");
        Self {
            lru: std::sync::Mutex::new(LruMap::new(HASH_LRU_CAPACITY)),
            tracker,
            pool: Arc::new(Semaphore::new(permits.max(1))),
        }
    }

    /// Hash a single file, consulting the LRU and the tracker before
    /// touching file contents.
    pub fn hash_file(&self, path: &Utf8Path) -> Result<u64, Error> {
        let metadata = path.symlink_metadata().map_err(|source| Error::Stat {
            path: path.to_owned(),
            source,
        })?;
        let mtime_ms = mtime_millis(&metadata);
        let size = metadata.len();

        let key = format!("{path}:{mtime_ms}:{size}");
        if let Some(hash) = self.lru.lock().expect("lru lock").get(&key) {
            return Ok(hash);
        }
        if let Some(hash) = self.tracker.lookup(path, mtime_ms, size) {
            self.lru.lock().expect("lru lock").insert(key, hash);
            return Ok(hash);
        }

        let bytes = std::fs::read(path).map_err(|source| Error::Read {
            path: path.to_owned(),
            source,
        })?;
        let hash = hash_bytes(&bytes);

        self.lru.lock().expect("lru lock").insert(key, hash);
        self.tracker.record(path, mtime_ms, size, hash);
        Ok(hash)
    }

    /// Hash a set of files concurrently, at most pool-size at a time. The
    /// result order matches the input order, so callers combining hashes
    /// order-sensitively still get deterministic output.
    pub async fn hash_files_parallel(
        self: &Arc<Self>,
        files: Vec<Utf8PathBuf>,
    ) -> Vec<Result<u64, Error>> {
        let mut handles = Vec::with_capacity(files.len());
        for path in files {
            let hasher = Arc::clone(self);
            let pool = Arc::clone(&self.pool);
            handles.push(tokio::spawn(async move {
                let _permit = pool.acquire().await.map_err(|_| Error::PoolClosed)?;
                tokio::task::block_in_place(|| hasher.hash_file(&path))
            }));
        }
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.unwrap_or(Err(Error::PoolClosed)));
        }
        results
    }

    pub fn tracker(&self) -> &Arc<IncrementalTracker> {
        &self.tracker
    }
}

pub(crate) fn mtime_millis(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|mtime| mtime.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use tempfile::tempdir;

    use super::*;

    fn hasher_in(dir: &Utf8Path) -> Arc<FileHasher> {
        let tracker = Arc::new(IncrementalTracker::new(dir.join("state.json")));
        Arc::new(FileHasher::with_pool_size(tracker, 4))
    }

    #[test]
    fn test_hash_is_stable() -> Result<()> {
        let dir = tempdir()?;
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let file = root.join("a.ts");
        std::fs::write(&file, b"export const a = 1;")?;

        let hasher = hasher_in(root);
        let first = hasher.hash_file(&file)?;
        let second = hasher.hash_file(&file)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_zero_byte_file_hashes() -> Result<()> {
        let dir = tempdir()?;
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let file = root.join("empty.ts");
        std::fs::write(&file, b"")?;

        let hasher = hasher_in(root);
        let hash = hasher.hash_file(&file)?;
        assert_eq!(hash, hash_bytes(b""));
        Ok(())
    }

    #[test]
    fn test_content_change_changes_hash() -> Result<()> {
        let dir = tempdir()?;
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let file = root.join("a.ts");

        std::fs::write(&file, b"one")?;
        let hasher = hasher_in(root);
        let first = hasher.hash_file(&file)?;

        // a new hasher so the change is seen even if mtime granularity hides
        // it from the stat cache
        std::fs::write(&file, b"three")?;
        let hasher = hasher_in(root);
        let second = hasher.hash_file(&file)?;
        assert_ne!(first, second);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_matches_serial() -> Result<()> {
        let dir = tempdir()?;
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let mut files = Vec::new();
        for i in 0..32 {
            let file = root.join(format!("f{i}.ts"));
            std::fs::write(&file, format!("export const v{i} = {i};"))?;
            files.push(file);
        }

        let hasher = hasher_in(root);
        let serial: Vec<u64> = files
            .iter()
            .map(|f| hasher.hash_file(f).unwrap())
            .collect();

        let fresh = hasher_in(root);
        let parallel: Vec<u64> = fresh
            .hash_files_parallel(files)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(serial, parallel);
        Ok(())
    }

    #[test]
    fn test_hex64_width() {
        assert_eq!(hex64(0), "0000000000000000");
        assert_eq!(hex64(u64::MAX), "ffffffffffffffff");
        assert_eq!(hex64(0xabc).len(), 16);
    }
}
