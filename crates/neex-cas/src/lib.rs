//! Content-addressable storage for task outputs.
//!
//! Objects are gzip-compressed byte blobs keyed by the XXH3-64 hash of
//! their raw content, sharded by the first two hex characters of the key:
//! `<root>/objects/<aa>/<rest>.gz`. Writes are idempotent: the same bytes
//! always land at the same path, so concurrent writers can race freely.

use std::{
    io::{Read, Write},
    time::{Duration, SystemTime},
};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum Error {
    #[error("content store IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("object {0} is corrupt: {1}")]
    Corrupt(String, std::io::Error),
}

pub struct ContentStore {
    objects_dir: Utf8PathBuf,
}

impl ContentStore {
    /// `root` is the cache directory, usually `<repo>/.neex/cache`.
    pub fn new(root: &Utf8Path) -> Self {
        Self {
            objects_dir: root.join("objects"),
        }
    }

    /// Store `bytes`, returning their content hash. A hit on an existing
    /// object skips the write entirely, which is what de-duplicates shared
    /// files across artifacts.
    pub fn put(&self, bytes: &[u8]) -> Result<String, Error> {
        let hash = neex_hash::hex64(neex_hash::hash_bytes(bytes));
        let path = self.object_path(&hash);
        if path.exists() {
            return Ok(hash);
        }
        std::fs::create_dir_all(path.parent().expect("object path has a shard parent"))?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(bytes)?;
        let compressed = encoder.finish()?;

        // Write through a temp file so a concurrent reader never observes a
        // partially written object.
        let tmp = path.with_extension(format!("gz.{}.tmp", std::process::id()));
        std::fs::write(&tmp, compressed)?;
        std::fs::rename(&tmp, &path)?;
        Ok(hash)
    }

    /// Fetch an object's raw bytes; `None` when it is not stored.
    pub fn get(&self, hash: &str) -> Result<Option<Vec<u8>>, Error> {
        let path = self.object_path(hash);
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut bytes = Vec::new();
        GzDecoder::new(file)
            .read_to_end(&mut bytes)
            .map_err(|e| Error::Corrupt(hash.to_string(), e))?;
        Ok(Some(bytes))
    }

    /// Restore an object to `dest`, creating intermediate directories.
    /// Returns false when the object is missing.
    pub fn write_to(&self, hash: &str, dest: &Utf8Path) -> Result<bool, Error> {
        let Some(bytes) = self.get(hash)? else {
            return Ok(false);
        };
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, bytes)?;
        Ok(true)
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.object_path(hash).exists()
    }

    /// On-disk (compressed) size of an object, when present.
    pub fn object_size(&self, hash: &str) -> Option<u64> {
        self.object_path(hash).metadata().ok().map(|m| m.len())
    }

    /// Unlink objects older than `max_age` and prune shard directories that
    /// end up empty. Missing shards are not an error.
    pub fn cleanup(&self, max_age: Duration) -> Result<usize, Error> {
        let shards = match self.objects_dir.read_dir_utf8() {
            Ok(shards) => shards,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let now = SystemTime::now();
        let mut removed = 0;

        for shard in shards {
            let shard = shard?;
            let shard_path = shard.path().to_owned();
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for object in shard_path.read_dir_utf8()? {
                let object = object?;
                let age = object
                    .metadata()?
                    .modified()
                    .ok()
                    .and_then(|mtime| now.duration_since(mtime).ok())
                    .unwrap_or(Duration::ZERO);
                if age >= max_age {
                    if let Err(e) = std::fs::remove_file(object.path()) {
                        warn!("could not remove stale object {}: {e}", object.path());
                    } else {
                        removed += 1;
                    }
                }
            }
            // prune the shard when nothing is left in it
            if shard_path.read_dir_utf8()?.next().is_none() {
                std::fs::remove_dir(&shard_path).ok();
            }
        }
        debug!("content store cleanup removed {removed} objects");
        Ok(removed)
    }

    fn object_path(&self, hash: &str) -> Utf8PathBuf {
        let (shard, rest) = hash.split_at(2.min(hash.len()));
        self.objects_dir.join(shard).join(format!("{rest}.gz"))
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use tempfile::tempdir;

    use super::*;

    fn store() -> Result<(tempfile::TempDir, ContentStore)> {
        let dir = tempdir()?;
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let store = ContentStore::new(&root);
        Ok((dir, store))
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        let (_dir, store) = store()?;
        let hash = store.put(b"hello cache")?;
        assert_eq!(store.get(&hash)?.as_deref(), Some(&b"hello cache"[..]));
        Ok(())
    }

    #[test]
    fn test_put_is_idempotent() -> Result<()> {
        let (_dir, store) = store()?;
        let first = store.put(b"same bytes")?;
        let second = store.put(b"same bytes")?;
        assert_eq!(first, second);

        // exactly one object file exists
        let shard_dir = store.object_path(&first);
        let shard_dir = shard_dir.parent().unwrap();
        let objects: Vec<_> = shard_dir.read_dir_utf8()?.collect();
        assert_eq!(objects.len(), 1);
        Ok(())
    }

    #[test]
    fn test_distinct_content_distinct_objects() -> Result<()> {
        let (_dir, store) = store()?;
        let a = store.put(b"a")?;
        let b = store.put(b"b")?;
        assert_ne!(a, b);
        assert_eq!(store.get(&a)?.as_deref(), Some(&b"a"[..]));
        assert_eq!(store.get(&b)?.as_deref(), Some(&b"b"[..]));
        Ok(())
    }

    #[test]
    fn test_get_missing_is_none() -> Result<()> {
        let (_dir, store) = store()?;
        assert!(store.get("00000000deadbeef")?.is_none());
        Ok(())
    }

    #[test]
    fn test_write_to_creates_directories() -> Result<()> {
        let (dir, store) = store()?;
        let hash = store.put(b"restored")?;
        let dest = Utf8PathBuf::from_path_buf(dir.path().join("deep/nested/out.txt")).unwrap();
        assert!(store.write_to(&hash, &dest)?);
        assert_eq!(std::fs::read(&dest)?, b"restored");
        Ok(())
    }

    #[test]
    fn test_cleanup_removes_old_objects_and_empty_shards() -> Result<()> {
        let (_dir, store) = store()?;
        let hash = store.put(b"stale")?;
        let removed = store.cleanup(Duration::ZERO)?;
        assert_eq!(removed, 1);
        assert!(!store.contains(&hash));
        assert!(!store.object_path(&hash).parent().unwrap().exists());

        // fresh objects survive a generous threshold
        let hash = store.put(b"fresh")?;
        store.cleanup(Duration::from_secs(3600))?;
        assert!(store.contains(&hash));
        Ok(())
    }

    #[test]
    fn test_zero_byte_object() -> Result<()> {
        let (_dir, store) = store()?;
        let hash = store.put(b"")?;
        assert_eq!(store.get(&hash)?.as_deref(), Some(&b""[..]));
        Ok(())
    }
}
