use camino::{Utf8Path, Utf8PathBuf};
use neex_cas::ContentStore;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::{
    ArtifactManifest, ArtifactMetadata, CacheError, CacheSource, ManifestEntry, RemoteCache,
    RemotePayload,
};

const META_FILE: &str = "meta.json";
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SaveSummary {
    pub files: usize,
    pub skipped: usize,
    pub total_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreSummary {
    pub source: CacheSource,
    pub restored: usize,
    pub failed: usize,
}

pub struct ArtifactCache {
    artifacts_dir: Utf8PathBuf,
    store: ContentStore,
    remote: Option<RemoteCache>,
}

impl ArtifactCache {
    /// `cache_root` is `<repo>/.neex/cache`; the content store and the
    /// artifact records live side by side under it.
    pub fn new(cache_root: &Utf8Path, remote: Option<RemoteCache>) -> Self {
        Self {
            artifacts_dir: cache_root.join("artifacts"),
            store: ContentStore::new(cache_root),
            remote,
        }
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Capture the named output directories into the cache under
    /// `fingerprint`. Unreadable files are skipped with a warning; a save
    /// never fails the build over a single file.
    #[tracing::instrument(skip_all, fields(fingerprint))]
    pub async fn save(
        &self,
        repo_root: &Utf8Path,
        fingerprint: &str,
        outputs: &[Utf8PathBuf],
        metadata: ArtifactMetadata,
    ) -> Result<SaveSummary, CacheError> {
        let artifact_dir = self.artifacts_dir.join(fingerprint);
        if artifact_dir.exists() {
            std::fs::remove_dir_all(&artifact_dir)?;
        }
        std::fs::create_dir_all(&artifact_dir)?;

        let mut summary = SaveSummary::default();
        let mut manifest = ArtifactManifest {
            files: Vec::new(),
            total_size: 0,
            compressed_size: 0,
        };

        for output in outputs {
            let output_root = repo_root.join(output);
            if !output_root.exists() {
                continue;
            }
            for entry in WalkDir::new(&output_root).sort_by_file_name() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("skipping unreadable output entry: {e}");
                        summary.skipped += 1;
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(path) = Utf8PathBuf::from_path_buf(entry.into_path()) else {
                    summary.skipped += 1;
                    continue;
                };
                let bytes = match std::fs::read(&path) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        // the file may have been removed between walk and read
                        warn!("could not capture {path}: {e}");
                        summary.skipped += 1;
                        continue;
                    }
                };
                let hash = self.store.put(&bytes)?;
                let relative = path
                    .strip_prefix(repo_root)
                    .unwrap_or(&path)
                    .to_owned();
                let size = bytes.len() as u64;
                manifest.total_size += size;
                manifest.compressed_size += self.store.object_size(&hash).unwrap_or(0);
                manifest.files.push(ManifestEntry {
                    path: relative,
                    hash,
                    size,
                    mode: file_mode(&path),
                });
                summary.files += 1;
                summary.total_size += size;
            }
        }

        write_json(&artifact_dir.join(META_FILE), &metadata)?;
        write_json(&artifact_dir.join(MANIFEST_FILE), &manifest)?;
        debug!(
            "saved artifact {fingerprint}: {} files, {} bytes",
            summary.files, summary.total_size
        );

        if let Some(remote) = &self.remote {
            let payload = RemotePayload { metadata, manifest };
            let bytes =
                serde_json::to_vec(&payload).map_err(CacheError::MetadataWriteFailure)?;
            if let Err(e) = remote.put(fingerprint, bytes).await {
                warn!("remote cache upload failed for {fingerprint}: {e}");
            }
        }

        Ok(summary)
    }

    /// Restore the artifact for `fingerprint`, falling back to the remote
    /// cache when the local record is missing. Returns the original
    /// execution metadata so the caller can replay the captured output.
    ///
    /// File restoration is best effort: a missing content object is
    /// counted, warned about, and skipped.
    #[tracing::instrument(skip_all, fields(fingerprint))]
    pub async fn restore(
        &self,
        repo_root: &Utf8Path,
        fingerprint: &str,
    ) -> Result<Option<(ArtifactMetadata, RestoreSummary)>, CacheError> {
        let artifact_dir = self.artifacts_dir.join(fingerprint);
        let mut source = CacheSource::Local;

        if !artifact_dir.join(META_FILE).exists() {
            let Some(payload) = self.fetch_remote(fingerprint).await else {
                return Ok(None);
            };
            std::fs::create_dir_all(&artifact_dir)?;
            write_json(&artifact_dir.join(META_FILE), &payload.metadata)?;
            write_json(&artifact_dir.join(MANIFEST_FILE), &payload.manifest)?;
            source = CacheSource::Remote;
        }

        let metadata: ArtifactMetadata = read_json(&artifact_dir.join(META_FILE))?;
        let manifest: ArtifactManifest = read_json(&artifact_dir.join(MANIFEST_FILE))?;

        let mut summary = RestoreSummary {
            source,
            restored: 0,
            failed: 0,
        };
        for entry in &manifest.files {
            let dest = repo_root.join(&entry.path);
            if dest.exists() {
                std::fs::remove_file(&dest)?;
            }
            match self.store.write_to(&entry.hash, &dest) {
                Ok(true) => {
                    set_file_mode(&dest, entry.mode);
                    summary.restored += 1;
                }
                Ok(false) => {
                    warn!("content object {} missing for {}", entry.hash, entry.path);
                    summary.failed += 1;
                }
                Err(e) => {
                    warn!("could not restore {}: {e}", entry.path);
                    summary.failed += 1;
                }
            }
        }
        debug!(
            "restored artifact {fingerprint}: {} files ({} failed)",
            summary.restored, summary.failed
        );
        Ok(Some((metadata, summary)))
    }

    /// Whether an artifact exists locally or, failing that, remotely.
    pub async fn exists(&self, fingerprint: &str) -> bool {
        if self
            .artifacts_dir
            .join(fingerprint)
            .join(META_FILE)
            .exists()
        {
            return true;
        }
        match &self.remote {
            Some(remote) => remote.has(fingerprint).await.unwrap_or(false),
            None => false,
        }
    }

    /// Drop artifacts older than `max_age` and garbage-collect content
    /// objects nothing references anymore.
    pub fn cleanup(&self, max_age: std::time::Duration) -> Result<usize, CacheError> {
        let mut removed = 0;
        let now = std::time::SystemTime::now();
        if let Ok(entries) = self.artifacts_dir.read_dir_utf8() {
            for entry in entries.flatten() {
                let Ok(metadata) = entry.metadata() else {
                    continue;
                };
                let age = metadata
                    .modified()
                    .ok()
                    .and_then(|mtime| now.duration_since(mtime).ok())
                    .unwrap_or_default();
                if age >= max_age {
                    if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                        warn!("could not remove stale artifact {}: {e}", entry.path());
                    } else {
                        removed += 1;
                    }
                }
            }
        }
        self.store.cleanup(max_age)?;
        Ok(removed)
    }

    async fn fetch_remote(&self, fingerprint: &str) -> Option<RemotePayload> {
        let remote = self.remote.as_ref()?;
        match remote.get(fingerprint).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!("remote artifact {fingerprint} is malformed: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("remote cache lookup failed for {fingerprint}: {e}");
                None
            }
        }
    }
}

fn write_json<T: serde::Serialize>(path: &Utf8Path, value: &T) -> Result<(), CacheError> {
    let contents = serde_json::to_string(value).map_err(CacheError::MetadataWriteFailure)?;
    let tmp = path.with_extension(format!("json.{}.tmp", std::process::id()));
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Utf8Path) -> Result<T, CacheError> {
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(CacheError::InvalidMetadata)
}

#[cfg(unix)]
fn file_mode(path: &Utf8Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    path.metadata().map(|m| m.permissions().mode()).unwrap_or(0o644)
}

#[cfg(not(unix))]
fn file_mode(_path: &Utf8Path) -> u32 {
    0o644
}

#[cfg(unix)]
fn set_file_mode(path: &Utf8Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
        warn!("could not restore mode {mode:o} on {path}: {e}");
    }
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Utf8Path, _mode: u32) {}
