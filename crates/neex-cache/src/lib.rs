//! The artifact cache: stores the outcome of a successful task execution
//! (metadata, captured output, and an output-file manifest) under its
//! fingerprint, with file bodies de-duplicated through the content store.
//! An optional S3-compatible remote mirrors the artifact payloads.

mod artifact;
pub mod remote;
mod sigv4;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use artifact::{ArtifactCache, RestoreSummary, SaveSummary};
pub use remote::{RemoteCache, RemoteCacheConfig};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("content store error: {0}")]
    Store(#[from] neex_cas::Error),
    #[error("invalid cache metadata file: {0}")]
    InvalidMetadata(serde_json::Error),
    #[error("failed to write cache metadata file: {0}")]
    MetadataWriteFailure(serde_json::Error),
    #[error("failed to contact remote cache: {0}")]
    Remote(#[from] reqwest::Error),
    #[error("remote cache returned status {0}")]
    RemoteStatus(u16),
    #[error("remote cache is not configured")]
    RemoteNotConfigured,
    #[error("invalid remote cache config: {0}")]
    RemoteConfig(serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    Local,
    Remote,
}

/// Metadata captured when a task ran, replayed verbatim on a cache hit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    pub hash: String,
    pub exit_code: i32,
    /// Wall-clock duration of the original execution, milliseconds.
    pub duration: u64,
    /// UNIX epoch milliseconds at save time.
    pub timestamp: u64,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactManifest {
    pub files: Vec<ManifestEntry>,
    pub total_size: u64,
    pub compressed_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Path relative to the repository root.
    pub path: camino::Utf8PathBuf,
    pub hash: String,
    pub size: u64,
    pub mode: u32,
}

/// The combined record shipped to the remote cache. Content objects stay
/// local; only the artifact payload is mirrored.
#[derive(Debug, Serialize, Deserialize)]
pub struct RemotePayload {
    pub metadata: ArtifactMetadata,
    pub manifest: ArtifactManifest,
}
