//! S3-compatible remote mirror of the artifact cache. Every operation is
//! best effort: callers treat failures as "not cached" and keep going with
//! the local cache as the source of truth.

use camino::Utf8Path;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    sigv4::{sha256_hex, sign_headers, SigningKeys},
    CacheError,
};

/// Credentials and addressing for the remote bucket, persisted at
/// `.neex/remote-cache.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCacheConfig {
    pub provider: String,
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

impl RemoteCacheConfig {
    pub fn load(path: &Utf8Path) -> Option<Self> {
        let contents = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("ignoring malformed remote cache config at {path}: {e}");
                None
            }
        }
    }

    pub fn save(&self, path: &Utf8Path) -> Result<(), CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents =
            serde_json::to_string_pretty(self).map_err(CacheError::RemoteConfig)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Remove the stored configuration; true when a file was dropped.
    pub fn clear(path: &Utf8Path) -> Result<bool, CacheError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct RemoteCache {
    client: reqwest::Client,
    config: RemoteCacheConfig,
    host: String,
    base_path: String,
}

impl RemoteCache {
    pub fn new(config: RemoteCacheConfig) -> Result<Self, CacheError> {
        let url = reqwest::Url::parse(&config.endpoint)
            .map_err(|_| CacheError::RemoteNotConfigured)?;
        let mut host = url.host_str().unwrap_or_default().to_string();
        if let Some(port) = url.port() {
            host = format!("{host}:{port}");
        }
        let base_path = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            config.bucket
        );
        Ok(Self {
            client: reqwest::Client::new(),
            config,
            host,
            base_path,
        })
    }

    /// Bucket key for an artifact: shard on the first two hex characters.
    fn key(hash: &str) -> String {
        let (shard, rest) = hash.split_at(2.min(hash.len()));
        format!("cache/{shard}/{rest}.tar.gz")
    }

    fn url_and_path(&self, key: &str) -> (String, String) {
        let canonical = format!("{}/{key}", self.base_path);
        let url = format!(
            "{}/{}/{key}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.bucket
        );
        (url, canonical)
    }

    fn signing_keys(&self) -> SigningKeys<'_> {
        SigningKeys {
            access_key: &self.config.access_key,
            secret_key: &self.config.secret_key,
            region: &self.config.region,
        }
    }

    pub async fn put(&self, hash: &str, bytes: Vec<u8>) -> Result<(), CacheError> {
        let (url, canonical) = self.url_and_path(&Self::key(hash));
        let payload_hash = sha256_hex(&bytes);
        let mut request = self.client.put(&url).body(bytes);
        for (name, value) in sign_headers(
            "PUT",
            &self.host,
            &canonical,
            &payload_hash,
            &self.signing_keys(),
            Utc::now(),
        ) {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(CacheError::RemoteStatus(response.status().as_u16()));
        }
        debug!("uploaded artifact {hash} to remote cache");
        Ok(())
    }

    pub async fn get(&self, hash: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let (url, canonical) = self.url_and_path(&Self::key(hash));
        let payload_hash = sha256_hex(b"");
        let mut request = self.client.get(&url);
        for (name, value) in sign_headers(
            "GET",
            &self.host,
            &canonical,
            &payload_hash,
            &self.signing_keys(),
            Utc::now(),
        ) {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        match response.status() {
            status if status.is_success() => Ok(Some(response.bytes().await?.to_vec())),
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status => Err(CacheError::RemoteStatus(status.as_u16())),
        }
    }

    pub async fn has(&self, hash: &str) -> Result<bool, CacheError> {
        let (url, canonical) = self.url_and_path(&Self::key(hash));
        let payload_hash = sha256_hex(b"");
        let mut request = self.client.head(&url);
        for (name, value) in sign_headers(
            "HEAD",
            &self.host,
            &canonical,
            &payload_hash,
            &self.signing_keys(),
            Utc::now(),
        ) {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            status => Err(CacheError::RemoteStatus(status.as_u16())),
        }
    }

    /// Probe the bucket. Any response the server answers at all counts as
    /// reachable as long as it is not an auth rejection or server error.
    pub async fn check_connection(&self) -> bool {
        let (url, canonical) = self.url_and_path("");
        let payload_hash = sha256_hex(b"");
        let mut request = self.client.head(&url);
        for (name, value) in sign_headers(
            "HEAD",
            &self.host,
            &canonical,
            &payload_hash,
            &self.signing_keys(),
            Utc::now(),
        ) {
            request = request.header(name, value);
        }
        match request.send().await {
            Ok(response) => {
                let status = response.status();
                status.is_success() || status == reqwest::StatusCode::NOT_FOUND
            }
            Err(e) => {
                warn!("remote cache unreachable: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use tempfile::tempdir;

    use super::*;

    fn config() -> RemoteCacheConfig {
        RemoteCacheConfig {
            provider: "s3".into(),
            endpoint: "https://storage.example.com".into(),
            bucket: "builds".into(),
            access_key: "key".into(),
            secret_key: "secret".into(),
            region: "auto".into(),
        }
    }

    #[test]
    fn test_key_sharding() {
        assert_eq!(
            RemoteCache::key("abcdef0123456789"),
            "cache/ab/cdef0123456789.tar.gz"
        );
    }

    #[test]
    fn test_url_construction() -> Result<()> {
        let cache = RemoteCache::new(config())?;
        let (url, canonical) = cache.url_and_path(&RemoteCache::key("aabb"));
        assert_eq!(
            url,
            "https://storage.example.com/builds/cache/aa/bb.tar.gz"
        );
        assert_eq!(canonical, "/builds/cache/aa/bb.tar.gz");
        Ok(())
    }

    #[test]
    fn test_config_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let path =
            camino::Utf8PathBuf::from_path_buf(dir.path().join("remote-cache.json")).unwrap();
        let config = config();
        config.save(&path)?;
        assert_eq!(RemoteCacheConfig::load(&path), Some(config));

        assert!(RemoteCacheConfig::clear(&path)?);
        assert!(!RemoteCacheConfig::clear(&path)?);
        assert_eq!(RemoteCacheConfig::load(&path), None);
        Ok(())
    }
}
