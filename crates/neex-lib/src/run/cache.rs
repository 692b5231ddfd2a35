use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use neex_cache::{ArtifactCache, ArtifactMetadata, RemoteCache, RestoreSummary};
use tracing::warn;

/// Cache surface for one run. Holds the artifact cache and the run-wide
/// read policy (`--force` skips reads but keeps writes).
pub struct RunCache {
    cache: ArtifactCache,
    repo_root: Utf8PathBuf,
    reads_enabled: bool,
}

impl RunCache {
    pub fn new(repo_root: &Utf8Path, remote: Option<RemoteCache>, force: bool) -> Self {
        Self {
            cache: ArtifactCache::new(&repo_root.join(".neex/cache"), remote),
            repo_root: repo_root.to_owned(),
            reads_enabled: !force,
        }
    }

    pub fn artifact_cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Per-task view: fingerprint plus the task's repo-relative outputs.
    /// `fingerprint: None` marks an uncacheable task; both ends become
    /// no-ops.
    pub fn task_cache(
        self: &Arc<Self>,
        fingerprint: Option<String>,
        outputs: Vec<Utf8PathBuf>,
    ) -> TaskCache {
        TaskCache {
            run_cache: Arc::clone(self),
            fingerprint,
            outputs,
        }
    }
}

pub struct TaskCache {
    run_cache: Arc<RunCache>,
    fingerprint: Option<String>,
    outputs: Vec<Utf8PathBuf>,
}

impl TaskCache {
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    /// Attempt a cache hit. Any cache failure degrades to a miss; the
    /// command must still run.
    pub async fn restore(&self) -> Option<(ArtifactMetadata, RestoreSummary)> {
        let fingerprint = self.fingerprint.as_deref()?;
        if !self.run_cache.reads_enabled {
            return None;
        }
        match self
            .run_cache
            .cache
            .restore(&self.run_cache.repo_root, fingerprint)
            .await
        {
            Ok(hit) => hit,
            Err(e) => {
                warn!("cache restore failed for {fingerprint}, re-running: {e}");
                None
            }
        }
    }

    /// Record a successful execution. Failures only warn; caching is never
    /// allowed to fail the task that just succeeded.
    pub async fn save(&self, metadata: ArtifactMetadata) {
        let Some(fingerprint) = self.fingerprint.as_deref() else {
            return;
        };
        if let Err(e) = self
            .run_cache
            .cache
            .save(
                &self.run_cache.repo_root,
                fingerprint,
                &self.outputs,
                metadata,
            )
            .await
        {
            warn!("cache save failed for {fingerprint}: {e}");
        }
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use tempfile::tempdir;

    use super::*;

    fn metadata() -> ArtifactMetadata {
        ArtifactMetadata {
            hash: "fp".into(),
            exit_code: 0,
            duration: 10,
            timestamp: 0,
            stdout: vec!["out".into()],
            stderr: vec![],
        }
    }

    #[tokio::test]
    async fn test_uncacheable_task_never_hits() -> Result<()> {
        let dir = tempdir()?;
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let run_cache = Arc::new(RunCache::new(root, None, false));
        let task_cache = run_cache.task_cache(None, vec![]);

        task_cache.save(metadata()).await;
        assert!(task_cache.restore().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_force_skips_reads_but_writes() -> Result<()> {
        let dir = tempdir()?;
        let root = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::create_dir_all(root.join("dist"))?;
        std::fs::write(root.join("dist/out.txt"), "x")?;

        let forced = Arc::new(RunCache::new(root, None, true));
        let task_cache = forced.task_cache(
            Some("fp".to_string()),
            vec![Utf8PathBuf::from("dist")],
        );
        task_cache.save(metadata()).await;
        assert!(task_cache.restore().await.is_none(), "force skips reads");

        // a non-forced cache sees the artifact the forced run wrote
        let normal = Arc::new(RunCache::new(root, None, false));
        let task_cache = normal.task_cache(
            Some("fp".to_string()),
            vec![Utf8PathBuf::from("dist")],
        );
        assert!(task_cache.restore().await.is_some());
        Ok(())
    }
}
