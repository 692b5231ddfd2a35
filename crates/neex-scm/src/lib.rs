//! Version-control integration. Everything shells out to the `git` binary;
//! the orchestrator never links a VCS library. Every failure mode (no
//! repository, no commits, missing binary) degrades to "no known changes"
//! so callers can carry on.

use std::{collections::BTreeSet, process::Command};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, trace};

/// Default ref to diff against when the caller does not name one.
pub const DEFAULT_BASE_REF: &str = "HEAD~1";

/// Files touched since a base ref, as repo-relative paths. The union of
/// committed-diff, staged, unstaged, and untracked files.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChangedFiles {
    pub files: BTreeSet<Utf8PathBuf>,
}

pub struct Scm {
    repo_root: Utf8PathBuf,
}

impl Scm {
    pub fn new(repo_root: &Utf8Path) -> Self {
        Self {
            repo_root: repo_root.to_owned(),
        }
    }

    /// Union of every kind of pending change against `base_ref`. Returns an
    /// empty set whenever git is unusable; absence of information is not an
    /// error here.
    #[tracing::instrument(skip(self))]
    pub fn changed_files(&self, base_ref: Option<&str>) -> ChangedFiles {
        let base_ref = base_ref.unwrap_or(DEFAULT_BASE_REF);
        let mut files = BTreeSet::new();

        // committed changes relative to the base ref
        files.extend(self.git_lines(&["diff", "--name-only", base_ref]));
        // staged
        files.extend(self.git_lines(&["diff", "--name-only", "--cached"]));
        // unstaged
        files.extend(self.git_lines(&["diff", "--name-only"]));
        // untracked
        files.extend(self.git_lines(&["ls-files", "--others", "--exclude-standard"]));

        debug!("{} changed files against {base_ref}", files.len());
        ChangedFiles { files }
    }

    /// Whether the root is inside a git work tree at all.
    pub fn is_repository(&self) -> bool {
        !self
            .git_lines(&["rev-parse", "--is-inside-work-tree"])
            .is_empty()
    }

    fn git_lines(&self, args: &[&str]) -> Vec<Utf8PathBuf> {
        let output = match Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                trace!("git {args:?} failed to spawn: {e}");
                return Vec::new();
            }
        };
        if !output.status.success() {
            trace!(
                "git {args:?} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Vec::new();
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(Utf8PathBuf::from)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use tempfile::tempdir;

    use super::*;

    fn git(root: &Utf8Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(root)
            .env("GIT_AUTHOR_NAME", "test")
            .env("GIT_AUTHOR_EMAIL", "test@example.com")
            .env("GIT_COMMITTER_NAME", "test")
            .env("GIT_COMMITTER_EMAIL", "test@example.com")
            .status()
            .expect("git runs");
        assert!(status.success(), "git {args:?} failed");
    }

    #[test]
    fn test_outside_repository_is_empty() -> Result<()> {
        let dir = tempdir()?;
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let scm = Scm::new(root);
        assert!(scm.changed_files(None).files.is_empty());
        Ok(())
    }

    #[test]
    fn test_untracked_staged_and_committed_changes() -> Result<()> {
        let dir = tempdir()?;
        let root = Utf8Path::from_path(dir.path()).unwrap();
        git(root, &["init", "-q"]);

        std::fs::write(root.join("first.txt"), "one")?;
        git(root, &["add", "."]);
        git(root, &["commit", "-qm", "first"]);

        std::fs::write(root.join("first.txt"), "one changed")?;
        git(root, &["add", "."]);
        git(root, &["commit", "-qm", "second"]);

        std::fs::write(root.join("staged.txt"), "staged")?;
        git(root, &["add", "staged.txt"]);
        std::fs::write(root.join("untracked.txt"), "untracked")?;

        let scm = Scm::new(root);
        let changed = scm.changed_files(Some("HEAD~1"));
        let names: Vec<_> = changed.files.iter().map(|f| f.as_str()).collect();
        assert_eq!(names, vec!["first.txt", "staged.txt", "untracked.txt"]);
        Ok(())
    }

    #[test]
    fn test_bad_ref_degrades_to_other_changes() -> Result<()> {
        let dir = tempdir()?;
        let root = Utf8Path::from_path(dir.path()).unwrap();
        git(root, &["init", "-q"]);
        std::fs::write(root.join("untracked.txt"), "u")?;

        // HEAD~1 does not resolve in a repo with no commits; the diff leg
        // yields nothing but untracked files still surface
        let scm = Scm::new(root);
        let changed = scm.changed_files(None);
        let names: Vec<_> = changed.files.iter().map(|f| f.as_str()).collect();
        assert_eq!(names, vec!["untracked.txt"]);
        Ok(())
    }
}
