use std::fmt;

use camino::Utf8Path;

/// Package manager the repository uses, inferred from canonical marker
/// files. Decides how scripts are invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Pnpm,
    Yarn,
    Bun,
    Npm,
}

/// Marker files in priority order; the first that exists wins.
const MARKERS: &[(&str, PackageManager)] = &[
    ("pnpm-lock.yaml", PackageManager::Pnpm),
    ("yarn.lock", PackageManager::Yarn),
    ("bun.lockb", PackageManager::Bun),
    ("package-lock.json", PackageManager::Npm),
    ("pnpm-workspace.yaml", PackageManager::Pnpm),
    ("nx.json", PackageManager::Npm),
    ("lerna.json", PackageManager::Npm),
    ("rush.json", PackageManager::Npm),
];

impl PackageManager {
    pub fn detect(repo_root: &Utf8Path) -> Self {
        for (marker, manager) in MARKERS {
            if repo_root.join(marker).exists() {
                return *manager;
            }
        }
        PackageManager::Npm
    }

    /// Shell command that runs a named script in the current directory.
    pub fn run_command(&self, script: &str) -> String {
        format!("{} run {script}", self.binary())
    }

    pub fn binary(&self) -> &'static str {
        match self {
            PackageManager::Pnpm => "pnpm",
            PackageManager::Yarn => "yarn",
            PackageManager::Bun => "bun",
            PackageManager::Npm => "npm",
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}
