use std::collections::BTreeMap;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::Error;

/// The subset of `package.json` the orchestrator cares about. Unknown
/// fields are ignored so arbitrary manifests parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PackageJson {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub dev_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub workspaces: Vec<String>,
}

impl PackageJson {
    /// Load the root manifest. Missing or malformed roots are fatal, unlike
    /// workspace members which are skipped silently by discovery.
    pub fn load_root(path: &Utf8Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)
            .map_err(|_| Error::MissingRootManifest(path.to_owned()))?;
        serde_json::from_str(&contents).map_err(|source| Error::InvalidRootManifest {
            path: path.to_owned(),
            source,
        })
    }

    /// Try to load a workspace member manifest; `None` covers both missing
    /// and malformed files.
    pub fn load_member(path: &Utf8Path) -> Option<Self> {
        let contents = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// Names declared in `dependencies` or `devDependencies`.
    pub fn all_dependency_names(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .keys()
            .chain(self.dev_dependencies.keys())
            .map(String::as_str)
    }
}
