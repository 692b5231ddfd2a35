//! Task fingerprinting: the deterministic digest of everything that, if
//! changed, must invalidate a task's cached artifact.

use std::{collections::HashMap, sync::Arc};

use itertools::Itertools;
use neex_engine::{TaskDefinition, TaskId};
use neex_hash::FileHasher;
use neex_repository::PackageGraph;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

/// Bumping this invalidates every artifact produced under older schemas.
pub const FINGERPRINT_SCHEMA_VERSION: &str = "1";

const PART_SEPARATOR: &str = "|";

/// Computes and memoizes task fingerprints for one run. Package content
/// hashes are cached per `(package, inputs)` so shared dependencies are
/// hashed once no matter how many dependents fingerprint them.
pub struct TaskHasher {
    file_hasher: Arc<FileHasher>,
    package_hashes: Mutex<HashMap<(String, Option<Vec<String>>), u64>>,
}

impl TaskHasher {
    pub fn new(file_hasher: Arc<FileHasher>) -> Self {
        Self {
            file_hasher,
            package_hashes: Mutex::new(HashMap::new()),
        }
    }

    /// Fingerprint a task. The composition is ordered and sorted where the
    /// underlying data is a set, so identical repository states always
    /// produce byte-identical fingerprints.
    pub async fn fingerprint(
        &self,
        package_graph: &PackageGraph,
        task_id: &TaskId,
        definition: &TaskDefinition,
        command: &str,
    ) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(8);

        let package = package_graph
            .package_info(task_id.package())
            .expect("fingerprinted tasks come from the package graph");
        let package_hash = self
            .package_hash(package_graph, task_id.package(), definition.inputs.as_deref())
            .await;
        parts.push(format!(
            "pkg:{}:{}",
            package.name,
            neex_hash::hex64(package_hash)
        ));

        for dep_name in package.internal_dependencies.iter().sorted() {
            let dep_hash = self.package_hash(package_graph, dep_name, None).await;
            parts.push(format!("dep:{dep_name}:{}", neex_hash::hex64(dep_hash)));
        }

        parts.push(format!("cmd:{command}"));

        if let Some(inputs) = &definition.inputs {
            parts.push(format!("inputs:{}", inputs.iter().sorted().join(",")));
        }
        if !definition.outputs.is_empty() {
            parts.push(format!(
                "outputs:{}",
                definition.outputs.iter().sorted().join(",")
            ));
        }

        parts.push(format!("task:{}", task_id.task()));
        parts.push(format!("schema:{FINGERPRINT_SCHEMA_VERSION}"));

        let digest = Sha256::digest(parts.join(PART_SEPARATOR).as_bytes());
        let fingerprint = hex::encode(digest);
        debug!("fingerprint for {task_id} is {fingerprint}");
        fingerprint
    }

    async fn package_hash(
        &self,
        package_graph: &PackageGraph,
        package_name: &str,
        inputs: Option<&[String]>,
    ) -> u64 {
        let key = (package_name.to_string(), inputs.map(<[String]>::to_vec));
        {
            let memo = self.package_hashes.lock().await;
            if let Some(hash) = memo.get(&key) {
                return *hash;
            }
        }
        let hash = match package_graph.package_info(package_name) {
            Some(info) => {
                // manifest hash folded in so dependency bumps that change
                // no source file still move the package hash
                let tree = neex_hash::package_hash(&self.file_hasher, &info.dir, inputs).await;
                tree ^ info.manifest_hash
            }
            None => 0,
        };
        self.package_hashes.lock().await.insert(key, hash);
        hash
    }
}
