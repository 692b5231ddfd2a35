//! Pipeline configuration: read `neex.json` when it exists, otherwise
//! synthesize a pipeline from the root manifest's scripts.

use std::collections::HashMap;

use camino::Utf8Path;
use neex_engine::TaskDefinition;
use neex_repository::PackageJson;
use serde::Deserialize;
use tracing::debug;

use crate::Error;

pub const PIPELINE_FILE: &str = "neex.json";

/// `{ "pipeline": { "<task>": {...} }, "performance": {...} }`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipelineFile {
    #[serde(default)]
    pipeline: HashMap<String, PipelineEntry>,
    #[serde(default)]
    performance: PerformanceConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipelineEntry {
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    inputs: Option<Vec<String>>,
    #[serde(default)]
    outputs: Vec<String>,
    #[serde(default = "default_cache")]
    cache: bool,
    #[serde(default)]
    persistent: bool,
}

fn default_cache() -> bool {
    true
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceConfig {
    pub max_parallel: Option<usize>,
}

#[derive(Debug)]
pub struct Pipeline {
    pub tasks: HashMap<String, TaskDefinition>,
    pub performance: PerformanceConfig,
}

impl Pipeline {
    /// Load the pipeline for a repository. A malformed config file is a
    /// fatal configuration error; a missing one falls back to zero-config
    /// synthesis from the root manifest's scripts.
    pub fn load(repo_root: &Utf8Path, root_manifest: &PackageJson) -> Result<Self, Error> {
        let path = repo_root.join(PIPELINE_FILE);
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let file: PipelineFile = serde_json::from_str(&contents)
                    .map_err(|source| Error::InvalidPipeline { path, source })?;
                let tasks = file
                    .pipeline
                    .into_iter()
                    .map(|(name, entry)| {
                        (
                            name,
                            TaskDefinition {
                                depends_on: entry.depends_on,
                                inputs: entry.inputs,
                                outputs: entry.outputs,
                                cache: entry.cache,
                                persistent: entry.persistent,
                            },
                        )
                    })
                    .collect();
                Ok(Self {
                    tasks,
                    performance: file.performance,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no {PIPELINE_FILE} found, synthesizing pipeline from root scripts");
                Ok(Self {
                    tasks: synthesize(root_manifest),
                    performance: PerformanceConfig::default(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Zero-config pipeline: defaults chosen by script name, then refined by
/// what the command string reveals. `pre*`/`post*` lifecycle scripts are
/// never tasks.
fn synthesize(root_manifest: &PackageJson) -> HashMap<String, TaskDefinition> {
    root_manifest
        .scripts
        .iter()
        .filter(|(name, _)| !name.starts_with("pre") && !name.starts_with("post"))
        .map(|(name, command)| (name.clone(), synthesize_task(name, command)))
        .collect()
}

pub(crate) fn synthesize_task(name: &str, command: &str) -> TaskDefinition {
    let mut definition = match name {
        "build" => TaskDefinition {
            depends_on: vec!["^build".into()],
            outputs: vec!["dist".into(), "build".into(), ".next".into(), ".nuxt".into()],
            ..Default::default()
        },
        "dev" | "start" => TaskDefinition {
            cache: false,
            persistent: true,
            ..Default::default()
        },
        "test" => TaskDefinition {
            outputs: vec!["coverage".into()],
            ..Default::default()
        },
        "lint" | "typecheck" | "type-check" => TaskDefinition::default(),
        _ => TaskDefinition::default(),
    };

    // command heuristics refine the name-based defaults
    let has_watch_flag = command
        .split_whitespace()
        .any(|token| token == "--watch" || token == "-w");
    if has_watch_flag {
        definition.cache = false;
        definition.persistent = true;
        definition.outputs.clear();
    } else if command.contains("next build") {
        definition.outputs = vec![".next".into()];
    } else if command.contains("vite build") {
        definition.outputs = vec!["dist".into()];
    } else if command.split_whitespace().any(|token| token == "tsc") {
        definition.outputs = vec!["dist".into()];
    }

    definition
}

/// Expand requested task patterns against the script names declared
/// anywhere in the workspace: `neex "build:*"` runs every matching
/// script. Non-glob names pass through untouched.
pub fn expand_task_patterns(
    requested: &[String],
    script_names: impl Iterator<Item = String>,
) -> Vec<String> {
    let names: Vec<String> = script_names.collect();
    let mut expanded = Vec::new();
    for pattern in requested {
        if !pattern.contains('*') {
            expanded.push(pattern.clone());
            continue;
        }
        match glob::Pattern::new(pattern) {
            Ok(matcher) => {
                let mut matches: Vec<String> = names
                    .iter()
                    .filter(|name| matcher.matches(name))
                    .cloned()
                    .collect();
                matches.sort_unstable();
                matches.dedup();
                expanded.extend(matches);
            }
            Err(_) => expanded.push(pattern.clone()),
        }
    }
    expanded.dedup();
    expanded
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_explicit_pipeline_wins() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::write(
            root.join(PIPELINE_FILE),
            r#"{
                "pipeline": {
                    "build": {"dependsOn": ["^build"], "outputs": ["dist"]},
                    "dev": {"cache": false, "persistent": true}
                },
                "performance": {"maxParallel": 6}
            }"#,
        )?;

        let pipeline = Pipeline::load(root, &PackageJson::default())?;
        let build = &pipeline.tasks["build"];
        assert_eq!(build.depends_on, vec!["^build".to_string()]);
        assert_eq!(build.outputs, vec!["dist".to_string()]);
        assert!(build.cache);
        assert!(pipeline.tasks["dev"].persistent);
        assert_eq!(pipeline.performance.max_parallel, Some(6));
        Ok(())
    }

    #[test]
    fn test_malformed_pipeline_is_fatal() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::write(root.join(PIPELINE_FILE), "{not json")?;
        assert!(matches!(
            Pipeline::load(root, &PackageJson::default()),
            Err(Error::InvalidPipeline { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_synthesis_excludes_lifecycle_scripts() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let manifest: PackageJson = serde_json::from_str(
            r#"{"name": "root", "scripts": {
                "build": "tsc -b",
                "prebuild": "rimraf dist",
                "postinstall": "husky install",
                "test": "vitest run"
            }}"#,
        )?;

        let pipeline = Pipeline::load(root, &manifest)?;
        let mut names: Vec<_> = pipeline.tasks.keys().collect();
        names.sort();
        assert_eq!(names, vec!["build", "test"]);
        Ok(())
    }

    #[test_case("build", "tsc -b", &["dist"], true, false ; "tsc overrides build outputs")]
    #[test_case("build", "next build", &[".next"], true, false ; "next build")]
    #[test_case("build", "vite build", &["dist"], true, false ; "vite build")]
    #[test_case("dev", "next dev", &[], false, true ; "dev server")]
    #[test_case("start", "node server.js", &[], false, true ; "start server")]
    #[test_case("check", "tsc --watch", &[], false, true ; "watch flag disables caching")]
    #[test_case("bundle", "rollup -c -w", &[], false, true ; "short watch flag")]
    #[test_case("test", "vitest run", &["coverage"], true, false ; "test outputs coverage")]
    #[test_case("lint", "eslint .", &[], true, false ; "lint is cached")]
    fn test_synthesized_defaults(
        name: &str,
        command: &str,
        outputs: &[&str],
        cache: bool,
        persistent: bool,
    ) {
        let definition = synthesize_task(name, command);
        assert_eq!(definition.outputs, outputs);
        assert_eq!(definition.cache, cache);
        assert_eq!(definition.persistent, persistent);
    }

    #[test]
    fn test_build_defaults_without_overrides() {
        let definition = synthesize_task("build", "webpack");
        assert_eq!(definition.depends_on, vec!["^build".to_string()]);
        assert_eq!(
            definition.outputs,
            vec![
                "dist".to_string(),
                "build".to_string(),
                ".next".to_string(),
                ".nuxt".to_string()
            ]
        );
    }

    #[test]
    fn test_wildcard_expansion() {
        let scripts = [
            "build".to_string(),
            "build:client".to_string(),
            "build:server".to_string(),
            "test".to_string(),
        ];
        let expanded = expand_task_patterns(
            &["build:*".to_string(), "test".to_string()],
            scripts.iter().cloned(),
        );
        assert_eq!(expanded, vec!["build:client", "build:server", "test"]);
    }
}
