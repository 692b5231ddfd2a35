//! End-to-end runs over real workspaces on disk: scheduling, caching,
//! restoration, and failure fan-out, all through the public `Run` surface.

use std::time::Instant;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use neex_lib::{
    cli::Args,
    events,
    run::{
        summary::{TaskOutcome, TaskResult},
        Run,
    },
};

fn args(argv: &[&str]) -> Args {
    Args::parse_from(argv)
}

fn write_package(root: &Utf8Path, dir: &str, manifest: &str) {
    let dir = root.join(dir);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("package.json"), manifest).unwrap();
}

fn two_package_repo() -> Result<(tempfile::TempDir, Utf8PathBuf)> {
    let dir = tempfile::tempdir()?;
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    std::fs::write(
        root.join("package.json"),
        r#"{"name": "fixture", "workspaces": ["packages/*"]}"#,
    )?;
    std::fs::write(
        root.join("neex.json"),
        r#"{"pipeline": {"build": {"dependsOn": ["^build"], "outputs": ["dist"]}}}"#,
    )?;
    write_package(
        &root,
        "packages/lib",
        r#"{"name": "lib",
            "scripts": {"build": "mkdir -p dist && echo lib > dist/out"}}"#,
    );
    write_package(
        &root,
        "packages/app",
        r#"{"name": "app",
            "scripts": {"build": "mkdir -p dist && cat ../lib/dist/out > dist/out && echo app >> dist/out"},
            "dependencies": {"lib": "workspace:*"}}"#,
    );
    Ok((dir, root))
}

fn outcome<'a>(results: &'a [TaskResult], id: &str) -> &'a TaskOutcome {
    &results
        .iter()
        .find(|r| r.task_id.to_string() == id)
        .unwrap_or_else(|| panic!("no result for {id}"))
        .outcome
}

async fn run_build(root: &Utf8Path, argv: &[&str]) -> Result<neex_lib::run::RunSummary> {
    let (events_tx, _events_rx) = events::channel();
    let run = Run::build(root.to_owned(), &args(argv), events_tx)?;
    let summary = run
        .run_tasks(&["build".to_string()], None, run.opts().stop_on_error)
        .await?;
    run.flush_tracker();
    Ok(summary)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_package_build_then_cache_hit_and_restore() -> Result<()> {
    let (_dir, root) = two_package_repo()?;

    // first run executes lib before app and produces correct outputs
    let summary = run_build(&root, &["neex", "build"]).await?;
    assert_eq!(summary.total(), 2);
    assert!(matches!(
        outcome(&summary.results, "lib:build"),
        TaskOutcome::Success { cached: false, .. }
    ));
    assert!(matches!(
        outcome(&summary.results, "app:build"),
        TaskOutcome::Success { cached: false, .. }
    ));
    let app_out = root.join("packages/app/dist/out");
    assert_eq!(std::fs::read_to_string(&app_out)?, "lib\napp\n");

    // unchanged inputs: both tasks replay from cache
    let summary = run_build(&root, &["neex", "build"]).await?;
    assert_eq!(summary.cached(), 2);

    // wiping outputs and re-running restores byte-identical files without
    // re-executing
    std::fs::remove_dir_all(root.join("packages/lib/dist"))?;
    std::fs::remove_dir_all(root.join("packages/app/dist"))?;
    let summary = run_build(&root, &["neex", "build"]).await?;
    assert_eq!(summary.cached(), 2);
    assert_eq!(std::fs::read_to_string(&app_out)?, "lib\napp\n");
    assert_eq!(
        std::fs::read_to_string(root.join("packages/lib/dist/out"))?,
        "lib\n"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_source_change_invalidates_only_downstream() -> Result<()> {
    let (_dir, root) = two_package_repo()?;
    // seed source files so there is something to edit
    std::fs::create_dir_all(root.join("packages/lib/src"))?;
    std::fs::create_dir_all(root.join("packages/app/src"))?;
    std::fs::write(root.join("packages/lib/src/index.ts"), "export {};")?;
    std::fs::write(root.join("packages/app/src/index.ts"), "export {};")?;

    run_build(&root, &["neex", "build"]).await?;

    // editing app's source leaves lib cached but re-runs app
    std::fs::write(
        root.join("packages/app/src/index.ts"),
        "export const changed = 1;",
    )?;
    let summary = run_build(&root, &["neex", "build"]).await?;
    assert!(matches!(
        outcome(&summary.results, "lib:build"),
        TaskOutcome::Success { cached: true, .. }
    ));
    assert!(matches!(
        outcome(&summary.results, "app:build"),
        TaskOutcome::Success { cached: false, .. }
    ));

    // editing lib's source invalidates both (app depends on lib's hash)
    std::fs::write(
        root.join("packages/lib/src/index.ts"),
        "export const changed = 2;",
    )?;
    let summary = run_build(&root, &["neex", "build"]).await?;
    assert!(matches!(
        outcome(&summary.results, "lib:build"),
        TaskOutcome::Success { cached: false, .. }
    ));
    assert!(matches!(
        outcome(&summary.results, "app:build"),
        TaskOutcome::Success { cached: false, .. }
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_skips_dependents() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    std::fs::write(
        root.join("package.json"),
        r#"{"name": "fixture", "workspaces": ["packages/*"]}"#,
    )?;
    std::fs::write(
        root.join("neex.json"),
        r#"{"pipeline": {"build": {"dependsOn": ["^build"], "outputs": ["dist"]}}}"#,
    )?;
    write_package(
        &root,
        "packages/x",
        r#"{"name": "x", "scripts": {"build": "false"}}"#,
    );
    write_package(
        &root,
        "packages/y",
        r#"{"name": "y",
            "scripts": {"build": "mkdir -p dist && echo y > dist/out"},
            "dependencies": {"x": "workspace:*"}}"#,
    );

    let summary = run_build(&root, &["neex", "build"]).await?;
    assert_eq!(summary.exit_code(), 1);
    assert!(matches!(
        outcome(&summary.results, "x:build"),
        TaskOutcome::Failed {
            exit_code: Some(1),
            ..
        }
    ));
    assert!(matches!(
        outcome(&summary.results, "y:build"),
        TaskOutcome::Skipped
    ));
    // y was never spawned and x failed: no outputs, no artifacts
    assert!(!root.join("packages/y/dist").exists());
    let artifacts = root.join(".neex/cache/artifacts");
    let artifact_count = artifacts
        .read_dir_utf8()
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(artifact_count, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_run_emits_one_task_end_per_task() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    std::fs::write(
        root.join("package.json"),
        r#"{"name": "fixture", "workspaces": ["packages/*"]}"#,
    )?;
    std::fs::write(
        root.join("neex.json"),
        r#"{"pipeline": {"build": {"dependsOn": ["^build"], "outputs": ["dist"]}}}"#,
    )?;
    write_package(
        &root,
        "packages/x",
        r#"{"name": "x", "scripts": {"build": "echo failing >&2 && false"}}"#,
    );
    write_package(
        &root,
        "packages/y",
        r#"{"name": "y",
            "scripts": {"build": "mkdir -p dist && echo y > dist/out"},
            "dependencies": {"x": "workspace:*"}}"#,
    );
    write_package(
        &root,
        "packages/z",
        r#"{"name": "z", "scripts": {"build": "echo z"}}"#,
    );

    let (events_tx, mut events_rx) = events::channel();
    let run = Run::build(root, &args(&["neex", "build"]), events_tx.clone())?;
    let summary = run.run_tasks(&["build".to_string()], None, false).await?;
    summary.emit(&events_tx);
    drop(run);
    drop(events_tx);

    let mut task_ends: std::collections::HashMap<String, usize> =
        std::collections::HashMap::new();
    while let Some(event) = events_rx.recv().await {
        if let neex_lib::events::Event::TaskEnd { id, .. } = event {
            *task_ends.entry(id.to_string()).or_default() += 1;
        }
    }

    // executed tasks report exactly one TaskEnd each, even the failure;
    // y:build was skipped before starting and reports none
    assert_eq!(task_ends.get("x:build"), Some(&1));
    assert_eq!(task_ends.get("z:build"), Some(&1));
    assert_eq!(task_ends.get("y:build"), None);
    assert!(task_ends.values().all(|count| *count == 1));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_independent_tasks_run_concurrently() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    std::fs::write(
        root.join("package.json"),
        r#"{"name": "fixture", "workspaces": ["packages/*"]}"#,
    )?;
    std::fs::write(
        root.join("neex.json"),
        r#"{"pipeline": {"build": {"cache": false}}}"#,
    )?;
    for name in ["a", "b", "c"] {
        write_package(
            &root,
            &format!("packages/{name}"),
            &format!(r#"{{"name": "{name}", "scripts": {{"build": "sleep 0.5"}}}}"#),
        );
    }

    let started = Instant::now();
    let summary = run_build(&root, &["neex", "build", "--max-parallel", "3"]).await?;
    let parallel_elapsed = started.elapsed();
    assert_eq!(summary.successes(), 3);
    assert!(
        parallel_elapsed.as_millis() < 1400,
        "three 500ms sleeps at concurrency 3 took {parallel_elapsed:?}"
    );

    let started = Instant::now();
    run_build(&root, &["neex", "build", "--max-parallel", "1"]).await?;
    let serial_elapsed = started.elapsed();
    assert!(
        serial_elapsed.as_millis() >= 1400,
        "three 500ms sleeps at concurrency 1 took {serial_elapsed:?}"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_task_set_returns_immediately() -> Result<()> {
    let (_dir, root) = two_package_repo()?;
    let (events_tx, _events_rx) = events::channel();
    let run = Run::build(root.clone(), &args(&["neex", "deploy"]), events_tx)?;
    let summary = run
        .run_tasks(&["deploy".to_string()], None, false)
        .await?;
    assert_eq!(summary.total(), 0);
    assert_eq!(summary.exit_code(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dry_run_reports_cache_state_without_executing() -> Result<()> {
    let (_dir, root) = two_package_repo()?;
    let (events_tx, _events_rx) = events::channel();
    let run = Run::build(root.clone(), &args(&["neex", "build"]), events_tx)?;

    // nothing has run yet: everything is a miss and nothing executes
    let rows = run.dry_run(&["build".to_string()], None).await?;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| !row.cached));
    assert!(rows.iter().all(|row| row.fingerprint.is_some()));
    assert!(!root.join("packages/lib/dist").exists());

    // after a real run the same rows report hits
    run.run_tasks(&["build".to_string()], None, false).await?;
    let rows = run.dry_run(&["build".to_string()], None).await?;
    assert!(rows.iter().all(|row| row.cached));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_graph_rendering_lists_edges() -> Result<()> {
    let (_dir, root) = two_package_repo()?;
    let (events_tx, _events_rx) = events::channel();
    let run = Run::build(root, &args(&["neex", "build"]), events_tx)?;

    let mut rendered = Vec::new();
    run.print_graph(&["build".to_string()], None, &mut rendered)?;
    let rendered = String::from_utf8(rendered)?;
    assert!(rendered.contains("\"app:build\" -> \"lib:build\""));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_force_reexecutes_with_cache_writeback() -> Result<()> {
    let (_dir, root) = two_package_repo()?;
    run_build(&root, &["neex", "build"]).await?;

    let summary = run_build(&root, &["neex", "build", "--force"]).await?;
    assert_eq!(summary.cached(), 0);
    assert_eq!(summary.successes(), 2);

    // the forced run refreshed the cache, a normal run hits again
    let summary = run_build(&root, &["neex", "build"]).await?;
    assert_eq!(summary.cached(), 2);
    Ok(())
}
