//! Smart watch mode: debounced, affected-only rebuilds driven by
//! filesystem events.

use std::{collections::HashSet, sync::Arc};

use camino::Utf8PathBuf;
use neex_filewatch::{Debouncer, FileSystemWatcher};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    run::Run,
    signal::SignalHandler,
    Error, INTERRUPT_EXIT_CODE,
};

/// Drive rebuilds of `task` until interrupted. One rebuild runs at a
/// time; events arriving during a rebuild accumulate and trigger exactly
/// one follow-up.
pub async fn watch(run: &Run, task: &str, handler: &SignalHandler) -> Result<i32, Error> {
    let roots: Vec<Utf8PathBuf> = run
        .package_graph()
        .packages()
        .map(|package| {
            let src = package.dir.join("src");
            if src.is_dir() {
                src
            } else {
                package.dir.clone()
            }
        })
        .collect();
    if roots.is_empty() {
        println!("no packages to watch");
        return Ok(0);
    }

    let watcher = FileSystemWatcher::new(&roots)?;
    let mut events = watcher.subscribe();

    let Some(subscriber) = handler.subscribe() else {
        return Ok(INTERRUPT_EXIT_CODE);
    };
    let mut cancelled = Box::pin(subscriber.listen());

    // initial full pass so the watch starts from a consistent state
    let tasks = vec![task.to_string()];
    let summary = run.run_tasks(&tasks, None, false).await?;
    summary.emit(run.events_sender());
    println!("watching {} packages for changes...", run.package_graph().len());

    let mut pending: HashSet<String> = HashSet::new();
    loop {
        // wait for the first interesting event unless a rebuild is
        // already owed from changes that arrived mid-run
        if pending.is_empty() {
            tokio::select! {
                _guard = &mut cancelled => break,
                event = events.recv() => match event {
                    Ok(path) => note_change(run, &path, &mut pending),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("missed {n} filesystem events, rebuilding everything");
                        pending.extend(run.package_graph().packages().map(|p| p.name.clone()));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
            if pending.is_empty() {
                continue;
            }
        }

        // debounce: keep absorbing events until the window stays quiet
        let debouncer = Arc::new(Debouncer::default());
        let settle = {
            let debouncer = debouncer.clone();
            async move { debouncer.settle().await }
        };
        tokio::pin!(settle);
        let interrupted = loop {
            tokio::select! {
                _guard = &mut cancelled => break true,
                _ = &mut settle => break false,
                event = events.recv() => {
                    if let Ok(path) = event {
                        note_change(run, &path, &mut pending);
                        debouncer.bump();
                    }
                }
            }
        };
        if interrupted {
            break;
        }

        // affected closure, narrowed to packages that declare the task
        let affected: HashSet<String> = run
            .package_graph()
            .dependents_closure(pending.iter().map(String::as_str))
            .into_iter()
            .filter(|name| {
                run.package_graph()
                    .package_info(name)
                    .is_some_and(|info| info.script(task).is_some())
            })
            .collect();
        pending.clear();

        if affected.is_empty() {
            continue;
        }
        debug!("rebuilding {} affected packages", affected.len());
        // failures must not stop sibling rebuilds in watch mode
        let summary = run.run_tasks(&tasks, Some(affected), false).await?;
        summary.emit(run.events_sender());

        // changes that landed during the rebuild queue exactly one
        // follow-up pass
        loop {
            match events.try_recv() {
                Ok(path) => note_change(run, &path, &mut pending),
                Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    pending.extend(run.package_graph().packages().map(|p| p.name.clone()));
                }
                Err(_) => break,
            }
        }
    }

    Ok(INTERRUPT_EXIT_CODE)
}

fn note_change(run: &Run, path: &Utf8PathBuf, pending: &mut HashSet<String>) {
    let repo_root = run.repo_root();
    let relative = path.strip_prefix(repo_root).unwrap_or(path);
    if let Some(package) = run.package_graph().package_for_file(relative) {
        debug!("{relative} maps to {}", package.name);
        pending.insert(package.name.clone());
    }
}
