use std::{collections::HashSet, sync::atomic::Ordering};

use neex_scm::Scm;

use crate::{
    cli::Args,
    events::{self, ConsoleLogger},
    run::{scope, Run},
    signal::{signal_source, SignalHandler},
    Error, INTERRUPT_EXIT_CODE,
};

pub async fn affected(args: &Args, task: String, base: Option<String>) -> Result<i32, Error> {
    let repo_root = crate::repo_root()?;
    let (events_tx, events_rx) = events::channel();
    let run = Run::build(repo_root, args, events_tx.clone())?;
    let logger = tokio::spawn(ConsoleLogger::new(run.opts().color).log(events_rx));

    let scm = Scm::new(run.repo_root());
    let affected = scope::affected_packages(run.package_graph(), &scm, base.as_deref());
    if affected.is_empty() {
        println!("no affected packages, nothing to do");
        drop(run);
        drop(events_tx);
        logger.await.ok();
        return Ok(0);
    }

    for package in &affected {
        match package.reason {
            scope::AffectedReason::Changed => {
                println!("  {} ({} changed files)", package.name, package.files.len());
            }
            scope::AffectedReason::Dependency => {
                println!("  {} (dependency changed)", package.name);
            }
        }
    }

    let filter: HashSet<String> = affected.into_iter().map(|package| package.name).collect();

    if args.graph || args.dry_run {
        let code = super::run::print_without_running(
            &run,
            args,
            std::slice::from_ref(&task),
            Some(filter),
        )
        .await?;
        drop(run);
        drop(events_tx);
        logger.await.ok();
        return Ok(code);
    }

    let handler = SignalHandler::new(signal_source());
    let interrupted = super::run::interrupt_guard(&handler, &run);

    let stop_on_error = run.opts().stop_on_error;
    let summary = run
        .run_tasks(&[task], Some(filter), stop_on_error)
        .await?;
    run.flush_tracker();
    summary.emit(&events_tx);

    let exit_code = if interrupted.load(Ordering::SeqCst) {
        INTERRUPT_EXIT_CODE
    } else {
        summary.exit_code()
    };

    drop(run);
    drop(events_tx);
    logger.await.ok();
    Ok(exit_code)
}
