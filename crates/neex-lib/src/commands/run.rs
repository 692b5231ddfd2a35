use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{
    cli::Args,
    events::{self, ConsoleLogger},
    run::Run,
    signal::{signal_source, SignalHandler},
    Error, INTERRUPT_EXIT_CODE,
};

pub async fn run(args: &Args, tasks: Vec<String>) -> Result<i32, Error> {
    let repo_root = crate::repo_root()?;
    let (events_tx, events_rx) = events::channel();
    let run = Run::build(repo_root, args, events_tx.clone())?;
    let logger = tokio::spawn(ConsoleLogger::new(run.opts().color).log(events_rx));

    let task_names = run.expand_tasks(&tasks);

    if args.graph || args.dry_run {
        let code = print_without_running(&run, args, &task_names, None).await?;
        drop(run);
        drop(events_tx);
        logger.await.ok();
        return Ok(code);
    }

    let handler = SignalHandler::new(signal_source());
    let interrupted = interrupt_guard(&handler, &run);

    let stop_on_error = run.opts().stop_on_error;
    let summary = run.run_tasks(&task_names, None, stop_on_error).await?;
    run.flush_tracker();
    summary.emit(&events_tx);

    let exit_code = if interrupted.load(Ordering::SeqCst) {
        INTERRUPT_EXIT_CODE
    } else {
        summary.exit_code()
    };

    // dropping every sender ends the logger
    drop(summary);
    drop(run);
    drop(events_tx);
    logger.await.ok();

    Ok(exit_code)
}

/// Handle `--graph` and `--dry-run`: inspect the task graph without
/// executing it.
pub(crate) async fn print_without_running(
    run: &Run,
    args: &Args,
    task_names: &[String],
    package_filter: Option<std::collections::HashSet<String>>,
) -> Result<i32, Error> {
    if args.graph {
        run.print_graph(task_names, package_filter, std::io::stdout().lock())?;
        return Ok(0);
    }
    let rows = run.dry_run(task_names, package_filter).await?;
    for row in &rows {
        let cache_state = match (&row.fingerprint, row.cached) {
            (None, _) => "uncacheable".to_string(),
            (Some(fingerprint), true) => format!("cache hit  {fingerprint}"),
            (Some(fingerprint), false) => format!("cache miss {fingerprint}"),
        };
        println!("{}  {}  $ {}", row.task_id, cache_state, row.command);
    }
    println!("{} tasks resolved", rows.len());
    Ok(0)
}

/// Wire the signal handler to the run: the first signal closes the
/// process manager (cancelling running tasks) and flags the interruption.
pub(crate) fn interrupt_guard(handler: &SignalHandler, run: &Run) -> Arc<AtomicBool> {
    let interrupted = Arc::new(AtomicBool::new(false));
    if let Some(subscriber) = handler.subscribe() {
        let manager = run.manager().clone();
        let flag = interrupted.clone();
        tokio::spawn(async move {
            let _guard = subscriber.listen().await;
            flag.store(true, Ordering::SeqCst);
            manager.close().await;
        });
    }
    interrupted
}
