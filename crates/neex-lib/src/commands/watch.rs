use crate::{
    cli::Args,
    events::{self, ConsoleLogger},
    run::{watch as watch_mode, Run},
    signal::{signal_source, SignalHandler},
    Error,
};

pub async fn watch(args: &Args, task: String) -> Result<i32, Error> {
    let repo_root = crate::repo_root()?;
    let (events_tx, events_rx) = events::channel();
    let run = Run::build(repo_root, args, events_tx.clone())?;
    let logger = tokio::spawn(ConsoleLogger::new(run.opts().color).log(events_rx));

    let handler = SignalHandler::new(signal_source());
    // the same signal also cancels whatever rebuild is in flight
    let _interrupted = super::run::interrupt_guard(&handler, &run);

    let exit_code = watch_mode::watch(&run, &task, &handler).await?;
    run.flush_tracker();

    drop(run);
    drop(events_tx);
    logger.await.ok();
    Ok(exit_code)
}
