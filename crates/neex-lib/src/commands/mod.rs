mod affected;
mod cache;
mod run;
mod watch;

use crate::{
    cli::{Args, Command},
    Error,
};

pub async fn dispatch(mut args: Args) -> Result<i32, Error> {
    match args.command.take() {
        None => {
            let tasks = std::mem::take(&mut args.tasks);
            run::run(&args, tasks).await
        }
        Some(Command::Run { tasks }) => run::run(&args, tasks).await,
        Some(Command::Affected { task, base }) => affected::affected(&args, task, base).await,
        Some(Command::Watch { task }) => watch::watch(&args, task).await,
        Some(Command::Cache {
            status,
            s3,
            r2,
            clear,
            clean,
            max_age_days,
        }) => cache::cache(status, s3, r2, clear, clean, max_age_days).await,
    }
}
