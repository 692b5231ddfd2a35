//! Everything behind the `neex` binary: argument parsing, configuration,
//! task fingerprinting, the runner, and the run/affected/watch/cache
//! commands.

pub mod cli;
mod commands;
pub mod config;
pub mod events;
pub mod opts;
pub mod run;
pub mod signal;
mod task_graph;
pub mod task_hash;

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::error;

pub use cli::Args;
pub use events::{Event, EventSender};

/// Exit code reported when the user interrupts a run.
pub const INTERRUPT_EXIT_CODE: i32 = 130;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Repository(#[from] neex_repository::Error),
    #[error("invalid pipeline config at {path}: {source}")]
    InvalidPipeline {
        path: Utf8PathBuf,
        source: serde_json::Error,
    },
    #[error("could not determine repository root: {0}")]
    RepoRoot(std::io::Error),
    #[error(transparent)]
    Cache(#[from] neex_cache::CacheError),
    #[error(transparent)]
    Engine(#[from] neex_engine::ExecuteError),
    #[error(transparent)]
    Watch(#[from] neex_filewatch::WatchError),
    #[error("task runner error: {0}")]
    Runner(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Entry point used by the `neex` binary: parse arguments, set up
/// tracing, run the command on a multi-threaded runtime, and map the
/// outcome to an exit code.
pub fn main() -> i32 {
    let args = cli::parse();
    init_tracing(args.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("neex: failed to start runtime: {e}");
            return 1;
        }
    };

    match runtime.block_on(commands::dispatch(args)) {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            eprintln!("neex: {e}");
            1
        }
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_filter = if verbose { "neex=debug" } else { "neex=warn" };
    let filter = EnvFilter::try_from_env("NEEX_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// The repository root is wherever the invocation starts; commands are
/// expected to run from the monorepo root, as the scanner's workspace
/// patterns are root-relative.
pub(crate) fn repo_root() -> Result<Utf8PathBuf, Error> {
    let cwd = std::env::current_dir().map_err(Error::RepoRoot)?;
    Utf8PathBuf::from_path_buf(cwd)
        .map_err(|path| Error::RepoRoot(std::io::Error::other(format!(
            "current directory {} is not valid UTF-8",
            path.display()
        ))))
}
