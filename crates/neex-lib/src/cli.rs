use clap::{ArgAction, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "neex",
    version,
    about = "Monorepo task orchestrator with content-addressed caching",
    args_conflicts_with_subcommands = true,
    arg_required_else_help = true
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Task names to run across the workspace (shorthand for `neex run`).
    /// Globs against script names are supported: `neex "build:*"`.
    pub tasks: Vec<String>,

    /// Maximum number of tasks running at once.
    #[arg(long, global = true, value_name = "N")]
    pub max_parallel: Option<usize>,

    /// Stop scheduling and cancel running tasks after the first failure.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub stop_on_error: bool,

    /// Disable colored output.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub no_color: bool,

    /// Verbose logging (equivalent to NEEX_LOG=neex=debug).
    #[arg(long, short, global = true, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Ignore existing cache entries and re-execute every task; results
    /// are still written back to the cache.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub force: bool,

    /// Print the task graph in Graphviz DOT format instead of running.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub graph: bool,

    /// Resolve tasks, fingerprints, and cache state without executing
    /// anything.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub dry_run: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run tasks across every package that declares them.
    Run {
        #[arg(required = true)]
        tasks: Vec<String>,
    },
    /// Run a task only in packages affected by version-control changes.
    Affected {
        task: String,
        /// Ref to diff against (defaults to the previous commit).
        #[arg(long)]
        base: Option<String>,
    },
    /// Watch source trees and rebuild affected packages on change.
    Watch { task: String },
    /// Inspect or configure the cache.
    Cache {
        /// Report local and remote cache health.
        #[arg(long)]
        status: bool,
        /// Configure an S3 remote cache interactively.
        #[arg(long)]
        s3: bool,
        /// Configure a Cloudflare R2 remote cache interactively.
        #[arg(long)]
        r2: bool,
        /// Drop the remote cache configuration.
        #[arg(long)]
        clear: bool,
        /// Remove local artifacts and content objects older than
        /// --max-age-days.
        #[arg(long)]
        clean: bool,
        /// Age threshold for --clean, in days.
        #[arg(long, value_name = "DAYS", default_value_t = 30)]
        max_age_days: u64,
    },
}

pub fn parse() -> Args {
    Args::parse()
}
