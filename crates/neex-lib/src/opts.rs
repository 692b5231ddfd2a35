use crate::{cli::Args, config::PerformanceConfig};

/// Resolved execution options for one invocation, after CLI flags and the
/// pipeline's performance block are reconciled (flags win).
#[derive(Debug, Clone)]
pub struct RunOpts {
    pub max_parallel: usize,
    pub stop_on_error: bool,
    pub color: bool,
    pub force: bool,
}

impl RunOpts {
    pub fn resolve(args: &Args, performance: PerformanceConfig) -> Self {
        let max_parallel = args
            .max_parallel
            .or(performance.max_parallel)
            .unwrap_or_else(default_parallelism);
        Self {
            max_parallel: max_parallel.max(1),
            stop_on_error: args.stop_on_error,
            color: !args.no_color && console::colors_enabled(),
            force: args.force,
        }
    }
}

fn default_parallelism() -> usize {
    match num_cpus::get() {
        0 => 8,
        n => n,
    }
}
