use neex_engine::TaskId;

use crate::events::{Event, EventSender};

/// Lines of stderr echoed with a task failure report.
const STDERR_TAIL_LINES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success {
        cached: bool,
        exit_code: i32,
        duration_ms: u64,
    },
    Failed {
        exit_code: Option<i32>,
        stderr_tail: Vec<String>,
    },
    /// Never spawned because a dependency failed or sat on a cycle.
    Skipped,
    /// Terminated by cancellation; not an error.
    Cancelled,
}

/// Detected dev-server coordinates, scraped from a task's stdout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    pub port: Option<u16>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub outcome: TaskOutcome,
    pub server: Option<ServerInfo>,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub results: Vec<TaskResult>,
    pub total_ms: u64,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn successes(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, TaskOutcome::Success { .. }))
            .count()
    }

    pub fn cached(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, TaskOutcome::Success { cached: true, .. }))
            .count()
    }

    pub fn failures(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, TaskOutcome::Failed { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, TaskOutcome::Skipped))
            .count()
    }

    /// 0 on full success; 1 when any task failed. Cancellations alone do
    /// not fail the run (the interrupt path owns its exit code).
    pub fn exit_code(&self) -> i32 {
        if self.failures() > 0 {
            1
        } else {
            0
        }
    }

    /// Recap each failure's trailing stderr, then the aggregate block.
    /// The runner already emitted the per-task `TaskEnd`; the stream
    /// carries exactly one of those per task, so the recap must not add
    /// another.
    pub fn emit(&self, events: &EventSender) {
        for result in &self.results {
            if let TaskOutcome::Failed { stderr_tail, .. } = &result.outcome {
                for line in stderr_tail.iter().rev().take(STDERR_TAIL_LINES).rev() {
                    events
                        .send(Event::TaskStderr {
                            id: result.task_id.clone(),
                            line: line.clone(),
                        })
                        .ok();
                }
            }
        }
        events
            .send(Event::Summary {
                total: self.total(),
                success: self.successes(),
                failed: self.failures(),
                skipped: self.skipped(),
                cached: self.cached(),
                total_ms: self.total_ms,
            })
            .ok();
    }
}
