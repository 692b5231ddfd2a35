//! The progress event stream: the only boundary between task execution
//! and whatever renders it. The CLI binds the stream to a prefixed
//! console logger; tests bind it to a buffer.

use std::collections::HashMap;

use console::Style;
use neex_engine::TaskId;
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    TaskStart {
        id: TaskId,
        command: String,
    },
    TaskStdout {
        id: TaskId,
        line: String,
    },
    TaskStderr {
        id: TaskId,
        line: String,
    },
    TaskEnd {
        id: TaskId,
        success: bool,
        exit_code: Option<i32>,
        duration_ms: u64,
        cached: bool,
    },
    Summary {
        total: usize,
        success: usize,
        failed: usize,
        skipped: usize,
        cached: usize,
        total_ms: u64,
    },
}

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Stable prefix palette: each task keeps its color for the whole run.
const PREFIX_COLORS: &[u8] = &[6, 3, 2, 5, 4, 1]; // cyan yellow green magenta blue red

/// Consumes the event stream and renders it as prefixed terminal output.
pub struct ConsoleLogger {
    color: bool,
    assigned: HashMap<TaskId, Style>,
}

impl ConsoleLogger {
    pub fn new(color: bool) -> Self {
        Self {
            color,
            assigned: HashMap::new(),
        }
    }

    /// Drain events until every sender is gone.
    pub async fn log(mut self, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            self.render(event);
        }
        trace!("event stream closed");
    }

    fn render(&mut self, event: Event) {
        match event {
            Event::TaskStart { id, command } => {
                let prefix = self.prefix(&id);
                println!("{prefix} $ {command}");
            }
            Event::TaskStdout { id, line } => {
                let prefix = self.prefix(&id);
                println!("{prefix} {line}");
            }
            Event::TaskStderr { id, line } => {
                let prefix = self.prefix(&id);
                eprintln!("{prefix} {line}");
            }
            Event::TaskEnd {
                id,
                success,
                exit_code,
                duration_ms,
                cached,
            } => {
                let prefix = self.prefix(&id);
                if cached {
                    println!("{prefix} cache hit, replaying output ({duration_ms}ms saved)");
                } else if success {
                    println!("{prefix} done in {duration_ms}ms");
                } else {
                    let code = exit_code
                        .map(|code| code.to_string())
                        .unwrap_or_else(|| "signal".to_string());
                    eprintln!(
                        "{prefix} {} (exit {code})",
                        self.maybe_color(Style::new().red().bold(), "failed")
                    );
                }
            }
            Event::Summary {
                total,
                success,
                failed,
                skipped,
                cached,
                total_ms,
            } => {
                println!();
                println!(
                    " Tasks: {} successful ({cached} cached), {failed} failed, {skipped} \
                     skipped, {total} total",
                    self.maybe_color(Style::new().green().bold(), &success.to_string()),
                );
                println!("  Time: {}", format_duration(total_ms));
            }
        }
    }

    fn prefix(&mut self, id: &TaskId) -> String {
        let color = self.color;
        let next_index = self.assigned.len();
        let style = self
            .assigned
            .entry(id.clone())
            .or_insert_with(|| {
                let color_index = PREFIX_COLORS[next_index % PREFIX_COLORS.len()];
                Style::new().color256(color_index)
            })
            .clone();
        let rendered = format!("{id}:");
        if color {
            style.apply_to(rendered).to_string()
        } else {
            rendered
        }
    }

    fn maybe_color(&self, style: Style, text: &str) -> String {
        if self.color {
            style.apply_to(text).to_string()
        } else {
            text.to_string()
        }
    }
}

pub fn format_duration(ms: u64) -> String {
    if ms >= 60_000 {
        format!("{}m{:.1}s", ms / 60_000, (ms % 60_000) as f64 / 1000.0)
    } else if ms >= 1000 {
        format!("{:.2}s", ms as f64 / 1000.0)
    } else {
        format!("{ms}ms")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(250), "250ms");
        assert_eq!(format_duration(1500), "1.50s");
        assert_eq!(format_duration(65_500), "1m5.5s");
    }

    #[test]
    fn test_prefix_is_stable_per_task() {
        let mut logger = ConsoleLogger::new(false);
        let a = TaskId::new("a", "build");
        let b = TaskId::new("b", "build");
        let first = logger.prefix(&a);
        let _ = logger.prefix(&b);
        assert_eq!(logger.prefix(&a), first);
        assert_eq!(first, "a:build:");
    }
}
