//! Execution of a single task: cache probe, process spawn, output
//! capture, artifact write-back.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, OnceLock},
    time::Instant,
};

use camino::Utf8PathBuf;
use neex_cache::ArtifactMetadata;
use neex_engine::{StopExecution, TaskId};
use neex_process::{Child, ChildExit, Command, ProcessManager};
use regex::Regex;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    sync::oneshot,
};
use tracing::{debug, warn};

use crate::{
    events::{Event, EventSender},
    run::{
        summary::{ServerInfo, TaskOutcome, TaskResult},
        TaskCache,
    },
};

fn port_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)listening on (?:port |http://localhost:|https://localhost:)(\d+)")
            .expect("port regex compiles")
    })
}

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(https?://localhost:[0-9]+(?:/[^\s]*)?)").expect("url regex compiles")
    })
}

/// Tasks whose outcome poisons their dependents: failed or cancelled.
/// Shared between the visitor (which consults it) and every exec context
/// (which records into it before unblocking the walk).
pub(crate) type TaintedTasks = Arc<Mutex<HashSet<TaskId>>>;

pub(crate) struct ExecContext {
    pub task_id: TaskId,
    pub command: String,
    pub cwd: Utf8PathBuf,
    pub task_cache: TaskCache,
    pub manager: ProcessManager,
    pub events: EventSender,
    pub color: bool,
    pub stop_on_error: bool,
    pub tainted: TaintedTasks,
}

impl ExecContext {
    /// Run the task to completion and answer the scheduler's callback.
    /// Every path answers: dependents must never wait on a dropped
    /// channel.
    pub async fn execute(
        self,
        callback: oneshot::Sender<Result<(), StopExecution>>,
    ) -> TaskResult {
        self.events
            .send(Event::TaskStart {
                id: self.task_id.clone(),
                command: self.command.clone(),
            })
            .ok();

        // Cache first. Errors inside the cache have already degraded to a
        // miss by the time we see `None`.
        if let Some((metadata, _summary)) = self.task_cache.restore().await {
            self.replay(&metadata);
            self.events
                .send(Event::TaskEnd {
                    id: self.task_id.clone(),
                    success: true,
                    exit_code: Some(metadata.exit_code),
                    duration_ms: metadata.duration,
                    cached: true,
                })
                .ok();
            callback.send(Ok(())).ok();
            return TaskResult {
                task_id: self.task_id,
                outcome: TaskOutcome::Success {
                    cached: true,
                    exit_code: metadata.exit_code,
                    duration_ms: metadata.duration,
                },
                server: None,
            };
        }

        let start = Instant::now();
        let mut child = match self.spawn() {
            SpawnOutcome::Running(child) => child,
            SpawnOutcome::Cancelled => {
                self.taint();
                callback.send(Ok(())).ok();
                return self.finish(TaskOutcome::Cancelled, None);
            }
            SpawnOutcome::Failed(message) => {
                self.events
                    .send(Event::TaskStderr {
                        id: self.task_id.clone(),
                        line: message,
                    })
                    .ok();
                self.taint();
                let stop = self.stop_on_error;
                callback
                    .send(if stop { Err(StopExecution) } else { Ok(()) })
                    .ok();
                return self.finish(
                    TaskOutcome::Failed {
                        exit_code: None,
                        stderr_tail: vec![],
                    },
                    None,
                );
            }
        };

        let stdout_task = self.consume_stream(child.take_stdout(), false);
        let stderr_task = self.consume_stream(child.take_stderr(), true);
        let ((stdout_lines, server), (stderr_lines, _)) =
            tokio::join!(stdout_task, stderr_task);

        let exit = child.wait().await;
        let duration_ms = start.elapsed().as_millis() as u64;
        debug!("{} exited with {exit:?} after {duration_ms}ms", self.task_id);

        match exit {
            Some(ChildExit::Finished(Some(0))) => {
                let metadata = ArtifactMetadata {
                    hash: self
                        .task_cache
                        .fingerprint()
                        .unwrap_or_default()
                        .to_string(),
                    exit_code: 0,
                    duration: duration_ms,
                    timestamp: unix_millis(),
                    stdout: stdout_lines,
                    stderr: stderr_lines,
                };
                self.task_cache.save(metadata).await;
                self.events
                    .send(Event::TaskEnd {
                        id: self.task_id.clone(),
                        success: true,
                        exit_code: Some(0),
                        duration_ms,
                        cached: false,
                    })
                    .ok();
                callback.send(Ok(())).ok();
                self.finish(
                    TaskOutcome::Success {
                        cached: false,
                        exit_code: 0,
                        duration_ms,
                    },
                    server,
                )
            }
            Some(ChildExit::Interrupted) | Some(ChildExit::Killed) => {
                self.taint();
                callback.send(Ok(())).ok();
                self.finish(TaskOutcome::Cancelled, server)
            }
            other => {
                let exit_code = other.and_then(|exit| exit.code());
                self.events
                    .send(Event::TaskEnd {
                        id: self.task_id.clone(),
                        success: false,
                        exit_code,
                        duration_ms,
                        cached: false,
                    })
                    .ok();
                self.taint();
                if self.stop_on_error {
                    // cancel everything else that is still running
                    let manager = self.manager.clone();
                    tokio::spawn(async move { manager.close().await });
                    callback.send(Err(StopExecution)).ok();
                } else {
                    callback.send(Ok(())).ok();
                }
                self.finish(
                    TaskOutcome::Failed {
                        exit_code,
                        stderr_tail: stderr_lines,
                    },
                    server,
                )
            }
        }
    }

    fn spawn(&self) -> SpawnOutcome {
        let mut command = Command::new("sh");
        command
            .args(["-c", self.command.as_str()])
            .current_dir(&self.cwd);
        if self.color {
            command.env("FORCE_COLOR", "1");
        }
        match self.manager.spawn(command) {
            None => SpawnOutcome::Cancelled,
            Some(Ok(child)) => SpawnOutcome::Running(child),
            Some(Err(e)) => SpawnOutcome::Failed(format!("failed to spawn shell: {e}")),
        }
    }

    /// Read a pipe to EOF, forwarding each line as an event and capturing
    /// it for the artifact. Stdout is also scanned for server signals.
    async fn consume_stream(
        &self,
        stream: Option<impl AsyncRead + Unpin + Send>,
        is_stderr: bool,
    ) -> (Vec<String>, Option<ServerInfo>) {
        let Some(stream) = stream else {
            return (Vec::new(), None);
        };
        let mut lines = BufReader::new(stream).lines();
        let mut captured = Vec::new();
        let mut server: Option<ServerInfo> = None;

        while let Ok(Some(line)) = lines.next_line().await {
            let event = if is_stderr {
                Event::TaskStderr {
                    id: self.task_id.clone(),
                    line: line.clone(),
                }
            } else {
                Event::TaskStdout {
                    id: self.task_id.clone(),
                    line: line.clone(),
                }
            };
            self.events.send(event).ok();

            if !is_stderr {
                scan_server_signals(&line, &mut server);
            }
            captured.push(line);
        }
        (captured, server)
    }

    fn replay(&self, metadata: &ArtifactMetadata) {
        for line in &metadata.stdout {
            self.events
                .send(Event::TaskStdout {
                    id: self.task_id.clone(),
                    line: line.clone(),
                })
                .ok();
        }
        for line in &metadata.stderr {
            self.events
                .send(Event::TaskStderr {
                    id: self.task_id.clone(),
                    line: line.clone(),
                })
                .ok();
        }
    }

    /// Record this task as poisoned for its dependents. Must happen before
    /// the scheduler callback fires, or a dependent could race past the
    /// check.
    fn taint(&self) {
        self.tainted
            .lock()
            .expect("tainted lock")
            .insert(self.task_id.clone());
    }

    fn finish(self, outcome: TaskOutcome, server: Option<ServerInfo>) -> TaskResult {
        if matches!(outcome, TaskOutcome::Failed { .. }) {
            warn!("{} failed", self.task_id);
        }
        TaskResult {
            task_id: self.task_id,
            outcome,
            server,
        }
    }
}

enum SpawnOutcome {
    Running(Child),
    Cancelled,
    Failed(String),
}

fn scan_server_signals(line: &str, server: &mut Option<ServerInfo>) {
    let port = port_regex()
        .captures(line)
        .and_then(|captures| captures.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok());
    let url = url_regex()
        .captures(line)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string());
    if port.is_none() && url.is_none() {
        return;
    }
    let info = server.get_or_insert_with(ServerInfo::default);
    if info.port.is_none() {
        info.port = port;
    }
    if info.url.is_none() {
        info.url = url;
    }
}

fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
