//! Child process lifecycle management.
//!
//! Each spawned command runs in its own process group and is owned by a
//! monitor task; callers interact through cheap clonable handles. Closing
//! follows the graceful path: SIGTERM to the group, a grace window, then
//! SIGKILL. The `ProcessManager` fans the same shutdown out to every child
//! it has spawned, which is how cancellation reaches running tasks.

mod child;
mod command;

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use tracing::{debug, trace};

pub use child::{Child, ChildExit, ShutdownStyle};
pub use command::Command;

/// Grace period between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Tracks every live child so a single close call can wind the whole run
/// down. Clones share state.
#[derive(Clone)]
pub struct ProcessManager {
    state: Arc<std::sync::Mutex<ManagerState>>,
    grace_period: Duration,
}

struct ManagerState {
    is_closing: bool,
    children: Vec<Child>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::with_grace_period(DEFAULT_GRACE_PERIOD)
    }

    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self {
            state: Arc::new(std::sync::Mutex::new(ManagerState {
                is_closing: false,
                children: Vec::new(),
            })),
            grace_period,
        }
    }

    /// Spawn a command under management. `None` means the manager is
    /// already closing and no new work should start.
    pub fn spawn(&self, command: Command) -> Option<std::io::Result<Child>> {
        let mut state = self.state.lock().expect("manager lock");
        if state.is_closing {
            return None;
        }
        let child = Child::spawn(command, ShutdownStyle::Graceful(self.grace_period));
        if let Ok(child) = &child {
            state.children.push(child.clone());
        }
        Some(child)
    }

    /// Gracefully stop every child and refuse new spawns. Idempotent.
    pub async fn close(&self) {
        let children = {
            let mut state = self.state.lock().expect("manager lock");
            state.is_closing = true;
            state.children.drain(..).collect::<Vec<_>>()
        };
        if children.is_empty() {
            return;
        }
        debug!("stopping {} running children", children.len());
        join_all(children.into_iter().map(|mut child| async move {
            let exit = child.stop().await;
            trace!("child stopped with {exit:?}");
        }))
        .await;
    }

    /// Forget children that have already exited so the list stays small on
    /// long watch sessions.
    pub fn reap(&self) {
        let mut state = self.state.lock().expect("manager lock");
        state.children.retain(|child| child.exit_code_now().is_none());
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use std::time::Instant;

    use super::*;

    fn shell(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[tokio::test]
    async fn test_spawn_and_wait() {
        let manager = ProcessManager::new();
        let mut child = manager.spawn(shell("exit 3")).unwrap().unwrap();
        assert_eq!(child.wait().await, Some(ChildExit::Finished(Some(3))));
    }

    #[tokio::test]
    async fn test_close_terminates_children() {
        let manager = ProcessManager::with_grace_period(Duration::from_millis(200));
        let mut child = manager.spawn(shell("sleep 30")).unwrap().unwrap();

        let start = Instant::now();
        manager.close().await;
        assert!(start.elapsed() < Duration::from_secs(5));

        let exit = child.wait().await;
        assert!(
            matches!(
                exit,
                Some(ChildExit::Interrupted) | Some(ChildExit::Killed)
            ),
            "unexpected exit {exit:?}"
        );

        // closed managers refuse new work
        assert!(manager.spawn(shell("true")).is_none());
    }

    #[tokio::test]
    async fn test_close_without_children() {
        let manager = ProcessManager::new();
        manager.close().await;
    }
}
