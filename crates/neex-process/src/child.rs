//! A spawned command and the monitor task that owns it.
//!
//! The process is placed in its own group (`setsid`) so shutdown signals
//! reach the whole tree a shell command may have forked, not just the
//! shell. The monitor task is the only holder of the OS handle; `Child`
//! handles talk to it over channels and can be cloned freely.

use std::{
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    process::Command as TokioCommand,
    sync::{mpsc, watch},
};
use tracing::{debug, trace};

use crate::Command;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChildExit {
    /// The process exited on its own; `None` when it died to an external
    /// signal so no code was reported.
    Finished(Option<i32>),
    /// Terminated in response to our SIGTERM within the grace window.
    Interrupted,
    /// Did not react to SIGTERM and was SIGKILLed.
    Killed,
    /// The monitor lost the process (wait or kill failed).
    Failed,
}

impl ChildExit {
    pub fn code(&self) -> Option<i32> {
        match self {
            ChildExit::Finished(code) => *code,
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ChildExit::Finished(Some(0)))
    }
}

#[derive(Debug, Clone)]
pub enum ShutdownStyle {
    /// SIGTERM the process group, wait out the grace period, then SIGKILL.
    Graceful(Duration),
    Kill,
}

impl ShutdownStyle {
    // Windows has no process-group signal, so the graceful path degrades to
    // an immediate kill there.
    #[allow(unused_variables)]
    async fn shut_down(&self, child: &mut tokio::process::Child, pid: Option<u32>) -> ChildExit {
        if let ShutdownStyle::Graceful(grace) = self {
            #[cfg(unix)]
            if let Some(pid) = pid {
                debug!("sending SIGTERM to process group {pid}");
                // negative pid targets the whole group
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGTERM);
                }
                match tokio::time::timeout(*grace, child.wait()).await {
                    Ok(Ok(_)) => return ChildExit::Interrupted,
                    Ok(Err(_)) => return ChildExit::Failed,
                    Err(_) => trace!("grace period expired for {pid}, killing"),
                }
            }
        }
        match child.kill().await {
            Ok(()) => ChildExit::Killed,
            Err(_) => ChildExit::Failed,
        }
    }
}

enum ChildCommand {
    Stop,
    Kill,
}

#[derive(Clone)]
pub struct Child {
    pid: Option<u32>,
    command_tx: mpsc::Sender<ChildCommand>,
    exit_rx: watch::Receiver<Option<ChildExit>>,
    stdout: Arc<Mutex<Option<tokio::process::ChildStdout>>>,
    stderr: Arc<Mutex<Option<tokio::process::ChildStderr>>>,
}

impl Child {
    pub fn spawn(command: Command, shutdown: ShutdownStyle) -> io::Result<Self> {
        let mut cmd = TokioCommand::from(command);

        // Put the child in its own process group so signals reach every
        // descendant of the shell.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()?;
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (command_tx, mut command_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(async move {
            let exit = tokio::select! {
                command = command_rx.recv() => {
                    let style = match command {
                        Some(ChildCommand::Stop) => shutdown,
                        Some(ChildCommand::Kill) => ShutdownStyle::Kill,
                        // every handle dropped: nobody can observe the
                        // process anymore, reap it
                        None => shutdown,
                    };
                    style.shut_down(&mut child, pid).await
                }
                status = child.wait() => match status {
                    Ok(status) => ChildExit::Finished(status.code()),
                    Err(e) => {
                        trace!("wait on child {pid:?} failed: {e}");
                        ChildExit::Failed
                    }
                },
            };
            exit_tx.send(Some(exit)).ok();
        });

        Ok(Self {
            pid,
            command_tx,
            exit_rx,
            stdout: Arc::new(Mutex::new(stdout)),
            stderr: Arc::new(Mutex::new(stderr)),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The captured stdout pipe; the first caller takes ownership.
    pub fn take_stdout(&self) -> Option<tokio::process::ChildStdout> {
        self.stdout.lock().expect("stdout lock").take()
    }

    pub fn take_stderr(&self) -> Option<tokio::process::ChildStderr> {
        self.stderr.lock().expect("stderr lock").take()
    }

    /// Wait for the process to exit. `None` only when the monitor task
    /// vanished without reporting, which should not happen.
    pub async fn wait(&mut self) -> Option<ChildExit> {
        loop {
            if let Some(exit) = *self.exit_rx.borrow() {
                return Some(exit);
            }
            if self.exit_rx.changed().await.is_err() {
                return *self.exit_rx.borrow();
            }
        }
    }

    /// Graceful shutdown: SIGTERM, grace window, SIGKILL.
    pub async fn stop(&mut self) -> Option<ChildExit> {
        // an error just means the monitor already finished
        self.command_tx.send(ChildCommand::Stop).await.ok();
        self.wait().await
    }

    /// Immediate SIGKILL.
    pub async fn kill(&mut self) -> Option<ChildExit> {
        self.command_tx.send(ChildCommand::Kill).await.ok();
        self.wait().await
    }

    /// Non-blocking view of the exit state.
    pub fn exit_code_now(&self) -> Option<ChildExit> {
        *self.exit_rx.borrow()
    }
}
