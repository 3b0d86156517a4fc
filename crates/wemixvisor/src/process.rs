//! Owns the child node process: spawn, graceful-then-forceful stop, and
//! exit reporting.
//!
//! The child is spawned in its own process group so signals aimed at it (or
//! at the supervisor) never cross over. At most one child is alive at a
//! time; `start` and `stop` serialize on a lifecycle lock.

use std::{
    process::Stdio,
    time::Duration,
};

use chrono::{
    DateTime,
    Utc,
};
use nix::{
    sys::signal::{
        killpg,
        Signal,
    },
    unistd::Pid,
};
use serde::Serialize;
use tokio::{
    sync::{
        mpsc,
        watch,
    },
    time::timeout,
};
use tracing::{
    info,
    instrument,
    warn,
};

use crate::layout::{
    BinaryLayout,
    LayoutError,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Value-copied view of the child for collaborators.
#[derive(Clone, Debug, Serialize)]
pub struct ProcessStatus {
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
    /// How many times the node has been started beyond the initial launch.
    pub restart_count: u64,
}

impl ProcessStatus {
    fn stopped() -> Self {
        Self {
            state: ProcessState::Stopped,
            pid: None,
            start_time: None,
            restart_count: 0,
        }
    }

    #[must_use]
    pub fn uptime(&self) -> Option<Duration> {
        if self.state != ProcessState::Running {
            return None;
        }
        let started = self.start_time?;
        (Utc::now() - started).to_std().ok()
    }
}

/// Reported to the orchestrator whenever the child exits, expected or not.
#[derive(Debug)]
pub(crate) struct NodeExit {
    pub(crate) pid: u32,
    pub(crate) status: std::io::Result<std::process::ExitStatus>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("node is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("failed spawning node")]
    Spawn { source: std::io::Error },
    #[error("failed signaling node process group")]
    Signal { source: nix::Error },
}

pub struct ProcessManager {
    layout: BinaryLayout,
    shutdown_grace: Option<Duration>,
    /// Serializes `start`, `stop`, and `kill` against each other.
    lifecycle: tokio::sync::Mutex<()>,
    status_tx: watch::Sender<ProcessStatus>,
    exit_tx: mpsc::UnboundedSender<NodeExit>,
}

impl ProcessManager {
    /// Creates the manager together with the receiver the orchestrator
    /// consumes child-exit notifications from.
    #[must_use]
    pub(crate) fn new(
        layout: BinaryLayout,
        shutdown_grace: Option<Duration>,
    ) -> (Self, mpsc::UnboundedReceiver<NodeExit>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(ProcessStatus::stopped());
        let manager = Self {
            layout,
            shutdown_grace,
            lifecycle: tokio::sync::Mutex::new(()),
            status_tx,
            exit_tx,
        };
        (manager, exit_rx)
    }

    #[must_use]
    pub fn status(&self) -> ProcessStatus {
        self.status_tx.borrow().clone()
    }

    /// Spawns the node from the binary the `current` pointer resolves to.
    ///
    /// # Errors
    /// Returns an error if a node is already running, if the pointer does
    /// not resolve to an executable binary, or if the spawn itself fails.
    #[instrument(skip_all)]
    pub async fn start(&self, args: &[String]) -> Result<(), ProcessError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.status_tx.borrow().state != ProcessState::Stopped {
            return Err(ProcessError::AlreadyRunning);
        }
        self.layout.verify_current()?;
        self.status_tx
            .send_modify(|status| status.state = ProcessState::Starting);

        let exe = self.layout.current_bin_path();
        let spawned = tokio::process::Command::new(&exe)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .process_group(0)
            .spawn();
        let child = match spawned {
            Ok(child) => child,
            Err(source) => {
                self.status_tx
                    .send_modify(|status| status.state = ProcessState::Stopped);
                return Err(ProcessError::Spawn {
                    source,
                });
            }
        };
        let pid = child.id().expect("pid must be set on a child that has not been polled");

        self.status_tx.send_modify(|status| {
            let restarted = status.restart_count + u64::from(status.start_time.is_some());
            *status = ProcessStatus {
                state: ProcessState::Running,
                pid: Some(pid),
                start_time: Some(Utc::now()),
                restart_count: restarted,
            };
        });
        info!(exe = %exe.display(), pid, "started node");

        let status_tx = self.status_tx.clone();
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            let mut child = child;
            let status = child.wait().await;
            match &status {
                Ok(exit) => info!(pid, %exit, "node exited"),
                Err(error) => warn!(pid, %error, "failed waiting on node"),
            }
            status_tx.send_modify(|current| {
                // A newer incarnation may already have taken over the slot.
                if current.pid == Some(pid) {
                    current.state = ProcessState::Stopped;
                    current.pid = None;
                }
            });
            let _ = exit_tx.send(NodeExit {
                pid,
                status,
            });
        });
        Ok(())
    }

    /// Stops the node: SIGTERM to its process group, then SIGKILL if it has
    /// not exited within the shutdown grace period. Returns once the child
    /// has been reaped. A no-op if the node is already stopped.
    ///
    /// # Errors
    /// Returns an error if the process group cannot be signaled.
    #[instrument(skip_all)]
    pub async fn stop(&self) -> Result<(), ProcessError> {
        let _lifecycle = self.lifecycle.lock().await;
        let pid = {
            let status = self.status_tx.borrow();
            if status.state == ProcessState::Stopped {
                return Ok(());
            }
            status.pid
        };
        let Some(pid) = pid else {
            return Ok(());
        };
        self.status_tx
            .send_modify(|status| status.state = ProcessState::Stopping);

        info!(pid, "sending SIGTERM to node process group");
        signal_group(pid, Signal::SIGTERM)?;

        // The child is reaped once its waiter clears the recorded pid; the
        // waiter may even have done so already.
        let mut status_rx = self.status_tx.subscribe();
        let reaped = status_rx.wait_for(|status| status.pid != Some(pid));
        match self.shutdown_grace {
            Some(grace) => {
                if timeout(grace, reaped).await.is_err() {
                    warn!(
                        pid,
                        grace = %humantime::format_duration(grace),
                        "node did not exit within shutdown grace; sending SIGKILL",
                    );
                    signal_group(pid, Signal::SIGKILL)?;
                    let mut status_rx = self.status_tx.subscribe();
                    let _ = status_rx.wait_for(|status| status.pid != Some(pid)).await;
                }
            }
            None => {
                let _ = reaped.await;
            }
        }
        self.status_tx.send_modify(|status| {
            if status.state == ProcessState::Stopping {
                status.state = ProcessState::Stopped;
            }
        });
        info!(pid, "node stopped");
        Ok(())
    }

    /// Kills the node process group immediately, bypassing the graceful
    /// sequence. Used on SIGQUIT.
    ///
    /// # Errors
    /// Returns an error if the process group cannot be signaled.
    pub async fn kill(&self) -> Result<(), ProcessError> {
        let _lifecycle = self.lifecycle.lock().await;
        let pid = {
            let status = self.status_tx.borrow();
            if status.state == ProcessState::Stopped {
                return Ok(());
            }
            status.pid
        };
        let Some(pid) = pid else {
            return Ok(());
        };
        warn!(pid, "killing node process group");
        signal_group(pid, Signal::SIGKILL)?;
        let mut status_rx = self.status_tx.subscribe();
        let _ = status_rx.wait_for(|status| status.pid != Some(pid)).await;
        self.status_tx.send_modify(|status| {
            if status.state != ProcessState::Stopped {
                status.state = ProcessState::Stopped;
            }
        });
        Ok(())
    }
}

fn signal_group(pid: u32, signal: Signal) -> Result<(), ProcessError> {
    let pgid = Pid::from_raw(
        i32::try_from(pid).expect("pids returned by the kernel fit into an i32"),
    );
    match killpg(pgid, signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(source) => Err(ProcessError::Signal {
            source,
        }),
    }
}
