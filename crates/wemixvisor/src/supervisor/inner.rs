//! The orchestrator event loop: consumes height updates, upgrade-source
//! notifications, and child exits, and drives the upgrade critical section.

use std::{
    sync::Arc,
    time::Duration,
};

use eyre::WrapErr as _;
use tokio::{
    select,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    error,
    info,
    instrument,
    warn,
};

use super::state::State;
use crate::{
    backup::BackupManager,
    download::Downloader,
    height::HeightMonitor,
    hook::PreUpgradeHook,
    layout::BinaryLayout,
    process::{
        NodeExit,
        ProcessManager,
        ProcessState,
    },
    upgrade::{
        source::UpgradeSource,
        UpgradeInfo,
    },
};

/// How an upgrade critical section can fail.
///
/// An aborted upgrade leaves the supervisor running and the armed upgrade
/// set for operator action; a fatal failure means even the rollback could
/// not bring a node back up and the supervisor itself must exit.
enum UpgradeFailure {
    Aborted(eyre::Report),
    Fatal(eyre::Report),
}

fn abort(report: eyre::Report) -> UpgradeFailure {
    UpgradeFailure::Aborted(report)
}

pub(super) struct Inner {
    pub(super) shutdown_token: CancellationToken,
    pub(super) monitor: HeightMonitor,
    pub(super) height_rx: mpsc::Receiver<u64>,
    pub(super) source: UpgradeSource,
    pub(super) source_rx: mpsc::Receiver<()>,
    pub(super) process: Arc<ProcessManager>,
    pub(super) exit_rx: mpsc::UnboundedReceiver<NodeExit>,
    pub(super) layout: BinaryLayout,
    pub(super) downloader: Downloader,
    pub(super) backups: BackupManager,
    pub(super) hook: PreUpgradeHook,
    pub(super) state: Arc<State>,

    pub(super) node_args: Vec<String>,
    pub(super) allow_downloads: bool,
    pub(super) unsafe_skip_backup: bool,
    pub(super) backup_retention: Duration,
    pub(super) restart_after_upgrade: bool,
    pub(super) restart_delay: Duration,

    pub(super) armed: Option<UpgradeInfo>,
    pub(super) last_applied_height: u64,
}

impl Inner {
    #[instrument(skip_all)]
    pub(super) async fn run_until_stopped(mut self) -> eyre::Result<()> {
        self.layout
            .ensure_current_pointer()
            .wrap_err("binary layout failed verification")?;
        self.process
            .start(&self.node_args)
            .await
            .wrap_err("failed starting node")?;
        self.monitor
            .start()
            .wrap_err("failed starting height monitor")?;
        self.source
            .start()
            .wrap_err("failed starting upgrade source")?;
        info!("supervisor is running");

        let result = self.event_loop().await;

        self.shutdown().await;
        result
    }

    async fn event_loop(&mut self) -> eyre::Result<()> {
        loop {
            select!(
                biased;

                () = self.shutdown_token.cancelled() => {
                    info!("received shutdown signal");
                    return Ok(());
                }

                Some(height) = self.height_rx.recv() => {
                    self.handle_height(height).await?;
                }

                Some(()) = self.source_rx.recv() => {
                    self.handle_source_change().await?;
                }

                Some(exit) = self.exit_rx.recv() => {
                    self.handle_node_exit(exit).await?;
                }
            );
        }
    }

    async fn shutdown(&mut self) {
        self.monitor.stop().await;
        self.source.stop().await;
        if let Err(error) = self.process.stop().await {
            warn!(%error, "failed stopping node during shutdown");
        }
        info!("supervisor stopped");
    }

    /// Fires the armed upgrade once the observed height reaches its target.
    async fn handle_height(&mut self, height: u64) -> eyre::Result<()> {
        let Some(armed) = self.armed.clone() else {
            return Ok(());
        };
        if height >= armed.height {
            info!(height, upgrade = %armed, "target height reached");
            self.run_upgrade(armed).await?;
        }
        Ok(())
    }

    /// Arms a newly detected pending upgrade after validation. A pending
    /// upgrade at or below the last applied height has already been handled
    /// and is ignored; a pending upgrade whose height has been passed while
    /// it was validated fires immediately.
    async fn handle_source_change(&mut self) -> eyre::Result<()> {
        let slot = self.source.slot();
        if !slot.needs_update() {
            return Ok(());
        }
        slot.clear_update_flag();
        let Some(pending) = slot.pending() else {
            return Ok(());
        };
        if let Err(error) = pending.validate() {
            warn!(%error, "refusing to arm invalid pending upgrade");
            return Ok(());
        }
        if pending.height <= self.last_applied_height {
            warn!(
                upgrade = %pending,
                last_applied_height = self.last_applied_height,
                "pending upgrade does not lie beyond the last applied height; ignoring",
            );
            return Ok(());
        }
        info!(upgrade = %pending, "armed upgrade");
        self.armed = Some(pending.clone());
        self.state.set_armed(Some(pending.clone()));

        if self.monitor.current_height() >= pending.height {
            self.run_upgrade(pending).await?;
        }
        Ok(())
    }

    /// Restart-on-exit policy. Exits caused by the critical section's own
    /// stop are recognized by a newer incarnation already running and
    /// dropped as stale.
    async fn handle_node_exit(&mut self, exit: NodeExit) -> eyre::Result<()> {
        if self.process.status().state != ProcessState::Stopped {
            return Ok(());
        }
        match &exit.status {
            Ok(status) => warn!(pid = exit.pid, %status, "node exited"),
            Err(error) => warn!(pid = exit.pid, %error, "node exited; wait failed"),
        }

        // A node that exits at its upgrade height is treating the height as
        // its own upgrade signal; apply the upgrade rather than restarting
        // the old binary.
        if let Some(armed) = self.armed.clone() {
            if self.monitor.current_height() >= armed.height {
                info!(upgrade = %armed, "node exited at upgrade height");
                return self.run_upgrade(armed).await;
            }
        }

        if !self.restart_after_upgrade {
            warn!("node exited and restarts are disabled; leaving it stopped");
            return Ok(());
        }
        select!(
            () = self.shutdown_token.cancelled() => return Ok(()),
            () = tokio::time::sleep(self.restart_delay) => {}
        );
        info!("restarting node");
        if let Err(error) = self.process.start(&self.node_args).await {
            warn!(%error, "failed restarting node");
        }
        Ok(())
    }

    /// The upgrade critical section. Runs to completion before any further
    /// events are processed; on success the armed upgrade is cleared, on an
    /// abort it stays set for operator action.
    #[instrument(skip_all, fields(upgrade = %upgrade), err)]
    async fn run_upgrade(&mut self, upgrade: UpgradeInfo) -> eyre::Result<()> {
        self.state.set_upgrading(true);
        let outcome = self.apply_upgrade(&upgrade).await;
        match outcome {
            Ok(()) => {
                self.last_applied_height = upgrade.height;
                self.armed = None;
                self.state.record_applied(&upgrade);
                info!(upgrade = %upgrade, "upgrade applied");
                // Retention cleanup is still part of the critical section;
                // the upgrading flag drops only once it is done.
                if let Err(error) = self.backups.clean_old_backups(self.backup_retention).await {
                    warn!(%error, "failed pruning old backups");
                }
                self.state.set_upgrading(false);
                Ok(())
            }
            Err(UpgradeFailure::Aborted(report)) => {
                self.state.set_upgrading(false);
                error!(
                    upgrade = %upgrade,
                    error = %report,
                    "upgrade aborted; armed upgrade kept for operator action",
                );
                Ok(())
            }
            Err(UpgradeFailure::Fatal(report)) => {
                self.state.set_upgrading(false);
                Err(report.wrap_err("unrecoverable upgrade failure; node left stopped"))
            }
        }
    }

    async fn apply_upgrade(&mut self, upgrade: &UpgradeInfo) -> Result<(), UpgradeFailure> {
        // 1. Cheap pre-checks before touching anything.
        upgrade
            .validate()
            .map_err(|error| abort(eyre::Report::new(error)))?;
        if !self.allow_downloads && !self.layout.upgrade_bin_path(&upgrade.name).exists() {
            return Err(abort(eyre::eyre!(
                "binary for upgrade `{}` not found and downloads are disabled",
                upgrade.name,
            )));
        }

        // 2. Snapshot the data directory so every later step can roll back.
        let snapshot = match self
            .backups
            .create_backup(&format!("pre-upgrade-{}", upgrade.name))
            .await
        {
            Ok(path) => Some(path),
            Err(error) => {
                if self.unsafe_skip_backup {
                    warn!(%error, "backup failed but backups are disabled; proceeding");
                    None
                } else {
                    return Err(abort(error.wrap_err("failed creating pre-upgrade backup")));
                }
            }
        };

        // Cancellation is honored between steps; past the pointer swap the
        // section always runs to completion.
        if self.shutdown_token.is_cancelled() {
            self.restore_and_resume(snapshot.as_deref()).await;
            return Err(abort(eyre::eyre!("shutdown requested during upgrade")));
        }

        // 3. A misconfigured environment fails here, fast and cheap.
        if let Err(error) = self.hook.run(upgrade).await {
            self.restore_and_resume(snapshot.as_deref()).await;
            return Err(abort(error.wrap_err("pre-upgrade hook failed")));
        }

        // 4. Make sure the new binary is on disk and verified.
        if let Err(error) = self.downloader.ensure_upgrade_binary(upgrade).await {
            self.restore_and_resume(snapshot.as_deref()).await;
            return Err(abort(error.wrap_err("failed ensuring upgrade binary")));
        }

        if self.shutdown_token.is_cancelled() {
            self.restore_and_resume(snapshot.as_deref()).await;
            return Err(abort(eyre::eyre!("shutdown requested during upgrade")));
        }

        // 5. Stop the node before the pointer moves.
        if let Err(error) = self.process.stop().await {
            self.restore_and_resume(snapshot.as_deref()).await;
            return Err(abort(
                eyre::Report::new(error).wrap_err("failed stopping node for upgrade"),
            ));
        }

        // 6. The point of no easy return.
        let previous = self.layout.current_target().ok();
        if let Err(error) = self.layout.set_current_upgrade(&upgrade.name) {
            self.restore_data(snapshot.as_deref()).await;
            return Err(abort(
                eyre::Report::new(error).wrap_err("failed swapping current pointer"),
            ));
        }

        // 7. Bring the node back up on the new binary, or roll the pointer
        //    back and bring up the old one.
        if let Err(error) = self.process.start(&self.node_args).await {
            warn!(%error, "node failed to start on the new binary; rolling back");
            let Some(previous) = previous else {
                return Err(UpgradeFailure::Fatal(
                    eyre::Report::new(error)
                        .wrap_err("node failed to start and no previous binary is known"),
                ));
            };
            if let Err(swap_back) = self.layout.set_current_target(&previous) {
                return Err(UpgradeFailure::Fatal(
                    eyre::Report::new(swap_back)
                        .wrap_err("failed repointing at the previous binary after a failed start"),
                ));
            }
            if let Err(old_start) = self.process.start(&self.node_args).await {
                return Err(UpgradeFailure::Fatal(
                    eyre::Report::new(old_start)
                        .wrap_err("node failed to start on the previous binary as well"),
                ));
            }
            return Err(abort(
                eyre::Report::new(error)
                    .wrap_err("node failed to start on the new binary; previous binary restored"),
            ));
        }
        Ok(())
    }

    /// Restores the data directory from the snapshot, pausing the node
    /// around the restore: the data directory is never written while the
    /// node runs.
    async fn restore_and_resume(&self, snapshot: Option<&std::path::Path>) {
        let Some(snapshot) = snapshot else {
            return;
        };
        let was_running = self.process.status().state == ProcessState::Running;
        if was_running {
            if let Err(error) = self.process.stop().await {
                warn!(%error, "failed stopping node for rollback; skipping data restore");
                return;
            }
        }
        if let Err(error) = self.backups.restore_backup(snapshot).await {
            warn!(%error, "failed restoring data directory from backup");
        }
        if was_running {
            if let Err(error) = self.process.start(&self.node_args).await {
                warn!(%error, "failed restarting node after rollback");
            }
        }
    }

    /// Restores the data directory with the node already stopped, and
    /// leaves it stopped.
    async fn restore_data(&self, snapshot: Option<&std::path::Path>) {
        let Some(snapshot) = snapshot else {
            return;
        };
        if let Err(error) = self.backups.restore_backup(snapshot).await {
            warn!(%error, "failed restoring data directory from backup");
        }
    }
}
