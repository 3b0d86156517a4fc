//! The supervisor wires the height monitor, upgrade source, process
//! manager, and the upgrade steps together, and owns the orchestrator task.

mod inner;
mod state;

use std::sync::Arc;

use eyre::WrapErr as _;
use inner::Inner;
use pin_project_lite::pin_project;
pub use state::StatusSnapshot;
use tokio::task::{
    JoinError,
    JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    instrument,
    warn,
};

use crate::{
    backup::BackupManager,
    config::Config,
    download::Downloader,
    height::{
        HeightMonitor,
        HeightProvider,
        HeightReader,
        RpcHeightProvider,
    },
    hook::PreUpgradeHook,
    layout::BinaryLayout,
    process::{
        ProcessManager,
        ProcessStatus,
    },
    upgrade::{
        source::{
            PendingSlot,
            UpgradeSource,
        },
        InvalidUpgrade,
        UpgradeInfo,
    },
};

/// Entrypoint for collaborators to schedule upgrades and read progress.
///
/// Cloneable and cheap; every accepted schedule flows through the same
/// validation and the same pending slot the file watcher feeds.
#[derive(Clone)]
pub struct Scheduler {
    slot: PendingSlot,
    heights: HeightReader,
}

impl Scheduler {
    /// Schedules an upgrade.
    ///
    /// # Errors
    /// Returns an error if the upgrade is malformed or its target height is
    /// at or below the node's current height ("height exceeded").
    pub fn schedule(&self, upgrade: UpgradeInfo) -> Result<(), InvalidUpgrade> {
        upgrade.validate()?;
        let current_height = self.heights.current_height();
        if upgrade.height <= current_height {
            return Err(InvalidUpgrade::HeightExceeded {
                name: upgrade.name,
                height: upgrade.height,
                current_height,
            });
        }
        self.slot.offer(upgrade);
        Ok(())
    }

    /// The node's last observed block height.
    #[must_use]
    pub fn current_height(&self) -> u64 {
        self.heights.current_height()
    }
}

pin_project! {
    /// A running supervisor, created with [`Supervisor::spawn`].
    ///
    /// The handle doubles as a future resolving with the orchestrator
    /// task's result; dropping it does not stop the supervisor.
    pub struct Handle {
        shutdown_token: CancellationToken,
        scheduler: Scheduler,
        process: Arc<ProcessManager>,
        status_rx: tokio::sync::watch::Receiver<StatusSnapshot>,
        task: Option<JoinHandle<eyre::Result<()>>>,
    }
}

impl Handle {
    /// Initiates a graceful shutdown (node stopped with SIGTERM first) and
    /// returns the orchestrator's result.
    ///
    /// # Errors
    /// Returns an error if the orchestrator task panicked.
    ///
    /// # Panics
    /// Panics if shutdown is called twice.
    #[instrument(skip_all, err)]
    pub async fn shutdown(&mut self) -> Result<eyre::Result<()>, JoinError> {
        self.shutdown_token.cancel();
        self.task
            .take()
            .expect("shutdown must not be called twice")
            .await
    }

    /// Kills the node immediately (SIGKILL, no grace) and shuts the
    /// supervisor down. Used on SIGQUIT.
    ///
    /// # Errors
    /// Returns an error if the orchestrator task panicked.
    ///
    /// # Panics
    /// Panics if called after shutdown.
    pub async fn kill(&mut self) -> Result<eyre::Result<()>, JoinError> {
        if let Err(error) = self.process.kill().await {
            warn!(%error, "failed killing node process group");
        }
        self.shutdown_token.cancel();
        self.task
            .take()
            .expect("kill must not be called after shutdown")
            .await
    }

    #[must_use]
    pub fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }

    /// Value-copied orchestrator status.
    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        self.status_rx.borrow().clone()
    }

    /// Waits until the orchestrator status satisfies `predicate` and
    /// returns the matching snapshot, or `None` if the supervisor exited.
    pub async fn status_changed(
        &mut self,
        predicate: impl FnMut(&StatusSnapshot) -> bool,
    ) -> Option<StatusSnapshot> {
        self.status_rx
            .wait_for(predicate)
            .await
            .ok()
            .map(|snapshot| snapshot.clone())
    }

    #[must_use]
    pub fn current_height(&self) -> u64 {
        self.scheduler.current_height()
    }

    #[must_use]
    pub fn process_status(&self) -> ProcessStatus {
        self.process.status()
    }
}

impl std::future::Future for Handle {
    type Output = Result<eyre::Result<()>, JoinError>;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        use futures::future::FutureExt as _;
        let this = self.project();
        let task = this
            .task
            .as_mut()
            .expect("the supervisor handle must not be polled after shutdown");
        task.poll_unpin(cx)
    }
}

/// Supervises one node: holds every component wired but not yet running.
pub struct Supervisor {
    shutdown_token: CancellationToken,
    inner: Inner,
    process: Arc<ProcessManager>,
    scheduler: Scheduler,
    status_rx: tokio::sync::watch::Receiver<StatusSnapshot>,
}

impl Supervisor {
    /// Creates a supervisor from a [`Config`], querying heights over the
    /// node's JSON-RPC endpoint.
    ///
    /// # Errors
    /// Returns an error if any component cannot be constructed from the
    /// config.
    pub fn new(cfg: Config) -> eyre::Result<Self> {
        let provider = RpcHeightProvider::new(&cfg.node_rpc_url)
            .wrap_err("failed constructing height provider")?;
        Self::with_height_provider(cfg, Arc::new(provider))
    }

    /// Creates a supervisor with a caller-supplied height provider. This is
    /// the seam embedders and tests use to control observed heights.
    ///
    /// # Errors
    /// Returns an error if any component cannot be constructed from the
    /// config.
    pub fn with_height_provider(
        cfg: Config,
        provider: Arc<dyn HeightProvider>,
    ) -> eyre::Result<Self> {
        let shutdown_token = CancellationToken::new();
        let layout = BinaryLayout::new(&cfg.home_dir(), &cfg.node_name);

        let monitor = HeightMonitor::new(provider, cfg.poll_interval());
        let height_rx = monitor.subscribe();
        let heights = monitor.reader();

        let (source, source_rx) = UpgradeSource::new(cfg.upgrade_info_path(), cfg.poll_interval());
        let slot = source.slot();

        let (process, exit_rx) = ProcessManager::new(layout.clone(), cfg.shutdown_grace());
        let process = Arc::new(process);

        let downloader = Downloader::new(
            layout.clone(),
            cfg.allow_download_binaries,
            cfg.download_urls()
                .wrap_err("failed parsing download_urls")?,
            cfg.unsafe_skip_checksum,
        )
        .wrap_err("failed constructing downloader")?;

        let backups = BackupManager::new(cfg.data_dir(), layout.root().join("backups"));

        let hook = PreUpgradeHook::new(
            layout.clone(),
            cfg.home_dir(),
            cfg.node_name.clone(),
            cfg.custom_pre_upgrade(),
            cfg.pre_upgrade_max_retries,
        );

        let state = Arc::new(state::State::new());
        let status_rx = state.subscribe();

        let inner = Inner {
            shutdown_token: shutdown_token.child_token(),
            monitor,
            height_rx,
            source,
            source_rx,
            process: process.clone(),
            exit_rx,
            layout,
            downloader,
            backups,
            hook,
            state,
            node_args: cfg.node_args(),
            allow_downloads: cfg.allow_download_binaries,
            unsafe_skip_backup: cfg.unsafe_skip_backup,
            backup_retention: cfg.backup_retention(),
            restart_after_upgrade: cfg.restart_after_upgrade,
            restart_delay: cfg.restart_delay(),
            armed: None,
            last_applied_height: 0,
        };

        Ok(Self {
            shutdown_token,
            inner,
            process,
            scheduler: Scheduler {
                slot,
                heights,
            },
            status_rx,
        })
    }

    #[must_use]
    pub fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }

    /// Spawns the orchestrator task and returns the handle controlling it.
    #[must_use]
    pub fn spawn(self) -> Handle {
        let task = tokio::spawn(self.inner.run_until_stopped());
        Handle {
            shutdown_token: self.shutdown_token,
            scheduler: self.scheduler,
            process: self.process,
            status_rx: self.status_rx,
            task: Some(task),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        os::unix::fs::PermissionsExt as _,
        sync::{
            atomic::{
                AtomicU64,
                Ordering,
            },
            Arc,
        },
        time::Duration,
    };

    use async_trait::async_trait;

    use super::{
        Handle,
        Supervisor,
    };
    use crate::{
        height::HeightProvider,
        process::ProcessState,
        upgrade::UpgradeInfo,
        Config,
    };

    const NODE: &str = "gwemix";
    const WAIT: Duration = Duration::from_secs(15);

    struct FixedProvider(AtomicU64);

    #[async_trait]
    impl HeightProvider for FixedProvider {
        async fn current_height(&self) -> eyre::Result<u64> {
            Ok(self.0.load(Ordering::Relaxed))
        }
    }

    fn place_executable(path: &std::path::Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
        let mut perms = std::fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).unwrap();
    }

    fn test_config(home: &std::path::Path) -> Config {
        let mut cfg = crate::test_utils::example_config();
        cfg.home = home.display().to_string();
        cfg.poll_interval_ms = 25;
        cfg.shutdown_grace_ms = 2000;
        cfg.restart_delay_ms = 50;
        cfg.pre_upgrade_max_retries = 0;
        cfg
    }

    fn spawn_at_height(
        home: &std::path::Path,
        height: u64,
    ) -> (Handle, Arc<FixedProvider>) {
        let provider = Arc::new(FixedProvider(AtomicU64::new(height)));
        let supervisor =
            Supervisor::with_height_provider(test_config(home), provider.clone()).unwrap();
        (supervisor.spawn(), provider)
    }

    async fn await_running(handle: &Handle) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while handle.process_status().state != ProcessState::Running {
            assert!(tokio::time::Instant::now() < deadline, "node did not come up");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// A failing pre-upgrade hook aborts the attempt; the data mutations
    /// the hook made are rolled back, the pointer stays put, and the armed
    /// upgrade is kept.
    #[tokio::test]
    async fn failing_hook_rolls_back_and_keeps_armed() {
        let home = tempfile::tempdir().unwrap();
        let visor = home.path().join("wemixvisor");
        place_executable(&visor.join("genesis").join("bin").join(NODE), "#!/bin/sh\nexec sleep 600\n");
        place_executable(
            &visor.join("upgrades").join("v2").join("bin").join(NODE),
            "#!/bin/sh\nexec sleep 600\n",
        );
        // The hook corrupts the data directory, then fails.
        place_executable(
            &visor.join("upgrades").join("v2").join("pre-upgrade"),
            "#!/bin/sh\necho corrupted > \"$DAEMON_HOME/data/state\"\nexit 1\n",
        );
        std::fs::create_dir_all(home.path().join("data")).unwrap();
        std::fs::write(home.path().join("data").join("state"), b"pristine").unwrap();

        let (mut handle, provider) = spawn_at_height(home.path(), 90);
        await_running(&handle).await;
        handle.scheduler().schedule(UpgradeInfo::new("v2", 100)).unwrap();
        provider.0.store(100, Ordering::Relaxed);

        // The attempt runs and aborts; afterwards the hook's damage is gone.
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            assert!(tokio::time::Instant::now() < deadline, "rollback did not finish");
            let status = handle.status();
            let data = std::fs::read(home.path().join("data").join("state")).unwrap();
            if !status.upgrading
                && data == b"pristine"
                && handle.process_status().state == ProcessState::Running
                && !visor.join("backups").read_dir().map_or(true, |mut d| d.next().is_none())
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let status = handle.status();
        assert_eq!(status.armed, Some(UpgradeInfo::new("v2", 100)));
        assert_eq!(status.last_applied_height, 0);
        assert_eq!(
            std::fs::read_link(visor.join("current")).unwrap(),
            std::path::PathBuf::from("genesis"),
        );

        handle.shutdown().await.unwrap().unwrap();
    }

    /// Applied heights are monotonic: a second upgrade only applies beyond
    /// the first, and the same attempt is never applied twice.
    #[tokio::test]
    async fn applications_are_monotonic() {
        let home = tempfile::tempdir().unwrap();
        let visor = home.path().join("wemixvisor");
        for dir in ["genesis", "upgrades/v2", "upgrades/v3"] {
            place_executable(
                &visor.join(dir).join("bin").join(NODE),
                "#!/bin/sh\nexec sleep 600\n",
            );
        }
        std::fs::create_dir_all(home.path().join("data")).unwrap();

        let (mut handle, provider) = spawn_at_height(home.path(), 50);
        await_running(&handle).await;

        handle.scheduler().schedule(UpgradeInfo::new("v2", 100)).unwrap();
        provider.0.store(100, Ordering::Relaxed);
        tokio::time::timeout(WAIT, handle.status_changed(|s| s.last_applied_height == 100))
            .await
            .unwrap()
            .unwrap();

        // The same attempt is now behind the chain and cannot re-arm.
        let error = handle
            .scheduler()
            .schedule(UpgradeInfo::new("v2", 100))
            .unwrap_err();
        assert!(error.to_string().contains("height exceeded"), "{error}");

        handle.scheduler().schedule(UpgradeInfo::new("v3", 150)).unwrap();
        provider.0.store(150, Ordering::Relaxed);
        let status = tokio::time::timeout(
            WAIT,
            handle.status_changed(|s| s.last_applied_height == 150),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(status.last_applied_name.as_deref(), Some("v3"));

        handle.shutdown().await.unwrap().unwrap();
    }
}
