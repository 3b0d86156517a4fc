use std::{
    os::unix::fs::PermissionsExt as _,
    path::{
        Path,
        PathBuf,
    },
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
use tempfile::TempDir;
use wemixvisor::{
    height::HeightProvider,
    supervisor::{
        Handle,
        StatusSnapshot,
    },
    Config,
    Supervisor,
};

pub const NODE: &str = "gwemix";
/// A node that runs until it is signaled.
pub const LONG_RUNNING_NODE: &str = "#!/bin/sh\nexec sleep 600\n";

pub const WAIT: Duration = Duration::from_secs(15);

/// A height provider the test drives by hand.
pub struct AdjustableProvider {
    height: AtomicU64,
}

impl AdjustableProvider {
    pub fn with_height(height: u64) -> Arc<Self> {
        Arc::new(Self {
            height: AtomicU64::new(height),
        })
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::Relaxed);
    }
}

#[async_trait]
impl HeightProvider for AdjustableProvider {
    async fn current_height(&self) -> eyre::Result<u64> {
        Ok(self.height.load(Ordering::Relaxed))
    }
}

/// A supervisor running against a scratch home directory and a hand-driven
/// height provider.
pub struct TestSupervisor {
    // Held so the scratch directory outlives the supervisor.
    pub home: TempDir,
    pub provider: Arc<AdjustableProvider>,
    pub handle: Handle,
}

impl TestSupervisor {
    /// Spawns a supervisor over a fresh home with a genesis node binary in
    /// place. `configure` may adjust the config before the spawn.
    pub async fn spawn(
        initial_height: u64,
        configure: impl FnOnce(&mut Config),
    ) -> Self {
        let home = TempDir::new().unwrap();
        place_executable(
            &home
                .path()
                .join("wemixvisor")
                .join("genesis")
                .join("bin")
                .join(NODE),
            LONG_RUNNING_NODE,
        );
        std::fs::create_dir_all(home.path().join("data")).unwrap();

        let mut cfg = test_config(home.path());
        configure(&mut cfg);

        let provider = AdjustableProvider::with_height(initial_height);
        let supervisor = Supervisor::with_height_provider(cfg, provider.clone()).unwrap();
        let handle = supervisor.spawn();

        Self {
            home,
            provider,
            handle,
        }
    }

    pub fn upgrade_bin_path(&self, name: &str) -> PathBuf {
        self.home
            .path()
            .join("wemixvisor")
            .join("upgrades")
            .join(name)
            .join("bin")
            .join(NODE)
    }

    pub fn upgrade_info_path(&self) -> PathBuf {
        self.home.path().join("data").join("upgrade-info.json")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.home.path().join("wemixvisor").join("backups")
    }

    /// The directory name the `current` pointer holds, e.g. `genesis` or
    /// `upgrades/v2`.
    pub fn current_pointer(&self) -> PathBuf {
        std::fs::read_link(self.home.path().join("wemixvisor").join("current")).unwrap()
    }

    /// Waits until the orchestrator status satisfies `predicate`, panicking
    /// after the shared deadline.
    pub async fn await_status(
        &mut self,
        predicate: impl FnMut(&StatusSnapshot) -> bool,
    ) -> StatusSnapshot {
        tokio::time::timeout(WAIT, self.handle.status_changed(predicate))
            .await
            .expect("status did not reach the expected shape in time")
            .expect("supervisor exited while awaiting status")
    }

    /// Waits until `condition` holds, polling.
    pub async fn await_condition(&self, mut condition: impl FnMut(&Self) -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !condition(self) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition did not hold in time",
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn shutdown(mut self) {
        self.handle
            .shutdown()
            .await
            .expect("supervisor task must not panic")
            .expect("supervisor must shut down cleanly");
    }
}

pub fn place_executable(path: &Path, contents: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
    let mut perms = std::fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).unwrap();
}

pub fn test_config(home: &Path) -> Config {
    Config {
        home: home.display().to_string(),
        node_name: NODE.to_string(),
        node_rpc_url: "http://127.0.0.1:0".to_string(),
        node_args: String::new(),
        log: String::new(),
        force_stdout: false,
        pretty_print: false,
        poll_interval_ms: 25,
        shutdown_grace_ms: 2000,
        restart_after_upgrade: true,
        restart_delay_ms: 50,
        allow_download_binaries: false,
        download_urls: String::new(),
        unsafe_skip_checksum: false,
        custom_pre_upgrade: String::new(),
        pre_upgrade_max_retries: 0,
        unsafe_skip_backup: false,
        backup_retention_hours: 168,
        validator_mode: false,
    }
}
