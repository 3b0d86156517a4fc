//! Detects pending upgrades from two origins feeding one slot: an on-disk
//! `upgrade-info.json` watched for mtime changes, and direct `schedule` calls
//! from the API or a plan runner.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        Mutex,
    },
    time::{
        Duration,
        SystemTime,
    },
};

use eyre::bail;
use tokio::{
    select,
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    error,
    info,
    warn,
};

use super::UpgradeInfo;

/// How many change notifications can sit unread. One is enough: the
/// orchestrator re-reads the slot on every wakeup, so coalescing is correct.
const NOTIFY_BUFFER: usize = 1;

#[derive(Default)]
struct SlotInner {
    pending: Option<UpgradeInfo>,
    needs_update: bool,
}

/// The single "current pending upgrade" slot shared by both origins.
///
/// A new candidate replaces the pending upgrade iff its `(name, height)`
/// differs from what is already there; offering the same attempt again is a
/// no-op. Every replacement raises the dirty flag and pings the notification
/// channel.
#[derive(Clone)]
pub(crate) struct PendingSlot {
    inner: Arc<Mutex<SlotInner>>,
    notify: mpsc::Sender<()>,
}

impl PendingSlot {
    fn new(notify: mpsc::Sender<()>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SlotInner::default())),
            notify,
        }
    }

    /// Returns true if the candidate replaced the pending upgrade.
    pub(crate) fn offer(&self, candidate: UpgradeInfo) -> bool {
        let replaced = {
            let mut inner = self.inner.lock().expect("pending slot lock must not be poisoned");
            if inner
                .pending
                .as_ref()
                .is_some_and(|pending| pending.same_attempt(&candidate))
            {
                false
            } else {
                info!(upgrade = %candidate, "new pending upgrade");
                inner.pending = Some(candidate);
                inner.needs_update = true;
                true
            }
        };
        if replaced {
            // A full buffer already means a wakeup is owed; dropping is fine.
            let _ = self.notify.try_send(());
        }
        replaced
    }

    pub(crate) fn pending(&self) -> Option<UpgradeInfo> {
        self.inner
            .lock()
            .expect("pending slot lock must not be poisoned")
            .pending
            .clone()
    }

    pub(crate) fn needs_update(&self) -> bool {
        self.inner
            .lock()
            .expect("pending slot lock must not be poisoned")
            .needs_update
    }

    pub(crate) fn clear_update_flag(&self) {
        self.inner
            .lock()
            .expect("pending slot lock must not be poisoned")
            .needs_update = false;
    }
}

/// Watches `data/upgrade-info.json` and accepts programmatic schedules.
pub(crate) struct UpgradeSource {
    slot: PendingSlot,
    watch_path: PathBuf,
    poll_interval: Duration,
    shutdown_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl UpgradeSource {
    /// Creates the source together with the receiver the orchestrator
    /// selects on for change notifications.
    pub(crate) fn new(watch_path: PathBuf, poll_interval: Duration) -> (Self, mpsc::Receiver<()>) {
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_BUFFER);
        let source = Self {
            slot: PendingSlot::new(notify_tx),
            watch_path,
            poll_interval,
            shutdown_token: CancellationToken::new(),
            task: None,
        };
        (source, notify_rx)
    }

    pub(crate) fn slot(&self) -> PendingSlot {
        self.slot.clone()
    }

    /// Spawns the file-watch loop. One-shot: a live source cannot be started
    /// twice.
    ///
    /// # Errors
    /// Returns an error if the watch loop is already running.
    pub(crate) fn start(&mut self) -> eyre::Result<()> {
        if self.task.is_some() {
            bail!("upgrade source is already running");
        }
        let worker = WatchLoop {
            slot: self.slot.clone(),
            watch_path: self.watch_path.clone(),
            poll_interval: self.poll_interval,
            shutdown_token: self.shutdown_token.clone(),
            last_mtime: None,
        };
        self.task = Some(tokio::spawn(worker.run()));
        Ok(())
    }

    /// Cancels the watch loop and waits for it to exit. Idempotent.
    pub(crate) async fn stop(&mut self) {
        self.shutdown_token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                warn!(%error, "upgrade source watch loop panicked");
            }
        }
    }
}

struct WatchLoop {
    slot: PendingSlot,
    watch_path: PathBuf,
    poll_interval: Duration,
    shutdown_token: CancellationToken,
    last_mtime: Option<SystemTime>,
}

impl WatchLoop {
    async fn run(mut self) {
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        debug!(path = %self.watch_path.display(), "watching upgrade-info file");
        loop {
            select!(
                biased;

                () = self.shutdown_token.cancelled() => {
                    debug!("upgrade source watch loop received shutdown signal");
                    break;
                }

                _ = poll.tick() => self.tick().await,
            );
        }
    }

    async fn tick(&mut self) {
        let mtime = match tokio::fs::metadata(&self.watch_path).await {
            Ok(metadata) => match metadata.modified() {
                Ok(mtime) => mtime,
                Err(error) => {
                    warn!(%error, "failed reading mtime of upgrade-info file");
                    return;
                }
            },
            // The file not existing is the steady state before an upgrade
            // is scheduled.
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return,
            Err(error) => {
                warn!(%error, "failed stating upgrade-info file");
                return;
            }
        };
        if self.last_mtime.is_some_and(|seen| mtime <= seen) {
            return;
        }
        self.last_mtime = Some(mtime);
        match read_upgrade_info(&self.watch_path).await {
            Ok(upgrade) => {
                self.slot.offer(upgrade);
            }
            Err(error) => {
                error!(
                    path = %self.watch_path.display(),
                    %error,
                    "ignoring unusable upgrade-info file",
                );
            }
        }
    }
}

async fn read_upgrade_info(path: &PathBuf) -> eyre::Result<UpgradeInfo> {
    use eyre::WrapErr as _;

    let raw = tokio::fs::read(path)
        .await
        .wrap_err("failed reading upgrade-info file")?;
    if raw.is_empty() {
        bail!("upgrade-info file is empty");
    }
    let upgrade: UpgradeInfo =
        serde_json::from_slice(&raw).wrap_err("failed parsing upgrade-info file")?;
    upgrade
        .validate()
        .wrap_err("upgrade-info file failed validation")?;
    Ok(upgrade)
}
