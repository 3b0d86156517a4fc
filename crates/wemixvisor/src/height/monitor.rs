//! Polls a [`HeightProvider`] and fans height changes out to subscribers.

use std::{
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
        Mutex,
    },
    time::Duration,
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
    warn,
};

use super::provider::HeightProvider;

/// Bound of each subscriber mailbox. A subscriber that falls further behind
/// than this loses updates rather than stalling the monitor.
const SUBSCRIBER_BUFFER: usize = 10;

struct Shared {
    current: AtomicU64,
    subscribers: Mutex<Vec<mpsc::Sender<u64>>>,
}

impl Shared {
    fn publish(&self, height: u64) {
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("subscriber list lock must not be poisoned");
        subscribers.retain(|subscriber| match subscriber.try_send(height) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(height, "subscriber mailbox full; dropping height update");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// A cheap read-only view of the last observed height, handed to
/// collaborators that must not hold the monitor itself.
#[derive(Clone)]
pub struct HeightReader {
    shared: Arc<Shared>,
}

impl HeightReader {
    /// The last successfully observed height; 0 before the first success.
    #[must_use]
    pub fn current_height(&self) -> u64 {
        self.shared.current.load(Ordering::Relaxed)
    }
}

/// Observes the node's height at a fixed cadence and publishes every change
/// to all subscribers. Provider errors are tolerated indefinitely.
pub struct HeightMonitor {
    provider: Arc<dyn HeightProvider>,
    poll_interval: Duration,
    shared: Arc<Shared>,
    shutdown_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HeightMonitor {
    #[must_use]
    pub fn new(provider: Arc<dyn HeightProvider>, poll_interval: Duration) -> Self {
        Self {
            provider,
            poll_interval,
            shared: Arc::new(Shared {
                current: AtomicU64::new(0),
                subscribers: Mutex::new(Vec::new()),
            }),
            shutdown_token: CancellationToken::new(),
            task: None,
        }
    }

    /// The last successfully observed height; 0 before the first success.
    #[must_use]
    pub fn current_height(&self) -> u64 {
        self.shared.current.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn reader(&self) -> HeightReader {
        HeightReader {
            shared: self.shared.clone(),
        }
    }

    /// Registers a new subscriber. Its mailbox is bounded; under pressure
    /// updates are dropped (warn-logged), never reordered. The subscriber is
    /// seeded with the current height so it does not have to wait for the
    /// next change.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::Receiver<u64> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let current = self.current_height();
        if current > 0 {
            let _ = tx.try_send(current);
        }
        self.shared
            .subscribers
            .lock()
            .expect("subscriber list lock must not be poisoned")
            .push(tx);
        rx
    }

    /// Spawns the poll loop. One-shot: a monitor that has been started
    /// cannot be started again, even after a stop.
    ///
    /// # Errors
    /// Returns an error if the monitor was already started.
    pub fn start(&mut self) -> eyre::Result<()> {
        if self.task.is_some() || self.shutdown_token.is_cancelled() {
            bail!("height monitor can only be started once");
        }
        let worker = PollLoop {
            provider: self.provider.clone(),
            poll_interval: self.poll_interval,
            shared: self.shared.clone(),
            shutdown_token: self.shutdown_token.clone(),
        };
        self.task = Some(tokio::spawn(worker.run()));
        Ok(())
    }

    /// Cancels the poll loop and waits for it to exit. Idempotent.
    pub async fn stop(&mut self) {
        self.shutdown_token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                warn!(%error, "height monitor poll loop panicked");
            }
        }
    }
}

struct PollLoop {
    provider: Arc<dyn HeightProvider>,
    poll_interval: Duration,
    shared: Arc<Shared>,
    shutdown_token: CancellationToken,
}

impl PollLoop {
    async fn run(self) {
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            select!(
                biased;

                () = self.shutdown_token.cancelled() => {
                    debug!("height monitor received shutdown signal");
                    break;
                }

                _ = poll.tick() => self.tick().await,
            );
        }
    }

    async fn tick(&self) {
        let height = match self.provider.current_height().await {
            Ok(height) => height,
            Err(error) => {
                // Keep the last good value; the provider is permitted to
                // fail transiently.
                warn!(%error, "failed querying node for current height");
                return;
            }
        };
        let previous = self.shared.current.swap(height, Ordering::Relaxed);
        if height != previous {
            debug!(previous, height, "observed height change");
            self.shared.publish(height);
        }
    }
}
