//! Read-only runtime status for collaborators (API, metrics, alerting).
//!
//! The orchestrator is the only writer; everyone else sees value-copied
//! snapshots through a watch channel.

use serde::Serialize;
use tokio::sync::watch;

use crate::upgrade::UpgradeInfo;

#[derive(Clone, Debug, Default, Serialize)]
pub struct StatusSnapshot {
    /// The validated upgrade the orchestrator is waiting to apply.
    pub armed: Option<UpgradeInfo>,
    /// True while the upgrade critical section is running.
    pub upgrading: bool,
    pub last_applied_height: u64,
    pub last_applied_name: Option<String>,
}

pub(crate) struct State {
    inner: watch::Sender<StatusSnapshot>,
}

impl State {
    pub(crate) fn new() -> Self {
        Self {
            inner: watch::channel(StatusSnapshot::default()).0,
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.inner.subscribe()
    }

    pub(crate) fn set_armed(&self, armed: Option<UpgradeInfo>) {
        self.inner.send_modify(|snapshot| snapshot.armed = armed);
    }

    pub(crate) fn set_upgrading(&self, upgrading: bool) {
        self.inner.send_modify(|snapshot| snapshot.upgrading = upgrading);
    }

    pub(crate) fn record_applied(&self, upgrade: &UpgradeInfo) {
        self.inner.send_modify(|snapshot| {
            snapshot.armed = None;
            snapshot.last_applied_height = upgrade.height;
            snapshot.last_applied_name = Some(upgrade.name.clone());
        });
    }
}
