//! The unit of scheduled work: a named, height-scheduled swap of the node's
//! executable, either alone ([`UpgradeInfo`]) or as an ordered batch
//! ([`plan::UpgradePlan`]).

use serde::{
    Deserialize,
    Serialize,
};

pub mod plan;
pub(crate) mod source;

pub use plan::UpgradePlan;

/// A scheduled upgrade. `(name, height)` is the identity of an upgrade
/// attempt; the free-form `info` map carries anything a collaborator wants to
/// pass through to the downloader or the pre-upgrade hook (download URLs,
/// checksums).
///
/// This type round-trips through the on-disk `upgrade-info.json` format.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpgradeInfo {
    pub name: String,
    pub height: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<serde_json::Map<String, serde_json::Value>>,
}

impl UpgradeInfo {
    pub fn new(name: impl Into<String>, height: u64) -> Self {
        Self {
            name: name.into(),
            height,
            info: None,
        }
    }

    /// Checks the invariants every accepted upgrade must satisfy.
    ///
    /// # Errors
    /// Returns an error if the name is empty or the target height is zero.
    pub fn validate(&self) -> Result<(), InvalidUpgrade> {
        if self.name.is_empty() {
            return Err(InvalidUpgrade::EmptyName);
        }
        if self.height == 0 {
            return Err(InvalidUpgrade::ZeroHeight {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Returns true if `other` names the same upgrade attempt.
    pub(crate) fn same_attempt(&self, other: &UpgradeInfo) -> bool {
        self.name == other.name && self.height == other.height
    }
}

impl std::fmt::Display for UpgradeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.height)
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum InvalidUpgrade {
    #[error("upgrade name must not be empty")]
    EmptyName,
    #[error("upgrade `{name}` has height 0; the target height must be strictly positive")]
    ZeroHeight { name: String },
    #[error(
        "upgrade `{name}` at height {height} is scheduled at or below the current height \
         {current_height}: height exceeded"
    )]
    HeightExceeded {
        name: String,
        height: u64,
        current_height: u64,
    },
}
