//! Ordered batches of upgrades loaded from operator-authored plan files.

use std::path::{
    Path,
    PathBuf,
};

use chrono::{
    DateTime,
    Utc,
};
use eyre::WrapErr as _;
use serde::{
    Deserialize,
    Serialize,
};
use tracing::info;

use super::UpgradeInfo;

pub const PLAN_FORMAT_VERSION: &str = "1.0";

/// An ordered batch of upgrades. Heights must be strictly increasing and
/// names unique within the plan; both are checked on load and again before
/// execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpgradePlan {
    pub version: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub upgrades: Vec<UpgradeInfo>,
}

impl UpgradePlan {
    /// Reads and validates a plan file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, does not parse, or fails
    /// [`UpgradePlan::validate`].
    pub async fn load(path: &Path) -> eyre::Result<Self> {
        let raw = tokio::fs::read(path)
            .await
            .wrap_err_with(|| format!("failed reading plan file `{}`", path.display()))?;
        let plan: UpgradePlan = serde_json::from_slice(&raw)
            .wrap_err_with(|| format!("failed parsing plan file `{}`", path.display()))?;
        plan.validate()
            .wrap_err_with(|| format!("plan file `{}` is invalid", path.display()))?;
        Ok(plan)
    }

    /// # Errors
    /// Returns an error if the plan is empty, if any contained upgrade is
    /// itself invalid, if heights are not strictly increasing, or if a name
    /// appears twice.
    pub fn validate(&self) -> Result<(), InvalidPlan> {
        if self.name.is_empty() {
            return Err(InvalidPlan::EmptyName);
        }
        if self.upgrades.is_empty() {
            return Err(InvalidPlan::NoUpgrades);
        }
        let mut last_height = 0u64;
        let mut seen = std::collections::HashSet::new();
        for upgrade in &self.upgrades {
            upgrade
                .validate()
                .map_err(|source| InvalidPlan::InvalidUpgrade {
                    name: upgrade.name.clone(),
                    source,
                })?;
            if upgrade.height <= last_height {
                return Err(InvalidPlan::NonIncreasingHeights {
                    name: upgrade.name.clone(),
                    height: upgrade.height,
                    previous: last_height,
                });
            }
            last_height = upgrade.height;
            if !seen.insert(upgrade.name.clone()) {
                return Err(InvalidPlan::DuplicateName {
                    name: upgrade.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Persists the plan under `plans_dir` as `<name>-<yyyymmdd-hhmmss>.json`
    /// and returns the written path.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or the file cannot
    /// be written.
    pub async fn persist(&self, plans_dir: &Path) -> eyre::Result<PathBuf> {
        tokio::fs::create_dir_all(plans_dir)
            .await
            .wrap_err_with(|| format!("failed creating `{}`", plans_dir.display()))?;
        let stamp = self.created_at.format("%Y%m%d-%H%M%S");
        let path = plans_dir.join(format!("{}-{stamp}.json", self.name));
        let encoded =
            serde_json::to_vec_pretty(self).wrap_err("failed serializing upgrade plan")?;
        tokio::fs::write(&path, encoded)
            .await
            .wrap_err_with(|| format!("failed writing plan to `{}`", path.display()))?;
        info!(plan = self.name, path = %path.display(), "persisted upgrade plan");
        Ok(path)
    }

    /// Writes a per-height `upgrade-info.json` copy for every upgrade in the
    /// plan under `data_dir/upgrades/<height>/`, so each one is recoverable
    /// individually after the watched file has moved on.
    ///
    /// # Errors
    /// Returns an error on the first copy that cannot be written.
    pub async fn write_height_copies(&self, data_dir: &Path) -> eyre::Result<()> {
        for upgrade in &self.upgrades {
            let dir = data_dir.join("upgrades").join(upgrade.height.to_string());
            tokio::fs::create_dir_all(&dir)
                .await
                .wrap_err_with(|| format!("failed creating `{}`", dir.display()))?;
            let path = dir.join("upgrade-info.json");
            let encoded =
                serde_json::to_vec_pretty(upgrade).wrap_err("failed serializing upgrade")?;
            tokio::fs::write(&path, encoded)
                .await
                .wrap_err_with(|| format!("failed writing `{}`", path.display()))?;
        }
        Ok(())
    }

    /// The first upgrade in the plan whose target height is still ahead of
    /// `current_height`.
    #[must_use]
    pub fn next_applicable(&self, current_height: u64) -> Option<&UpgradeInfo> {
        self.upgrades
            .iter()
            .find(|upgrade| upgrade.height > current_height)
    }

    /// Runs the plan: re-validates it, persists a copy under `plans_dir`,
    /// writes the per-height `upgrade-info.json` copies, and schedules the
    /// next applicable upgrade.
    ///
    /// # Errors
    /// Returns an error if validation, persistence, or scheduling fails.
    pub async fn execute(
        &self,
        scheduler: &crate::supervisor::Scheduler,
        plans_dir: &Path,
        data_dir: &Path,
    ) -> eyre::Result<()> {
        self.validate().wrap_err("refusing to execute invalid plan")?;
        self.persist(plans_dir).await?;
        self.write_height_copies(data_dir).await?;
        match self.next_applicable(scheduler.current_height()) {
            Some(next) => {
                scheduler
                    .schedule(next.clone())
                    .wrap_err_with(|| format!("failed scheduling `{next}` from plan"))?;
            }
            None => {
                info!(
                    plan = self.name,
                    "every upgrade in the plan lies at or below the current height; nothing to \
                     schedule",
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidPlan {
    #[error("plan name must not be empty")]
    EmptyName,
    #[error("plan contains no upgrades")]
    NoUpgrades,
    #[error("upgrade `{name}` in plan is invalid")]
    InvalidUpgrade {
        name: String,
        source: super::InvalidUpgrade,
    },
    #[error(
        "upgrade `{name}` at height {height} does not increase on the previous plan height \
         {previous}; plan heights must be strictly increasing"
    )]
    NonIncreasingHeights {
        name: String,
        height: u64,
        previous: u64,
    },
    #[error("upgrade name `{name}` appears more than once in the plan")]
    DuplicateName { name: String },
}
