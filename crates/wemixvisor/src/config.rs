//! The supervisor configuration, read from `WEMIXVISOR_`-prefixed
//! environment variables.

use std::{
    collections::HashMap,
    path::PathBuf,
    time::Duration,
};

use figment::{
    providers::Env,
    Figment,
};
use serde::{
    Deserialize,
    Serialize,
};

/// Poll cadence used when `poll_interval_ms` is unset or non-positive.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Reads the supervisor config from the environment.
///
/// # Errors
/// Returns an error if a required variable is missing or a value cannot be
/// deserialized into its field.
pub fn get() -> Result<Config, figment::Error> {
    Config::from_environment("WEMIXVISOR_")
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Root directory anchoring all on-disk layout.
    pub home: String,

    /// Basename of the node executable under `<dir>/bin/`.
    pub node_name: String,

    /// URL of the node's JSON-RPC endpoint, queried for the current height.
    pub node_rpc_url: String,

    /// Extra arguments passed to the node executable, whitespace-separated.
    pub node_args: String,

    /// Log directive to use for telemetry.
    pub log: String,

    /// Writes logs to stdout instead of stderr.
    pub force_stdout: bool,

    /// Writes human-readable logs instead of JSON-formatted ones.
    pub pretty_print: bool,

    /// Poll cadence in milliseconds for the height monitor and the
    /// upgrade-info file watcher. Values <= 0 fall back to 5000.
    pub poll_interval_ms: i64,

    /// How long a stopping node may take to exit after SIGTERM before it is
    /// killed. 0 waits indefinitely.
    pub shutdown_grace_ms: u64,

    /// Restarts the node when it exits outside an upgrade.
    pub restart_after_upgrade: bool,

    /// Delay in milliseconds before such a restart.
    pub restart_delay_ms: u64,

    /// Allows fetching missing upgrade binaries over HTTP.
    pub allow_download_binaries: bool,

    /// JSON object mapping upgrade names to download URLs. The key
    /// `default` holds a template with `{name}`/`{version}` placeholders.
    pub download_urls: String,

    /// Skips checksum verification of downloaded binaries. Unsafe.
    pub unsafe_skip_checksum: bool,

    /// Path of a script to run before every upgrade instead of the
    /// per-upgrade `pre-upgrade` script. Empty means unset.
    pub custom_pre_upgrade: String,

    /// How often a failing pre-upgrade script is retried.
    pub pre_upgrade_max_retries: u32,

    /// Skips the data-directory snapshot before the swap. Unsafe.
    pub unsafe_skip_backup: bool,

    /// How long backups are retained, in hours.
    pub backup_retention_hours: u64,

    /// Reserved for collaborator logic; the supervisor core ignores it.
    pub validator_mode: bool,
}

impl Config {
    fn from_environment(envar_prefix: &str) -> Result<Config, figment::Error> {
        Figment::new()
            .merge(Env::prefixed("RUST_").split("_").only(&["log"]))
            .merge(Env::prefixed(envar_prefix))
            .extract()
    }

    #[must_use]
    pub fn home_dir(&self) -> PathBuf {
        PathBuf::from(&self.home)
    }

    /// The directory holding the node's chain data, snapshotted by the
    /// backup manager and watched for `upgrade-info.json`.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.home_dir().join("data")
    }

    #[must_use]
    pub fn upgrade_info_path(&self) -> PathBuf {
        self.data_dir().join("upgrade-info.json")
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        u64::try_from(self.poll_interval_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map_or(DEFAULT_POLL_INTERVAL, Duration::from_millis)
    }

    /// `None` means wait indefinitely for a graceful stop.
    #[must_use]
    pub fn shutdown_grace(&self) -> Option<Duration> {
        (self.shutdown_grace_ms > 0).then(|| Duration::from_millis(self.shutdown_grace_ms))
    }

    #[must_use]
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    #[must_use]
    pub fn backup_retention(&self) -> Duration {
        Duration::from_secs(self.backup_retention_hours.saturating_mul(3600))
    }

    #[must_use]
    pub fn node_args(&self) -> Vec<String> {
        self.node_args
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    #[must_use]
    pub fn custom_pre_upgrade(&self) -> Option<PathBuf> {
        (!self.custom_pre_upgrade.is_empty()).then(|| PathBuf::from(&self.custom_pre_upgrade))
    }

    /// Parses the `download_urls` JSON object. An empty value yields an
    /// empty map.
    ///
    /// # Errors
    /// Returns an error if the value is non-empty and not a JSON object of
    /// strings.
    pub fn download_urls(&self) -> Result<HashMap<String, String>, serde_json::Error> {
        if self.download_urls.is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&self.download_urls)
    }
}
