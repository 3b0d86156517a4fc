//! Runs the operator-supplied pre-upgrade script, if any, before the binary
//! swap.

use std::{
    path::PathBuf,
    process::Output,
    time::Duration,
};

use eyre::{
    bail,
    ensure,
    WrapErr as _,
};
use tokio::time::timeout;
use tracing::{
    debug,
    info,
    instrument,
    warn,
};

use crate::{
    layout::BinaryLayout,
    upgrade::UpgradeInfo,
};

/// Hard per-attempt limit on script execution.
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

pub struct PreUpgradeHook {
    layout: BinaryLayout,
    home: PathBuf,
    node_name: String,
    custom_script: Option<PathBuf>,
    max_retries: u32,
}

impl PreUpgradeHook {
    #[must_use]
    pub fn new(
        layout: BinaryLayout,
        home: PathBuf,
        node_name: String,
        custom_script: Option<PathBuf>,
        max_retries: u32,
    ) -> Self {
        Self {
            layout,
            home,
            node_name,
            custom_script,
            max_retries,
        }
    }

    fn resolve_script(&self, upgrade: &UpgradeInfo) -> PathBuf {
        self.custom_script.clone().unwrap_or_else(|| {
            self.layout.upgrade_dir(&upgrade.name).join("pre-upgrade")
        })
    }

    /// Runs the resolved script with the upgrade described in its
    /// environment. A missing script is a no-op success. Each attempt is
    /// bounded by a five minute timeout; failing attempts are retried up to
    /// the configured maximum with linear backoff.
    ///
    /// # Errors
    /// Returns an error if the script keeps failing or timing out after all
    /// retries.
    #[instrument(skip_all, fields(upgrade = %upgrade))]
    pub async fn run(&self, upgrade: &UpgradeInfo) -> eyre::Result<()> {
        let script = self.resolve_script(upgrade);
        if !script.exists() {
            debug!(script = %script.display(), "no pre-upgrade script; skipping");
            return Ok(());
        }

        let upgrade_info = serde_json::to_string(upgrade)
            .wrap_err("failed encoding upgrade for the script environment")?;
        let mut height_buf = itoa::Buffer::new();
        let height = height_buf.format(upgrade.height).to_string();

        let retry_config = tryhard::RetryFutureConfig::new(self.max_retries)
            .linear_backoff(RETRY_BASE_DELAY)
            .on_retry(|attempt, next_delay: Option<Duration>, error: &eyre::Report| {
                let wait_duration = next_delay
                    .map(humantime::format_duration)
                    .map(tracing::field::display);
                warn!(
                    attempt,
                    wait_duration,
                    %error,
                    "pre-upgrade script failed; retrying after delay",
                );
                futures::future::ready(())
            });

        tryhard::retry_fn(|| {
            run_script_once(
                &script,
                &self.home,
                &self.node_name,
                &upgrade.name,
                &height,
                &upgrade_info,
            )
        })
        .with_config(retry_config)
        .await
        .wrap_err_with(|| format!("pre-upgrade script `{}` failed", script.display()))?;

        info!(script = %script.display(), "pre-upgrade script succeeded");
        Ok(())
    }
}

async fn run_script_once(
    script: &PathBuf,
    home: &PathBuf,
    node_name: &str,
    upgrade_name: &str,
    upgrade_height: &str,
    upgrade_info: &str,
) -> eyre::Result<()> {
    let mut command = tokio::process::Command::new(script);
    command
        .env("DAEMON_HOME", home)
        .env("DAEMON_NAME", node_name)
        .env("UPGRADE_NAME", upgrade_name)
        .env("UPGRADE_HEIGHT", upgrade_height)
        .env("UPGRADE_INFO", upgrade_info)
        .kill_on_drop(true);
    let output: Output = match timeout(SCRIPT_TIMEOUT, command.output()).await {
        Ok(output) => output.wrap_err("failed executing pre-upgrade script")?,
        Err(_) => bail!("script execution timeout"),
    };
    log_captured_output(&output);
    ensure!(
        output.status.success(),
        "pre-upgrade script exited with {}",
        output.status,
    );
    Ok(())
}

fn log_captured_output(output: &Output) {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stdout = stdout.trim();
    if !stdout.is_empty() {
        info!(stdout, "pre-upgrade script output");
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        warn!(stderr, "pre-upgrade script error output");
    }
}
