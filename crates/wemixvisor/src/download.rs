//! Fetches upgrade binaries over HTTP and verifies them against a published
//! checksum before they are allowed into the binary layout.

use std::{
    collections::HashMap,
    os::unix::fs::PermissionsExt as _,
    path::{
        Path,
        PathBuf,
    },
    time::Duration,
};

use eyre::{
    bail,
    WrapErr as _,
};
use futures::StreamExt as _;
use tokio::io::AsyncWriteExt as _;
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

/// Retries after a failed download attempt; attempt `i` sleeps `2i` seconds.
const DOWNLOAD_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// Progress is reported at most this often while a download is running.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Checksum-file suffixes probed next to the binary URL, in order.
const CHECKSUM_SUFFIXES: [&str; 3] = [".sha256", ".sha512", ".checksum"];

pub struct Downloader {
    client: reqwest::Client,
    layout: BinaryLayout,
    allow_downloads: bool,
    urls: HashMap<String, String>,
    unsafe_skip_checksum: bool,
    retry_base_delay: Duration,
}

impl Downloader {
    /// # Errors
    /// Returns an error if the underlying HTTP client cannot be constructed.
    pub fn new(
        layout: BinaryLayout,
        allow_downloads: bool,
        urls: HashMap<String, String>,
        unsafe_skip_checksum: bool,
    ) -> eyre::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .wrap_err("failed constructing http client for binary downloads")?;
        Ok(Self {
            client,
            layout,
            allow_downloads,
            urls,
            unsafe_skip_checksum,
            retry_base_delay: RETRY_BASE_DELAY,
        })
    }

    #[cfg(test)]
    pub(crate) fn set_retry_base_delay(&mut self, delay: Duration) {
        self.retry_base_delay = delay;
    }

    /// Ensures the binary for the named upgrade is present locally and
    /// integrity-verified, downloading it if allowed. Calling this twice
    /// performs the download at most once.
    ///
    /// # Errors
    /// Returns an error if the binary is missing and downloads are disabled,
    /// if no URL is configured for the upgrade, if all download attempts
    /// fail, or if the downloaded file does not match its checksum.
    #[instrument(skip_all, fields(upgrade = %upgrade))]
    pub async fn ensure_upgrade_binary(&self, upgrade: &UpgradeInfo) -> eyre::Result<PathBuf> {
        let dest = self.layout.upgrade_bin_path(&upgrade.name);
        if dest.exists() {
            debug!(path = %dest.display(), "upgrade binary is already present");
            return Ok(dest);
        }
        if !self.allow_downloads {
            bail!(
                "binary for upgrade `{}` not found at `{}` and downloads are disabled",
                upgrade.name,
                dest.display(),
            );
        }

        let url = self.resolve_url(&upgrade.name)?;
        let checksum_url = if self.unsafe_skip_checksum {
            None
        } else {
            Some(self.resolve_checksum_url(&url).await)
        };

        self.download_with_retries(&url, &dest).await?;

        match checksum_url {
            Some(checksum_url) => {
                if let Err(error) = self.verify_checksum(&dest, &checksum_url).await {
                    let _ = tokio::fs::remove_file(&dest).await;
                    return Err(error);
                }
            }
            None => {
                warn!(
                    url,
                    "checksum verification disabled; installing unverified binary",
                );
            }
        }

        info!(url, path = %dest.display(), "installed upgrade binary");
        Ok(dest)
    }

    fn resolve_url(&self, name: &str) -> eyre::Result<String> {
        if let Some(url) = self.urls.get(name) {
            return Ok(url.clone());
        }
        if let Some(template) = self.urls.get("default") {
            return Ok(template.replace("{name}", name).replace("{version}", name));
        }
        bail!("no download url configured for upgrade `{name}`");
    }

    /// Probes the conventional checksum suffixes next to the binary URL and
    /// settles on the first one that answers; defaults to `.sha256`.
    async fn resolve_checksum_url(&self, url: &str) -> String {
        for suffix in CHECKSUM_SUFFIXES {
            let candidate = format!("{url}{suffix}");
            match self.client.head(&candidate).send().await {
                Ok(response) if response.status().is_success() => return candidate,
                Ok(_) | Err(_) => {}
            }
        }
        format!("{url}{}", CHECKSUM_SUFFIXES[0])
    }

    async fn download_with_retries(&self, url: &str, dest: &Path) -> eyre::Result<()> {
        let retry_config = tryhard::RetryFutureConfig::new(DOWNLOAD_RETRIES)
            .linear_backoff(self.retry_base_delay)
            .on_retry(|attempt, next_delay: Option<Duration>, error: &eyre::Report| {
                let wait_duration = next_delay
                    .map(humantime::format_duration)
                    .map(tracing::field::display);
                warn!(
                    attempt,
                    wait_duration,
                    %error,
                    "download attempt failed; retrying after delay",
                );
                futures::future::ready(())
            });

        tryhard::retry_fn(|| self.download_once(url, dest))
            .with_config(retry_config)
            .await
            .wrap_err_with(|| format!("failed downloading `{url}`"))
    }

    async fn download_once(&self, url: &str, dest: &Path) -> eyre::Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .wrap_err_with(|| format!("failed creating `{}`", parent.display()))?;
        }
        let staged: PathBuf = {
            let mut name = dest
                .file_name()
                .map(std::ffi::OsStr::to_os_string)
                .unwrap_or_default();
            name.push(".tmp");
            dest.with_file_name(name)
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .wrap_err("request failed")?
            .error_for_status()
            .wrap_err("server answered with an error status")?;
        let total = response.content_length();

        let mut file = tokio::fs::File::create(&staged)
            .await
            .wrap_err_with(|| format!("failed creating `{}`", staged.display()))?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut last_report = tokio::time::Instant::now();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&staged).await;
                    return Err(error).wrap_err("download stream failed");
                }
            };
            if let Err(error) = file.write_all(&chunk).await {
                drop(file);
                let _ = tokio::fs::remove_file(&staged).await;
                return Err(error).wrap_err("failed writing downloaded chunk");
            }
            downloaded = downloaded.saturating_add(chunk.len() as u64);
            if let Some(total) = total {
                if last_report.elapsed() >= PROGRESS_INTERVAL {
                    last_report = tokio::time::Instant::now();
                    info!(
                        downloaded,
                        total,
                        percent = downloaded.saturating_mul(100) / total.max(1),
                        "download in progress",
                    );
                }
            }
        }
        file.flush().await.wrap_err("failed flushing download")?;
        drop(file);

        let mut perms = tokio::fs::metadata(&staged)
            .await
            .wrap_err("failed reading downloaded file metadata")?
            .permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&staged, perms)
            .await
            .wrap_err("failed marking downloaded binary executable")?;
        tokio::fs::rename(&staged, dest)
            .await
            .wrap_err("failed moving downloaded binary into place")?;
        Ok(())
    }

    async fn verify_checksum(&self, path: &Path, checksum_url: &str) -> eyre::Result<()> {
        let published = self
            .client
            .get(checksum_url)
            .send()
            .await
            .wrap_err_with(|| format!("failed fetching checksum from `{checksum_url}`"))?
            .error_for_status()
            .wrap_err("checksum request answered with an error status")?
            .text()
            .await
            .wrap_err("failed reading checksum body")?;
        let expected = published
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();

        let actual = match expected.len() {
            64 => hex::encode(hash_file::<sha2::Sha256>(path).await?),
            128 => hex::encode(hash_file::<sha2::Sha512>(path).await?),
            other => bail!("unsupported checksum length: {other}"),
        };
        if actual != expected {
            bail!(
                "checksum mismatch for `{}`: expected {expected}, computed {actual}",
                path.display(),
            );
        }
        debug!(path = %path.display(), "checksum verified");
        Ok(())
    }
}

async fn hash_file<D: sha2::Digest + 'static>(path: &Path) -> eyre::Result<Vec<u8>> {
    use std::io::Read as _;

    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> eyre::Result<Vec<u8>> {
        let mut file = std::fs::File::open(&path)
            .wrap_err_with(|| format!("failed opening `{}` for hashing", path.display()))?;
        let mut hasher = D::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buf).wrap_err("failed reading file for hashing")?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(hasher.finalize().to_vec())
    })
    .await
    .wrap_err("hashing task panicked")?
}
