//! Snapshots of the node's data directory, taken before every binary swap
//! and restored when an upgrade attempt fails.
//!
//! Snapshots are staged under a `.tmp` suffix and renamed into place once
//! complete, so a crash mid-copy leaves either a finished snapshot or a
//! stale staging directory that the next retention sweep removes.

use std::{
    path::{
        Path,
        PathBuf,
    },
    time::Duration,
};

use chrono::{
    DateTime,
    Utc,
};
use eyre::WrapErr as _;
use tracing::{
    info,
    warn,
};

const STAGING_SUFFIX: &str = ".tmp";

#[derive(Clone, Debug, PartialEq)]
pub struct BackupRecord {
    pub label: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub bytes: u64,
}

#[derive(Clone, Debug)]
pub struct BackupManager {
    data_dir: PathBuf,
    backups_dir: PathBuf,
}

impl BackupManager {
    #[must_use]
    pub fn new(data_dir: PathBuf, backups_dir: PathBuf) -> Self {
        Self {
            data_dir,
            backups_dir,
        }
    }

    /// Snapshots the data directory to `backups/<label>-<UTC time>/` and
    /// returns the snapshot path.
    ///
    /// # Errors
    /// Returns an error if the snapshot cannot be completed; a partial copy
    /// is removed before returning.
    pub async fn create_backup(&self, label: &str) -> eyre::Result<PathBuf> {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let dest = self.backups_dir.join(format!("{label}-{stamp}"));
        let data_dir = self.data_dir.clone();

        tokio::fs::create_dir_all(&self.backups_dir)
            .await
            .wrap_err_with(|| format!("failed creating `{}`", self.backups_dir.display()))?;

        let copy_dest = dest.clone();
        tokio::task::spawn_blocking(move || {
            let staged = staging_path(&copy_dest);
            let result = if data_dir.exists() {
                copy_dir_recursive(&data_dir, &staged)
            } else {
                // A node that has never run has nothing to snapshot yet;
                // restoring this backup returns to the empty state.
                warn!(
                    data_dir = %data_dir.display(),
                    "data directory does not exist; creating empty snapshot",
                );
                std::fs::create_dir_all(&staged).map_err(Into::into)
            };
            if let Err(error) = result {
                let _ = std::fs::remove_dir_all(&staged);
                return Err(error);
            }
            std::fs::rename(&staged, &copy_dest)
                .wrap_err("failed moving finished snapshot into place")
        })
        .await
        .wrap_err("snapshot task panicked")??;

        info!(label, path = %dest.display(), "created backup");
        Ok(dest)
    }

    /// Replaces the data directory with the given snapshot. The snapshot is
    /// first copied beside the data directory, then renamed over it, so a
    /// failure partway leaves the original data untouched.
    ///
    /// # Errors
    /// Returns an error if the snapshot cannot be copied or the directories
    /// cannot be exchanged.
    pub async fn restore_backup(&self, snapshot: &Path) -> eyre::Result<()> {
        let data_dir = self.data_dir.clone();
        let snapshot_dir = snapshot.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let parent = data_dir
                .parent()
                .ok_or_else(|| eyre::eyre!("data directory has no parent"))?;
            let staged = parent.join(".data.restoring");
            let replaced = parent.join(".data.replaced");
            let _ = std::fs::remove_dir_all(&staged);
            let _ = std::fs::remove_dir_all(&replaced);

            copy_dir_recursive(&snapshot_dir, &staged).wrap_err_with(|| {
                format!("failed copying snapshot `{}`", snapshot_dir.display())
            })?;
            if data_dir.exists() {
                std::fs::rename(&data_dir, &replaced)
                    .wrap_err("failed moving aside current data directory")?;
            }
            if let Err(error) = std::fs::rename(&staged, &data_dir)
                .wrap_err("failed moving restored data directory into place")
            {
                // Put the original back; the staged copy is abandoned.
                let _ = std::fs::rename(&replaced, &data_dir);
                return Err(error);
            }
            let _ = std::fs::remove_dir_all(&replaced);
            Ok(())
        })
        .await
        .wrap_err("restore task panicked")??;

        info!(snapshot = %snapshot.display(), "restored data directory from backup");
        Ok(())
    }

    /// Removes snapshots older than `retention`, along with staging
    /// directories left behind by interrupted snapshots. Returns how many
    /// directories were removed.
    ///
    /// # Errors
    /// Returns an error if the backups directory cannot be listed.
    pub async fn clean_old_backups(&self, retention: Duration) -> eyre::Result<usize> {
        let backups_dir = self.backups_dir.clone();
        let removed = tokio::task::spawn_blocking(move || -> eyre::Result<usize> {
            let entries = match std::fs::read_dir(&backups_dir) {
                Ok(entries) => entries,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(0),
                Err(error) => {
                    return Err(error)
                        .wrap_err_with(|| format!("failed listing `{}`", backups_dir.display()));
                }
            };
            let mut removed = 0;
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let is_stale_staging = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.ends_with(STAGING_SUFFIX));
                let expired = entry
                    .metadata()
                    .and_then(|metadata| metadata.modified())
                    .ok()
                    .and_then(|mtime| mtime.elapsed().ok())
                    .is_some_and(|age| age > retention);
                if is_stale_staging || expired {
                    match std::fs::remove_dir_all(&path) {
                        Ok(()) => {
                            info!(path = %path.display(), "removed expired backup");
                            removed += 1;
                        }
                        Err(error) => {
                            warn!(path = %path.display(), %error, "failed removing backup");
                        }
                    }
                }
            }
            Ok(removed)
        })
        .await
        .wrap_err("retention sweep task panicked")??;
        Ok(removed)
    }

    /// Lists finished snapshots, oldest first.
    ///
    /// # Errors
    /// Returns an error if the backups directory cannot be listed.
    pub fn list_backups(&self) -> eyre::Result<Vec<BackupRecord>> {
        let entries = match std::fs::read_dir(&self.backups_dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => {
                return Err(error)
                    .wrap_err_with(|| format!("failed listing `{}`", self.backups_dir.display()));
            }
        };
        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !path.is_dir() || name.ends_with(STAGING_SUFFIX) {
                continue;
            }
            let created_at = entry
                .metadata()
                .and_then(|metadata| metadata.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            records.push(BackupRecord {
                label: strip_timestamp(name).to_string(),
                path: path.clone(),
                created_at,
                bytes: dir_size(&path),
            });
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}

fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(STAGING_SUFFIX);
    dest.with_file_name(name)
}

/// Strips the trailing `-<yyyymmdd>-<hhmmss>` stamp appended by
/// [`BackupManager::create_backup`].
fn strip_timestamp(name: &str) -> &str {
    let mut parts = name.rsplitn(3, '-');
    let time = parts.next();
    let date = parts.next();
    let rest = parts.next();
    match (rest, date, time) {
        (Some(rest), Some(date), Some(time))
            if date.len() == 8
                && time.len() == 6
                && date.bytes().all(|b| b.is_ascii_digit())
                && time.bytes().all(|b| b.is_ascii_digit()) =>
        {
            rest
        }
        _ => name,
    }
}

fn copy_dir_recursive(from: &Path, to: &Path) -> eyre::Result<()> {
    std::fs::create_dir_all(to).wrap_err_with(|| format!("failed creating `{}`", to.display()))?;
    for entry in std::fs::read_dir(from)
        .wrap_err_with(|| format!("failed listing `{}`", from.display()))?
    {
        let entry = entry.wrap_err("failed reading directory entry")?;
        let source = entry.path();
        let target = to.join(entry.file_name());
        let file_type = entry.file_type().wrap_err("failed reading file type")?;
        if file_type.is_dir() {
            copy_dir_recursive(&source, &target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(&source)
                .wrap_err_with(|| format!("failed reading link `{}`", source.display()))?;
            std::os::unix::fs::symlink(link, &target)
                .wrap_err_with(|| format!("failed recreating link `{}`", target.display()))?;
        } else {
            std::fs::copy(&source, &target).wrap_err_with(|| {
                format!("failed copying `{}` to `{}`", source.display(), target.display())
            })?;
        }
    }
    Ok(())
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let Ok(metadata) = entry.metadata() else {
                return 0;
            };
            if metadata.is_dir() {
                dir_size(&entry.path())
            } else {
                metadata.len()
            }
        })
        .sum()
}
