//! On-disk layout of versioned node binaries and the `current` pointer.
//!
//! ```text
//! <home>/wemixvisor/
//!   genesis/bin/<node>           initial binary, provided externally
//!   upgrades/<name>/bin/<node>   per-upgrade binaries
//!   current -> genesis | upgrades/<name>
//! ```
//!
//! All mutation of `current` goes through this type. The pointer is swapped
//! by creating the new symlink at a temporary name and renaming it over the
//! old one, so concurrent readers never observe a dangling or partial
//! pointer.

use std::{
    io,
    os::unix::fs::PermissionsExt as _,
    path::{
        Path,
        PathBuf,
    },
};

use tracing::{
    debug,
    info,
};

pub const VISOR_DIR: &str = "wemixvisor";
pub const GENESIS_DIR: &str = "genesis";
pub const UPGRADES_DIR: &str = "upgrades";
pub const CURRENT_LINK: &str = "current";

#[derive(Clone, Debug)]
pub struct BinaryLayout {
    root: PathBuf,
    node_name: String,
}

impl BinaryLayout {
    #[must_use]
    pub fn new(home: &Path, node_name: &str) -> Self {
        Self {
            root: home.join(VISOR_DIR),
            node_name: node_name.to_string(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn genesis_dir(&self) -> PathBuf {
        self.root.join(GENESIS_DIR)
    }

    #[must_use]
    pub fn upgrade_dir(&self, name: &str) -> PathBuf {
        self.root.join(UPGRADES_DIR).join(name)
    }

    #[must_use]
    pub fn current_link(&self) -> PathBuf {
        self.root.join(CURRENT_LINK)
    }

    #[must_use]
    pub fn genesis_bin_path(&self) -> PathBuf {
        self.genesis_dir().join("bin").join(&self.node_name)
    }

    #[must_use]
    pub fn upgrade_bin_path(&self, name: &str) -> PathBuf {
        self.upgrade_dir(name).join("bin").join(&self.node_name)
    }

    /// The node executable as resolved through the `current` pointer. The
    /// path is not checked; use [`BinaryLayout::verify_current`] for that.
    #[must_use]
    pub fn current_bin_path(&self) -> PathBuf {
        self.current_link().join("bin").join(&self.node_name)
    }

    /// The directory `current` points at right now.
    ///
    /// # Errors
    /// Returns an error if the pointer does not exist or is not a symlink.
    pub fn current_target(&self) -> Result<PathBuf, LayoutError> {
        let link = self.current_link();
        let target = std::fs::read_link(&link).map_err(|source| LayoutError::ReadPointer {
            path: link,
            source,
        })?;
        if target.is_absolute() {
            Ok(target)
        } else {
            Ok(self.root.join(target))
        }
    }

    /// Creates the `current` pointer if absent (pointing at `genesis`) and
    /// verifies that it resolves to an executable node binary. A no-op on an
    /// already-correct layout.
    ///
    /// # Errors
    /// Returns an error if the pointer cannot be created or does not resolve
    /// to an executable regular file.
    pub fn ensure_current_pointer(&self) -> Result<(), LayoutError> {
        let link = self.current_link();
        if std::fs::symlink_metadata(&link).is_err() {
            std::fs::create_dir_all(&self.root).map_err(|source| LayoutError::CreateDir {
                path: self.root.clone(),
                source,
            })?;
            std::os::unix::fs::symlink(GENESIS_DIR, &link).map_err(|source| {
                LayoutError::CreatePointer {
                    path: link.clone(),
                    source,
                }
            })?;
            info!(
                link = %link.display(),
                target = GENESIS_DIR,
                "created current pointer",
            );
        }
        self.verify_current()
    }

    /// Verifies that `current/bin/<node>` is an executable regular file.
    ///
    /// # Errors
    /// Returns an error if the binary is missing or not executable.
    pub fn verify_current(&self) -> Result<(), LayoutError> {
        verify_executable(&self.current_bin_path())
    }

    /// Atomically repoints `current` at `upgrades/<name>`.
    ///
    /// # Errors
    /// Returns an error if the upgrade directory does not hold an executable
    /// node binary, or if the pointer cannot be swapped.
    pub fn set_current_upgrade(&self, name: &str) -> Result<(), LayoutError> {
        verify_executable(&self.upgrade_bin_path(name))?;
        self.swap_pointer(&PathBuf::from(UPGRADES_DIR).join(name))
    }

    /// Atomically repoints `current` at an arbitrary target, used to roll the
    /// pointer back after a failed start.
    ///
    /// # Errors
    /// Returns an error if the pointer cannot be swapped.
    pub fn set_current_target(&self, target: &Path) -> Result<(), LayoutError> {
        // Keep the pointer relative to the layout root where possible so the
        // whole home directory stays relocatable.
        let relative = target.strip_prefix(&self.root).unwrap_or(target);
        self.swap_pointer(relative)
    }

    fn swap_pointer(&self, target: &Path) -> Result<(), LayoutError> {
        let link = self.current_link();
        let staged = self.root.join(".current.tmp");
        let _ = std::fs::remove_file(&staged);
        std::os::unix::fs::symlink(target, &staged).map_err(|source| {
            LayoutError::CreatePointer {
                path: staged.clone(),
                source,
            }
        })?;
        if let Err(source) = std::fs::rename(&staged, &link) {
            let _ = std::fs::remove_file(&staged);
            return Err(LayoutError::SwapPointer {
                path: link,
                source,
            });
        }
        debug!(target = %target.display(), "swapped current pointer");
        Ok(())
    }
}

fn verify_executable(path: &Path) -> Result<(), LayoutError> {
    let metadata = std::fs::metadata(path).map_err(|source| LayoutError::MissingBinary {
        path: path.to_path_buf(),
        source,
    })?;
    if !metadata.is_file() {
        return Err(LayoutError::NotAFile {
            path: path.to_path_buf(),
        });
    }
    if metadata.permissions().mode() & 0o111 == 0 {
        return Err(LayoutError::NotExecutable {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    #[error("failed creating directory `{path}`")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed creating pointer `{path}`")]
    CreatePointer { path: PathBuf, source: io::Error },
    #[error("failed reading pointer `{path}`")]
    ReadPointer { path: PathBuf, source: io::Error },
    #[error("failed swapping pointer `{path}`")]
    SwapPointer { path: PathBuf, source: io::Error },
    #[error("node binary `{path}` does not exist")]
    MissingBinary { path: PathBuf, source: io::Error },
    #[error("node binary `{path}` is not a regular file")]
    NotAFile { path: PathBuf },
    #[error("node binary `{path}` is not executable")]
    NotExecutable { path: PathBuf },
}
