//! # Wemixvisor
//! A supervisor for a long-running blockchain node. It owns the node
//! process's lifecycle, watches for scheduled upgrades (an on-disk
//! `upgrade-info.json` or programmatic schedules), and at the target block
//! height stops the node, swaps the `current` binary pointer, and restarts
//! it against the new binary — with recoverable backups, checksum-verified
//! downloads, and an optional pre-upgrade hook.
//!
//! The moving parts:
//! - [`height::HeightMonitor`] polls the node for its latest height and
//!   fans changes out to subscribers.
//! - the upgrade source detects pending upgrades from both origins.
//! - [`supervisor::Supervisor`] runs the orchestrator that arms upgrades
//!   and drives the critical section backup → hook → download → stop →
//!   swap → start, rolling back on failure.

pub mod backup;
pub mod config;
pub mod download;
pub mod height;
pub mod hook;
pub mod layout;
pub mod process;
pub mod supervisor;
pub mod telemetry;
#[cfg(test)]
pub(crate) mod test_utils;
pub mod upgrade;

pub use config::Config;
pub use supervisor::Supervisor;

/// Installs an eyre error handler to print display-formatted errors.
///
/// # Errors
/// Returns an error if the error handler could not be installed.
/// See [`eyre::set_hook`] for more information.
pub fn install_error_handler() -> Result<(), eyre::InstallError> {
    eyre::set_hook(Box::new(|_| Box::new(ErrorHandler)))?;
    Ok(())
}

struct ErrorHandler;

impl eyre::EyreHandler for ErrorHandler {
    fn debug(
        &self,
        error: &(dyn std::error::Error + 'static),
        f: &mut core::fmt::Formatter<'_>,
    ) -> core::fmt::Result {
        display(error, f)
    }

    fn display(
        &self,
        error: &(dyn std::error::Error + 'static),
        f: &mut core::fmt::Formatter<'_>,
    ) -> core::fmt::Result {
        display(error, f)
    }
}

fn display(
    mut error: &(dyn std::error::Error + 'static),
    f: &mut core::fmt::Formatter<'_>,
) -> core::fmt::Result {
    use std::fmt::Write as _;

    f.write_char('{')?;
    f.write_fmt(format_args!("\"0\": \"{error}\""))?;
    let mut level: u32 = 1;
    while let Some(source) = error.source() {
        f.write_fmt(format_args!(", \"{level}\": \"{source}\""))?;
        level = level.saturating_add(1);
        error = source;
    }
    f.write_char('}')?;
    Ok(())
}
