use crate::error::AgentError;
use anyhow::Result;
use skiff_library::{bail_error, transaction::TransactionId};
use std::path::Path;
use tracing::{debug, warn};

/// Source of free-space figures for a filesystem
pub trait SpaceGauge: Send + Sync {
    /// Bytes available to unprivileged writers on the filesystem holding `path`
    fn available_bytes(&self, path: &Path, tid: &TransactionId) -> Result<u64>;
}

/// Asks the kernel via `statvfs(3)`
pub struct StatvfsGauge;
impl SpaceGauge for StatvfsGauge {
    fn available_bytes(&self, path: &Path, tid: &TransactionId) -> Result<u64> {
        match nix::sys::statvfs::statvfs(path) {
            Ok(stat) => Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64)),
            Err(e) => bail_error!(tid=tid, error=%e, path=%path.display(), "Failed to query filesystem space"),
        }
    }
}

/// Accept a transfer of `needed` bytes into `path` only if the filesystem can hold it.
/// Must run before anything is written for the transfer.
pub fn check_space(gauge: &dyn SpaceGauge, path: &Path, needed: u64, tid: &TransactionId) -> Result<()> {
    let available = gauge.available_bytes(path, tid)?;
    if needed > available {
        warn!(tid=tid, needed=needed, available=available, path=%path.display(), "Rejecting transfer, not enough disk space");
        anyhow::bail!(AgentError::InsufficientSpace { needed, available });
    }
    debug!(tid=tid, needed=needed, available=available, "Disk space check passed");
    Ok(())
}
