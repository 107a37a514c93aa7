use crate::error::AgentError;
use std::path::{Path, PathBuf};

pub mod chunked;
pub mod deploy;
pub mod disk_guard;

pub use deploy::{ReplySender, TransferService};

/// Where an uploaded plugin archive named `name` is kept until it is installed.
/// Plugin names can carry a repository and tag, both are flattened into the file name.
pub fn staged_plugin_path(staging_dir: &Path, name: &str) -> Result<PathBuf, AgentError> {
    if name.is_empty() || name.contains("..") || name.starts_with('/') {
        return Err(AgentError::InvalidArgument(format!("bad plugin name '{}'", name)));
    }
    Ok(staging_dir.join(name.replace(['/', ':'], "_")))
}
