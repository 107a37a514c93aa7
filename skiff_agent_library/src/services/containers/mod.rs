use self::structs::{ContainerInfo, ContainerSpec, ImageInfo, PluginInfo, PruneReport, PullProgress, VolumeInfo};
use anyhow::Result;
use futures::stream::BoxStream;
use skiff_library::transaction::TransactionId;
use std::collections::HashMap;
use std::path::Path;
use tonic::async_trait;

#[path = "./docker/docker.rs"]
pub mod docker;
pub mod structs;

/// Everything the agent needs from the container engine on the device.
/// Typed failures are reported as [structs::RuntimeError] inside the returned [anyhow::Error].
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// All containers, running or not
    async fn list_containers(&self, tid: &TransactionId) -> Result<Vec<ContainerInfo>>;
    /// The configuration the named container was created with
    async fn inspect_container(&self, name: &str, tid: &TransactionId) -> Result<ContainerSpec>;
    /// Create (but don't start) a container, returns its id
    async fn create_container(&self, spec: &ContainerSpec, tid: &TransactionId) -> Result<String>;
    async fn start_container(&self, name: &str, tid: &TransactionId) -> Result<()>;
    /// Fails with [structs::RuntimeError::NotRunning] if the container was already stopped
    async fn stop_container(&self, name: &str, force: bool, tid: &TransactionId) -> Result<()>;
    async fn remove_container(&self, name: &str, force: bool, tid: &TransactionId) -> Result<()>;
    /// Remove all stopped containers
    async fn prune_containers(&self, tid: &TransactionId) -> Result<PruneReport>;

    async fn list_images(&self, tid: &TransactionId) -> Result<Vec<ImageInfo>>;
    /// Pull `name:tag` from its registry, the stream yields cumulative progress until the pull completes
    fn pull_image<'a>(&'a self, name: &'a str, tag: &'a str, tid: &'a TransactionId) -> BoxStream<'a, Result<PullProgress>>;
    /// Load an image archive from disk, returns the references that were loaded
    async fn load_image(&self, archive: &Path, tid: &TransactionId) -> Result<Vec<String>>;
    async fn tag_image(&self, source: &str, repo: &str, tag: &str, tid: &TransactionId) -> Result<()>;
    /// Write the image archive to `dest`, returns the number of bytes written
    async fn export_image(&self, reference: &str, dest: &Path, tid: &TransactionId) -> Result<u64>;
    async fn remove_image(&self, reference: &str, force: bool, tid: &TransactionId) -> Result<()>;
    /// Remove dangling (untagged) images
    async fn prune_images(&self, tid: &TransactionId) -> Result<PruneReport>;

    async fn list_volumes(&self, tid: &TransactionId) -> Result<Vec<VolumeInfo>>;
    async fn create_volume(
        &self,
        name: &str,
        driver: &str,
        labels: &HashMap<String, String>,
        tid: &TransactionId,
    ) -> Result<()>;
    async fn remove_volume(&self, name: &str, force: bool, tid: &TransactionId) -> Result<()>;

    async fn list_plugins(&self, tid: &TransactionId) -> Result<Vec<PluginInfo>>;
    /// Install a plugin from an archive holding its `config.json` and `rootfs`
    async fn create_plugin(&self, name: &str, archive: &Path, tid: &TransactionId) -> Result<()>;
    async fn enable_plugin(&self, name: &str, tid: &TransactionId) -> Result<()>;
    async fn disable_plugin(&self, name: &str, force: bool, tid: &TransactionId) -> Result<()>;
    async fn remove_plugin(&self, name: &str, force: bool, tid: &TransactionId) -> Result<()>;
}
