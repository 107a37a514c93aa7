use self::agent_config::AgentConfig;
use crate::agent_api::skiff_agent::SkiffAgentImpl;
use crate::services::containers::ContainerRuntime;
use crate::services::janitor::Janitor;
use crate::services::transfer::disk_guard::{SpaceGauge, StatvfsGauge};
use crate::services::transfer::TransferService;
use crate::services::update::{InstanceLocks, UpdateOrchestrator};
use anyhow::Result;
use skiff_library::{bail_error, transaction::TransactionId};
use skiff_rpc::rpc::{
    ContainerSummary, DeploySuccess, ImageSummary, PluginSummary, PruneResponse, RunRequest, UpdateRequest,
    UpdateResponse, VolumeSummary,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

pub mod agent_config;
pub use agent_config as config;
pub mod rpc;
pub mod skiff_agent;

/// Wire the agent's services together over `runtime`, checking free space on the real filesystem
pub async fn create_agent(
    config: AgentConfig,
    runtime: Arc<dyn ContainerRuntime>,
    tid: &TransactionId,
) -> Result<SkiffAgentImpl> {
    create_agent_with_gauge(config, runtime, Arc::new(StatvfsGauge), tid).await
}

pub async fn create_agent_with_gauge(
    config: AgentConfig,
    runtime: Arc<dyn ContainerRuntime>,
    gauge: Arc<dyn SpaceGauge>,
    tid: &TransactionId,
) -> Result<SkiffAgentImpl> {
    let transfer = TransferService::new(runtime.clone(), config.transfer.clone(), gauge)
        .or_else(|e| bail_error!(tid=tid, error=%e, "Failed to make transfer service"))?;
    let orchestrator = UpdateOrchestrator::new(runtime.clone(), InstanceLocks::new(), config.update.clone());
    let janitor = Janitor::new(runtime.clone(), &config.janitor);
    Ok(SkiffAgentImpl::new(config, runtime, transfer, orchestrator, janitor))
}

#[tonic::async_trait]
pub trait SkiffAgentAPI {
    /// Ping the agent to check if it is up and accessible.
    async fn ping(&mut self, tid: TransactionId) -> Result<String>;
    /// Upload the image archive or plugin archive at `archive` in the chunk size the agent announces.
    async fn deploy(
        &mut self,
        name: String,
        tag: String,
        archive: &Path,
        is_plugin: bool,
        tid: TransactionId,
    ) -> Result<DeploySuccess>;
    /// Have the agent pull `reference` from a registry and tag it as `name:tag`.
    async fn pull(&mut self, name: String, tag: String, reference: String, tid: TransactionId) -> Result<DeploySuccess>;
    /// Export the image `name:tag` from the agent into the local file `dest`.
    /// Returns the number of bytes written.
    async fn download(&mut self, name: String, tag: String, dest: &Path, tid: TransactionId) -> Result<u64>;
    /// Create and start a new instance.
    async fn run(&mut self, request: RunRequest) -> Result<String>;
    /// Replace a running instance with a new configuration.
    async fn update(&mut self, request: UpdateRequest) -> Result<UpdateResponse>;
    async fn start(&mut self, instance_name: String, tid: TransactionId) -> Result<String>;
    async fn stop(&mut self, instance_name: String, force: bool, tid: TransactionId) -> Result<String>;
    async fn remove(&mut self, instance_name: String, force: bool, tid: TransactionId) -> Result<String>;
    async fn remove_image(&mut self, name: String, tag: String, force: bool, tid: TransactionId) -> Result<String>;
    async fn list_containers(&mut self, tid: TransactionId) -> Result<Vec<ContainerSummary>>;
    async fn list_images(&mut self, tid: TransactionId) -> Result<Vec<ImageSummary>>;
    /// Reclaim stopped containers and dangling images now.
    async fn prune(&mut self, tid: TransactionId) -> Result<PruneResponse>;
    async fn create_volume(
        &mut self,
        name: String,
        driver: String,
        labels: HashMap<String, String>,
        tid: TransactionId,
    ) -> Result<String>;
    async fn remove_volume(&mut self, name: String, force: bool, tid: TransactionId) -> Result<String>;
    async fn list_volumes(&mut self, tid: TransactionId) -> Result<Vec<VolumeSummary>>;
    /// Install a plugin previously uploaded with [SkiffAgentAPI::deploy].
    async fn install_plugin(&mut self, name: String, tid: TransactionId) -> Result<String>;
    async fn enable_plugin(&mut self, name: String, tid: TransactionId) -> Result<String>;
    async fn disable_plugin(&mut self, name: String, force: bool, tid: TransactionId) -> Result<String>;
    async fn remove_plugin(&mut self, name: String, force: bool, tid: TransactionId) -> Result<String>;
    async fn list_plugins(&mut self, tid: TransactionId) -> Result<Vec<PluginSummary>>;
}
