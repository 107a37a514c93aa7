use super::agent_config::AgentConfig;
use crate::error::{status_from_error, AgentError};
use crate::services::containers::structs::{image_ref, ContainerSpec};
use crate::services::containers::ContainerRuntime;
use crate::services::janitor::Janitor;
use crate::services::transfer::TransferService;
use crate::services::update::UpdateOrchestrator;
use skiff_library::transaction::tid_or_new;
use skiff_rpc::rpc::skiff_agent_server::SkiffAgent;
use skiff_rpc::rpc::{
    CreateVolumeRequest, DeployRequest, DeployResponse, DownloadImageRequest, DownloadImageResponse,
    InstallPluginRequest, LifecycleResponse, ListContainersRequest, ListContainersResponse, ListImagesRequest,
    ListImagesResponse, ListPluginsRequest, ListPluginsResponse, ListVolumesRequest, ListVolumesResponse, PingRequest,
    PingResponse, PluginRequest, PruneRequest, PruneResponse, RemoveImageRequest, RemoveRequest, RemoveVolumeRequest,
    RunRequest, RunResponse, StartRequest, StopRequest, UpdateRequest, UpdateResponse,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};

/// Replies queued per transfer stream before the handler waits on the client
const STREAM_BUFFER: usize = 16;

/// Read the deadline a gRPC client attached to its call, e.g. `1500m` or `30S`
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 {
        return None;
    }
    let (amount, unit) = value.split_at(value.len() - 1);
    let amount: u64 = amount.parse().ok()?;
    Some(match unit {
        "H" => Duration::from_secs(amount.checked_mul(3600)?),
        "M" => Duration::from_secs(amount.checked_mul(60)?),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    })
}

fn request_deadline<T>(request: &Request<T>) -> Option<Duration> {
    request
        .metadata()
        .get("grpc-timeout")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_grpc_timeout)
}

#[allow(unused)]
/// Public members are _only_ for use in testing
pub struct SkiffAgentImpl {
    pub config: AgentConfig,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub transfer: Arc<TransferService>,
    pub orchestrator: Arc<UpdateOrchestrator>,
    pub janitor: Arc<Janitor>,
}

impl SkiffAgentImpl {
    pub fn new(
        config: AgentConfig,
        runtime: Arc<dyn ContainerRuntime>,
        transfer: Arc<TransferService>,
        orchestrator: Arc<UpdateOrchestrator>,
        janitor: Arc<Janitor>,
    ) -> SkiffAgentImpl {
        SkiffAgentImpl {
            config,
            runtime,
            transfer,
            orchestrator,
            janitor,
        }
    }
}

#[tonic::async_trait]
impl SkiffAgent for SkiffAgentImpl {
    type DeployImageStream = ReceiverStream<Result<DeployResponse, Status>>;
    type DownloadImageStream = ReceiverStream<Result<DownloadImageResponse, Status>>;

    #[tracing::instrument(skip(self, request), fields(tid=request.get_ref().transaction_id))]
    async fn ping(&self, request: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        let request = request.into_inner();
        info!(message = request.message, tid = request.transaction_id, "in ping");
        Ok(Response::new(PingResponse { message: "Pong".into() }))
    }

    async fn deploy_image(
        &self,
        request: Request<Streaming<DeployRequest>>,
    ) -> Result<Response<Self::DeployImageStream>, Status> {
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let transfer = self.transfer.clone();
        tokio::spawn(async move {
            if let Err(e) = transfer.handle_deploy(inbound, &tx).await {
                let status = status_from_error(&e);
                warn!(code=?status.code(), error=%status.message(), "Deploy stream failed");
                if tx.send(Err(status)).await.is_err() {
                    warn!("Client left before the deploy error could be delivered");
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    #[tracing::instrument(skip(self, request), fields(tid=request.get_ref().transaction_id))]
    async fn download_image(
        &self,
        request: Request<DownloadImageRequest>,
    ) -> Result<Response<Self::DownloadImageStream>, Status> {
        let request = request.into_inner();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let transfer = self.transfer.clone();
        tokio::spawn(async move {
            if let Err(e) = transfer.handle_download(request, &tx).await {
                let status = status_from_error(&e);
                warn!(code=?status.code(), error=%status.message(), "Download stream failed");
                if tx.send(Err(status)).await.is_err() {
                    warn!("Client left before the download error could be delivered");
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    #[tracing::instrument(skip(self, request), fields(tid=request.get_ref().transaction_id))]
    async fn run(&self, request: Request<RunRequest>) -> Result<Response<RunResponse>, Status> {
        let request = request.into_inner();
        let tid = tid_or_new(request.transaction_id.clone());
        let spec = ContainerSpec::try_from(&request).map_err(|e| status_from_error(&e.into()))?;
        match self.orchestrator.run(spec, &tid).await {
            Ok(instance_name) => Ok(Response::new(RunResponse { instance_name })),
            Err(e) => Err(status_from_error(&e)),
        }
    }

    #[tracing::instrument(skip(self, request), fields(tid=request.get_ref().transaction_id))]
    async fn update(&self, request: Request<UpdateRequest>) -> Result<Response<UpdateResponse>, Status> {
        let deadline = request_deadline(&request);
        let request = request.into_inner();
        let tid = tid_or_new(request.transaction_id.clone());
        let target = ContainerSpec::try_from(&request).map_err(|e| status_from_error(&e.into()))?;
        let res = match request.is_async {
            true => self.orchestrator.update_async(target, deadline, &tid).await,
            false => self.orchestrator.update(target, deadline, &tid).await,
        };
        match res {
            Ok(instance_name) => Ok(Response::new(UpdateResponse {
                instance_name,
                is_async: request.is_async,
            })),
            Err(e) => Err(status_from_error(&e)),
        }
    }

    #[tracing::instrument(skip(self, request), fields(tid=request.get_ref().transaction_id))]
    async fn start(&self, request: Request<StartRequest>) -> Result<Response<LifecycleResponse>, Status> {
        let request = request.into_inner();
        let tid = tid_or_new(request.transaction_id);
        match self.orchestrator.start(&request.instance_name, &tid).await {
            Ok(_) => Ok(Response::new(LifecycleResponse::ok(format!(
                "started '{}'",
                request.instance_name
            )))),
            Err(e) => Err(status_from_error(&e)),
        }
    }

    #[tracing::instrument(skip(self, request), fields(tid=request.get_ref().transaction_id))]
    async fn stop(&self, request: Request<StopRequest>) -> Result<Response<LifecycleResponse>, Status> {
        let request = request.into_inner();
        let tid = tid_or_new(request.transaction_id);
        match self
            .orchestrator
            .stop(&request.instance_name, request.force, &tid)
            .await
        {
            Ok(_) => Ok(Response::new(LifecycleResponse::ok(format!(
                "stopped '{}'",
                request.instance_name
            )))),
            Err(e) => Err(status_from_error(&e)),
        }
    }

    #[tracing::instrument(skip(self, request), fields(tid=request.get_ref().transaction_id))]
    async fn remove(&self, request: Request<RemoveRequest>) -> Result<Response<LifecycleResponse>, Status> {
        let request = request.into_inner();
        let tid = tid_or_new(request.transaction_id);
        match self
            .orchestrator
            .remove(&request.instance_name, request.force, &tid)
            .await
        {
            Ok(_) => Ok(Response::new(LifecycleResponse::ok(format!(
                "removed '{}'",
                request.instance_name
            )))),
            Err(e) => Err(status_from_error(&e)),
        }
    }

    #[tracing::instrument(skip(self, request), fields(tid=request.get_ref().transaction_id))]
    async fn remove_image(&self, request: Request<RemoveImageRequest>) -> Result<Response<LifecycleResponse>, Status> {
        let request = request.into_inner();
        let tid = tid_or_new(request.transaction_id);
        if request.name.is_empty() {
            return Err(status_from_error(
                &AgentError::InvalidArgument("image name cannot be empty".to_string()).into(),
            ));
        }
        let reference = image_ref(&request.name, &request.tag);
        match self.runtime.remove_image(&reference, request.force, &tid).await {
            Ok(_) => Ok(Response::new(LifecycleResponse::ok(format!("removed '{}'", reference)))),
            Err(e) => Err(status_from_error(&e)),
        }
    }

    #[tracing::instrument(skip(self, request), fields(tid=request.get_ref().transaction_id))]
    async fn list_containers(
        &self,
        request: Request<ListContainersRequest>,
    ) -> Result<Response<ListContainersResponse>, Status> {
        let tid = tid_or_new(request.into_inner().transaction_id);
        match self.runtime.list_containers(&tid).await {
            Ok(list) => Ok(Response::new(ListContainersResponse {
                containers: list.into_iter().map(|c| c.into()).collect(),
            })),
            Err(e) => Err(status_from_error(&e)),
        }
    }

    #[tracing::instrument(skip(self, request), fields(tid=request.get_ref().transaction_id))]
    async fn list_images(&self, request: Request<ListImagesRequest>) -> Result<Response<ListImagesResponse>, Status> {
        let tid = tid_or_new(request.into_inner().transaction_id);
        match self.runtime.list_images(&tid).await {
            Ok(list) => Ok(Response::new(ListImagesResponse {
                images: list.into_iter().map(|i| i.into()).collect(),
            })),
            Err(e) => Err(status_from_error(&e)),
        }
    }

    #[tracing::instrument(skip(self, request), fields(tid=request.get_ref().transaction_id))]
    async fn prune(&self, request: Request<PruneRequest>) -> Result<Response<PruneResponse>, Status> {
        let tid = tid_or_new(request.into_inner().transaction_id);
        let report = self.janitor.prune_once(&tid).await;
        Ok(Response::new(PruneResponse {
            containers_removed: report.containers.removed,
            images_removed: report.images.removed,
            space_reclaimed: report.space_reclaimed(),
        }))
    }

    #[tracing::instrument(skip(self, request), fields(tid=request.get_ref().transaction_id))]
    async fn create_volume(&self, request: Request<CreateVolumeRequest>) -> Result<Response<LifecycleResponse>, Status> {
        let request = request.into_inner();
        let tid = tid_or_new(request.transaction_id);
        match self
            .runtime
            .create_volume(&request.name, &request.driver, &request.labels, &tid)
            .await
        {
            Ok(_) => Ok(Response::new(LifecycleResponse::ok(format!(
                "created volume '{}'",
                request.name
            )))),
            Err(e) => Err(status_from_error(&e)),
        }
    }

    #[tracing::instrument(skip(self, request), fields(tid=request.get_ref().transaction_id))]
    async fn remove_volume(&self, request: Request<RemoveVolumeRequest>) -> Result<Response<LifecycleResponse>, Status> {
        let request = request.into_inner();
        let tid = tid_or_new(request.transaction_id);
        match self.runtime.remove_volume(&request.name, request.force, &tid).await {
            Ok(_) => Ok(Response::new(LifecycleResponse::ok(format!(
                "removed volume '{}'",
                request.name
            )))),
            Err(e) => Err(status_from_error(&e)),
        }
    }

    #[tracing::instrument(skip(self, request), fields(tid=request.get_ref().transaction_id))]
    async fn list_volumes(&self, request: Request<ListVolumesRequest>) -> Result<Response<ListVolumesResponse>, Status> {
        let tid = tid_or_new(request.into_inner().transaction_id);
        match self.runtime.list_volumes(&tid).await {
            Ok(list) => Ok(Response::new(ListVolumesResponse {
                volumes: list.into_iter().map(|v| v.into()).collect(),
            })),
            Err(e) => Err(status_from_error(&e)),
        }
    }

    #[tracing::instrument(skip(self, request), fields(tid=request.get_ref().transaction_id))]
    async fn install_plugin(&self, request: Request<InstallPluginRequest>) -> Result<Response<LifecycleResponse>, Status> {
        let request = request.into_inner();
        let tid = tid_or_new(request.transaction_id);
        let staged = self
            .transfer
            .staged_plugin(&request.name)
            .map_err(|e| status_from_error(&e))?;
        if let Err(e) = self.runtime.create_plugin(&request.name, &staged, &tid).await {
            return Err(status_from_error(&e));
        }
        if let Err(e) = tokio::fs::remove_file(&staged).await {
            warn!(tid=tid, error=%e, path=%staged.display(), "Failed to remove staged plugin archive");
        }
        Ok(Response::new(LifecycleResponse::ok(format!(
            "installed plugin '{}'",
            request.name
        ))))
    }

    #[tracing::instrument(skip(self, request), fields(tid=request.get_ref().transaction_id))]
    async fn enable_plugin(&self, request: Request<PluginRequest>) -> Result<Response<LifecycleResponse>, Status> {
        let request = request.into_inner();
        let tid = tid_or_new(request.transaction_id);
        match self.runtime.enable_plugin(&request.name, &tid).await {
            Ok(_) => Ok(Response::new(LifecycleResponse::ok(format!(
                "enabled plugin '{}'",
                request.name
            )))),
            Err(e) => Err(status_from_error(&e)),
        }
    }

    #[tracing::instrument(skip(self, request), fields(tid=request.get_ref().transaction_id))]
    async fn disable_plugin(&self, request: Request<PluginRequest>) -> Result<Response<LifecycleResponse>, Status> {
        let request = request.into_inner();
        let tid = tid_or_new(request.transaction_id);
        match self.runtime.disable_plugin(&request.name, request.force, &tid).await {
            Ok(_) => Ok(Response::new(LifecycleResponse::ok(format!(
                "disabled plugin '{}'",
                request.name
            )))),
            Err(e) => Err(status_from_error(&e)),
        }
    }

    #[tracing::instrument(skip(self, request), fields(tid=request.get_ref().transaction_id))]
    async fn remove_plugin(&self, request: Request<PluginRequest>) -> Result<Response<LifecycleResponse>, Status> {
        let request = request.into_inner();
        let tid = tid_or_new(request.transaction_id);
        match self.runtime.remove_plugin(&request.name, request.force, &tid).await {
            Ok(_) => Ok(Response::new(LifecycleResponse::ok(format!(
                "removed plugin '{}'",
                request.name
            )))),
            Err(e) => Err(status_from_error(&e)),
        }
    }

    #[tracing::instrument(skip(self, request), fields(tid=request.get_ref().transaction_id))]
    async fn list_plugins(&self, request: Request<ListPluginsRequest>) -> Result<Response<ListPluginsResponse>, Status> {
        let tid = tid_or_new(request.into_inner().transaction_id);
        match self.runtime.list_plugins(&tid).await {
            Ok(list) => Ok(Response::new(ListPluginsResponse {
                plugins: list.into_iter().map(|p| p.into()).collect(),
            })),
            Err(e) => Err(status_from_error(&e)),
        }
    }
}
