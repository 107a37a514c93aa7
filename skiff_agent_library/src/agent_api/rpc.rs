use super::SkiffAgentAPI;
use crate::services::transfer::chunked::{ChunkedReader, ReadChunk};
use anyhow::{bail, Result};
use skiff_library::bail_error;
use skiff_library::transaction::TransactionId;
use skiff_rpc::rpc::skiff_agent_client::SkiffAgentClient;
use skiff_rpc::rpc::{
    deploy_response, download_image_response, ContainerSummary, CreateVolumeRequest, DeployIntent, DeployRequest,
    DeployResponse, DeploySuccess, DownloadImageRequest, ImageSummary, InstallPluginRequest, ListContainersRequest, ListImagesRequest,
    ListPluginsRequest, ListVolumesRequest, PingRequest, PluginRequest, PluginSummary, PruneRequest, PruneResponse,
    RemoteDownload, RemoveImageRequest, RemoveRequest, RemoveVolumeRequest, RunRequest, StartRequest, StopRequest,
    UpdateRequest, UpdateResponse, VolumeSummary,
};
use skiff_rpc::RPCError;
use std::collections::HashMap;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::{Code, Request, Status, Streaming};
use tracing::{debug, warn};

#[allow(unused)]
pub struct RPCAgentAPI {
    client: SkiffAgentClient<Channel>,
}

impl RPCAgentAPI {
    /// Open a new connection to an agent
    /// Returns a [RPCError] with details if the connection fails
    pub async fn new(address: &str, port: u16, tid: &TransactionId) -> Result<RPCAgentAPI, RPCError> {
        Self::repeat_try_connection(address, port, 5, tid).await
    }

    /// Try opening a new connection, with several retries
    /// This can be flaky, so if there is an error, the connection is retried several times
    async fn repeat_try_connection(
        address: &str,
        port: u16,
        mut retries: u32,
        tid: &TransactionId,
    ) -> Result<RPCAgentAPI, RPCError> {
        loop {
            match Self::try_new_connection(address, port).await {
                Ok(api) => {
                    return Ok(api);
                },
                Err(e) => {
                    warn!(error=%e, tid=tid, "Error opening RPC connection to agent");
                    retries -= 1;
                    if retries == 0 {
                        return Err(e);
                    }
                },
            }
        }
    }

    async fn try_new_connection(address: &str, port: u16) -> Result<RPCAgentAPI, RPCError> {
        let addr = format!("http://{}:{}", address, port);
        match SkiffAgentClient::connect(addr).await {
            Ok(c) => Ok(RPCAgentAPI { client: c }),
            Err(e) => Err(RPCError {
                message: Status::new(Code::Unknown, format!("Got unexpected error of {:?}", e)),
                source: "[RPCAgentAPI:new]".to_string(),
            }),
        }
    }

    /// The next reply worth acting on, progress updates are logged and skipped
    async fn next_reply(
        replies: &mut Streaming<DeployResponse>,
        source: &str,
        tid: &TransactionId,
    ) -> Result<DeployReply> {
        loop {
            match replies.message().await {
                Ok(Some(reply)) => match reply.msg {
                    Some(deploy_response::Msg::Ready(r)) => return Ok(DeployReply::Ready(r.chunk_size)),
                    Some(deploy_response::Msg::Success(s)) => return Ok(DeployReply::Success(s)),
                    Some(deploy_response::Msg::Progress(p)) => {
                        debug!(tid=tid, bytes=p.bytes_received, "Deploy progress")
                    },
                    None => (),
                },
                Ok(None) => bail_error!(tid = tid, "Deploy stream ended without success"),
                Err(e) => bail!(RPCError::new(e, source.to_string())),
            }
        }
    }
}

enum DeployReply {
    Ready(u64),
    Success(DeploySuccess),
}

impl Clone for RPCAgentAPI {
    /// A fast method for duplicating the agent API.
    /// Use this instead of concurrently sharing.
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
        }
    }
}

/// An implementation of the agent API that communicates with an agent via RPC
#[tonic::async_trait]
impl SkiffAgentAPI for RPCAgentAPI {
    async fn ping(&mut self, tid: TransactionId) -> Result<String> {
        let request = Request::new(PingRequest {
            message: "Ping".to_string(),
            transaction_id: tid,
        });
        match self.client.ping(request).await {
            Ok(response) => Ok(response.into_inner().message),
            Err(e) => bail!(RPCError::new(e, "[RPCAgentAPI:ping]".to_string())),
        }
    }

    async fn deploy(
        &mut self,
        name: String,
        tag: String,
        archive: &Path,
        is_plugin: bool,
        tid: TransactionId,
    ) -> Result<DeploySuccess> {
        let mut reader = ChunkedReader::open(archive)?;
        let (tx, rx) = mpsc::channel(4);
        let intent = DeployIntent {
            name,
            tag,
            declared_size: reader.size(),
            is_plugin,
            remote_download: None,
            transaction_id: tid.clone(),
        };
        if tx.send(DeployRequest::intent(intent)).await.is_err() {
            bail_error!(tid = tid, "Deploy stream closed before the intent was sent");
        }
        let mut replies = match self.client.deploy_image(ReceiverStream::new(rx)).await {
            Ok(r) => r.into_inner(),
            Err(e) => bail!(RPCError::new(e, "[RPCAgentAPI:deploy]".to_string())),
        };
        let chunk_size = match Self::next_reply(&mut replies, "[RPCAgentAPI:deploy]", &tid).await? {
            DeployReply::Ready(chunk_size) => chunk_size,
            DeployReply::Success(_) => bail_error!(tid = tid, "Agent finished the deploy before any content was sent"),
        };
        debug!(tid=tid, chunk_size=chunk_size, size=reader.size(), "Agent ready for upload");
        loop {
            let (msg, last) = match reader.read(chunk_size)? {
                ReadChunk::Data(data) if data.is_empty() => continue,
                ReadChunk::Data(data) => (DeployRequest::content(data), false),
                ReadChunk::EndOfData => (DeployRequest::end(), true),
            };
            // the agent hung up, its reason arrives on the reply stream
            if tx.send(msg).await.is_err() || last {
                break;
            }
        }
        drop(tx);
        loop {
            if let DeployReply::Success(s) = Self::next_reply(&mut replies, "[RPCAgentAPI:deploy]", &tid).await? {
                return Ok(s);
            }
        }
    }

    async fn pull(&mut self, name: String, tag: String, reference: String, tid: TransactionId) -> Result<DeploySuccess> {
        let intent = DeployIntent {
            name,
            tag,
            declared_size: 0,
            is_plugin: false,
            remote_download: Some(RemoteDownload { reference }),
            transaction_id: tid.clone(),
        };
        let outbound = tokio_stream::iter(vec![DeployRequest::intent(intent)]);
        let mut replies = match self.client.deploy_image(outbound).await {
            Ok(r) => r.into_inner(),
            Err(e) => bail!(RPCError::new(e, "[RPCAgentAPI:pull]".to_string())),
        };
        loop {
            if let DeployReply::Success(s) = Self::next_reply(&mut replies, "[RPCAgentAPI:pull]", &tid).await? {
                return Ok(s);
            }
        }
    }

    async fn download(&mut self, name: String, tag: String, dest: &Path, tid: TransactionId) -> Result<u64> {
        let request = Request::new(DownloadImageRequest {
            name,
            tag,
            transaction_id: tid.clone(),
        });
        let mut chunks = match self.client.download_image(request).await {
            Ok(r) => r.into_inner(),
            Err(e) => bail!(RPCError::new(e, "[RPCAgentAPI:download]".to_string())),
        };
        let mut file = tokio::fs::File::create(dest).await?;
        let mut expected = None;
        let mut written = 0;
        loop {
            match chunks.message().await {
                Ok(Some(reply)) => match reply.msg {
                    Some(download_image_response::Msg::Info(info)) => expected = Some(info.size),
                    Some(download_image_response::Msg::Chunk(c)) => {
                        file.write_all(&c.data).await?;
                        written += c.data.len() as u64;
                    },
                    None => (),
                },
                Ok(None) => break,
                Err(e) => bail!(RPCError::new(e, "[RPCAgentAPI:download]".to_string())),
            }
        }
        file.flush().await?;
        match expected {
            Some(size) if size == written => Ok(written),
            Some(size) => bail_error!(tid=tid, expected=size, received=written, "Download was truncated"),
            None => bail_error!(tid = tid, "Agent never described the download"),
        }
    }

    async fn run(&mut self, request: RunRequest) -> Result<String> {
        match self.client.run(Request::new(request)).await {
            Ok(response) => Ok(response.into_inner().instance_name),
            Err(e) => bail!(RPCError::new(e, "[RPCAgentAPI:run]".to_string())),
        }
    }

    async fn update(&mut self, request: UpdateRequest) -> Result<UpdateResponse> {
        match self.client.update(Request::new(request)).await {
            Ok(response) => Ok(response.into_inner()),
            Err(e) => bail!(RPCError::new(e, "[RPCAgentAPI:update]".to_string())),
        }
    }

    async fn start(&mut self, instance_name: String, tid: TransactionId) -> Result<String> {
        let request = Request::new(StartRequest {
            instance_name,
            transaction_id: tid,
        });
        match self.client.start(request).await {
            Ok(response) => Ok(response.into_inner().message),
            Err(e) => bail!(RPCError::new(e, "[RPCAgentAPI:start]".to_string())),
        }
    }

    async fn stop(&mut self, instance_name: String, force: bool, tid: TransactionId) -> Result<String> {
        let request = Request::new(StopRequest {
            instance_name,
            force,
            transaction_id: tid,
        });
        match self.client.stop(request).await {
            Ok(response) => Ok(response.into_inner().message),
            Err(e) => bail!(RPCError::new(e, "[RPCAgentAPI:stop]".to_string())),
        }
    }

    async fn remove(&mut self, instance_name: String, force: bool, tid: TransactionId) -> Result<String> {
        let request = Request::new(RemoveRequest {
            instance_name,
            force,
            transaction_id: tid,
        });
        match self.client.remove(request).await {
            Ok(response) => Ok(response.into_inner().message),
            Err(e) => bail!(RPCError::new(e, "[RPCAgentAPI:remove]".to_string())),
        }
    }

    async fn remove_image(&mut self, name: String, tag: String, force: bool, tid: TransactionId) -> Result<String> {
        let request = Request::new(RemoveImageRequest {
            name,
            tag,
            force,
            transaction_id: tid,
        });
        match self.client.remove_image(request).await {
            Ok(response) => Ok(response.into_inner().message),
            Err(e) => bail!(RPCError::new(e, "[RPCAgentAPI:remove_image]".to_string())),
        }
    }

    async fn list_containers(&mut self, tid: TransactionId) -> Result<Vec<ContainerSummary>> {
        let request = Request::new(ListContainersRequest { transaction_id: tid });
        match self.client.list_containers(request).await {
            Ok(response) => Ok(response.into_inner().containers),
            Err(e) => bail!(RPCError::new(e, "[RPCAgentAPI:list_containers]".to_string())),
        }
    }

    async fn list_images(&mut self, tid: TransactionId) -> Result<Vec<ImageSummary>> {
        let request = Request::new(ListImagesRequest { transaction_id: tid });
        match self.client.list_images(request).await {
            Ok(response) => Ok(response.into_inner().images),
            Err(e) => bail!(RPCError::new(e, "[RPCAgentAPI:list_images]".to_string())),
        }
    }

    async fn prune(&mut self, tid: TransactionId) -> Result<PruneResponse> {
        let request = Request::new(PruneRequest { transaction_id: tid });
        match self.client.prune(request).await {
            Ok(response) => Ok(response.into_inner()),
            Err(e) => bail!(RPCError::new(e, "[RPCAgentAPI:prune]".to_string())),
        }
    }

    async fn create_volume(
        &mut self,
        name: String,
        driver: String,
        labels: HashMap<String, String>,
        tid: TransactionId,
    ) -> Result<String> {
        let request = Request::new(CreateVolumeRequest {
            name,
            driver,
            labels,
            transaction_id: tid,
        });
        match self.client.create_volume(request).await {
            Ok(response) => Ok(response.into_inner().message),
            Err(e) => bail!(RPCError::new(e, "[RPCAgentAPI:create_volume]".to_string())),
        }
    }

    async fn remove_volume(&mut self, name: String, force: bool, tid: TransactionId) -> Result<String> {
        let request = Request::new(RemoveVolumeRequest {
            name,
            force,
            transaction_id: tid,
        });
        match self.client.remove_volume(request).await {
            Ok(response) => Ok(response.into_inner().message),
            Err(e) => bail!(RPCError::new(e, "[RPCAgentAPI:remove_volume]".to_string())),
        }
    }

    async fn list_volumes(&mut self, tid: TransactionId) -> Result<Vec<VolumeSummary>> {
        let request = Request::new(ListVolumesRequest { transaction_id: tid });
        match self.client.list_volumes(request).await {
            Ok(response) => Ok(response.into_inner().volumes),
            Err(e) => bail!(RPCError::new(e, "[RPCAgentAPI:list_volumes]".to_string())),
        }
    }

    async fn install_plugin(&mut self, name: String, tid: TransactionId) -> Result<String> {
        let request = Request::new(InstallPluginRequest {
            name,
            transaction_id: tid,
        });
        match self.client.install_plugin(request).await {
            Ok(response) => Ok(response.into_inner().message),
            Err(e) => bail!(RPCError::new(e, "[RPCAgentAPI:install_plugin]".to_string())),
        }
    }

    async fn enable_plugin(&mut self, name: String, tid: TransactionId) -> Result<String> {
        let request = Request::new(PluginRequest {
            name,
            force: false,
            transaction_id: tid,
        });
        match self.client.enable_plugin(request).await {
            Ok(response) => Ok(response.into_inner().message),
            Err(e) => bail!(RPCError::new(e, "[RPCAgentAPI:enable_plugin]".to_string())),
        }
    }

    async fn disable_plugin(&mut self, name: String, force: bool, tid: TransactionId) -> Result<String> {
        let request = Request::new(PluginRequest {
            name,
            force,
            transaction_id: tid,
        });
        match self.client.disable_plugin(request).await {
            Ok(response) => Ok(response.into_inner().message),
            Err(e) => bail!(RPCError::new(e, "[RPCAgentAPI:disable_plugin]".to_string())),
        }
    }

    async fn remove_plugin(&mut self, name: String, force: bool, tid: TransactionId) -> Result<String> {
        let request = Request::new(PluginRequest {
            name,
            force,
            transaction_id: tid,
        });
        match self.client.remove_plugin(request).await {
            Ok(response) => Ok(response.into_inner().message),
            Err(e) => bail!(RPCError::new(e, "[RPCAgentAPI:remove_plugin]".to_string())),
        }
    }

    async fn list_plugins(&mut self, tid: TransactionId) -> Result<Vec<PluginSummary>> {
        let request = Request::new(ListPluginsRequest { transaction_id: tid });
        match self.client.list_plugins(request).await {
            Ok(response) => Ok(response.into_inner().plugins),
            Err(e) => bail!(RPCError::new(e, "[RPCAgentAPI:list_plugins]".to_string())),
        }
    }
}
