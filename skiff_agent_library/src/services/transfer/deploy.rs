use super::chunked::{ChunkedReader, ChunkedWriter, ReadChunk};
use super::disk_guard::{check_space, SpaceGauge};
use super::staged_plugin_path;
use crate::agent_api::agent_config::TransferConfig;
use crate::error::AgentError;
use crate::services::containers::structs::{image_ref, split_reference};
use crate::services::containers::ContainerRuntime;
use anyhow::Result;
use futures::{Stream, StreamExt};
use skiff_library::transaction::{tid_or_new, TransactionId};
use skiff_library::{bail_error, utils::file_utils::ensure_dir};
use skiff_rpc::rpc::{
    deploy_request::Msg, DeployIntent, DeployRequest, DeployResponse, DeploySuccess, DownloadImageRequest,
    DownloadImageResponse, RemoteDownload,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tonic::Status;
use tracing::{debug, info, warn};

/// Outbound half of a transfer stream
#[tonic::async_trait]
pub trait ReplySender<T>: Send + Sync {
    /// Fails once the far end has gone away
    async fn send(&self, msg: T) -> Result<()>;
}

#[tonic::async_trait]
impl<T: Send + 'static> ReplySender<T> for mpsc::Sender<Result<T, Status>> {
    async fn send(&self, msg: T) -> Result<()> {
        match mpsc::Sender::send(self, Ok(msg)).await {
            Ok(_) => Ok(()),
            Err(_) => anyhow::bail!(AgentError::StreamClosed("client disconnected".to_string())),
        }
    }
}

fn describe(msg: &Option<Msg>) -> &'static str {
    match msg {
        Some(Msg::Intent(_)) => "intent",
        Some(Msg::Content(_)) => "content",
        Some(Msg::End(_)) => "end",
        None => "empty",
    }
}

/// Pull the next request off the client stream
async fn next_message<S>(inbound: &mut S) -> Result<Option<Msg>>
where
    S: Stream<Item = Result<DeployRequest, Status>> + Unpin + Send,
{
    match inbound.next().await {
        Some(Ok(req)) => Ok(req.msg),
        Some(Err(status)) => anyhow::bail!(AgentError::StreamClosed(status.message().to_string())),
        None => anyhow::bail!(AgentError::StreamClosed("client ended the stream early".to_string())),
    }
}

/// Moves image and plugin artifacts between clients and the device
pub struct TransferService {
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<TransferConfig>,
    gauge: Arc<dyn SpaceGauge>,
}

impl TransferService {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: Arc<TransferConfig>,
        gauge: Arc<dyn SpaceGauge>,
    ) -> Result<Arc<Self>> {
        ensure_dir(&config.temp_dir)?;
        ensure_dir(&config.plugin_staging_dir)?;
        Ok(Arc::new(TransferService { runtime, config, gauge }))
    }

    pub fn chunk_size(&self) -> u64 {
        self.config.chunk_size_bytes
    }

    /// Where the plugin `name` is staged after upload
    pub fn staged_plugin(&self, name: &str) -> Result<PathBuf> {
        Ok(staged_plugin_path(Path::new(&self.config.plugin_staging_dir), name)?)
    }

    /// Serve one deploy stream to completion.
    /// Every reply, including the final success, goes out on `reply`; the success is also returned.
    /// Any temporary file created for the session is gone when this returns.
    pub async fn handle_deploy<S, R>(&self, mut inbound: S, reply: &R) -> Result<DeploySuccess>
    where
        S: Stream<Item = Result<DeployRequest, Status>> + Unpin + Send,
        R: ReplySender<DeployResponse> + ?Sized,
    {
        let intent = match next_message(&mut inbound).await? {
            Some(Msg::Intent(intent)) => intent,
            Some(Msg::Content(_)) => anyhow::bail!(AgentError::OutOfOrder("content".to_string())),
            Some(Msg::End(_)) => anyhow::bail!(AgentError::OutOfOrder("end".to_string())),
            None => anyhow::bail!(AgentError::UnexpectedMessage("empty".to_string())),
        };
        let tid = tid_or_new(intent.transaction_id.clone());
        if intent.name.is_empty() {
            anyhow::bail!(AgentError::InvalidArgument("deploy target needs a name".to_string()));
        }
        info!(tid=%tid, name=%intent.name, tag=%intent.tag, declared=intent.declared_size, plugin=intent.is_plugin, remote=intent.remote_download.is_some(), "Deploy requested");

        match &intent.remote_download {
            Some(remote) => self.remote_download(&intent, remote, reply, &tid).await,
            None => self.local_upload(&intent, inbound, reply, &tid).await,
        }
    }

    async fn remote_download<R>(
        &self,
        intent: &DeployIntent,
        remote: &RemoteDownload,
        reply: &R,
        tid: &TransactionId,
    ) -> Result<DeploySuccess>
    where
        R: ReplySender<DeployResponse> + ?Sized,
    {
        if intent.is_plugin {
            anyhow::bail!(AgentError::InvalidArgument(
                "plugins must be uploaded, not pulled".to_string()
            ));
        }
        let target = image_ref(&intent.name, &intent.tag);
        let (pull_name, pull_tag) = match remote.reference.is_empty() {
            true => split_reference(&target),
            false => split_reference(&remote.reference),
        };

        let mut progress = self.runtime.pull_image(&pull_name, &pull_tag, tid);
        let mut reported = 0;
        while let Some(update) = progress.next().await {
            let update = update?;
            reported = reported.max(update.bytes);
            debug!(tid=%tid, bytes=reported, status=%update.status, "Pull progress");
            reply.send(DeployResponse::progress(reported)).await?;
        }
        drop(progress);

        let pulled = image_ref(&pull_name, &pull_tag);
        let (name, tag) = split_reference(&target);
        if pulled != target {
            self.runtime.tag_image(&pulled, &name, &tag, tid).await?;
        }
        let size = self
            .runtime
            .list_images(tid)
            .await?
            .into_iter()
            .find(|i| i.repo_tags.contains(&target))
            .map(|i| i.size)
            .unwrap_or(reported);
        info!(tid=%tid, image=%target, size=size, "Image pulled");
        let success = DeploySuccess {
            name,
            tag,
            image_size: size,
            digest: String::new(),
        };
        reply
            .send(DeployResponse::success(
                success.name.clone(),
                success.tag.clone(),
                success.image_size,
                success.digest.clone(),
            ))
            .await?;
        Ok(success)
    }

    async fn local_upload<S, R>(
        &self,
        intent: &DeployIntent,
        mut inbound: S,
        reply: &R,
        tid: &TransactionId,
    ) -> Result<DeploySuccess>
    where
        S: Stream<Item = Result<DeployRequest, Status>> + Unpin + Send,
        R: ReplySender<DeployResponse> + ?Sized,
    {
        let declared = intent.declared_size;
        let temp_dir = Path::new(&self.config.temp_dir);
        check_space(self.gauge.as_ref(), temp_dir, declared, tid)?;
        let plugin_dest = match intent.is_plugin {
            true => Some(self.staged_plugin(&intent.name)?),
            false => None,
        };

        // dropping the writer on any early return removes the partial file
        let mut writer = ChunkedWriter::open(temp_dir, self.chunk_size())?;
        reply.send(DeployResponse::ready(writer.chunk_size())).await?;

        loop {
            match next_message(&mut inbound).await? {
                Some(Msg::Content(content)) => {
                    let received = writer.size() + content.data.len() as u64;
                    if received > declared {
                        warn!(tid=%tid, declared=declared, received=received, "Transfer overran its declared size");
                        anyhow::bail!(AgentError::Overrun { declared, received });
                    }
                    writer.write(&content.data)?;
                    reply.send(DeployResponse::progress(writer.size())).await?;
                },
                Some(Msg::End(_)) => break,
                other => anyhow::bail!(AgentError::UnexpectedMessage(describe(&other).to_string())),
            }
        }
        if writer.size() != declared {
            anyhow::bail!(AgentError::IncompleteTransfer {
                declared,
                received: writer.size(),
            });
        }
        let digest = writer.digest();
        let (name, tag) = split_reference(&image_ref(&intent.name, &intent.tag));

        match plugin_dest {
            Some(dest) => {
                writer.persist(&dest, tid)?;
                info!(tid=%tid, plugin=%intent.name, path=%dest.display(), size=declared, "Plugin staged");
            },
            None => {
                let loaded = self.runtime.load_image(writer.path(), tid).await?;
                let target = image_ref(&name, &tag);
                if !loaded.contains(&target) {
                    match loaded.first() {
                        Some(source) => self.runtime.tag_image(source, &name, &tag, tid).await?,
                        None => bail_error!(tid=%tid, "Uploaded archive did not contain an image"),
                    };
                }
                info!(tid=%tid, image=%target, size=declared, digest=%digest, "Image loaded");
            },
        };

        let success = DeploySuccess {
            name,
            tag,
            image_size: declared,
            digest,
        };
        reply
            .send(DeployResponse::success(
                success.name.clone(),
                success.tag.clone(),
                success.image_size,
                success.digest.clone(),
            ))
            .await?;
        Ok(success)
    }

    /// Stream an image out of the runtime to a client, returns the number of bytes sent
    pub async fn handle_download<R>(&self, request: DownloadImageRequest, reply: &R) -> Result<u64>
    where
        R: ReplySender<DownloadImageResponse> + ?Sized,
    {
        let tid = tid_or_new(request.transaction_id);
        if request.name.is_empty() {
            anyhow::bail!(AgentError::InvalidArgument("download needs an image name".to_string()));
        }
        let reference = image_ref(&request.name, &request.tag);
        let export = match tempfile::Builder::new()
            .prefix("export-")
            .tempfile_in(&self.config.temp_dir)
        {
            Ok(f) => f,
            Err(e) => bail_error!(tid=%tid, error=%e, "Failed to create export file"),
        };
        self.runtime.export_image(&reference, export.path(), &tid).await?;

        let chunk_size = self.chunk_size();
        let mut reader = ChunkedReader::open(export.path())?;
        reply
            .send(DownloadImageResponse::info(reader.size(), chunk_size))
            .await?;
        while let ReadChunk::Data(data) = reader.read(chunk_size)? {
            if !data.is_empty() {
                reply.send(DownloadImageResponse::chunk(data)).await?;
            }
        }
        info!(tid=%tid, image=%reference, size=reader.size(), "Image exported");
        Ok(reader.size())
    }
}
