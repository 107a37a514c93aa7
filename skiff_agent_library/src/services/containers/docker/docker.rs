use self::dockerstructs::{create_config, spec_from_inspect};
use super::structs::{
    ContainerInfo, ContainerSpec, ImageInfo, PluginInfo, PruneReport, PullProgress, RuntimeError, VolumeInfo,
};
use super::ContainerRuntime;
use crate::agent_api::agent_config::RuntimeConfig;
use anyhow::Result;
use bollard::container::{
    CreateContainerOptions, InspectContainerOptions, KillContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{
    CreateImageOptions, ImportImageOptions, ListImagesOptions, PruneImagesOptions, RemoveImageOptions, TagImageOptions,
};
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions};
use bollard::Docker;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use skiff_library::utils::run_host_command;
use skiff_library::{bail_error, transaction::TransactionId};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

pub mod dockerstructs;

/// Turn a Docker API failure into a typed [RuntimeError] about `subject`
fn runtime_error(e: DockerError, subject: &str) -> RuntimeError {
    match e {
        DockerError::DockerResponseServerError { status_code: 404, .. } => RuntimeError::NotFound(subject.to_string()),
        DockerError::DockerResponseServerError { status_code: 304, .. } => {
            RuntimeError::NotRunning(subject.to_string())
        },
        DockerError::DockerResponseServerError {
            status_code: 409,
            message,
        } => RuntimeError::Conflict(message),
        e => RuntimeError::Internal(e.to_string()),
    }
}

/// Log and wrap a failed Docker call
fn fail(e: DockerError, subject: &str, action: &str, tid: &TransactionId) -> anyhow::Error {
    let e = runtime_error(e, subject);
    match &e {
        RuntimeError::Internal(_) => tracing::error!(tid=tid, error=%e, subject=subject, action=action, "Docker call failed"),
        _ => warn!(tid=tid, error=%e, subject=subject, action=action, "Docker call failed"),
    };
    e.into()
}

/// Bytes per body frame when streaming an archive to the daemon
const LOAD_FRAME_BYTES: usize = 1024 * 1024;

/// Stream `file` in frames of at most `frame` bytes, so an archive is never held in memory whole.
/// A read failure ends the stream early and is left in `failed`.
fn archive_body(
    file: tokio::fs::File,
    frame: usize,
    failed: Arc<Mutex<Option<std::io::Error>>>,
) -> impl Stream<Item = Bytes> + Send + 'static {
    futures::stream::unfold(file, move |mut file| {
        let failed = failed.clone();
        async move {
            let mut buf = vec![0; frame];
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Bytes::from(buf), file))
                },
                Err(e) => {
                    *failed.lock() = Some(e);
                    None
                },
            }
        }
    })
}

/// [ContainerRuntime] backed by the local Docker daemon.
/// Plugins are managed through the docker CLI, the engine API has no stable plugin install path.
pub struct DockerRuntime {
    docker_api: Docker,
    config: Arc<RuntimeConfig>,
}
impl DockerRuntime {
    pub async fn supported(tid: &TransactionId) -> bool {
        let docker = match Docker::connect_with_socket_defaults() {
            Ok(d) => d,
            Err(e) => {
                warn!(tid=tid, error=%e, "Failed to connect to docker");
                return false;
            },
        };
        match docker.ping().await {
            Ok(_) => true,
            Err(e) => {
                warn!(tid=tid, error=?e, "Failed to ping docker");
                false
            },
        }
    }

    pub fn new(config: Arc<RuntimeConfig>, tid: &TransactionId) -> Result<Self> {
        let docker = match Docker::connect_with_socket_defaults() {
            Ok(d) => d,
            Err(e) => bail_error!(tid=tid, error=%e, "Failed to connect to docker"),
        };
        Ok(DockerRuntime {
            docker_api: docker,
            config,
        })
    }

    async fn docker_cli(&self, args: Vec<&str>, tid: &TransactionId) -> Result<String> {
        run_host_command(&self.config.docker_cli, &args, tid).await
    }
}

#[tonic::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self, tid: &TransactionId) -> Result<Vec<ContainerInfo>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let list = match self.docker_api.list_containers(Some(options)).await {
            Ok(l) => l,
            Err(e) => return Err(fail(e, "containers", "list", tid)),
        };
        Ok(list
            .into_iter()
            .map(|c| {
                let mut ports: Vec<u16> = c
                    .ports
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|p| p.public_port)
                    .collect();
                ports.sort_unstable();
                ports.dedup();
                ContainerInfo {
                    id: c.id.unwrap_or_default(),
                    name: c
                        .names
                        .and_then(|n| n.into_iter().next())
                        .map(|n| n.trim_start_matches('/').to_string())
                        .unwrap_or_default(),
                    image: c.image.unwrap_or_default(),
                    state: c.state.unwrap_or_default(),
                    ports,
                }
            })
            .collect())
    }

    async fn inspect_container(&self, name: &str, tid: &TransactionId) -> Result<ContainerSpec> {
        match self
            .docker_api
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Ok(spec_from_inspect(name, inspect)),
            Err(e) => Err(fail(e, name, "inspect", tid)),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec, tid: &TransactionId) -> Result<String> {
        let config = create_config(spec);
        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };
        debug!(tid=tid, name=%spec.name, config=?config, "Creating container");
        match self.docker_api.create_container(Some(options), config).await {
            Ok(created) => {
                for warning in created.warnings {
                    warn!(tid=tid, name=%spec.name, warning=%warning, "Docker warning on create");
                }
                info!(tid=tid, name=%spec.name, id=%created.id, "Container created");
                Ok(created.id)
            },
            Err(e) => Err(fail(e, &spec.name, "create", tid)),
        }
    }

    async fn start_container(&self, name: &str, tid: &TransactionId) -> Result<()> {
        match self
            .docker_api
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => {
                debug!(tid = tid, name = name, "Container started");
                Ok(())
            },
            Err(e) => Err(fail(e, name, "start", tid)),
        }
    }

    async fn stop_container(&self, name: &str, force: bool, tid: &TransactionId) -> Result<()> {
        let res = match force {
            true => self
                .docker_api
                .kill_container(name, None::<KillContainerOptions<String>>)
                .await
                .map_err(|e| match e {
                    // killing a stopped container is a conflict, not a 304
                    DockerError::DockerResponseServerError { status_code: 409, .. } => {
                        DockerError::DockerResponseServerError {
                            status_code: 304,
                            message: String::new(),
                        }
                    },
                    e => e,
                }),
            false => {
                let options = StopContainerOptions {
                    t: self.config.stop_timeout_sec as i64,
                };
                self.docker_api.stop_container(name, Some(options)).await
            },
        };
        match res {
            Ok(_) => {
                debug!(tid = tid, name = name, force = force, "Container stopped");
                Ok(())
            },
            Err(e) => Err(fail(e, name, "stop", tid)),
        }
    }

    async fn remove_container(&self, name: &str, force: bool, tid: &TransactionId) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            v: false,
            link: false,
        };
        match self.docker_api.remove_container(name, Some(options)).await {
            Ok(_) => {
                debug!(tid = tid, name = name, "Container removed");
                Ok(())
            },
            Err(e) => Err(fail(e, name, "remove", tid)),
        }
    }

    async fn prune_containers(&self, tid: &TransactionId) -> Result<PruneReport> {
        match self.docker_api.prune_containers::<String>(None).await {
            Ok(r) => Ok(PruneReport {
                removed: r.containers_deleted.map(|d| d.len() as u64).unwrap_or(0),
                space_reclaimed: r.space_reclaimed.unwrap_or(0).max(0) as u64,
            }),
            Err(e) => Err(fail(e, "containers", "prune", tid)),
        }
    }

    async fn list_images(&self, tid: &TransactionId) -> Result<Vec<ImageInfo>> {
        let options = ListImagesOptions::<String> {
            all: false,
            ..Default::default()
        };
        match self.docker_api.list_images(Some(options)).await {
            Ok(list) => Ok(list
                .into_iter()
                .map(|i| ImageInfo {
                    id: i.id,
                    repo_tags: i.repo_tags,
                    size: i.size.max(0) as u64,
                })
                .collect()),
            Err(e) => Err(fail(e, "images", "list", tid)),
        }
    }

    fn pull_image<'a>(&'a self, name: &'a str, tag: &'a str, tid: &'a TransactionId) -> BoxStream<'a, Result<PullProgress>> {
        let options = CreateImageOptions {
            from_image: name.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        info!(tid = tid, name = name, tag = tag, "Pulling image");
        // Docker reports progress per layer, the caller sees the running total
        let mut layers: HashMap<String, u64> = HashMap::new();
        self.docker_api
            .create_image(Some(options), None, None)
            .map(move |res| match res {
                Ok(update) => {
                    if let Some(err) = update.error {
                        return Err(fail(
                            DockerError::DockerStreamError { error: err },
                            name,
                            "pull",
                            tid,
                        ));
                    }
                    // extraction restarts each layer's counter, only downloads add to the total
                    if update.status.as_deref() == Some("Downloading") {
                        if let (Some(id), Some(current)) = (
                            update.id.as_ref(),
                            update.progress_detail.as_ref().and_then(|d| d.current),
                        ) {
                            layers.insert(id.clone(), current.max(0) as u64);
                        }
                    }
                    Ok(PullProgress {
                        bytes: layers.values().sum(),
                        status: update.status.unwrap_or_default(),
                    })
                },
                Err(e) => Err(fail(e, name, "pull", tid)),
            })
            .boxed()
    }

    async fn load_image(&self, archive: &Path, tid: &TransactionId) -> Result<Vec<String>> {
        let file = match tokio::fs::File::open(archive).await {
            Ok(f) => f,
            Err(e) => bail_error!(tid=tid, error=%e, archive=%archive.display(), "Failed to open image archive"),
        };
        let read_failure = Arc::new(Mutex::new(None));
        let mut stream = self.docker_api.import_image_stream(
            ImportImageOptions { quiet: true },
            archive_body(file, LOAD_FRAME_BYTES, read_failure.clone()),
            None,
        );
        let mut loaded = vec![];
        let mut daemon_failure = None;
        while let Some(res) = stream.next().await {
            match res {
                Ok(info) => {
                    for line in info.stream.unwrap_or_default().lines() {
                        if let Some(r) = line
                            .strip_prefix("Loaded image: ")
                            .or_else(|| line.strip_prefix("Loaded image ID: "))
                        {
                            loaded.push(r.trim().to_string());
                        }
                    }
                },
                Err(e) => {
                    daemon_failure = Some(e);
                    break;
                },
            }
        }
        // a truncated body makes the daemon fail too, the read error is the real cause
        let read_error = read_failure.lock().take();
        if let Some(e) = read_error {
            bail_error!(tid=tid, error=%e, archive=%archive.display(), "Failed to read image archive");
        }
        if let Some(e) = daemon_failure {
            return Err(fail(e, "image", "load", tid));
        }
        info!(tid=tid, loaded=?loaded, "Image archive loaded");
        Ok(loaded)
    }

    async fn tag_image(&self, source: &str, repo: &str, tag: &str, tid: &TransactionId) -> Result<()> {
        let options = TagImageOptions { repo, tag };
        match self.docker_api.tag_image(source, Some(options)).await {
            Ok(_) => Ok(()),
            Err(e) => Err(fail(e, source, "tag", tid)),
        }
    }

    async fn export_image(&self, reference: &str, dest: &Path, tid: &TransactionId) -> Result<u64> {
        let mut file = match tokio::fs::File::create(dest).await {
            Ok(f) => f,
            Err(e) => bail_error!(tid=tid, error=%e, dest=%dest.display(), "Failed to create export file"),
        };
        let mut written = 0;
        let mut stream = self.docker_api.export_image(reference);
        while let Some(res) = stream.next().await {
            let chunk = match res {
                Ok(c) => c,
                Err(e) => return Err(fail(e, reference, "export", tid)),
            };
            if let Err(e) = file.write_all(&chunk).await {
                bail_error!(tid=tid, error=%e, dest=%dest.display(), "Failed to write export file");
            }
            written += chunk.len() as u64;
        }
        if let Err(e) = file.flush().await {
            bail_error!(tid=tid, error=%e, dest=%dest.display(), "Failed to flush export file");
        }
        Ok(written)
    }

    async fn remove_image(&self, reference: &str, force: bool, tid: &TransactionId) -> Result<()> {
        let options = RemoveImageOptions { force, noprune: false };
        match self.docker_api.remove_image(reference, Some(options), None).await {
            Ok(_) => Ok(()),
            Err(e) => Err(fail(e, reference, "remove", tid)),
        }
    }

    async fn prune_images(&self, tid: &TransactionId) -> Result<PruneReport> {
        let options = PruneImagesOptions {
            filters: HashMap::from([("dangling", vec!["true"])]),
        };
        match self.docker_api.prune_images(Some(options)).await {
            Ok(r) => Ok(PruneReport {
                removed: r.images_deleted.map(|d| d.len() as u64).unwrap_or(0),
                space_reclaimed: r.space_reclaimed.unwrap_or(0).max(0) as u64,
            }),
            Err(e) => Err(fail(e, "images", "prune", tid)),
        }
    }

    async fn list_volumes(&self, tid: &TransactionId) -> Result<Vec<VolumeInfo>> {
        match self.docker_api.list_volumes(None::<ListVolumesOptions<String>>).await {
            Ok(r) => Ok(r
                .volumes
                .unwrap_or_default()
                .into_iter()
                .map(|v| VolumeInfo {
                    name: v.name,
                    driver: v.driver,
                    mountpoint: v.mountpoint,
                })
                .collect()),
            Err(e) => Err(fail(e, "volumes", "list", tid)),
        }
    }

    async fn create_volume(
        &self,
        name: &str,
        driver: &str,
        labels: &HashMap<String, String>,
        tid: &TransactionId,
    ) -> Result<()> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            driver: match driver.is_empty() {
                true => "local".to_string(),
                false => driver.to_string(),
            },
            labels: labels.clone(),
            ..Default::default()
        };
        match self.docker_api.create_volume(options).await {
            Ok(_) => Ok(()),
            Err(e) => Err(fail(e, name, "create volume", tid)),
        }
    }

    async fn remove_volume(&self, name: &str, force: bool, tid: &TransactionId) -> Result<()> {
        match self
            .docker_api
            .remove_volume(name, Some(RemoveVolumeOptions { force }))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => Err(fail(e, name, "remove volume", tid)),
        }
    }

    async fn list_plugins(&self, tid: &TransactionId) -> Result<Vec<PluginInfo>> {
        let out = self
            .docker_cli(vec!["plugin", "ls", "--no-trunc", "--format", "{{.Name}}\t{{.Enabled}}"], tid)
            .await?;
        Ok(out
            .lines()
            .filter_map(|line| line.split_once('\t'))
            .map(|(name, enabled)| PluginInfo {
                name: name.to_string(),
                enabled: enabled.trim() == "true",
            })
            .collect())
    }

    async fn create_plugin(&self, name: &str, archive: &Path, tid: &TransactionId) -> Result<()> {
        if !archive.exists() {
            return Err(RuntimeError::NotFound(archive.display().to_string()).into());
        }
        let rootfs = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => bail_error!(tid=tid, error=%e, "Failed to create plugin unpack directory"),
        };
        let archive = archive.to_string_lossy().to_string();
        let dir = rootfs.path().to_string_lossy().to_string();
        run_host_command(&self.config.tar_cli, &["-xf", archive.as_str(), "-C", dir.as_str()], tid).await?;
        self.docker_cli(vec!["plugin", "create", name, dir.as_str()], tid).await?;
        info!(tid = tid, name = name, "Plugin installed");
        Ok(())
    }

    async fn enable_plugin(&self, name: &str, tid: &TransactionId) -> Result<()> {
        self.docker_cli(vec!["plugin", "enable", name], tid).await?;
        Ok(())
    }

    async fn disable_plugin(&self, name: &str, force: bool, tid: &TransactionId) -> Result<()> {
        let mut args = vec!["plugin", "disable"];
        if force {
            args.push("--force");
        }
        args.push(name);
        self.docker_cli(args, tid).await?;
        Ok(())
    }

    async fn remove_plugin(&self, name: &str, force: bool, tid: &TransactionId) -> Result<()> {
        let mut args = vec!["plugin", "rm"];
        if force {
            args.push("--force");
        }
        args.push(name);
        self.docker_cli(args, tid).await?;
        Ok(())
    }
}
