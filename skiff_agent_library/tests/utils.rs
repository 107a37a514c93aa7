#![allow(dead_code)]

use anyhow::Result;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use skiff_agent_library::agent_api::config::{AgentConfig, Configuration};
use skiff_agent_library::services::containers::structs::{
    image_ref, ContainerInfo, ContainerSpec, ImageInfo, PluginInfo, PruneReport, PullProgress, RuntimeError,
    VolumeInfo,
};
use skiff_agent_library::services::containers::ContainerRuntime;
use skiff_agent_library::services::transfer::disk_guard::SpaceGauge;
use skiff_agent_library::services::transfer::ReplySender;
use skiff_library::transaction::TransactionId;
use skiff_rpc::rpc::DeployRequest;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tonic::Status;

#[macro_export]
macro_rules! assert_error {
    ($err:expr, $exp:expr, $noerr:expr) => {
        match $err {
            Ok(_) => panic!("{}", $noerr),
            Err(e) => {
                assert_eq!(e.to_string(), $exp);
            },
        };
    };
}

/// Agent configuration rooted in `dir`, with a tiny chunk size so small payloads span several chunks
pub fn test_config(dir: &TempDir, overrides: Option<Vec<(String, String)>>) -> AgentConfig {
    let mut all = vec![
        ("transfer.chunk_size_bytes".to_string(), "8".to_string()),
        (
            "transfer.temp_dir".to_string(),
            dir.path().join("transfers").to_string_lossy().to_string(),
        ),
        (
            "transfer.plugin_staging_dir".to_string(),
            dir.path().join("plugins").to_string_lossy().to_string(),
        ),
        ("logging.directory".to_string(), "".to_string()),
    ];
    all.extend(overrides.unwrap_or_default());
    Configuration::boxed(None, Some(all)).unwrap()
}

/// Files left behind in `dir`
pub fn dir_entries(dir: &Path) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(rd) => rd
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect(),
        Err(_) => vec![],
    }
}

pub fn spec(name: &str, image: &str, tag: &str, ports: &[&str]) -> ContainerSpec {
    ContainerSpec {
        name: name.to_string(),
        image: image.to_string(),
        tag: tag.to_string(),
        ports: ports.iter().map(|p| p.parse().unwrap()).collect(),
        ..Default::default()
    }
}

/// Reports a fixed amount of free space
pub struct FixedGauge(pub u64);
impl SpaceGauge for FixedGauge {
    fn available_bytes(&self, _path: &Path, _tid: &TransactionId) -> Result<u64> {
        Ok(self.0)
    }
}

/// Collects everything sent on a transfer stream.
/// With `accept` set, sends after that many messages fail as if the client went away.
pub struct RecordingSender<T> {
    pub sent: Mutex<Vec<T>>,
    accept: Option<usize>,
}
impl<T> RecordingSender<T> {
    pub fn new() -> Self {
        RecordingSender {
            sent: Mutex::new(vec![]),
            accept: None,
        }
    }
    pub fn disconnect_after(accept: usize) -> Self {
        RecordingSender {
            sent: Mutex::new(vec![]),
            accept: Some(accept),
        }
    }
}
#[tonic::async_trait]
impl<T: Send> ReplySender<T> for RecordingSender<T> {
    async fn send(&self, msg: T) -> Result<()> {
        let mut sent = self.sent.lock();
        if let Some(accept) = self.accept {
            if sent.len() >= accept {
                anyhow::bail!("client went away");
            }
        }
        sent.push(msg);
        Ok(())
    }
}

pub fn deploy_stream(
    msgs: Vec<DeployRequest>,
) -> futures::stream::Iter<std::vec::IntoIter<Result<DeployRequest, Status>>> {
    futures::stream::iter(msgs.into_iter().map(Ok).collect::<Vec<_>>())
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub spec: ContainerSpec,
    pub running: bool,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    images: Vec<ImageInfo>,
    volumes: Vec<VolumeInfo>,
    plugins: Vec<PluginInfo>,
    failures: HashMap<String, VecDeque<RuntimeError>>,
    delays: HashMap<String, VecDeque<Duration>>,
    calls: Vec<String>,
    loaded: Vec<Vec<u8>>,
    load_refs: Vec<String>,
    pull_progress: Vec<u64>,
    export_bytes: Vec<u8>,
    plugin_archives: HashMap<String, Vec<u8>>,
    next_id: u64,
}

/// An in-memory container engine that behaves like the real one closely enough for the agent's logic.
/// One-shot failures and delays can be injected per operation name, e.g. `"remove_container"`.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeRuntime::default())
    }

    pub fn add_image(&self, reference: &str, size: u64) {
        let mut s = self.state.lock();
        s.next_id += 1;
        let id = format!("sha256:{:04}", s.next_id);
        s.images.push(ImageInfo {
            id,
            repo_tags: vec![reference.to_string()],
            size,
        });
    }
    /// An image with no tags
    pub fn add_dangling_image(&self, size: u64) {
        let mut s = self.state.lock();
        s.next_id += 1;
        let id = format!("sha256:{:04}", s.next_id);
        s.images.push(ImageInfo {
            id,
            repo_tags: vec![],
            size,
        });
    }
    pub fn add_container(&self, spec: ContainerSpec, running: bool) {
        let mut s = self.state.lock();
        s.next_id += 1;
        let id = format!("ctr-{}", s.next_id);
        s.containers
            .insert(spec.name.clone(), FakeContainer { id, spec, running });
    }
    /// The next call of `op` fails with `err`, calls queue up in order
    pub fn fail_next(&self, op: &str, err: RuntimeError) {
        self.state
            .lock()
            .failures
            .entry(op.to_string())
            .or_default()
            .push_back(err);
    }
    /// The next call of `op` takes `delay` before doing anything
    pub fn delay_next(&self, op: &str, delay: Duration) {
        self.state
            .lock()
            .delays
            .entry(op.to_string())
            .or_default()
            .push_back(delay);
    }
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }
    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.state.lock().containers.get(name).cloned()
    }
    pub fn image_tags(&self) -> Vec<String> {
        self.state
            .lock()
            .images
            .iter()
            .flat_map(|i| i.repo_tags.clone())
            .collect()
    }
    pub fn image_count(&self) -> usize {
        self.state.lock().images.len()
    }
    /// The references `load_image` reports for the next archive
    pub fn set_load_result(&self, refs: Vec<&str>) {
        self.state.lock().load_refs = refs.into_iter().map(|r| r.to_string()).collect();
    }
    /// Bytes of every archive handed to `load_image`
    pub fn loaded_archives(&self) -> Vec<Vec<u8>> {
        self.state.lock().loaded.clone()
    }
    pub fn set_pull_progress(&self, progress: Vec<u64>) {
        self.state.lock().pull_progress = progress;
    }
    pub fn set_export(&self, bytes: Vec<u8>) {
        self.state.lock().export_bytes = bytes;
    }
    pub fn plugin_archive(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().plugin_archives.get(name).cloned()
    }

    fn record(&self, op: &str, subject: &str) -> (Option<Duration>, Option<RuntimeError>) {
        let mut s = self.state.lock();
        s.calls.push(format!("{} {}", op, subject));
        let delay = s.delays.get_mut(op).and_then(|q| q.pop_front());
        let failure = s.failures.get_mut(op).and_then(|q| q.pop_front());
        (delay, failure)
    }

    async fn enter(&self, op: &str, subject: &str) -> Result<()> {
        let (delay, failure) = self.record(op, subject);
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

#[tonic::async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self, tid: &TransactionId) -> Result<Vec<ContainerInfo>> {
        self.enter("list_containers", tid).await?;
        let s = self.state.lock();
        let mut list: Vec<ContainerInfo> = s
            .containers
            .values()
            .map(|c| ContainerInfo {
                id: c.id.clone(),
                name: c.spec.name.clone(),
                image: c.spec.image_ref(),
                state: match c.running {
                    true => "running".to_string(),
                    false => "exited".to_string(),
                },
                ports: match c.running {
                    true => c.spec.host_ports().collect(),
                    false => vec![],
                },
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    async fn inspect_container(&self, name: &str, _tid: &TransactionId) -> Result<ContainerSpec> {
        self.enter("inspect_container", name).await?;
        match self.state.lock().containers.get(name) {
            Some(c) => Ok(c.spec.clone()),
            None => Err(RuntimeError::NotFound(name.to_string()).into()),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec, _tid: &TransactionId) -> Result<String> {
        self.enter("create_container", &spec.name).await?;
        let mut s = self.state.lock();
        if s.containers.contains_key(&spec.name) {
            return Err(RuntimeError::Conflict(format!("name '{}' is in use", spec.name)).into());
        }
        let reference = spec.image_ref();
        if !s.images.iter().any(|i| i.repo_tags.contains(&reference)) {
            return Err(RuntimeError::NotFound(reference).into());
        }
        s.next_id += 1;
        let id = format!("ctr-{}", s.next_id);
        s.containers.insert(
            spec.name.clone(),
            FakeContainer {
                id: id.clone(),
                spec: spec.clone(),
                running: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, name: &str, _tid: &TransactionId) -> Result<()> {
        self.enter("start_container", name).await?;
        match self.state.lock().containers.get_mut(name) {
            Some(c) => {
                c.running = true;
                Ok(())
            },
            None => Err(RuntimeError::NotFound(name.to_string()).into()),
        }
    }

    async fn stop_container(&self, name: &str, _force: bool, _tid: &TransactionId) -> Result<()> {
        self.enter("stop_container", name).await?;
        match self.state.lock().containers.get_mut(name) {
            Some(c) if !c.running => Err(RuntimeError::NotRunning(name.to_string()).into()),
            Some(c) => {
                c.running = false;
                Ok(())
            },
            None => Err(RuntimeError::NotFound(name.to_string()).into()),
        }
    }

    async fn remove_container(&self, name: &str, force: bool, _tid: &TransactionId) -> Result<()> {
        self.enter("remove_container", name).await?;
        let mut s = self.state.lock();
        match s.containers.get(name).map(|c| c.running) {
            Some(true) if !force => Err(RuntimeError::Conflict(format!("container '{}' is running", name)).into()),
            Some(_) => {
                s.containers.remove(name);
                Ok(())
            },
            None => Err(RuntimeError::NotFound(name.to_string()).into()),
        }
    }

    async fn prune_containers(&self, tid: &TransactionId) -> Result<PruneReport> {
        self.enter("prune_containers", tid).await?;
        let mut s = self.state.lock();
        let before = s.containers.len();
        s.containers.retain(|_, c| c.running);
        let removed = (before - s.containers.len()) as u64;
        Ok(PruneReport {
            removed,
            space_reclaimed: removed * 100,
        })
    }

    async fn list_images(&self, tid: &TransactionId) -> Result<Vec<ImageInfo>> {
        self.enter("list_images", tid).await?;
        Ok(self.state.lock().images.clone())
    }

    fn pull_image<'a>(&'a self, name: &'a str, tag: &'a str, _tid: &'a TransactionId) -> BoxStream<'a, Result<PullProgress>> {
        let reference = image_ref(name, tag);
        let (_, failure) = self.record("pull_image", &reference);
        if let Some(e) = failure {
            return Box::pin(futures::stream::once(async move { Err(e.into()) }));
        }
        let progress = self.state.lock().pull_progress.clone();
        let size = progress.last().copied().unwrap_or(0);
        self.add_image(&reference, size);
        Box::pin(futures::stream::iter(progress.into_iter().map(|bytes| {
            Ok(PullProgress {
                bytes,
                status: "Downloading".to_string(),
            })
        })))
    }

    async fn load_image(&self, archive: &Path, _tid: &TransactionId) -> Result<Vec<String>> {
        self.enter("load_image", &archive.to_string_lossy()).await?;
        let bytes = tokio::fs::read(archive).await?;
        let size = bytes.len() as u64;
        let refs = {
            let mut s = self.state.lock();
            s.loaded.push(bytes);
            s.load_refs.clone()
        };
        for r in &refs {
            self.add_image(r, size);
        }
        Ok(refs)
    }

    async fn tag_image(&self, source: &str, repo: &str, tag: &str, _tid: &TransactionId) -> Result<()> {
        self.enter("tag_image", source).await?;
        let mut s = self.state.lock();
        match s
            .images
            .iter_mut()
            .find(|i| i.repo_tags.iter().any(|t| t == source) || i.id == source)
        {
            Some(i) => {
                i.repo_tags.push(image_ref(repo, tag));
                Ok(())
            },
            None => Err(RuntimeError::NotFound(source.to_string()).into()),
        }
    }

    async fn export_image(&self, reference: &str, dest: &Path, _tid: &TransactionId) -> Result<u64> {
        self.enter("export_image", reference).await?;
        let bytes = {
            let s = self.state.lock();
            if !s.images.iter().any(|i| i.repo_tags.iter().any(|t| t == reference)) {
                return Err(RuntimeError::NotFound(reference.to_string()).into());
            }
            s.export_bytes.clone()
        };
        tokio::fs::write(dest, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn remove_image(&self, reference: &str, _force: bool, _tid: &TransactionId) -> Result<()> {
        self.enter("remove_image", reference).await?;
        let mut s = self.state.lock();
        match s.images.iter().position(|i| i.repo_tags.iter().any(|t| t == reference)) {
            Some(pos) => {
                s.images[pos].repo_tags.retain(|t| t != reference);
                if s.images[pos].repo_tags.is_empty() {
                    s.images.remove(pos);
                }
                Ok(())
            },
            None => Err(RuntimeError::NotFound(reference.to_string()).into()),
        }
    }

    async fn prune_images(&self, tid: &TransactionId) -> Result<PruneReport> {
        self.enter("prune_images", tid).await?;
        let mut s = self.state.lock();
        let (dangling, kept): (Vec<ImageInfo>, Vec<ImageInfo>) =
            s.images.drain(..).partition(|i| i.repo_tags.is_empty());
        s.images = kept;
        Ok(PruneReport {
            removed: dangling.len() as u64,
            space_reclaimed: dangling.iter().map(|i| i.size).sum(),
        })
    }

    async fn list_volumes(&self, tid: &TransactionId) -> Result<Vec<VolumeInfo>> {
        self.enter("list_volumes", tid).await?;
        Ok(self.state.lock().volumes.clone())
    }

    async fn create_volume(
        &self,
        name: &str,
        driver: &str,
        _labels: &HashMap<String, String>,
        _tid: &TransactionId,
    ) -> Result<()> {
        self.enter("create_volume", name).await?;
        let mut s = self.state.lock();
        if s.volumes.iter().any(|v| v.name == name) {
            return Err(RuntimeError::Conflict(format!("volume '{}' exists", name)).into());
        }
        s.volumes.push(VolumeInfo {
            name: name.to_string(),
            driver: match driver.is_empty() {
                true => "local".to_string(),
                false => driver.to_string(),
            },
            mountpoint: format!("/var/lib/docker/volumes/{}/_data", name),
        });
        Ok(())
    }

    async fn remove_volume(&self, name: &str, _force: bool, _tid: &TransactionId) -> Result<()> {
        self.enter("remove_volume", name).await?;
        let mut s = self.state.lock();
        match s.volumes.iter().position(|v| v.name == name) {
            Some(pos) => {
                s.volumes.remove(pos);
                Ok(())
            },
            None => Err(RuntimeError::NotFound(name.to_string()).into()),
        }
    }

    async fn list_plugins(&self, tid: &TransactionId) -> Result<Vec<PluginInfo>> {
        self.enter("list_plugins", tid).await?;
        Ok(self.state.lock().plugins.clone())
    }

    async fn create_plugin(&self, name: &str, archive: &Path, _tid: &TransactionId) -> Result<()> {
        self.enter("create_plugin", name).await?;
        let bytes = tokio::fs::read(archive).await?;
        let mut s = self.state.lock();
        if s.plugins.iter().any(|p| p.name == name) {
            return Err(RuntimeError::Conflict(format!("plugin '{}' exists", name)).into());
        }
        s.plugins.push(PluginInfo {
            name: name.to_string(),
            enabled: false,
        });
        s.plugin_archives.insert(name.to_string(), bytes);
        Ok(())
    }

    async fn enable_plugin(&self, name: &str, _tid: &TransactionId) -> Result<()> {
        self.enter("enable_plugin", name).await?;
        match self.state.lock().plugins.iter_mut().find(|p| p.name == name) {
            Some(p) => {
                p.enabled = true;
                Ok(())
            },
            None => Err(RuntimeError::NotFound(name.to_string()).into()),
        }
    }

    async fn disable_plugin(&self, name: &str, _force: bool, _tid: &TransactionId) -> Result<()> {
        self.enter("disable_plugin", name).await?;
        match self.state.lock().plugins.iter_mut().find(|p| p.name == name) {
            Some(p) => {
                p.enabled = false;
                Ok(())
            },
            None => Err(RuntimeError::NotFound(name.to_string()).into()),
        }
    }

    async fn remove_plugin(&self, name: &str, force: bool, _tid: &TransactionId) -> Result<()> {
        self.enter("remove_plugin", name).await?;
        let mut s = self.state.lock();
        match s.plugins.iter().position(|p| p.name == name) {
            Some(pos) if s.plugins[pos].enabled && !force => {
                Err(RuntimeError::Conflict(format!("plugin '{}' is enabled", name)).into())
            },
            Some(pos) => {
                s.plugins.remove(pos);
                Ok(())
            },
            None => Err(RuntimeError::NotFound(name.to_string()).into()),
        }
    }
}
