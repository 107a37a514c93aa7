use crate::error::AgentError;
use skiff_rpc::rpc::{ContainerOptions, ContainerSummary, ImageSummary, PluginSummary, RunRequest, UpdateRequest, VolumeSummary};
use std::collections::HashMap;
use std::str::FromStr;

/// Failures reported by a [super::ContainerRuntime] that callers may want to branch on
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("'{0}' not found")]
    NotFound(String),
    #[error("container '{0}' is not running")]
    NotRunning(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("container runtime failure: {0}")]
    Internal(String),
}

/// Join an image name and tag, an empty tag means `latest`
pub fn image_ref(name: &str, tag: &str) -> String {
    match tag.is_empty() {
        true => format!("{}:latest", name),
        false => format!("{}:{}", name, tag),
    }
}

/// Split `registry:5000/app:1.2` into (`registry:5000/app`, `1.2`).
/// A reference without a tag gets `latest`.
pub fn split_reference(reference: &str) -> (String, String) {
    match reference.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name.to_string(), tag.to_string()),
        _ => (reference.to_string(), "latest".to_string()),
    }
}

/// A published port, `[host_ip:]host_port:container_port[/protocol]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub host_ip: Option<String>,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String,
}
impl PortMapping {
    /// The key the runtime uses for the container side, e.g. `80/tcp`
    pub fn container_key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }
}
impl FromStr for PortMapping {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || AgentError::InvalidArgument(format!("bad port mapping '{}'", s));
        let (addr, protocol) = match s.split_once('/') {
            Some((addr, proto)) if proto == "tcp" || proto == "udp" || proto == "sctp" => (addr, proto.to_string()),
            Some(_) => return Err(bad()),
            None => (s, "tcp".to_string()),
        };
        let parts: Vec<&str> = addr.rsplitn(3, ':').collect();
        let (host_ip, host_port, container_port) = match parts.as_slice() {
            [ctr, host] => (None, *host, *ctr),
            [ctr, host, ip] if !ip.is_empty() => (Some(ip.to_string()), *host, *ctr),
            _ => return Err(bad()),
        };
        Ok(PortMapping {
            host_ip,
            host_port: host_port.parse().map_err(|_| bad())?,
            container_port: container_port.parse().map_err(|_| bad())?,
            protocol,
        })
    }
}
impl std::fmt::Display for PortMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ip) = &self.host_ip {
            write!(f, "{}:", ip)?;
        }
        write!(f, "{}:{}/{}", self.host_port, self.container_port, self.protocol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartMode {
    No,
    Always,
    UnlessStopped,
    OnFailure,
}

/// When the runtime brings a container back, `no|always|unless-stopped|on-failure[:retries]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub mode: RestartMode,
    /// only meaningful for [RestartMode::OnFailure], never zero
    pub max_retries: Option<u32>,
}
impl FromStr for RestartPolicy {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || AgentError::InvalidArgument(format!("bad restart policy '{}'", s));
        let (mode, retries) = match s.split_once(':') {
            Some((mode, count)) => (mode, Some(count.parse::<u32>().map_err(|_| bad())?)),
            None => (s, None),
        };
        let mode = match mode {
            "no" => RestartMode::No,
            "always" => RestartMode::Always,
            "unless-stopped" => RestartMode::UnlessStopped,
            "on-failure" => RestartMode::OnFailure,
            _ => return Err(bad()),
        };
        if retries.is_some() && mode != RestartMode::OnFailure {
            return Err(AgentError::InvalidArgument(format!(
                "only on-failure accepts a retry count, got '{}'",
                s
            )));
        }
        Ok(RestartPolicy {
            mode,
            max_retries: retries.filter(|r| *r > 0),
        })
    }
}
impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.mode {
            RestartMode::No => "no",
            RestartMode::Always => "always",
            RestartMode::UnlessStopped => "unless-stopped",
            RestartMode::OnFailure => "on-failure",
        };
        match self.max_retries {
            Some(r) => write!(f, "{}:{}", mode, r),
            None => write!(f, "{}", mode),
        }
    }
}

/// A host device passed into the container, `host_path[:container_path[:permissions]]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMapping {
    pub host_path: String,
    pub container_path: String,
    /// cgroup permissions, some combination of `r`, `w` and `m`
    pub permissions: String,
}
impl FromStr for DeviceMapping {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || AgentError::InvalidArgument(format!("bad device '{}'", s));
        let parts: Vec<&str> = s.splitn(3, ':').collect();
        let (host, ctr, perms) = match parts.as_slice() {
            [host] => (*host, *host, "rwm"),
            [host, ctr] => (*host, *ctr, "rwm"),
            [host, ctr, perms] => (*host, *ctr, *perms),
            _ => return Err(bad()),
        };
        if !host.starts_with('/') || !ctr.starts_with('/') {
            return Err(bad());
        }
        if perms.is_empty() || !perms.chars().all(|c| matches!(c, 'r' | 'w' | 'm')) {
            return Err(bad());
        }
        Ok(DeviceMapping {
            host_path: host.to_string(),
            container_path: ctr.to_string(),
            permissions: perms.to_string(),
        })
    }
}
impl std::fmt::Display for DeviceMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.host_path, self.container_path, self.permissions)
    }
}

/// `source:destination[:mode]`, the destination must be absolute
fn check_volume(volume: &str) -> Result<(), AgentError> {
    let parts: Vec<&str> = volume.splitn(3, ':').collect();
    match parts.as_slice() {
        [src, dest] | [src, dest, _] if !src.is_empty() && dest.starts_with('/') => Ok(()),
        _ => Err(AgentError::InvalidArgument(format!("bad volume '{}'", volume))),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceLimits {
    /// fractional CPUs
    pub cpus: Option<f64>,
    pub memory_bytes: Option<i64>,
}

/// Everything needed to create a container, and to re-create it exactly during a rollback
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub tag: String,
    pub cmd: Vec<String>,
    /// KEY=VALUE
    pub env: Vec<String>,
    pub ports: Vec<PortMapping>,
    /// source:destination[:mode]
    pub volumes: Vec<String>,
    pub devices: Vec<DeviceMapping>,
    pub network: Option<String>,
    pub cap_add: Vec<String>,
    pub run_as: Option<String>,
    pub restart_policy: Option<RestartPolicy>,
    pub labels: HashMap<String, String>,
    pub limits: ResourceLimits,
}
impl ContainerSpec {
    pub fn image_ref(&self) -> String {
        image_ref(&self.image, &self.tag)
    }
    pub fn host_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports.iter().map(|p| p.host_port)
    }

    fn from_parts(name: &str, image: &str, tag: &str, cmd: &[String], options: Option<&ContainerOptions>) -> Result<Self, AgentError> {
        if name.is_empty() {
            return Err(AgentError::InvalidArgument("instance name cannot be empty".to_string()));
        }
        if image.is_empty() {
            return Err(AgentError::InvalidArgument("image cannot be empty".to_string()));
        }
        let mut spec = ContainerSpec {
            name: name.to_string(),
            image: image.to_string(),
            tag: match tag.is_empty() {
                true => "latest".to_string(),
                false => tag.to_string(),
            },
            cmd: cmd.to_vec(),
            ..Default::default()
        };
        if let Some(opts) = options {
            spec.ports = opts
                .port_mappings
                .iter()
                .map(|p| PortMapping::from_str(p))
                .collect::<Result<Vec<_>, _>>()?;
            spec.env = opts.env_vars.clone();
            for volume in &opts.volumes {
                check_volume(volume)?;
            }
            spec.volumes = opts.volumes.clone();
            spec.devices = opts
                .devices
                .iter()
                .map(|d| DeviceMapping::from_str(d))
                .collect::<Result<Vec<_>, _>>()?;
            spec.network = non_empty(&opts.network);
            spec.cap_add = opts.capabilities.clone();
            spec.run_as = non_empty(&opts.run_as);
            spec.restart_policy = match opts.restart_policy.is_empty() {
                true => None,
                false => Some(RestartPolicy::from_str(&opts.restart_policy)?),
            };
            spec.labels = opts.labels.clone();
            if let Some(limits) = &opts.resource_limits {
                if limits.cpus < 0.0 || limits.memory_bytes < 0 {
                    return Err(AgentError::InvalidArgument("resource limits cannot be negative".to_string()));
                }
                spec.limits = ResourceLimits {
                    cpus: (limits.cpus > 0.0).then_some(limits.cpus),
                    memory_bytes: (limits.memory_bytes > 0).then_some(limits.memory_bytes),
                };
            }
        }
        Ok(spec)
    }
}
fn non_empty(s: &str) -> Option<String> {
    match s.is_empty() {
        true => None,
        false => Some(s.to_string()),
    }
}
impl TryFrom<&RunRequest> for ContainerSpec {
    type Error = AgentError;
    fn try_from(req: &RunRequest) -> Result<Self, Self::Error> {
        Self::from_parts(&req.instance_name, &req.image, &req.tag, &req.cmd, req.options.as_ref())
    }
}
impl TryFrom<&UpdateRequest> for ContainerSpec {
    type Error = AgentError;
    fn try_from(req: &UpdateRequest) -> Result<Self, Self::Error> {
        Self::from_parts(&req.instance_name, &req.image, &req.tag, &req.cmd, req.options.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    /// host ports published by this container
    pub ports: Vec<u16>,
}
impl From<ContainerInfo> for ContainerSummary {
    fn from(c: ContainerInfo) -> Self {
        ContainerSummary {
            id: c.id,
            name: c.name,
            image: c.image,
            state: c.state,
            ports: c.ports.into_iter().map(|p| p as u32).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageInfo {
    pub id: String,
    /// `name:tag` references pointing at this image
    pub repo_tags: Vec<String>,
    pub size: u64,
}
impl From<ImageInfo> for ImageSummary {
    fn from(i: ImageInfo) -> Self {
        ImageSummary {
            id: i.id,
            repo_tags: i.repo_tags,
            size: i.size,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeInfo {
    pub name: String,
    pub driver: String,
    pub mountpoint: String,
}
impl From<VolumeInfo> for VolumeSummary {
    fn from(v: VolumeInfo) -> Self {
        VolumeSummary {
            name: v.name,
            driver: v.driver,
            mountpoint: v.mountpoint,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PluginInfo {
    pub name: String,
    pub enabled: bool,
}
impl From<PluginInfo> for PluginSummary {
    fn from(p: PluginInfo) -> Self {
        PluginSummary {
            name: p.name,
            enabled: p.enabled,
        }
    }
}

/// What a prune call freed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: u64,
    pub space_reclaimed: u64,
}

/// Cumulative progress of an image pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullProgress {
    pub bytes: u64,
    pub status: String,
}
