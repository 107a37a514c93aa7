use crate::services::containers::structs::{
    split_reference, ContainerSpec, DeviceMapping, PortMapping, ResourceLimits, RestartMode, RestartPolicy,
};
use bollard::container::Config;
use bollard::models::{
    ContainerInspectResponse, DeviceMapping as DockerDeviceMapping, HostConfig, PortBinding,
    RestartPolicy as DockerRestartPolicy, RestartPolicyNameEnum,
};
use std::collections::HashMap;

pub type BollardPortBindings = HashMap<String, Option<Vec<PortBinding>>>;

fn to_docker_restart(policy: &RestartPolicy) -> DockerRestartPolicy {
    let name = match policy.mode {
        RestartMode::No => RestartPolicyNameEnum::NO,
        RestartMode::Always => RestartPolicyNameEnum::ALWAYS,
        RestartMode::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
        RestartMode::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
    };
    DockerRestartPolicy {
        name: Some(name),
        maximum_retry_count: policy.max_retries.map(i64::from),
    }
}

fn from_docker_restart(policy: &DockerRestartPolicy) -> Option<RestartPolicy> {
    let mode = match policy.name.as_ref()? {
        RestartPolicyNameEnum::EMPTY => return None,
        RestartPolicyNameEnum::NO => RestartMode::No,
        RestartPolicyNameEnum::ALWAYS => RestartMode::Always,
        RestartPolicyNameEnum::UNLESS_STOPPED => RestartMode::UnlessStopped,
        RestartPolicyNameEnum::ON_FAILURE => RestartMode::OnFailure,
    };
    let max_retries = match mode {
        RestartMode::OnFailure => policy
            .maximum_retry_count
            .and_then(|c| u32::try_from(c).ok())
            .filter(|c| *c > 0),
        _ => None,
    };
    Some(RestartPolicy { mode, max_retries })
}

fn to_docker_device(device: &DeviceMapping) -> DockerDeviceMapping {
    DockerDeviceMapping {
        path_on_host: Some(device.host_path.clone()),
        path_in_container: Some(device.container_path.clone()),
        cgroup_permissions: Some(device.permissions.clone()),
    }
}

fn from_docker_device(device: &DockerDeviceMapping) -> Option<DeviceMapping> {
    let host = device.path_on_host.clone()?;
    Some(DeviceMapping {
        container_path: device.path_in_container.clone().unwrap_or_else(|| host.clone()),
        permissions: device.cgroup_permissions.clone().unwrap_or_else(|| "rwm".to_string()),
        host_path: host,
    })
}

/// Translate a [ContainerSpec] into the body Docker expects for container creation
pub fn create_config(spec: &ContainerSpec) -> Config<String> {
    let mut port_bindings: BollardPortBindings = HashMap::new();
    let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
    for port in &spec.ports {
        exposed_ports.insert(port.container_key(), HashMap::new());
        port_bindings
            .entry(port.container_key())
            .or_insert_with(|| Some(vec![]))
            .get_or_insert_with(Vec::new)
            .push(PortBinding {
                host_ip: port.host_ip.clone(),
                host_port: Some(port.host_port.to_string()),
            });
    }
    let host_config = HostConfig {
        binds: Some(spec.volumes.clone()),
        port_bindings: Some(port_bindings),
        devices: Some(spec.devices.iter().map(to_docker_device).collect()),
        network_mode: spec.network.clone(),
        cap_add: Some(spec.cap_add.clone()),
        restart_policy: spec.restart_policy.as_ref().map(to_docker_restart),
        nano_cpus: spec.limits.cpus.map(|c| (c * 1_000_000_000.0) as i64),
        memory: spec.limits.memory_bytes,
        ..Default::default()
    };
    Config {
        image: Some(spec.image_ref()),
        cmd: match spec.cmd.is_empty() {
            true => None,
            false => Some(spec.cmd.clone()),
        },
        env: Some(spec.env.clone()),
        user: spec.run_as.clone(),
        labels: Some(spec.labels.clone()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// Rebuild the [ContainerSpec] an existing container was created from
pub fn spec_from_inspect(name: &str, inspect: ContainerInspectResponse) -> ContainerSpec {
    let config = inspect.config.unwrap_or_default();
    let host = inspect.host_config.unwrap_or_default();
    let (image, tag) = split_reference(config.image.as_deref().unwrap_or_default());

    let mut ports = vec![];
    for (key, bindings) in host.port_bindings.unwrap_or_default() {
        let (ctr_port, protocol) = match key.split_once('/') {
            Some((p, proto)) => (p, proto.to_string()),
            None => (key.as_str(), "tcp".to_string()),
        };
        let Ok(container_port) = ctr_port.parse::<u16>() else {
            continue;
        };
        for binding in bindings.unwrap_or_default() {
            let Some(Ok(host_port)) = binding.host_port.as_deref().map(str::parse::<u16>) else {
                continue;
            };
            ports.push(PortMapping {
                host_ip: binding.host_ip.filter(|ip| !ip.is_empty()),
                host_port,
                container_port,
                protocol: protocol.clone(),
            });
        }
    }
    ports.sort_by_key(|p| (p.host_port, p.container_port));

    ContainerSpec {
        name: inspect
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| name.to_string()),
        image,
        tag,
        cmd: config.cmd.unwrap_or_default(),
        env: config.env.unwrap_or_default(),
        ports,
        volumes: host.binds.unwrap_or_default(),
        devices: host
            .devices
            .unwrap_or_default()
            .iter()
            .filter_map(from_docker_device)
            .collect(),
        network: host.network_mode.filter(|n| !n.is_empty()),
        cap_add: host.cap_add.unwrap_or_default(),
        run_as: config.user.filter(|u| !u.is_empty()),
        restart_policy: host.restart_policy.as_ref().and_then(from_docker_restart),
        labels: config.labels.unwrap_or_default(),
        limits: ResourceLimits {
            cpus: host.nano_cpus.filter(|c| *c > 0).map(|c| c as f64 / 1_000_000_000.0),
            memory_bytes: host.memory.filter(|m| *m > 0),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::ContainerConfig;
    use std::str::FromStr;

    #[test]
    fn on_failure_retries_reach_docker() {
        let policy = RestartPolicy::from_str("on-failure:3").unwrap();
        let docker = to_docker_restart(&policy);
        assert_eq!(docker.name, Some(RestartPolicyNameEnum::ON_FAILURE));
        assert_eq!(docker.maximum_retry_count, Some(3));
        assert_eq!(from_docker_restart(&docker), Some(policy));
    }

    #[test]
    fn inspect_zero_retries_means_none() {
        let docker = DockerRestartPolicy {
            name: Some(RestartPolicyNameEnum::ALWAYS),
            maximum_retry_count: Some(0),
        };
        assert_eq!(from_docker_restart(&docker).unwrap().to_string(), "always");
        let empty = DockerRestartPolicy {
            name: Some(RestartPolicyNameEnum::EMPTY),
            maximum_retry_count: None,
        };
        assert_eq!(from_docker_restart(&empty), None);
    }

    #[test]
    fn device_without_container_path_mirrors_host() {
        let docker = DockerDeviceMapping {
            path_on_host: Some("/dev/ttyS0".to_string()),
            path_in_container: None,
            cgroup_permissions: None,
        };
        assert_eq!(from_docker_device(&docker).unwrap().to_string(), "/dev/ttyS0:/dev/ttyS0:rwm");
    }

    #[test]
    fn inspect_restores_create_config() {
        let spec = ContainerSpec {
            name: "web".to_string(),
            image: "registry:5000/web".to_string(),
            tag: "2".to_string(),
            cmd: vec!["serve".to_string()],
            env: vec!["A=1".to_string()],
            ports: vec![
                PortMapping::from_str("8080:80").unwrap(),
                PortMapping::from_str("127.0.0.1:9090:90/udp").unwrap(),
            ],
            volumes: vec!["data:/data".to_string()],
            devices: vec![DeviceMapping::from_str("/dev/ttyS0:/dev/ttyS0:rw").unwrap()],
            network: Some("host".to_string()),
            cap_add: vec!["NET_ADMIN".to_string()],
            run_as: Some("1000".to_string()),
            restart_policy: Some(RestartPolicy::from_str("always").unwrap()),
            labels: HashMap::from([("app".to_string(), "web".to_string())]),
            limits: ResourceLimits {
                cpus: Some(1.5),
                memory_bytes: Some(64 * 1024 * 1024),
            },
        };
        let config = create_config(&spec);
        let inspect = ContainerInspectResponse {
            name: Some("/web".to_string()),
            config: Some(ContainerConfig {
                image: config.image,
                cmd: config.cmd,
                env: config.env,
                user: config.user,
                labels: config.labels,
                ..Default::default()
            }),
            host_config: config.host_config,
            ..Default::default()
        };
        assert_eq!(spec_from_inspect("web", inspect), spec);
    }
}
