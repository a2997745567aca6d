//! Map CRI sandbox and container configs to engine create configs.
//!
//! Engine container names follow the kubelet convention
//! `k8s_<container>_<pod>_<namespace>_<uid>_<attempt>`, with `POD` as the
//! container name of a sandbox's infra container.

use std::path::Path;

use dockershim_core::{Result, ShimError};

use crate::cri_api::{
    ContainerConfig, LinuxContainerSecurityContext, Mount, MountPropagation, PodSandboxConfig,
    PodSandboxMetadata, Protocol,
};
use crate::engine::{CreateContainerConfig, EnginePortBinding};
use crate::labels::{ContainerRecord, SandboxRecord};
use crate::translate::resources_to_engine;

const NAME_PREFIX: &str = "k8s";
const INFRA_CONTAINER_NAME: &str = "POD";
const NAME_DELIMITER: &str = "_";

/// Engine name of a sandbox's infra container.
pub fn infra_container_name(pod: &PodSandboxMetadata) -> String {
    [
        NAME_PREFIX,
        INFRA_CONTAINER_NAME,
        &pod.name,
        &pod.namespace,
        &pod.uid,
        &pod.attempt.to_string(),
    ]
    .join(NAME_DELIMITER)
}

/// Engine name of an application container.
pub fn container_name(container: &str, attempt: u32, pod: &PodSandboxMetadata) -> String {
    [
        NAME_PREFIX,
        container,
        &pod.name,
        &pod.namespace,
        &pod.uid,
        &attempt.to_string(),
    ]
    .join(NAME_DELIMITER)
}

fn protocol_name(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Tcp => "tcp",
        Protocol::Udp => "udp",
        Protocol::Sctp => "sctp",
    }
}

/// Engine bind spec `host:container[:opts]` for a CRI mount.
pub fn bind_spec(mount: &Mount) -> Result<String> {
    if mount.host_path.is_empty() || mount.container_path.is_empty() {
        return Err(ShimError::InvalidArgument(format!(
            "mount needs both host and container paths (host '{}', container '{}')",
            mount.host_path, mount.container_path
        )));
    }
    let mut opts = Vec::new();
    if mount.readonly {
        opts.push("ro");
    }
    if mount.selinux_relabel {
        opts.push("Z");
    }
    match mount.propagation {
        MountPropagation::PropagationPrivate => {}
        MountPropagation::PropagationHostToContainer => opts.push("rslave"),
        MountPropagation::PropagationBidirectional => opts.push("rshared"),
    }

    let mut spec = format!("{}:{}", mount.host_path, mount.container_path);
    if !opts.is_empty() {
        spec.push(':');
        spec.push_str(&opts.join(","));
    }
    Ok(spec)
}

fn user_from_security(sc: Option<&LinuxContainerSecurityContext>) -> String {
    match sc {
        Some(sc) if !sc.run_as_username.is_empty() => sc.run_as_username.clone(),
        Some(LinuxContainerSecurityContext {
            run_as_user: Some(uid),
            ..
        }) => uid.to_string(),
        _ => String::new(),
    }
}

/// Create config for a sandbox's infra container.
pub fn sandbox_create_config(
    config: &PodSandboxConfig,
    infra_image: &str,
) -> Result<CreateContainerConfig> {
    let metadata = config
        .metadata
        .clone()
        .ok_or_else(|| ShimError::InvalidArgument("sandbox config is missing metadata".to_string()))?;
    if metadata.name.is_empty() || metadata.namespace.is_empty() || metadata.uid.is_empty() {
        return Err(ShimError::InvalidArgument(
            "sandbox metadata needs a name, namespace and uid".to_string(),
        ));
    }

    let host_network = config.host_network();
    let record = SandboxRecord {
        metadata: metadata.clone(),
        labels: config.labels.clone(),
        annotations: config.annotations.clone(),
    };

    let mut create = CreateContainerConfig {
        name: infra_container_name(&metadata),
        image: infra_image.to_string(),
        labels: record.encode(),
        hostname: if host_network {
            String::new()
        } else {
            config.hostname.clone()
        },
        network_mode: if host_network { "host".to_string() } else { String::new() },
        cgroup_parent: config.cgroup_parent.clone(),
        ..Default::default()
    };

    if let Some(dns) = &config.dns_config {
        create.dns_servers = dns.servers.clone();
        create.dns_searches = dns.searches.clone();
        create.dns_options = dns.options.clone();
    }

    // Host-network sandboxes use the node's ports directly.
    if !host_network {
        create.port_bindings = config
            .port_mappings
            .iter()
            .filter(|pm| pm.host_port > 0)
            .map(|pm| EnginePortBinding {
                protocol: protocol_name(pm.protocol).to_string(),
                container_port: pm.container_port,
                host_port: pm.host_port,
                host_ip: pm.host_ip.clone(),
            })
            .collect();
    }

    Ok(create)
}

/// Resolve a container's log path against the sandbox log directory.
pub fn resolve_log_path(log_directory: Option<&str>, log_path: &str) -> String {
    match log_directory {
        Some(dir) if !dir.is_empty() && !log_path.is_empty() => {
            Path::new(dir).join(log_path).to_string_lossy().into_owned()
        }
        _ => log_path.to_string(),
    }
}

/// Create config for an application container joining `sandbox_id`.
pub fn container_create_config(
    sandbox_id: &str,
    pod: &PodSandboxMetadata,
    config: &ContainerConfig,
    log_directory: Option<&str>,
) -> Result<CreateContainerConfig> {
    let metadata = config.metadata.clone().ok_or_else(|| {
        ShimError::InvalidArgument("container config is missing metadata".to_string())
    })?;
    if metadata.name.is_empty() {
        return Err(ShimError::InvalidArgument(
            "container metadata needs a name".to_string(),
        ));
    }
    let image = config
        .image
        .as_ref()
        .map(|spec| spec.image.clone())
        .filter(|image| !image.is_empty())
        .ok_or_else(|| {
            ShimError::InvalidArgument(format!("container {} has no image", metadata.name))
        })?;

    let binds = config
        .mounts
        .iter()
        .map(bind_spec)
        .collect::<Result<Vec<_>>>()?;

    let record = ContainerRecord {
        metadata: metadata.clone(),
        sandbox_id: sandbox_id.to_string(),
        log_path: resolve_log_path(log_directory, &config.log_path),
        labels: config.labels.clone(),
        annotations: config.annotations.clone(),
    };

    let linux = config.linux.as_ref();
    let resources = linux.and_then(|l| l.resources.as_ref());
    let security = linux.and_then(|l| l.security_context.as_ref());

    Ok(CreateContainerConfig {
        name: container_name(&metadata.name, metadata.attempt, pod),
        image,
        entrypoint: config.command.clone(),
        cmd: config.args.clone(),
        env: config
            .envs
            .iter()
            .map(|kv| format!("{}={}", kv.key, kv.value))
            .collect(),
        working_dir: config.working_dir.clone(),
        labels: record.encode(),
        user: user_from_security(security),
        tty: config.tty,
        open_stdin: config.stdin,
        stdin_once: config.stdin_once,
        binds,
        network_mode: format!("container:{}", sandbox_id),
        resources: resources.map(resources_to_engine).unwrap_or_default(),
        oom_score_adj: resources.map(|r| r.oom_score_adj).unwrap_or(0),
        privileged: security.map_or(false, |s| s.privileged),
        readonly_rootfs: security.map_or(false, |s| s.readonly_rootfs),
        ..Default::default()
    })
}
