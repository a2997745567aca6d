//! Engine records to CRI records.
//!
//! Every function here is pure and total. Entries whose labels cannot be
//! decoded are reported in a degraded form (state unknown / not ready, no
//! metadata) instead of failing, so one damaged entry never spoils a listing.

use chrono::DateTime;

use crate::cri_api::{
    Container, ContainerState, ContainerStatus, Image, ImageSpec, LinuxContainerResources, Mount,
    PodSandbox, PodSandboxNetworkStatus, PodSandboxState, PodSandboxStatus,
};
use crate::engine::{
    EngineContainer, EngineContainerDetails, EngineImage, EngineResources, STATUS_CREATED_PREFIX,
    STATUS_EXITED_PREFIX, STATUS_RUNNING_PREFIX,
};
use crate::labels::{entry_type, ContainerRecord, EntryType, SandboxRecord};

pub const REASON_OOM_KILLED: &str = "OOMKilled";
pub const REASON_COMPLETED: &str = "Completed";
pub const REASON_ERROR: &str = "Error";
pub const REASON_CREATED: &str = "Created";
pub const REASON_UNKNOWN: &str = "Unknown";

const NONE_TAG: &str = "<none>:<none>";
const NONE_DIGEST: &str = "<none>@<none>";

/// RFC 3339 engine time to Unix nanoseconds. The engine's zero time and
/// anything unparseable map to 0.
pub fn engine_time_to_nanos(raw: &str) -> i64 {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(t) if t.timestamp() > 0 => t.timestamp_nanos_opt().unwrap_or(0),
        _ => 0,
    }
}

fn seconds_to_nanos(secs: i64) -> i64 {
    secs.saturating_mul(1_000_000_000)
}

/// Classify a listing's human status string.
pub fn state_from_summary_status(status: &str) -> ContainerState {
    if status.starts_with(STATUS_RUNNING_PREFIX) {
        ContainerState::ContainerRunning
    } else if status.starts_with(STATUS_CREATED_PREFIX) {
        ContainerState::ContainerCreated
    } else if status.starts_with(STATUS_EXITED_PREFIX) {
        ContainerState::ContainerExited
    } else {
        ContainerState::ContainerUnknown
    }
}

/// Lifecycle state of an inspected container.
pub fn container_state(details: &EngineContainerDetails) -> ContainerState {
    state_from_details(details).0
}

/// State and reason from a full inspection.
fn state_from_details(details: &EngineContainerDetails) -> (ContainerState, &'static str) {
    let state = &details.state;
    if state.running {
        (ContainerState::ContainerRunning, "")
    } else if engine_time_to_nanos(&state.finished_at) != 0 || state.status == "exited" {
        let reason = if state.oom_killed {
            REASON_OOM_KILLED
        } else if state.exit_code == 0 {
            REASON_COMPLETED
        } else {
            REASON_ERROR
        };
        (ContainerState::ContainerExited, reason)
    } else if state.status == "created" {
        (ContainerState::ContainerCreated, REASON_CREATED)
    } else {
        (ContainerState::ContainerUnknown, REASON_UNKNOWN)
    }
}

fn mounts_from_details(details: &EngineContainerDetails) -> Vec<Mount> {
    details
        .mounts
        .iter()
        .map(|m| Mount {
            container_path: m.destination.clone(),
            host_path: m.source.clone(),
            readonly: m.read_only,
            ..Default::default()
        })
        .collect()
}

/// Full container status from an inspection.
pub fn container_status(details: &EngineContainerDetails) -> ContainerStatus {
    let mut status = ContainerStatus {
        id: details.id.clone(),
        created_at: engine_time_to_nanos(&details.created),
        started_at: engine_time_to_nanos(&details.state.started_at),
        finished_at: engine_time_to_nanos(&details.state.finished_at),
        exit_code: details.state.exit_code as i32,
        image: Some(ImageSpec::new(details.image.clone())),
        image_ref: details.image_id.clone(),
        mounts: mounts_from_details(details),
        ..Default::default()
    };

    match ContainerRecord::decode(&details.labels) {
        Ok(record) => {
            let (state, reason) = state_from_details(details);
            status.metadata = Some(record.metadata);
            status.state = state;
            status.reason = reason.to_string();
            status.message = details.state.error.clone();
            status.labels = record.labels;
            status.annotations = record.annotations;
            status.log_path = record.log_path;
        }
        Err(e) => {
            status.state = ContainerState::ContainerUnknown;
            status.reason = REASON_UNKNOWN.to_string();
            status.message = format!("cannot decode container labels: {}", e);
        }
    }
    status
}

/// CRI container from a listing entry. `None` when the entry is not a CRI
/// container at all (a sandbox's infra container or a foreign container).
pub fn container_from_summary(c: &EngineContainer) -> Option<Container> {
    if entry_type(&c.labels) != Some(EntryType::Container) {
        return None;
    }
    let mut container = Container {
        id: c.id.clone(),
        image: Some(ImageSpec::new(c.image.clone())),
        image_ref: c.image_id.clone(),
        created_at: seconds_to_nanos(c.created),
        ..Default::default()
    };
    match ContainerRecord::decode(&c.labels) {
        Ok(record) => {
            container.pod_sandbox_id = record.sandbox_id;
            container.metadata = Some(record.metadata);
            container.state = state_from_summary_status(&c.status);
            container.labels = record.labels;
            container.annotations = record.annotations;
        }
        Err(e) => {
            tracing::debug!(container_id = %c.id, error = %e, "Undecodable container labels");
            container.state = ContainerState::ContainerUnknown;
        }
    }
    Some(container)
}

/// CRI sandbox from an infra container listing entry.
pub fn sandbox_from_summary(c: &EngineContainer) -> Option<PodSandbox> {
    if entry_type(&c.labels) != Some(EntryType::Sandbox) {
        return None;
    }
    let mut sandbox = PodSandbox {
        id: c.id.clone(),
        created_at: seconds_to_nanos(c.created),
        state: PodSandboxState::SandboxNotready,
        ..Default::default()
    };
    match SandboxRecord::decode(&c.labels) {
        Ok(record) => {
            if state_from_summary_status(&c.status) == ContainerState::ContainerRunning {
                sandbox.state = PodSandboxState::SandboxReady;
            }
            sandbox.metadata = Some(record.metadata);
            sandbox.labels = record.labels;
            sandbox.annotations = record.annotations;
        }
        Err(e) => {
            tracing::debug!(sandbox_id = %c.id, error = %e, "Undecodable sandbox labels");
        }
    }
    Some(sandbox)
}

/// Sandbox status from an infra container inspection.
pub fn sandbox_status(details: &EngineContainerDetails) -> PodSandboxStatus {
    let mut status = PodSandboxStatus {
        id: details.id.clone(),
        created_at: engine_time_to_nanos(&details.created),
        state: PodSandboxState::SandboxNotready,
        ..Default::default()
    };
    if let Ok(record) = SandboxRecord::decode(&details.labels) {
        if details.state.running {
            status.state = PodSandboxState::SandboxReady;
        }
        status.metadata = Some(record.metadata);
        status.labels = record.labels;
        status.annotations = record.annotations;
    }
    if !details.ip_address.is_empty() {
        status.network = Some(PodSandboxNetworkStatus {
            ip: details.ip_address.clone(),
            additional_ips: Vec::new(),
        });
    }
    status
}

/// Split the engine's image user into a numeric uid or a user name.
fn split_image_user(user: &str) -> (Option<i64>, String) {
    let name = user.split(':').next().unwrap_or("");
    if name.is_empty() {
        return (None, String::new());
    }
    match name.parse::<i64>() {
        Ok(uid) => (Some(uid), String::new()),
        Err(_) => (None, name.to_string()),
    }
}

pub fn image_from_engine(img: &EngineImage) -> Image {
    let (uid, username) = split_image_user(&img.user);
    Image {
        id: img.id.clone(),
        repo_tags: img
            .repo_tags
            .iter()
            .filter(|t| t.as_str() != NONE_TAG)
            .cloned()
            .collect(),
        repo_digests: img
            .repo_digests
            .iter()
            .filter(|d| d.as_str() != NONE_DIGEST)
            .cloned()
            .collect(),
        size: img.size.max(0) as u64,
        uid,
        username,
        spec: Some(ImageSpec::new(img.id.clone())),
        pinned: false,
    }
}

pub fn resources_to_engine(r: &LinuxContainerResources) -> EngineResources {
    EngineResources {
        cpu_period: r.cpu_period,
        cpu_quota: r.cpu_quota,
        cpu_shares: r.cpu_shares,
        memory: r.memory_limit_in_bytes,
        cpuset_cpus: r.cpuset_cpus.clone(),
        cpuset_mems: r.cpuset_mems.clone(),
    }
}
