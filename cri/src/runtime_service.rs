//! CRI RuntimeService implementation.
//!
//! The engine is the only source of truth: no sandbox or container state is
//! cached here, every query re-inspects the engine and decodes the labels of
//! the engine containers involved. Pod sandbox verbs live in
//! [`crate::sandbox`], container verbs in [`crate::container`]; this module
//! holds the service itself plus runtime, exec/streaming and stats verbs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, info, warn};

use dockershim_core::exec::{ExecOutput, DEFAULT_EXEC_TIMEOUT};
use dockershim_core::{EntityKind, LogStream, Result, ShimConfig, ShimError};

use crate::cri_api::*;
use crate::engine::{EngineClient, EngineContainerDetails, EngineStats, ExecConfig};
use crate::image_service::ImageService;
use crate::labels::{entry_type, matches_selector, ContainerRecord, EntryType};
use crate::logs::LogManager;
use crate::network::NetworkPlugin;
use crate::streaming::{wait_exec_exit, StreamingRouter, StreamingSession};

pub const RUNTIME_NAME: &str = "docker";
pub const CRI_API_VERSION: &str = "0.1.0";

const RUNTIME_READY: &str = "RuntimeReady";
const NETWORK_READY: &str = "NetworkReady";

/// Docker-backed implementation of the CRI RuntimeService.
#[derive(Clone)]
pub struct RuntimeService {
    pub(crate) engine: Arc<dyn EngineClient>,
    pub(crate) images: ImageService,
    pub(crate) network: Arc<dyn NetworkPlugin>,
    pub(crate) streaming: StreamingRouter,
    pub(crate) logs: LogManager,
    pub(crate) pod_infra_image: String,
    pub(crate) sandbox_stop_grace: Duration,
}

impl RuntimeService {
    pub fn new(
        engine: Arc<dyn EngineClient>,
        images: ImageService,
        network: Arc<dyn NetworkPlugin>,
        streaming: StreamingRouter,
        config: &ShimConfig,
    ) -> Self {
        Self {
            logs: LogManager::new(engine.clone()),
            engine,
            images,
            network,
            streaming,
            pod_infra_image: config.pod_infra_image.clone(),
            sandbox_stop_grace: config.sandbox_stop_grace(),
        }
    }

    /// Log retrieval for containers managed by this service.
    pub fn logs(&self) -> &LogManager {
        &self.logs
    }

    pub fn streaming(&self) -> &StreamingRouter {
        &self.streaming
    }

    // ── Runtime ──────────────────────────────────────────────────────

    pub async fn version(&self, _req: VersionRequest) -> Result<VersionResponse> {
        let version = self
            .engine
            .version()
            .await
            .map_err(|e| e.classify(EntityKind::Engine, "version"))?;
        Ok(VersionResponse {
            version: CRI_API_VERSION.to_string(),
            runtime_name: RUNTIME_NAME.to_string(),
            runtime_version: version.version,
            runtime_api_version: version.api_version,
        })
    }

    /// Runtime conditions. An unreachable engine is reported as a false
    /// condition rather than an error.
    pub async fn status(&self, req: StatusRequest) -> Result<StatusResponse> {
        let runtime = match self.engine.version().await {
            Ok(_) => RuntimeCondition {
                condition_type: RUNTIME_READY.to_string(),
                status: true,
                ..Default::default()
            },
            Err(e) => {
                warn!(error = %e, "Engine is not responding");
                RuntimeCondition {
                    condition_type: RUNTIME_READY.to_string(),
                    status: false,
                    reason: "DockerDaemonNotReady".to_string(),
                    message: format!("docker: failed to get docker version: {}", e),
                }
            }
        };
        let network = RuntimeCondition {
            condition_type: NETWORK_READY.to_string(),
            status: true,
            ..Default::default()
        };

        let mut info = HashMap::new();
        if req.verbose {
            info.insert("shimVersion".to_string(), dockershim_core::VERSION.to_string());
            info.insert("networkPlugin".to_string(), self.network.name().to_string());
        }
        Ok(StatusResponse {
            status: Some(RuntimeStatus {
                conditions: vec![runtime, network],
            }),
            info,
        })
    }

    pub async fn update_runtime_config(
        &self,
        req: UpdateRuntimeConfigRequest,
    ) -> Result<UpdateRuntimeConfigResponse> {
        if let Some(cidr) = req
            .runtime_config
            .and_then(|c| c.network_config)
            .map(|n| n.pod_cidr)
            .filter(|cidr| !cidr.is_empty())
        {
            info!(pod_cidr = %cidr, "CRI UpdateRuntimeConfig");
        }
        Ok(UpdateRuntimeConfigResponse {})
    }

    // ── Exec / streaming ─────────────────────────────────────────────

    /// Run a command to completion and capture its output.
    pub async fn exec_sync(&self, req: ExecSyncRequest) -> Result<ExecSyncResponse> {
        if req.cmd.is_empty() {
            return Err(ShimError::InvalidArgument("exec command must not be empty".to_string()));
        }
        let id = req.container_id.as_str();
        debug!(container_id = %id, cmd = ?req.cmd, "CRI ExecSync");
        self.running_container(id).await?;

        let timeout = if req.timeout > 0 {
            Duration::from_secs(req.timeout as u64)
        } else {
            DEFAULT_EXEC_TIMEOUT
        };

        let exec_id = self
            .engine
            .create_exec(
                id,
                ExecConfig {
                    cmd: req.cmd.clone(),
                    attach_stdin: false,
                    attach_stdout: true,
                    attach_stderr: true,
                    tty: false,
                },
            )
            .await
            .map_err(|e| e.classify(EntityKind::Container, id))?;
        let mut attach = self
            .engine
            .start_exec(&exec_id)
            .await
            .map_err(|e| e.classify(EntityKind::Exec, &exec_id))?;

        let mut output = ExecOutput::default();
        let collect = async {
            while let Some(chunk) = attach.output.next().await {
                let chunk = chunk.map_err(|e| e.classify(EntityKind::Exec, &exec_id))?;
                match chunk.stream {
                    LogStream::Stdout => ExecOutput::capture(&mut output.stdout, &chunk.data),
                    LogStream::Stderr => ExecOutput::capture(&mut output.stderr, &chunk.data),
                }
            }
            Ok::<_, ShimError>(())
        };
        match tokio::time::timeout(timeout, collect).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(container_id = %id, exec_id = %exec_id, ?timeout, "ExecSync timed out");
                return Err(ShimError::Unavailable(format!(
                    "command {:?} in container {} timed out after {:?}",
                    req.cmd, id, timeout
                )));
            }
        }

        let exit_code = wait_exec_exit(self.engine.as_ref(), &exec_id)
            .await
            .map_err(|e| e.classify(EntityKind::Exec, &exec_id))?
            .ok_or_else(|| {
                ShimError::internal(EntityKind::Exec, &exec_id, "exec output closed but process still running")
            })?;
        output.exit_code = exit_code as i32;

        Ok(ExecSyncResponse {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
        })
    }

    pub async fn exec(&self, req: ExecRequest) -> Result<ExecResponse> {
        info!(container_id = %req.container_id, cmd = ?req.cmd, "CRI Exec");
        self.running_container(&req.container_id).await?;
        let url = self.streaming.issue(StreamingSession::exec(
            &req.container_id,
            req.cmd,
            req.tty,
            req.stdin,
            req.stdout,
            req.stderr,
        ))?;
        Ok(ExecResponse { url })
    }

    pub async fn attach(&self, req: AttachRequest) -> Result<AttachResponse> {
        info!(container_id = %req.container_id, "CRI Attach");
        self.running_container(&req.container_id).await?;
        let url = self.streaming.issue(StreamingSession::attach(
            &req.container_id,
            req.tty,
            req.stdin,
            req.stdout,
            req.stderr,
        ))?;
        Ok(AttachResponse { url })
    }

    pub async fn port_forward(&self, req: PortForwardRequest) -> Result<PortForwardResponse> {
        info!(sandbox_id = %req.pod_sandbox_id, ports = ?req.port, "CRI PortForward");
        let details = self.infra_container(&req.pod_sandbox_id).await?;
        if !details.state.running {
            return Err(ShimError::conflict(
                EntityKind::Sandbox,
                &req.pod_sandbox_id,
                "sandbox is not ready",
            ));
        }
        let url = self
            .streaming
            .issue(StreamingSession::port_forward(&details.id, req.port))?;
        Ok(PortForwardResponse { url })
    }

    // ── Stats ────────────────────────────────────────────────────────

    pub async fn container_stats(&self, req: ContainerStatsRequest) -> Result<ContainerStatsResponse> {
        let id = req.container_id.as_str();
        let details = self
            .engine
            .inspect_container(id)
            .await
            .map_err(|e| e.classify(EntityKind::Container, id))?;
        let stats = self
            .engine
            .stats(&details.id)
            .await
            .map_err(|e| e.classify(EntityKind::Container, id))?;
        Ok(ContainerStatsResponse {
            stats: Some(container_stats(&details.id, &details.labels, &stats)),
        })
    }

    /// Stats of running CRI containers. Containers that disappear or fail
    /// to report in the middle of the listing are skipped.
    pub async fn list_container_stats(
        &self,
        req: ListContainerStatsRequest,
    ) -> Result<ListContainerStatsResponse> {
        let filter = req.filter.unwrap_or_default();
        let containers = self
            .engine
            .list_containers(false)
            .await
            .map_err(|e| e.classify(EntityKind::Container, "list"))?;

        let mut result = Vec::new();
        for c in containers {
            if entry_type(&c.labels) != Some(EntryType::Container) {
                continue;
            }
            if !filter.id.is_empty() && !c.id.starts_with(&filter.id) {
                continue;
            }
            let record = ContainerRecord::decode(&c.labels).ok();
            if !filter.pod_sandbox_id.is_empty()
                && record.as_ref().map(|r| r.sandbox_id.as_str()) != Some(filter.pod_sandbox_id.as_str())
            {
                continue;
            }
            if !filter.label_selector.is_empty()
                && !record
                    .as_ref()
                    .map_or(false, |r| matches_selector(&r.labels, &filter.label_selector))
            {
                continue;
            }
            match self.engine.stats(&c.id).await {
                Ok(stats) => result.push(container_stats(&c.id, &c.labels, &stats)),
                Err(e) => warn!(container_id = %c.id, error = %e, "Skipping container stats"),
            }
        }
        Ok(ListContainerStatsResponse { stats: result })
    }

    // ── Shared lookups ───────────────────────────────────────────────

    /// Inspect a container and require it to be running.
    pub(crate) async fn running_container(&self, id: &str) -> Result<EngineContainerDetails> {
        let details = self
            .engine
            .inspect_container(id)
            .await
            .map_err(|e| e.classify(EntityKind::Container, id))?;
        if !details.state.running {
            return Err(ShimError::conflict(
                EntityKind::Container,
                id,
                "container is not running",
            ));
        }
        Ok(details)
    }

    /// Inspect a sandbox's infra container. Anything that is not a sandbox
    /// is reported as a missing sandbox.
    pub(crate) async fn infra_container(&self, sandbox_id: &str) -> Result<EngineContainerDetails> {
        let details = self
            .engine
            .inspect_container(sandbox_id)
            .await
            .map_err(|e| e.classify(EntityKind::Sandbox, sandbox_id))?;
        if entry_type(&details.labels) != Some(EntryType::Sandbox) {
            return Err(ShimError::not_found(
                EntityKind::Sandbox,
                sandbox_id,
                "not a pod sandbox",
            ));
        }
        Ok(details)
    }
}

fn container_stats(id: &str, labels: &HashMap<String, String>, stats: &EngineStats) -> ContainerStats {
    let timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);
    let attributes = match ContainerRecord::decode(labels) {
        Ok(record) => ContainerAttributes {
            id: id.to_string(),
            metadata: Some(record.metadata),
            labels: record.labels,
            annotations: record.annotations,
        },
        Err(_) => ContainerAttributes {
            id: id.to_string(),
            ..Default::default()
        },
    };
    ContainerStats {
        attributes: Some(attributes),
        cpu: Some(CpuUsage {
            timestamp,
            usage_core_nano_seconds: Some(stats.cpu_total_usage),
        }),
        memory: Some(MemoryUsage {
            timestamp,
            working_set_bytes: Some(stats.memory_working_set),
        }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::{EngineError, FakeEngine};
    use crate::network::RecordingNetworkPlugin;

    pub(crate) struct Harness {
        pub engine: FakeEngine,
        pub network: RecordingNetworkPlugin,
        pub service: RuntimeService,
    }

    pub(crate) fn harness() -> Harness {
        let engine = FakeEngine::new();
        let network = RecordingNetworkPlugin::new();
        let config = ShimConfig::default();
        let shared: Arc<dyn EngineClient> = Arc::new(engine.clone());
        let images = ImageService::new(shared.clone(), config.image_pull_progress_deadline());
        let streaming = StreamingRouter::new(shared.clone(), &config.streaming);
        let service = RuntimeService::new(
            shared,
            images,
            Arc::new(network.clone()),
            streaming,
            &config,
        );
        Harness {
            engine,
            network,
            service,
        }
    }

    pub(crate) fn sandbox_config(name: &str) -> PodSandboxConfig {
        PodSandboxConfig {
            metadata: Some(PodSandboxMetadata {
                name: name.to_string(),
                uid: format!("uid-{}", name),
                namespace: "default".to_string(),
                attempt: 0,
            }),
            hostname: name.to_string(),
            log_directory: format!("/var/log/pods/default_{}", name),
            labels: HashMap::from([("app".to_string(), name.to_string())]),
            ..Default::default()
        }
    }

    pub(crate) fn container_config(name: &str, image: &str) -> ContainerConfig {
        ContainerConfig {
            metadata: Some(ContainerMetadata {
                name: name.to_string(),
                attempt: 0,
            }),
            image: Some(ImageSpec::new(image)),
            log_path: format!("{}/0.log", name),
            stdin: true,
            labels: HashMap::from([("tier".to_string(), "web".to_string())]),
            ..Default::default()
        }
    }

    /// Sandbox plus one started container in it.
    pub(crate) async fn running_pod(h: &Harness, name: &str) -> (String, String) {
        h.engine.add_image("busybox:latest", 1024);
        let sandbox_id = h
            .service
            .run_pod_sandbox(RunPodSandboxRequest {
                config: Some(sandbox_config(name)),
                ..Default::default()
            })
            .await
            .unwrap()
            .pod_sandbox_id;
        let container_id = h
            .service
            .create_container(CreateContainerRequest {
                pod_sandbox_id: sandbox_id.clone(),
                config: Some(container_config("app", "busybox:latest")),
                sandbox_config: Some(sandbox_config(name)),
            })
            .await
            .unwrap()
            .container_id;
        h.service
            .start_container(StartContainerRequest {
                container_id: container_id.clone(),
            })
            .await
            .unwrap();
        (sandbox_id, container_id)
    }

    #[tokio::test]
    async fn test_version() {
        let h = harness();
        let resp = h.service.version(VersionRequest::default()).await.unwrap();
        assert_eq!(resp.runtime_name, "docker");
        assert_eq!(resp.runtime_version, "24.0.7");
        assert_eq!(resp.runtime_api_version, "1.43");
    }

    #[tokio::test]
    async fn test_status_reports_engine_down() {
        let h = harness();
        let resp = h.service.status(StatusRequest::default()).await.unwrap();
        assert!(resp.status.as_ref().unwrap().conditions.iter().all(|c| c.status));

        h.engine
            .inject_error("version", EngineError::Transport("connection refused".to_string()));
        let resp = h.service.status(StatusRequest { verbose: true }).await.unwrap();
        let conditions = resp.status.unwrap().conditions;
        let runtime = conditions.iter().find(|c| c.condition_type == RUNTIME_READY).unwrap();
        assert!(!runtime.status);
        assert_eq!(runtime.reason, "DockerDaemonNotReady");
        assert_eq!(resp.info["networkPlugin"], "recording");
    }

    #[tokio::test]
    async fn test_exec_sync_captures_output() {
        let h = harness();
        let (_, id) = running_pod(&h, "web").await;
        let resp = h
            .service
            .exec_sync(ExecSyncRequest {
                container_id: id,
                cmd: vec!["sh".into(), "-c".into(), "echo out; missing".into()],
                timeout: 0,
            })
            .await
            .unwrap();
        assert_eq!(resp.stdout, b"out\n");
        assert_eq!(resp.stderr, b"sh: missing: not found\n");
        assert_eq!(resp.exit_code, 127);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exec_sync_timeout() {
        let h = harness();
        let (_, id) = running_pod(&h, "web").await;
        let err = h
            .service
            .exec_sync(ExecSyncRequest {
                container_id: id,
                cmd: vec!["sleep".into(), "60".into()],
                timeout: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ShimError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_exec_requires_running_container() {
        let h = harness();
        let (_, id) = running_pod(&h, "web").await;
        h.engine.exit_container(&id, 1, false);

        let err = h
            .service
            .exec(ExecRequest {
                container_id: id.clone(),
                cmd: vec!["sh".into()],
                stdin: true,
                stdout: true,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ShimError::Conflict { .. }));
        assert_eq!(h.service.streaming().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_exec_attach_issue_tokens() {
        let h = harness();
        let (sandbox_id, id) = running_pod(&h, "web").await;

        let exec = h
            .service
            .exec(ExecRequest {
                container_id: id.clone(),
                cmd: vec!["sh".into()],
                tty: true,
                stdin: true,
                stdout: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(exec.url.contains("/exec/"));

        let attach = h
            .service
            .attach(AttachRequest {
                container_id: id,
                stdin: true,
                stdout: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(attach.url.contains("/attach/"));

        let forward = h
            .service
            .port_forward(PortForwardRequest {
                pod_sandbox_id: sandbox_id,
                port: vec![80],
            })
            .await
            .unwrap();
        assert!(forward.url.contains("/portforward/"));
        assert_eq!(h.service.streaming().pending_count(), 3);
    }

    #[tokio::test]
    async fn test_port_forward_unknown_sandbox() {
        let h = harness();
        let err = h
            .service
            .port_forward(PortForwardRequest {
                pod_sandbox_id: "missing".to_string(),
                port: vec![80],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ShimError::NotFound { kind: EntityKind::Sandbox, .. }));
    }

    #[tokio::test]
    async fn test_container_stats() {
        let h = harness();
        let (sandbox_id, id) = running_pod(&h, "web").await;
        h.engine.set_stats(
            &id,
            EngineStats {
                cpu_total_usage: 5_000,
                memory_working_set: 1 << 20,
            },
        );

        let stats = h
            .service
            .container_stats(ContainerStatsRequest {
                container_id: id.clone(),
            })
            .await
            .unwrap()
            .stats
            .unwrap();
        assert_eq!(stats.cpu.unwrap().usage_core_nano_seconds, Some(5_000));
        assert_eq!(stats.memory.unwrap().working_set_bytes, Some(1 << 20));
        assert_eq!(stats.attributes.unwrap().metadata.unwrap().name, "app");

        let listed = h
            .service
            .list_container_stats(ListContainerStatsRequest {
                filter: Some(ContainerStatsFilter {
                    pod_sandbox_id: sandbox_id,
                    ..Default::default()
                }),
            })
            .await
            .unwrap();
        // The infra container is not a CRI container.
        assert_eq!(listed.stats.len(), 1);

        let none = h
            .service
            .list_container_stats(ListContainerStatsRequest {
                filter: Some(ContainerStatsFilter {
                    label_selector: HashMap::from([("tier".to_string(), "db".to_string())]),
                    ..Default::default()
                }),
            })
            .await
            .unwrap();
        assert!(none.stats.is_empty());
    }
}
