//! Docker-backed engine client over bollard.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::Docker;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use dockershim_core::config::parse_api_version;
use dockershim_core::exec::TerminalSize;
use dockershim_core::{Result, ShimError};

use super::{
    AttachConfig, CreateContainerConfig, EngineAttach, EngineClient, EngineContainer,
    EngineContainerDetails, EngineContainerState, EngineError, EngineImage, EngineImageLayer,
    EngineInfo, EngineMount, EngineResources, EngineResult, EngineStats, EngineVersion,
    ExecConfig, ExecInspect, LogRequest, OutputChunk, OutputStream, PullProgress, PullStream,
    RegistryCredentials,
};

/// Buffered events between an engine stream task and its consumer.
const STREAM_BUFFER: usize = 64;

/// Reject engines older than the minimum supported API version.
pub fn check_api_version(actual: &str, minimum: &str) -> Result<()> {
    let have = parse_api_version(actual)?;
    let need = parse_api_version(minimum)?;
    if have < need {
        return Err(ShimError::Unavailable(format!(
            "engine API version {} is older than the minimum supported {}",
            actual, minimum
        )));
    }
    Ok(())
}

/// Memory usage minus the inactive page cache. cgroup v2 reports
/// `inactive_file`, v1 `total_inactive_file`.
fn memory_working_set(usage: u64, stats: Option<&HashMap<String, u64>>) -> u64 {
    let inactive = stats
        .and_then(|stats| {
            stats
                .get("inactive_file")
                .or_else(|| stats.get("total_inactive_file"))
        })
        .copied()
        .unwrap_or(0);
    usage.saturating_sub(inactive)
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn non_empty_vec(values: Vec<String>) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

fn non_zero(value: i64) -> Option<i64> {
    if value == 0 {
        None
    } else {
        Some(value)
    }
}

/// Convert a bollard output stream into engine output chunks.
///
/// Raw TTY output arrives as console frames and is reported on stdout.
fn output_stream<S>(output: S) -> OutputStream
where
    S: Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>> + Send + 'static,
{
    output
        .filter_map(|item| {
            futures::future::ready(match item {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    Some(Ok(OutputChunk::stdout(message)))
                }
                Ok(LogOutput::StdErr { message }) => Some(Ok(OutputChunk::stderr(message))),
                Ok(LogOutput::StdIn { .. }) => None,
                Err(e) => Some(Err(e.into())),
            })
        })
        .boxed()
}

/// Engine client for a Docker daemon.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
    timeout: Duration,
}

impl DockerEngine {
    /// Connect to the engine and negotiate the API version.
    ///
    /// `endpoint` accepts `unix://` sockets and `tcp://`/`http://` addresses;
    /// `None` falls back to `DOCKER_HOST` or the local socket.
    pub async fn connect(endpoint: Option<&str>, timeout: Duration) -> EngineResult<Self> {
        let secs = timeout.as_secs();
        let docker = match endpoint {
            None => Docker::connect_with_local_defaults(),
            Some(ep) if ep.starts_with("unix://") => {
                Docker::connect_with_socket(ep, secs, bollard::API_DEFAULT_VERSION)
            }
            Some(ep) if ep.starts_with("tcp://") || ep.starts_with("http://") => {
                Docker::connect_with_http(ep, secs, bollard::API_DEFAULT_VERSION)
            }
            Some(ep) => {
                return Err(EngineError::Transport(format!(
                    "unsupported engine endpoint: {}",
                    ep
                )))
            }
        }?;

        let docker = match tokio::time::timeout(timeout, docker.negotiate_version()).await {
            Ok(result) => result?,
            Err(_) => return Err(EngineError::DeadlineExceeded(timeout)),
        };
        info!(endpoint = endpoint.unwrap_or("local defaults"), "Connected to engine");
        Ok(Self { docker, timeout })
    }

    async fn bounded<T, F>(&self, fut: F) -> EngineResult<T>
    where
        F: Future<Output = std::result::Result<T, bollard::errors::Error>>,
    {
        self.bounded_for(self.timeout, fut).await
    }

    async fn bounded_for<T, F>(&self, limit: Duration, fut: F) -> EngineResult<T>
    where
        F: Future<Output = std::result::Result<T, bollard::errors::Error>>,
    {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(EngineError::from),
            Err(_) => Err(EngineError::DeadlineExceeded(limit)),
        }
    }

    fn attach_from(
        output: impl Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>>
            + Send
            + 'static,
        input: std::pin::Pin<Box<dyn tokio::io::AsyncWrite + Send>>,
    ) -> EngineAttach {
        EngineAttach {
            output: output_stream(output),
            input,
        }
    }
}

#[async_trait]
impl EngineClient for DockerEngine {
    async fn list_containers(&self, all: bool) -> EngineResult<Vec<EngineContainer>> {
        let containers = self
            .bounded(
                self.docker
                    .list_containers(Some(bollard::container::ListContainersOptions::<String> {
                        all,
                        ..Default::default()
                    })),
            )
            .await?;

        Ok(containers
            .into_iter()
            .map(|c| EngineContainer {
                id: c.id.unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                image_id: c.image_id.unwrap_or_default(),
                created: c.created.unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
                status: c.status.unwrap_or_default(),
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<EngineContainerDetails> {
        let resp = self
            .bounded(
                self.docker
                    .inspect_container(id, None::<bollard::query_parameters::InspectContainerOptions>),
            )
            .await?;

        let state = resp.state.unwrap_or_default();
        let config = resp.config.unwrap_or_default();
        let network_mode = resp
            .host_config
            .and_then(|hc| hc.network_mode)
            .unwrap_or_default();
        let ip_address = resp
            .network_settings
            .and_then(|ns| ns.networks)
            .and_then(|networks| {
                networks
                    .into_values()
                    .find_map(|ep| ep.ip_address.filter(|ip| !ip.is_empty()))
            })
            .unwrap_or_default();

        Ok(EngineContainerDetails {
            id: resp
                .id
                .ok_or_else(|| EngineError::Malformed(format!("container {} has no id", id)))?,
            name: resp.name.unwrap_or_default(),
            image_id: resp.image.unwrap_or_default(),
            image: config.image.unwrap_or_default(),
            created: resp.created.unwrap_or_default(),
            labels: config.labels.unwrap_or_default(),
            state: EngineContainerState {
                status: state.status.map(|s| s.to_string()).unwrap_or_default(),
                running: state.running.unwrap_or(false),
                exit_code: state.exit_code.unwrap_or(0),
                oom_killed: state.oom_killed.unwrap_or(false),
                error: state.error.unwrap_or_default(),
                started_at: state.started_at.unwrap_or_default(),
                finished_at: state.finished_at.unwrap_or_default(),
            },
            mounts: resp
                .mounts
                .unwrap_or_default()
                .into_iter()
                .map(|m| EngineMount {
                    source: m.source.unwrap_or_default(),
                    destination: m.destination.unwrap_or_default(),
                    read_only: !m.rw.unwrap_or(true),
                })
                .collect(),
            ip_address,
            network_mode,
            tty: config.tty.unwrap_or(false),
        })
    }

    async fn create_container(&self, config: CreateContainerConfig) -> EngineResult<String> {
        let mut port_bindings: HashMap<String, Option<Vec<bollard::models::PortBinding>>> =
            HashMap::new();
        for pb in &config.port_bindings {
            port_bindings
                .entry(format!("{}/{}", pb.container_port, pb.protocol))
                .or_insert_with(|| Some(Vec::new()))
                .get_or_insert_with(Vec::new)
                .push(bollard::models::PortBinding {
                    host_ip: non_empty(pb.host_ip.clone()),
                    host_port: Some(pb.host_port.to_string()),
                });
        }

        let resources = config.resources;
        let host_config = bollard::models::HostConfig {
            binds: non_empty_vec(config.binds),
            network_mode: non_empty(config.network_mode),
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            dns: non_empty_vec(config.dns_servers),
            dns_search: non_empty_vec(config.dns_searches),
            dns_options: non_empty_vec(config.dns_options),
            cpu_period: non_zero(resources.cpu_period),
            cpu_quota: non_zero(resources.cpu_quota),
            cpu_shares: non_zero(resources.cpu_shares),
            memory: non_zero(resources.memory),
            cpuset_cpus: non_empty(resources.cpuset_cpus),
            cpuset_mems: non_empty(resources.cpuset_mems),
            oom_score_adj: non_zero(config.oom_score_adj),
            privileged: Some(config.privileged),
            readonly_rootfs: Some(config.readonly_rootfs),
            cgroup_parent: non_empty(config.cgroup_parent),
            ..Default::default()
        };

        let body = bollard::container::Config {
            image: Some(config.image),
            entrypoint: non_empty_vec(config.entrypoint),
            cmd: non_empty_vec(config.cmd),
            env: non_empty_vec(config.env),
            working_dir: non_empty(config.working_dir),
            labels: Some(config.labels),
            hostname: non_empty(config.hostname),
            user: non_empty(config.user),
            tty: Some(config.tty),
            open_stdin: Some(config.open_stdin),
            stdin_once: Some(config.stdin_once),
            attach_stdin: Some(config.open_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        debug!(name = %config.name, "Creating engine container");
        let options = bollard::container::CreateContainerOptions {
            name: config.name.as_str(),
            ..Default::default()
        };
        let response = self
            .bounded(self.docker.create_container(Some(options), body))
            .await?;
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        self.bounded(
            self.docker
                .start_container(id, None::<bollard::container::StartContainerOptions<String>>),
        )
        .await
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> EngineResult<()> {
        // The request outlives the grace period by the normal request bound.
        let limit = self.timeout + grace;
        self.bounded_for(
            limit,
            self.docker.stop_container(
                id,
                Some(bollard::container::StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            ),
        )
        .await
    }

    async fn update_container(&self, id: &str, resources: EngineResources) -> EngineResult<()> {
        let options = bollard::container::UpdateContainerOptions::<String> {
            cpu_period: non_zero(resources.cpu_period).map(|v| v as _),
            cpu_quota: non_zero(resources.cpu_quota).map(|v| v as _),
            cpu_shares: non_zero(resources.cpu_shares).map(|v| v as _),
            memory: non_zero(resources.memory).map(|v| v as _),
            cpuset_cpus: non_empty(resources.cpuset_cpus),
            cpuset_mems: non_empty(resources.cpuset_mems),
            ..Default::default()
        };
        self.bounded(self.docker.update_container(id, options)).await
    }

    async fn remove_container(&self, id: &str, force: bool) -> EngineResult<()> {
        self.bounded(self.docker.remove_container(
            id,
            Some(bollard::container::RemoveContainerOptions {
                force,
                v: true,
                ..Default::default()
            }),
        ))
        .await
    }

    async fn inspect_image(&self, reference: &str) -> EngineResult<EngineImage> {
        let img = self.bounded(self.docker.inspect_image(reference)).await?;
        Ok(EngineImage {
            id: img
                .id
                .ok_or_else(|| EngineError::Malformed(format!("image {} has no id", reference)))?,
            repo_tags: img.repo_tags.unwrap_or_default(),
            repo_digests: img.repo_digests.unwrap_or_default(),
            size: img.size.unwrap_or(0),
            user: img.config.and_then(|c| c.user).unwrap_or_default(),
        })
    }

    async fn list_images(&self) -> EngineResult<Vec<EngineImage>> {
        let images = self
            .bounded(
                self.docker
                    .list_images(Some(bollard::image::ListImagesOptions::<String> {
                        all: false,
                        ..Default::default()
                    })),
            )
            .await?;
        Ok(images
            .into_iter()
            .map(|img| EngineImage {
                id: img.id,
                repo_tags: img.repo_tags,
                repo_digests: img.repo_digests,
                size: img.size,
                user: String::new(),
            })
            .collect())
    }

    async fn pull_image(
        &self,
        reference: &str,
        credentials: Option<RegistryCredentials>,
    ) -> EngineResult<PullStream> {
        let docker = self.docker.clone();
        let options = bollard::image::CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };
        let credentials = credentials.map(|c| bollard::auth::DockerCredentials {
            username: non_empty(c.username),
            password: non_empty(c.password),
            serveraddress: non_empty(c.server_address),
            identitytoken: non_empty(c.identity_token),
            registrytoken: non_empty(c.registry_token),
            ..Default::default()
        });

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let mut stream = docker.create_image(Some(options), None, credentials);
            loop {
                let item = tokio::select! {
                    item = stream.next() => item,
                    _ = tx.closed() => break,
                };
                let Some(item) = item else { break };
                let event = match item {
                    Ok(info) => match info.error {
                        Some(error) => Err(EngineError::status(500, error)),
                        None => Ok(PullProgress {
                            status: info.status.unwrap_or_default(),
                            layer: info.id,
                            progress: info.progress,
                        }),
                    },
                    Err(e) => Err(EngineError::from(e)),
                };
                let failed = event.is_err();
                if tx.send(event).await.is_err() || failed {
                    break;
                }
            }
        });
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn remove_image(&self, reference: &str) -> EngineResult<()> {
        self.bounded(self.docker.remove_image(
            reference,
            Some(bollard::image::RemoveImageOptions {
                force: false,
                ..Default::default()
            }),
            None,
        ))
        .await
        .map(|_| ())
    }

    async fn image_history(&self, reference: &str) -> EngineResult<Vec<EngineImageLayer>> {
        let history = self.bounded(self.docker.image_history(reference)).await?;
        Ok(history
            .into_iter()
            .map(|h| EngineImageLayer {
                id: h.id,
                created: h.created,
                created_by: h.created_by,
                size: h.size,
                comment: h.comment,
            })
            .collect())
    }

    async fn logs(&self, id: &str, request: LogRequest) -> EngineResult<OutputStream> {
        let docker = self.docker.clone();
        let id = id.to_string();
        let options = bollard::container::LogsOptions::<String> {
            follow: request.follow,
            stdout: true,
            stderr: true,
            since: request.since,
            timestamps: request.timestamps,
            tail: request.tail,
            ..Default::default()
        };

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let mut stream = output_stream(docker.logs(&id, Some(options)));
            loop {
                let item = tokio::select! {
                    item = stream.next() => item,
                    _ = tx.closed() => break,
                };
                let Some(item) = item else { break };
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
            debug!(container_id = %id, "Engine log stream closed");
        });
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn create_exec(&self, container_id: &str, config: ExecConfig) -> EngineResult<String> {
        let options = bollard::exec::CreateExecOptions {
            cmd: Some(config.cmd),
            attach_stdin: Some(config.attach_stdin),
            attach_stdout: Some(config.attach_stdout),
            attach_stderr: Some(config.attach_stderr),
            tty: Some(config.tty),
            ..Default::default()
        };
        let exec = self
            .bounded(self.docker.create_exec(container_id, options))
            .await?;
        Ok(exec.id)
    }

    async fn start_exec(&self, exec_id: &str) -> EngineResult<EngineAttach> {
        match self.bounded(self.docker.start_exec(exec_id, None)).await? {
            bollard::exec::StartExecResults::Attached { output, input } => {
                Ok(Self::attach_from(output, input))
            }
            bollard::exec::StartExecResults::Detached => Err(EngineError::Malformed(format!(
                "exec {} started detached",
                exec_id
            ))),
        }
    }

    async fn inspect_exec(&self, exec_id: &str) -> EngineResult<ExecInspect> {
        let inspect = self.bounded(self.docker.inspect_exec(exec_id)).await?;
        Ok(ExecInspect {
            running: inspect.running.unwrap_or(false),
            exit_code: inspect.exit_code,
        })
    }

    async fn attach_container(&self, id: &str, config: AttachConfig) -> EngineResult<EngineAttach> {
        let options = bollard::container::AttachContainerOptions::<String> {
            stdin: Some(config.stdin),
            stdout: Some(config.stdout),
            stderr: Some(config.stderr),
            stream: Some(true),
            logs: Some(false),
            ..Default::default()
        };
        let bollard::container::AttachContainerResults { output, input } = self
            .bounded(self.docker.attach_container(id, Some(options)))
            .await?;
        Ok(Self::attach_from(output, input))
    }

    async fn resize_container_tty(&self, id: &str, size: TerminalSize) -> EngineResult<()> {
        self.bounded(self.docker.resize_container_tty(
            id,
            bollard::container::ResizeContainerTtyOptions {
                width: size.width,
                height: size.height,
            },
        ))
        .await
    }

    async fn resize_exec_tty(&self, exec_id: &str, size: TerminalSize) -> EngineResult<()> {
        self.bounded(self.docker.resize_exec(
            exec_id,
            bollard::exec::ResizeExecOptions {
                height: size.height,
                width: size.width,
            },
        ))
        .await
    }

    async fn stats(&self, id: &str) -> EngineResult<EngineStats> {
        let mut stream = self.docker.stats(
            id,
            Some(bollard::container::StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );
        let sample = match tokio::time::timeout(self.timeout, stream.next()).await {
            Ok(Some(sample)) => sample?,
            Ok(None) => {
                return Err(EngineError::Malformed(format!(
                    "no stats sample for container {}",
                    id
                )))
            }
            Err(_) => return Err(EngineError::DeadlineExceeded(self.timeout)),
        };

        Ok(EngineStats {
            cpu_total_usage: sample
                .cpu_stats
                .as_ref()
                .and_then(|cpu| cpu.cpu_usage.as_ref())
                .and_then(|usage| usage.total_usage)
                .unwrap_or(0),
            memory_working_set: sample
                .memory_stats
                .as_ref()
                .map(|mem| memory_working_set(mem.usage.unwrap_or(0), mem.stats.as_ref()))
                .unwrap_or(0),
        })
    }

    async fn info(&self) -> EngineResult<EngineInfo> {
        let info = self.bounded(self.docker.info()).await?;
        Ok(EngineInfo {
            logging_driver: info.logging_driver.unwrap_or_default(),
            root_dir: info.docker_root_dir.unwrap_or_default(),
            server_version: info.server_version.unwrap_or_default(),
        })
    }

    async fn version(&self) -> EngineResult<EngineVersion> {
        let version = self.bounded(self.docker.version()).await?;
        Ok(EngineVersion {
            version: version.version.unwrap_or_default(),
            api_version: version.api_version.unwrap_or_default(),
            min_api_version: version.min_api_version.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_api_version() {
        assert!(check_api_version("1.42", "1.42").is_ok());
        assert!(check_api_version("1.45", "1.42").is_ok());
        assert!(check_api_version("2.0", "1.42").is_ok());

        let err = check_api_version("1.41", "1.42").unwrap_err();
        assert!(matches!(err, ShimError::Unavailable(ref m) if m.contains("1.41")));
    }

    #[test]
    fn test_check_api_version_malformed() {
        assert!(matches!(
            check_api_version("latest", "1.42"),
            Err(ShimError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_memory_working_set() {
        let v2 = HashMap::from([("inactive_file".to_string(), 300)]);
        assert_eq!(memory_working_set(1000, Some(&v2)), 700);

        let v1 = HashMap::from([("total_inactive_file".to_string(), 250)]);
        assert_eq!(memory_working_set(1000, Some(&v1)), 750);

        let oversized = HashMap::from([("inactive_file".to_string(), 5000)]);
        assert_eq!(memory_working_set(1000, Some(&oversized)), 0);
        assert_eq!(memory_working_set(1000, None), 1000);
    }

    #[tokio::test]
    async fn test_unsupported_endpoint() {
        let err = DockerEngine::connect(Some("ftp://engine"), Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Transport(ref m) if m.contains("ftp://engine")));
    }

    #[tokio::test]
    #[ignore] // Requires a running Docker daemon
    async fn test_connect_local_daemon() {
        let engine = DockerEngine::connect(None, Duration::from_secs(10)).await.unwrap();
        let version = engine.version().await.unwrap();
        check_api_version(&version.api_version, "1.42").unwrap();
        let info = engine.info().await.unwrap();
        assert!(!info.logging_driver.is_empty());
    }
}
