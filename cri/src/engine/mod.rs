//! Engine client abstraction.
//!
//! [`EngineClient`] is the typed surface the shim needs from the container
//! engine's remote API. [`DockerEngine`] talks to a real daemon; [`FakeEngine`]
//! satisfies the same contract in-process for tests.

mod docker;
mod error;
mod fake;

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::io::AsyncWrite;

use dockershim_core::exec::TerminalSize;
use dockershim_core::LogStream;

pub use docker::{check_api_version, DockerEngine};
pub use error::{EngineError, EngineResult};
pub use fake::{FakeEngine, PullStep};

/// Human status prefixes the engine uses in container listings.
pub const STATUS_RUNNING_PREFIX: &str = "Up";
pub const STATUS_CREATED_PREFIX: &str = "Created";
pub const STATUS_EXITED_PREFIX: &str = "Exited";

/// Container summary from a bulk listing.
#[derive(Debug, Clone, Default)]
pub struct EngineContainer {
    pub id: String,
    pub image: String,
    pub image_id: String,
    /// Unix seconds.
    pub created: i64,
    pub labels: HashMap<String, String>,
    /// Human status, e.g. `Up 3 minutes` or `Exited (0) 2 seconds ago`.
    pub status: String,
}

/// Runtime state reported by a container inspection.
#[derive(Debug, Clone, Default)]
pub struct EngineContainerState {
    /// `created`, `running`, `exited`, ...
    pub status: String,
    pub running: bool,
    pub exit_code: i64,
    pub oom_killed: bool,
    pub error: String,
    /// RFC 3339; the zero time when never started.
    pub started_at: String,
    /// RFC 3339; the zero time when never finished.
    pub finished_at: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineMount {
    pub source: String,
    pub destination: String,
    pub read_only: bool,
}

/// Full container inspection.
#[derive(Debug, Clone, Default)]
pub struct EngineContainerDetails {
    pub id: String,
    pub name: String,
    /// Resolved image id.
    pub image_id: String,
    /// Image reference as given at create time.
    pub image: String,
    /// RFC 3339.
    pub created: String,
    pub labels: HashMap<String, String>,
    pub state: EngineContainerState,
    pub mounts: Vec<EngineMount>,
    pub ip_address: String,
    /// `host`, `container:<id>`, or the engine default.
    pub network_mode: String,
    pub tty: bool,
}

/// Resource limits applied at create time or through an update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineResources {
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub cpu_shares: i64,
    pub memory: i64,
    pub cpuset_cpus: String,
    pub cpuset_mems: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnginePortBinding {
    /// `tcp`, `udp` or `sctp`.
    pub protocol: String,
    pub container_port: i32,
    pub host_port: i32,
    pub host_ip: String,
}

/// Everything needed to create one container.
#[derive(Debug, Clone, Default)]
pub struct CreateContainerConfig {
    pub name: String,
    pub image: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    pub working_dir: String,
    pub labels: HashMap<String, String>,
    pub hostname: String,
    pub user: String,
    pub tty: bool,
    pub open_stdin: bool,
    pub stdin_once: bool,
    /// `host:container[:ro]` bind specs.
    pub binds: Vec<String>,
    /// `container:<id>`, `host`, or empty for the engine default.
    pub network_mode: String,
    pub port_bindings: Vec<EnginePortBinding>,
    pub dns_servers: Vec<String>,
    pub dns_searches: Vec<String>,
    pub dns_options: Vec<String>,
    pub resources: EngineResources,
    pub oom_score_adj: i64,
    pub privileged: bool,
    pub readonly_rootfs: bool,
    pub cgroup_parent: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineImage {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
    pub size: i64,
    /// Configured user; only known from an inspection.
    pub user: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineImageLayer {
    pub id: String,
    pub created: i64,
    pub created_by: String,
    pub size: i64,
    pub comment: String,
}

/// One pull progress event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullProgress {
    pub status: String,
    pub layer: Option<String>,
    pub progress: Option<String>,
}

/// Registry credentials forwarded to a pull.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
    pub server_address: String,
    pub identity_token: String,
    pub registry_token: String,
}

/// Log retrieval parameters in engine terms.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRequest {
    /// Unix seconds; 0 = everything.
    pub since: i64,
    /// Line count or `all`.
    pub tail: String,
    pub timestamps: bool,
    pub follow: bool,
}

impl Default for LogRequest {
    fn default() -> Self {
        Self {
            since: 0,
            tail: "all".to_string(),
            timestamps: false,
            follow: false,
        }
    }
}

/// A chunk of container or exec output.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputChunk {
    pub stream: LogStream,
    pub data: Bytes,
}

impl OutputChunk {
    pub fn stdout(data: impl Into<Bytes>) -> Self {
        Self {
            stream: LogStream::Stdout,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<Bytes>) -> Self {
        Self {
            stream: LogStream::Stderr,
            data: data.into(),
        }
    }
}

pub type OutputStream = BoxStream<'static, EngineResult<OutputChunk>>;
pub type PullStream = BoxStream<'static, EngineResult<PullProgress>>;
pub type InputSink = Pin<Box<dyn AsyncWrite + Send>>;

/// An attached stdio channel: engine output plus a writer into the process stdin.
pub struct EngineAttach {
    pub output: OutputStream,
    pub input: InputSink,
}

impl std::fmt::Debug for EngineAttach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineAttach").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecConfig {
    pub cmd: Vec<String>,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub tty: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecInspect {
    pub running: bool,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachConfig {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

/// One-shot resource usage sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    /// Cumulative CPU time in nanoseconds.
    pub cpu_total_usage: u64,
    /// Memory usage without inactive page cache, in bytes.
    pub memory_working_set: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineInfo {
    pub logging_driver: String,
    pub root_dir: String,
    pub server_version: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineVersion {
    pub version: String,
    pub api_version: String,
    pub min_api_version: String,
}

/// Typed interface over the engine's remote API.
///
/// Every non-streaming call is bounded by the implementation's request
/// timeout. Streams end when the engine closes them or the consumer drops
/// them; dropping a stream releases the underlying engine connection.
#[async_trait]
pub trait EngineClient: Send + Sync {
    async fn list_containers(&self, all: bool) -> EngineResult<Vec<EngineContainer>>;
    async fn inspect_container(&self, id: &str) -> EngineResult<EngineContainerDetails>;
    /// Returns the new container id.
    async fn create_container(&self, config: CreateContainerConfig) -> EngineResult<String>;
    async fn start_container(&self, id: &str) -> EngineResult<()>;
    /// Graceful stop; the engine force-kills once `grace` elapses.
    async fn stop_container(&self, id: &str, grace: Duration) -> EngineResult<()>;
    async fn update_container(&self, id: &str, resources: EngineResources) -> EngineResult<()>;
    async fn remove_container(&self, id: &str, force: bool) -> EngineResult<()>;

    async fn inspect_image(&self, reference: &str) -> EngineResult<EngineImage>;
    async fn list_images(&self) -> EngineResult<Vec<EngineImage>>;
    async fn pull_image(
        &self,
        reference: &str,
        credentials: Option<RegistryCredentials>,
    ) -> EngineResult<PullStream>;
    async fn remove_image(&self, reference: &str) -> EngineResult<()>;
    async fn image_history(&self, reference: &str) -> EngineResult<Vec<EngineImageLayer>>;

    async fn logs(&self, id: &str, request: LogRequest) -> EngineResult<OutputStream>;
    /// Returns the exec instance id.
    async fn create_exec(&self, container_id: &str, config: ExecConfig) -> EngineResult<String>;
    async fn start_exec(&self, exec_id: &str) -> EngineResult<EngineAttach>;
    async fn inspect_exec(&self, exec_id: &str) -> EngineResult<ExecInspect>;
    async fn attach_container(&self, id: &str, config: AttachConfig) -> EngineResult<EngineAttach>;
    async fn resize_container_tty(&self, id: &str, size: TerminalSize) -> EngineResult<()>;
    async fn resize_exec_tty(&self, exec_id: &str, size: TerminalSize) -> EngineResult<()>;

    async fn stats(&self, id: &str) -> EngineResult<EngineStats>;
    async fn info(&self) -> EngineResult<EngineInfo>;
    async fn version(&self) -> EngineResult<EngineVersion>;
}
