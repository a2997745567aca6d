//! In-process engine used by tests.
//!
//! Containers, images and exec instances live in a mutex-guarded table. Ids are
//! handed out from a counter so runs are deterministic. Any operation can be
//! made to fail once through [`FakeEngine::inject_error`].
//!
//! Processes are simulated by a tiny command interpreter: `echo X` prints `X`,
//! `exit N` ends the process with code `N`, `true`/`false` set the status and
//! anything else prints a "not found" error with status 127. Attaching to a
//! container feeds its stdin to that interpreter. Exec understands the same
//! commands plus `sh -c <script>`, `sleep <secs>`, and `cat`/`socat`, which
//! echo stdin back to stdout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};

use dockershim_core::exec::TerminalSize;

use super::{
    AttachConfig, CreateContainerConfig, EngineAttach, EngineClient, EngineContainer,
    EngineContainerDetails, EngineContainerState, EngineError, EngineImage, EngineImageLayer,
    EngineInfo, EngineMount, EngineResources, EngineResult, EngineStats, EngineVersion,
    ExecConfig, ExecInspect, LogRequest, OutputChunk, OutputStream, PullProgress, PullStream,
    RegistryCredentials,
};

const ZERO_TIME: &str = "0001-01-01T00:00:00Z";
const PIPE_CAPACITY: usize = 64 * 1024;

/// One scripted step of an image pull.
#[derive(Debug, Clone)]
pub enum PullStep {
    /// Emit a progress event after the given delay.
    Progress(Duration),
    /// Never emit anything again.
    Stall,
    /// Fail the pull with an engine error.
    Fail(String),
}

type Sink = mpsc::UnboundedSender<OutputChunk>;

struct Follower {
    sink: Sink,
    timestamps: bool,
}

struct FakeContainer {
    details: EngineContainerDetails,
    created_unix: i64,
    resources: EngineResources,
    status_override: Option<String>,
    logs: Vec<(DateTime<Utc>, OutputChunk)>,
    attachers: Vec<Sink>,
    followers: Vec<Follower>,
    last_resize: Option<TerminalSize>,
    stats: EngineStats,
}

impl FakeContainer {
    fn summary_status(&self) -> String {
        if let Some(status) = &self.status_override {
            return status.clone();
        }
        let state = &self.details.state;
        if state.running {
            "Up 1 second".to_string()
        } else if state.status == "created" {
            "Created".to_string()
        } else {
            format!("Exited ({}) 1 second ago", state.exit_code)
        }
    }
}

struct FakeExec {
    container_id: String,
    config: ExecConfig,
    running: bool,
    exit_code: Option<i64>,
    last_resize: Option<TerminalSize>,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    containers: HashMap<String, FakeContainer>,
    images: Vec<EngineImage>,
    history: HashMap<String, Vec<EngineImageLayer>>,
    execs: HashMap<String, FakeExec>,
    errors: HashMap<String, EngineError>,
    pull_scripts: HashMap<String, Vec<PullStep>>,
    pull_credentials: Vec<(String, Option<RegistryCredentials>)>,
    calls: Vec<String>,
    logging_driver: String,
    api_version: String,
}

impl FakeState {
    fn next_id(&mut self) -> String {
        self.next_id += 1;
        format!("{:064x}", self.next_id)
    }

    fn container(&self, id: &str) -> EngineResult<&FakeContainer> {
        self.resolve_container(id)
            .and_then(|full| self.containers.get(&full))
            .ok_or_else(|| EngineError::not_found(format!("No such container: {}", id)))
    }

    fn container_mut(&mut self, id: &str) -> EngineResult<&mut FakeContainer> {
        match self.resolve_container(id) {
            Some(full) => self
                .containers
                .get_mut(&full)
                .ok_or_else(|| EngineError::not_found(format!("No such container: {}", id))),
            None => Err(EngineError::not_found(format!("No such container: {}", id))),
        }
    }

    /// Accept full ids, unique prefixes and names, like the engine does.
    fn resolve_container(&self, id: &str) -> Option<String> {
        if self.containers.contains_key(id) {
            return Some(id.to_string());
        }
        let name = format!("/{}", id.trim_start_matches('/'));
        self.containers
            .iter()
            .find(|(full, c)| c.details.name == name || (id.len() >= 12 && full.starts_with(id)))
            .map(|(full, _)| full.clone())
    }

    fn find_image(&self, reference: &str) -> Option<&EngineImage> {
        let tagged = if reference.contains(':') || reference.contains('@') {
            reference.to_string()
        } else {
            format!("{}:latest", reference)
        };
        self.images.iter().find(|img| {
            img.id == reference
                || img.id.trim_start_matches("sha256:") == reference
                || img.repo_tags.iter().any(|t| *t == tagged)
                || img.repo_digests.iter().any(|d| d == reference)
        })
    }

    fn add_image(&mut self, reference: &str, size: i64) -> String {
        if let Some(existing) = self.find_image(reference) {
            return existing.id.clone();
        }
        let id = format!("sha256:{}", self.next_id());
        let tag = if reference.contains(':') {
            reference.to_string()
        } else {
            format!("{}:latest", reference)
        };
        self.images.push(EngineImage {
            id: id.clone(),
            repo_tags: vec![tag],
            repo_digests: Vec::new(),
            size,
            user: String::new(),
        });
        id
    }

    fn emit(&mut self, id: &str, chunk: OutputChunk, at: DateTime<Utc>) {
        let Ok(container) = self.container_mut(id) else {
            return;
        };
        container
            .attachers
            .retain(|sink| sink.send(chunk.clone()).is_ok());
        container.followers.retain(|f| {
            let data = if f.timestamps {
                with_timestamp(at, &chunk.data)
            } else {
                chunk.data.clone()
            };
            f.sink
                .send(OutputChunk {
                    stream: chunk.stream,
                    data,
                })
                .is_ok()
        });
        container.logs.push((at, chunk));
    }

    fn exit_container(&mut self, id: &str, exit_code: i64, oom_killed: bool) {
        if let Ok(container) = self.container_mut(id) {
            let state = &mut container.details.state;
            if !state.running {
                return;
            }
            state.running = false;
            state.status = "exited".to_string();
            state.exit_code = exit_code;
            state.oom_killed = oom_killed;
            state.finished_at = now_rfc3339();
            // Dropping the sinks ends every attached and following stream.
            container.attachers.clear();
            container.followers.clear();
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn with_timestamp(at: DateTime<Utc>, data: &Bytes) -> Bytes {
    let mut line = at.to_rfc3339_opts(SecondsFormat::Nanos, true).into_bytes();
    line.push(b' ');
    line.extend_from_slice(data);
    Bytes::from(line)
}

struct ScriptResult {
    output: Vec<OutputChunk>,
    status: i64,
    exited: bool,
}

fn run_script(script: &str) -> ScriptResult {
    let mut result = ScriptResult {
        output: Vec::new(),
        status: 0,
        exited: false,
    };
    for cmd in script.split(|c| c == ';' || c == '\n') {
        let cmd = cmd.trim();
        if cmd.is_empty() {
            continue;
        }
        let (word, rest) = cmd.split_once(' ').unwrap_or((cmd, ""));
        match word {
            "echo" => {
                result.output.push(OutputChunk::stdout(format!("{}\n", rest)));
                result.status = 0;
            }
            "true" => result.status = 0,
            "false" => result.status = 1,
            "exit" => {
                result.status = rest.trim().parse().unwrap_or(0);
                result.exited = true;
                return result;
            }
            other => {
                result
                    .output
                    .push(OutputChunk::stderr(format!("sh: {}: not found\n", other)));
                result.status = 127;
            }
        }
    }
    result
}

/// Read stdin lines through the interpreter until `exit` or EOF.
async fn run_shell<F>(input: DuplexStream, mut on_output: F) -> i64
where
    F: FnMut(OutputChunk),
{
    let mut lines = BufReader::new(input).lines();
    let mut status = 0;
    while let Ok(Some(line)) = lines.next_line().await {
        let result = run_script(&line);
        for chunk in result.output {
            on_output(chunk);
        }
        status = result.status;
        if result.exited {
            break;
        }
    }
    status
}

/// In-process [`EngineClient`] with deterministic ids and error injection.
#[derive(Clone)]
pub struct FakeEngine {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        let state = FakeState {
            logging_driver: "json-file".to_string(),
            api_version: "1.43".to_string(),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Make the next call of `op` (a trait method name) fail with `err`.
    pub fn inject_error(&self, op: &str, err: EngineError) {
        self.state.lock().errors.insert(op.to_string(), err);
    }

    /// Every call made so far, as `op` or `op id`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn set_logging_driver(&self, driver: &str) {
        self.state.lock().logging_driver = driver.to_string();
    }

    pub fn set_api_version(&self, version: &str) {
        self.state.lock().api_version = version.to_string();
    }

    /// Make an image available locally. Returns its id.
    pub fn add_image(&self, reference: &str, size: i64) -> String {
        self.state.lock().add_image(reference, size)
    }

    pub fn set_image_user(&self, reference: &str, user: &str) {
        let mut state = self.state.lock();
        let id = state.find_image(reference).map(|img| img.id.clone());
        if let Some(img) = state.images.iter_mut().find(|img| Some(&img.id) == id.as_ref()) {
            img.user = user.to_string();
        }
    }

    pub fn set_image_history(&self, reference: &str, layers: Vec<EngineImageLayer>) {
        let mut state = self.state.lock();
        if let Some(id) = state.find_image(reference).map(|img| img.id.clone()) {
            state.history.insert(id, layers);
        }
    }

    /// Script the next pull of `reference`. Unscripted pulls succeed at once.
    pub fn script_pull(&self, reference: &str, steps: Vec<PullStep>) {
        self.state
            .lock()
            .pull_scripts
            .insert(reference.to_string(), steps);
    }

    /// Credentials seen by each pull, in order.
    pub fn pull_credentials(&self) -> Vec<(String, Option<RegistryCredentials>)> {
        self.state.lock().pull_credentials.clone()
    }

    /// Insert a container that did not come from `create_container`,
    /// e.g. one created by another tool or carrying damaged labels.
    pub fn insert_container(
        &self,
        name: &str,
        image: &str,
        labels: HashMap<String, String>,
        running: bool,
    ) -> String {
        let mut state = self.state.lock();
        let id = state.next_id();
        let now = Utc::now();
        let details = EngineContainerDetails {
            id: id.clone(),
            name: format!("/{}", name),
            image_id: state.find_image(image).map(|i| i.id.clone()).unwrap_or_default(),
            image: image.to_string(),
            created: now.to_rfc3339_opts(SecondsFormat::Nanos, true),
            labels,
            state: EngineContainerState {
                status: if running { "running" } else { "created" }.to_string(),
                running,
                started_at: if running { now_rfc3339() } else { ZERO_TIME.to_string() },
                finished_at: ZERO_TIME.to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        state.containers.insert(
            id.clone(),
            FakeContainer {
                details,
                created_unix: now.timestamp(),
                resources: EngineResources::default(),
                status_override: None,
                logs: Vec::new(),
                attachers: Vec::new(),
                followers: Vec::new(),
                last_resize: None,
                stats: EngineStats::default(),
            },
        );
        id
    }

    /// Override the human status string reported in listings.
    pub fn set_container_status(&self, id: &str, status: &str) {
        if let Ok(c) = self.state.lock().container_mut(id) {
            c.status_override = Some(status.to_string());
        }
    }

    /// Append output to a container's log and live streams.
    pub fn emit_output(&self, id: &str, chunk: OutputChunk) {
        self.emit_output_at(id, chunk, Utc::now());
    }

    pub fn emit_output_at(&self, id: &str, chunk: OutputChunk, at: DateTime<Utc>) {
        self.state.lock().emit(id, chunk, at);
    }

    /// Simulate the main process exiting on its own.
    pub fn exit_container(&self, id: &str, exit_code: i64, oom_killed: bool) {
        self.state.lock().exit_container(id, exit_code, oom_killed);
    }

    pub fn set_stats(&self, id: &str, stats: EngineStats) {
        if let Ok(c) = self.state.lock().container_mut(id) {
            c.stats = stats;
        }
    }

    pub fn container_resources(&self, id: &str) -> Option<EngineResources> {
        self.state.lock().container(id).ok().map(|c| c.resources.clone())
    }

    pub fn container_exists(&self, id: &str) -> bool {
        self.state.lock().container(id).is_ok()
    }

    pub fn last_resize(&self, id: &str) -> Option<TerminalSize> {
        let state = self.state.lock();
        if let Some(exec) = state.execs.get(id) {
            return exec.last_resize;
        }
        state.container(id).ok().and_then(|c| c.last_resize)
    }

    /// Record the call and consume any injected failure for it.
    fn enter(&self, op: &str, id: Option<&str>) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.calls.push(match id {
            Some(id) => format!("{} {}", op, id),
            None => op.to_string(),
        });
        match state.errors.remove(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn spawn_exec(&self, exec_id: String, argv: Vec<String>, input: DuplexStream, output: Sink) {
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut input = input;
            let program = argv.first().map(String::as_str).unwrap_or("");
            let status = match program {
                "echo" => {
                    let _ = output.send(OutputChunk::stdout(format!("{}\n", argv[1..].join(" "))));
                    0
                }
                "true" => 0,
                "false" => 1,
                "sh" | "/bin/sh" if argv.get(1).map(String::as_str) == Some("-c") => {
                    let result = run_script(argv.get(2).map(String::as_str).unwrap_or(""));
                    for chunk in result.output {
                        let _ = output.send(chunk);
                    }
                    result.status
                }
                "sh" | "/bin/sh" => {
                    let sink = output.clone();
                    run_shell(input, move |chunk| {
                        let _ = sink.send(chunk);
                    })
                    .await
                }
                "sleep" => {
                    let secs = argv.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    0
                }
                "cat" | "socat" => {
                    let mut buf = vec![0u8; 8192];
                    loop {
                        match input.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if output
                                    .send(OutputChunk::stdout(buf[..n].to_vec()))
                                    .is_err()
                                {
                                    break;
                                }
                            }
                        }
                    }
                    0
                }
                other => {
                    let _ = output.send(OutputChunk::stderr(format!(
                        "exec: \"{}\": executable file not found in $PATH\n",
                        other
                    )));
                    127
                }
            };

            if let Some(exec) = state.lock().execs.get_mut(&exec_id) {
                exec.running = false;
                exec.exit_code = Some(status);
            }
            drop(output);
        });
    }
}

#[async_trait]
impl EngineClient for FakeEngine {
    async fn list_containers(&self, all: bool) -> EngineResult<Vec<EngineContainer>> {
        self.enter("list_containers", None)?;
        let state = self.state.lock();
        let mut containers: Vec<_> = state
            .containers
            .values()
            .filter(|c| all || c.details.state.running)
            .map(|c| EngineContainer {
                id: c.details.id.clone(),
                image: c.details.image.clone(),
                image_id: c.details.image_id.clone(),
                created: c.created_unix,
                labels: c.details.labels.clone(),
                status: c.summary_status(),
            })
            .collect();
        containers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(containers)
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<EngineContainerDetails> {
        self.enter("inspect_container", Some(id))?;
        Ok(self.state.lock().container(id)?.details.clone())
    }

    async fn create_container(&self, config: CreateContainerConfig) -> EngineResult<String> {
        self.enter("create_container", Some(&config.name))?;
        let mut state = self.state.lock();
        let image_id = state
            .find_image(&config.image)
            .map(|img| img.id.clone())
            .ok_or_else(|| EngineError::not_found(format!("No such image: {}", config.image)))?;
        let name = format!("/{}", config.name);
        if state.containers.values().any(|c| c.details.name == name) {
            return Err(EngineError::conflict(format!(
                "Conflict. The container name \"{}\" is already in use",
                name
            )));
        }

        let id = state.next_id();
        let now = Utc::now();
        let mounts = config
            .binds
            .iter()
            .filter_map(|bind| {
                let mut parts = bind.split(':');
                let source = parts.next()?.to_string();
                let destination = parts.next()?.to_string();
                let read_only = parts.next().map_or(false, |opts| opts.split(',').any(|o| o == "ro"));
                Some(EngineMount {
                    source,
                    destination,
                    read_only,
                })
            })
            .collect();
        let details = EngineContainerDetails {
            id: id.clone(),
            name,
            image_id,
            image: config.image.clone(),
            created: now.to_rfc3339_opts(SecondsFormat::Nanos, true),
            labels: config.labels.clone(),
            state: EngineContainerState {
                status: "created".to_string(),
                started_at: ZERO_TIME.to_string(),
                finished_at: ZERO_TIME.to_string(),
                ..Default::default()
            },
            mounts,
            ip_address: String::new(),
            network_mode: config.network_mode.clone(),
            tty: config.tty,
        };
        state.containers.insert(
            id.clone(),
            FakeContainer {
                details,
                created_unix: now.timestamp(),
                resources: config.resources,
                status_override: None,
                logs: Vec::new(),
                attachers: Vec::new(),
                followers: Vec::new(),
                last_resize: None,
                stats: EngineStats::default(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        self.enter("start_container", Some(id))?;
        let mut state = self.state.lock();
        let ip = format!("10.88.0.{}", (state.next_id % 250) + 2);
        let container = state.container_mut(id)?;
        let details = &mut container.details;
        if details.state.running {
            return Err(EngineError::not_modified("container already started"));
        }
        details.state = EngineContainerState {
            status: "running".to_string(),
            running: true,
            started_at: now_rfc3339(),
            finished_at: ZERO_TIME.to_string(),
            ..Default::default()
        };
        details.ip_address = ip;
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> EngineResult<()> {
        self.enter("stop_container", Some(id))?;
        let mut state = self.state.lock();
        if !state.container(id)?.details.state.running {
            return Err(EngineError::not_modified("container already stopped"));
        }
        state.exit_container(id, 0, false);
        Ok(())
    }

    async fn update_container(&self, id: &str, resources: EngineResources) -> EngineResult<()> {
        self.enter("update_container", Some(id))?;
        self.state.lock().container_mut(id)?.resources = resources;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> EngineResult<()> {
        self.enter("remove_container", Some(id))?;
        let mut state = self.state.lock();
        let full = state.container(id)?.details.id.clone();
        let running = state.container(id)?.details.state.running;
        if running && !force {
            return Err(EngineError::conflict(format!(
                "You cannot remove a running container {}. Stop the container before attempting removal or force remove",
                full
            )));
        }
        if running {
            state.exit_container(&full, 137, false);
        }
        state.containers.remove(&full);
        state.execs.retain(|_, exec| exec.container_id != full);
        Ok(())
    }

    async fn inspect_image(&self, reference: &str) -> EngineResult<EngineImage> {
        self.enter("inspect_image", Some(reference))?;
        self.state
            .lock()
            .find_image(reference)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("No such image: {}", reference)))
    }

    async fn list_images(&self) -> EngineResult<Vec<EngineImage>> {
        self.enter("list_images", None)?;
        Ok(self
            .state
            .lock()
            .images
            .iter()
            .map(|img| EngineImage {
                user: String::new(),
                ..img.clone()
            })
            .collect())
    }

    async fn pull_image(
        &self,
        reference: &str,
        credentials: Option<RegistryCredentials>,
    ) -> EngineResult<PullStream> {
        self.enter("pull_image", Some(reference))?;
        let steps = {
            let mut state = self.state.lock();
            state
                .pull_credentials
                .push((reference.to_string(), credentials));
            state.pull_scripts.remove(reference).unwrap_or_else(|| {
                vec![
                    PullStep::Progress(Duration::ZERO),
                    PullStep::Progress(Duration::ZERO),
                ]
            })
        };

        let state = self.state.clone();
        let reference = reference.to_string();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for (n, step) in steps.into_iter().enumerate() {
                match step {
                    PullStep::Progress(delay) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = tx.closed() => return,
                        }
                        let event = PullProgress {
                            status: "Downloading".to_string(),
                            layer: Some(format!("layer{}", n)),
                            progress: Some(format!("[{}]", "=".repeat(n + 1))),
                        };
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                    PullStep::Stall => {
                        tx.closed().await;
                        return;
                    }
                    PullStep::Fail(message) => {
                        let _ = tx.send(Err(EngineError::status(500, message))).await;
                        return;
                    }
                }
            }
            state.lock().add_image(&reference, 1024 * 1024);
            let _ = tx
                .send(Ok(PullProgress {
                    status: format!("Status: Downloaded newer image for {}", reference),
                    layer: None,
                    progress: None,
                }))
                .await;
        });
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn remove_image(&self, reference: &str) -> EngineResult<()> {
        self.enter("remove_image", Some(reference))?;
        let mut state = self.state.lock();
        let id = state
            .find_image(reference)
            .map(|img| img.id.clone())
            .ok_or_else(|| EngineError::not_found(format!("No such image: {}", reference)))?;
        if let Some(user) = state.containers.values().find(|c| c.details.image_id == id) {
            return Err(EngineError::conflict(format!(
                "conflict: unable to remove repository reference \"{}\" (must force) - container {} is using its referenced image",
                reference, user.details.id
            )));
        }
        state.images.retain(|img| img.id != id);
        state.history.remove(&id);
        Ok(())
    }

    async fn image_history(&self, reference: &str) -> EngineResult<Vec<EngineImageLayer>> {
        self.enter("image_history", Some(reference))?;
        let state = self.state.lock();
        let id = state
            .find_image(reference)
            .map(|img| img.id.clone())
            .ok_or_else(|| EngineError::not_found(format!("No such image: {}", reference)))?;
        Ok(state.history.get(&id).cloned().unwrap_or_default())
    }

    async fn logs(&self, id: &str, request: LogRequest) -> EngineResult<OutputStream> {
        self.enter("logs", Some(id))?;
        let mut state = self.state.lock();
        let container = state.container_mut(id)?;

        let mut lines: Vec<OutputChunk> = container
            .logs
            .iter()
            .filter(|(at, _)| request.since <= 0 || at.timestamp() >= request.since)
            .map(|(at, chunk)| OutputChunk {
                stream: chunk.stream,
                data: if request.timestamps {
                    with_timestamp(*at, &chunk.data)
                } else {
                    chunk.data.clone()
                },
            })
            .collect();
        if let Ok(tail) = request.tail.parse::<usize>() {
            let skip = lines.len().saturating_sub(tail);
            lines.drain(..skip);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for line in lines {
            let _ = tx.send(line);
        }
        if request.follow && container.details.state.running {
            container.followers.push(Follower {
                sink: tx,
                timestamps: request.timestamps,
            });
        }
        Ok(UnboundedReceiverStream::new(rx).map(Ok).boxed())
    }

    async fn create_exec(&self, container_id: &str, config: ExecConfig) -> EngineResult<String> {
        self.enter("create_exec", Some(container_id))?;
        let mut state = self.state.lock();
        let container = state.container(container_id)?;
        if !container.details.state.running {
            return Err(EngineError::conflict(format!(
                "Container {} is not running",
                container_id
            )));
        }
        let full = container.details.id.clone();
        let exec_id = state.next_id();
        state.execs.insert(
            exec_id.clone(),
            FakeExec {
                container_id: full,
                config,
                running: false,
                exit_code: None,
                last_resize: None,
            },
        );
        Ok(exec_id)
    }

    async fn start_exec(&self, exec_id: &str) -> EngineResult<EngineAttach> {
        self.enter("start_exec", Some(exec_id))?;
        let argv = {
            let mut state = self.state.lock();
            let exec = state
                .execs
                .get_mut(exec_id)
                .ok_or_else(|| EngineError::not_found(format!("No such exec instance: {}", exec_id)))?;
            if exec.running || exec.exit_code.is_some() {
                return Err(EngineError::conflict(format!(
                    "exec {} has already been started",
                    exec_id
                )));
            }
            exec.running = true;
            exec.config.cmd.clone()
        };

        let (client, process) = tokio::io::duplex(PIPE_CAPACITY);
        let (tx, rx) = mpsc::unbounded_channel();
        self.spawn_exec(exec_id.to_string(), argv, process, tx);
        Ok(EngineAttach {
            output: UnboundedReceiverStream::new(rx).map(Ok).boxed(),
            input: Box::pin(client),
        })
    }

    async fn inspect_exec(&self, exec_id: &str) -> EngineResult<ExecInspect> {
        self.enter("inspect_exec", Some(exec_id))?;
        let state = self.state.lock();
        let exec = state
            .execs
            .get(exec_id)
            .ok_or_else(|| EngineError::not_found(format!("No such exec instance: {}", exec_id)))?;
        Ok(ExecInspect {
            running: exec.running,
            exit_code: exec.exit_code,
        })
    }

    async fn attach_container(&self, id: &str, config: AttachConfig) -> EngineResult<EngineAttach> {
        self.enter("attach_container", Some(id))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let full = {
            let mut state = self.state.lock();
            let container = state.container_mut(id)?;
            if !container.details.state.running {
                return Err(EngineError::conflict(format!(
                    "You cannot attach to a stopped container {}",
                    id
                )));
            }
            container.attachers.push(tx);
            container.details.id.clone()
        };

        let (client, process) = tokio::io::duplex(PIPE_CAPACITY);
        if config.stdin {
            let state = self.state.clone();
            tokio::spawn(async move {
                let target = full.clone();
                let shell_state = state.clone();
                let mut exit = None;
                let mut lines = BufReader::new(process).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let result = run_script(&line);
                    for chunk in result.output {
                        shell_state.lock().emit(&target, chunk, Utc::now());
                    }
                    if result.exited {
                        exit = Some(result.status);
                        break;
                    }
                }
                if let Some(code) = exit {
                    state.lock().exit_container(&full, code, false);
                }
            });
        }

        let stdout = config.stdout;
        let stderr = config.stderr;
        let output = UnboundedReceiverStream::new(rx)
            .filter(move |chunk| {
                let wanted = match chunk.stream {
                    dockershim_core::LogStream::Stdout => stdout,
                    dockershim_core::LogStream::Stderr => stderr,
                };
                futures::future::ready(wanted)
            })
            .map(Ok)
            .boxed();
        Ok(EngineAttach {
            output,
            input: Box::pin(client),
        })
    }

    async fn resize_container_tty(&self, id: &str, size: TerminalSize) -> EngineResult<()> {
        self.enter("resize_container_tty", Some(id))?;
        self.state.lock().container_mut(id)?.last_resize = Some(size);
        Ok(())
    }

    async fn resize_exec_tty(&self, exec_id: &str, size: TerminalSize) -> EngineResult<()> {
        self.enter("resize_exec_tty", Some(exec_id))?;
        let mut state = self.state.lock();
        let exec = state
            .execs
            .get_mut(exec_id)
            .ok_or_else(|| EngineError::not_found(format!("No such exec instance: {}", exec_id)))?;
        exec.last_resize = Some(size);
        Ok(())
    }

    async fn stats(&self, id: &str) -> EngineResult<EngineStats> {
        self.enter("stats", Some(id))?;
        Ok(self.state.lock().container(id)?.stats.clone())
    }

    async fn info(&self) -> EngineResult<EngineInfo> {
        self.enter("info", None)?;
        Ok(EngineInfo {
            logging_driver: self.state.lock().logging_driver.clone(),
            root_dir: "/var/lib/docker".to_string(),
            server_version: "24.0.7".to_string(),
        })
    }

    async fn version(&self) -> EngineResult<EngineVersion> {
        self.enter("version", None)?;
        Ok(EngineVersion {
            version: "24.0.7".to_string(),
            api_version: self.state.lock().api_version.clone(),
            min_api_version: "1.12".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn running_container(engine: &FakeEngine) -> String {
        engine.add_image("busybox:latest", 1024);
        let id = engine
            .create_container(CreateContainerConfig {
                name: "c1".to_string(),
                image: "busybox:latest".to_string(),
                open_stdin: true,
                ..Default::default()
            })
            .await
            .unwrap();
        engine.start_container(&id).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_create_requires_image() {
        let engine = FakeEngine::new();
        let err = engine
            .create_container(CreateContainerConfig {
                name: "c1".to_string(),
                image: "missing:1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_start_twice_not_modified() {
        let engine = FakeEngine::new();
        let id = running_container(&engine).await;
        assert!(engine.start_container(&id).await.unwrap_err().is_not_modified());
        engine.stop_container(&id, Duration::ZERO).await.unwrap();
        assert!(engine
            .stop_container(&id, Duration::ZERO)
            .await
            .unwrap_err()
            .is_not_modified());
    }

    #[tokio::test]
    async fn test_injected_error_is_one_shot() {
        let engine = FakeEngine::new();
        engine.inject_error("info", EngineError::Transport("refused".to_string()));
        assert!(engine.info().await.is_err());
        assert!(engine.info().await.is_ok());
    }

    #[tokio::test]
    async fn test_remove_running_requires_force() {
        let engine = FakeEngine::new();
        let id = running_container(&engine).await;
        assert!(engine.remove_container(&id, false).await.unwrap_err().is_conflict());
        engine.remove_container(&id, true).await.unwrap();
        assert!(!engine.container_exists(&id));
    }

    #[tokio::test]
    async fn test_attach_runs_shell() {
        let engine = FakeEngine::new();
        let id = running_container(&engine).await;
        let mut attach = engine
            .attach_container(
                &id,
                AttachConfig {
                    stdin: true,
                    stdout: true,
                    stderr: true,
                },
            )
            .await
            .unwrap();
        attach.input.write_all(b"echo hi\n").await.unwrap();
        let chunk = attach.output.next().await.unwrap().unwrap();
        assert_eq!(chunk, OutputChunk::stdout("hi\n"));

        attach.input.write_all(b"exit 3\n").await.unwrap();
        assert!(attach.output.next().await.is_none());
        let details = engine.inspect_container(&id).await.unwrap();
        assert!(!details.state.running);
        assert_eq!(details.state.exit_code, 3);
    }

    #[tokio::test]
    async fn test_exec_echo_and_exit_code() {
        let engine = FakeEngine::new();
        let id = running_container(&engine).await;
        let exec_id = engine
            .create_exec(
                &id,
                ExecConfig {
                    cmd: vec!["sh".into(), "-c".into(), "echo out; nope".into()],
                    attach_stdout: true,
                    attach_stderr: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let attach = engine.start_exec(&exec_id).await.unwrap();
        let chunks: Vec<_> = attach.output.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks[0], OutputChunk::stdout("out\n"));
        assert_eq!(chunks[1].stream, dockershim_core::LogStream::Stderr);

        let inspect = engine.inspect_exec(&exec_id).await.unwrap();
        assert_eq!(inspect.exit_code, Some(127));
    }

    #[tokio::test]
    async fn test_logs_tail_and_timestamps() {
        let engine = FakeEngine::new();
        let id = running_container(&engine).await;
        for line in ["a\n", "b\n", "c\n"] {
            engine.emit_output(&id, OutputChunk::stdout(line));
        }
        let stream = engine
            .logs(
                &id,
                LogRequest {
                    tail: "2".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let lines: Vec<_> = stream.map(|c| c.unwrap().data).collect().await;
        assert_eq!(lines, vec![Bytes::from("b\n"), Bytes::from("c\n")]);

        let stream = engine
            .logs(
                &id,
                LogRequest {
                    tail: "1".to_string(),
                    timestamps: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let lines: Vec<_> = stream.map(|c| c.unwrap().data).collect().await;
        assert!(lines[0].ends_with(b" c\n"));
        assert!(lines[0].len() > 30);
    }

    #[tokio::test]
    async fn test_scripted_pull_adds_image() {
        let engine = FakeEngine::new();
        engine.script_pull("nginx:1.25", vec![PullStep::Progress(Duration::from_millis(1))]);
        let events: Vec<_> = engine
            .pull_image("nginx:1.25", None)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert!(engine.inspect_image("nginx:1.25").await.is_ok());
    }

    #[tokio::test]
    async fn test_remove_image_in_use() {
        let engine = FakeEngine::new();
        running_container(&engine).await;
        assert!(engine
            .remove_image("busybox:latest")
            .await
            .unwrap_err()
            .is_conflict());
    }
}
