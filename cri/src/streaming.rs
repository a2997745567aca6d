//! CRI streaming for exec, attach, and port-forward.
//!
//! Kubernetes CRI uses a two-phase protocol for interactive operations:
//! 1. the runtime call registers a session and returns a URL carrying a token
//! 2. kubelet connects to that URL and upgrades it to a bidirectional stream
//!
//! [`StreamingRouter`] owns the token table and bridges an upgraded
//! connection to the engine's exec or attach channel. [`StreamingServer`]
//! accepts the connections and speaks the framing from
//! [`dockershim_core::frame`] once upgraded.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use dockershim_core::exec::TerminalSize;
use dockershim_core::frame::{read_frame, write_frame, SessionStatus, StreamFrame};
use dockershim_core::{EntityKind, LogStream, Result, ShimError, StreamingConfig};

use crate::engine::{
    AttachConfig, EngineAttach, EngineClient, EngineResult, ExecConfig, InputSink, OutputStream,
};

/// Frames buffered per direction between the connection and the engine.
const FRAME_QUEUE: usize = 64;

const EXEC_EXIT_POLLS: usize = 20;
const EXEC_EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on the request head of a streaming connection.
const MAX_REQUEST_HEAD: usize = 8192;

/// Type of CRI streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Exec,
    Attach,
    PortForward,
}

impl SessionKind {
    /// URL path segment.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exec => "exec",
            Self::Attach => "attach",
            Self::PortForward => "portforward",
        }
    }

    fn from_path(segment: &str) -> Option<Self> {
        match segment {
            "exec" => Some(Self::Exec),
            "attach" => Some(Self::Attach),
            "portforward" => Some(Self::PortForward),
            _ => None,
        }
    }
}

/// A pending streaming session registered by a runtime call.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingSession {
    pub kind: SessionKind,
    /// Target container. For port-forward this is the sandbox's infra
    /// container, whose network namespace the tunnel runs in.
    pub container_id: String,
    /// Command to execute (exec only).
    pub cmd: Vec<String>,
    pub tty: bool,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    /// Ports to forward (port-forward only).
    pub ports: Vec<i32>,
}

impl StreamingSession {
    pub fn exec(container_id: &str, cmd: Vec<String>, tty: bool, stdin: bool, stdout: bool, stderr: bool) -> Self {
        Self {
            kind: SessionKind::Exec,
            container_id: container_id.to_string(),
            cmd,
            tty,
            stdin,
            stdout,
            stderr,
            ports: Vec::new(),
        }
    }

    pub fn attach(container_id: &str, tty: bool, stdin: bool, stdout: bool, stderr: bool) -> Self {
        Self {
            kind: SessionKind::Attach,
            container_id: container_id.to_string(),
            cmd: Vec::new(),
            tty,
            stdin,
            stdout,
            stderr,
            ports: Vec::new(),
        }
    }

    pub fn port_forward(infra_container_id: &str, ports: Vec<i32>) -> Self {
        Self {
            kind: SessionKind::PortForward,
            container_id: infra_container_id.to_string(),
            cmd: Vec::new(),
            tty: false,
            stdin: true,
            stdout: true,
            stderr: false,
            ports,
        }
    }
}

struct PendingSession {
    session: StreamingSession,
    expires_at: Instant,
}

/// Where terminal resizes and the final exit status come from.
#[derive(Clone)]
enum EngineTarget {
    Exec(String),
    Container(String),
}

/// Token table plus the bridge between upgraded connections and the engine.
#[derive(Clone)]
pub struct StreamingRouter {
    engine: Arc<dyn EngineClient>,
    addr: SocketAddr,
    token_ttl: Duration,
    max_inflight: usize,
    teardown_grace: Duration,
    pending: Arc<DashMap<String, PendingSession>>,
    /// Serializes the in-flight check with the insert in `issue`.
    admission: Arc<Mutex<()>>,
}

impl StreamingRouter {
    pub fn new(engine: Arc<dyn EngineClient>, config: &StreamingConfig) -> Self {
        Self {
            engine,
            addr: config.addr,
            token_ttl: config.token_ttl(),
            max_inflight: config.max_inflight,
            teardown_grace: config.teardown_grace(),
            pending: Arc::new(DashMap::new()),
            admission: Arc::new(Mutex::new(())),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Tokens issued and not yet consumed or purged.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Register a session and return the URL kubelet should connect to.
    pub fn issue(&self, session: StreamingSession) -> Result<String> {
        match session.kind {
            SessionKind::Exec if session.cmd.is_empty() => {
                return Err(ShimError::InvalidArgument("exec command must not be empty".to_string()));
            }
            SessionKind::PortForward if session.ports.is_empty() => {
                return Err(ShimError::InvalidArgument("no ports to forward".to_string()));
            }
            // One connection carries one tunnel.
            SessionKind::PortForward if session.ports.len() > 1 => {
                return Err(ShimError::InvalidArgument(format!(
                    "a port-forward session relays a single port, got {:?}",
                    session.ports
                )));
            }
            SessionKind::PortForward if !(1..=65535).contains(&session.ports[0]) => {
                return Err(ShimError::InvalidArgument(format!(
                    "invalid port {}",
                    session.ports[0]
                )));
            }
            _ => {}
        }

        let _admission = self.admission.lock();
        self.purge_expired();
        if self.pending.len() >= self.max_inflight {
            warn!(limit = self.max_inflight, "Too many pending streaming sessions");
            return Err(ShimError::Unavailable(format!(
                "too many pending streaming sessions (limit {})",
                self.max_inflight
            )));
        }

        let token = uuid::Uuid::new_v4().simple().to_string();
        let url = format!("http://{}/{}/{}", self.addr, session.kind.as_str(), token);
        debug!(
            kind = session.kind.as_str(),
            container_id = %session.container_id,
            "Streaming session registered"
        );
        self.pending.insert(
            token,
            PendingSession {
                session,
                expires_at: Instant::now() + self.token_ttl,
            },
        );
        Ok(url)
    }

    /// Look up a token and invalidate it in the same step. A token that is
    /// unknown, already used or past its expiry is rejected.
    pub fn consume(&self, token: &str) -> Result<StreamingSession> {
        let (_, pending) = self.pending.remove(token).ok_or_else(|| {
            ShimError::not_found(EntityKind::Session, token, "unknown or already used token")
        })?;
        if Instant::now() >= pending.expires_at {
            return Err(ShimError::not_found(EntityKind::Session, token, "token expired"));
        }
        Ok(pending.session)
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        self.pending.retain(|_, pending| pending.expires_at > now);
    }

    /// Run one session: open the engine channel, then shuttle frames until
    /// either side finishes.
    ///
    /// `input` closing means the client went away; the engine side then gets
    /// the teardown grace period to drain before it is cut off. An empty
    /// stdin frame closes the process's stdin without ending the session.
    pub async fn serve_session(
        &self,
        session: StreamingSession,
        input: mpsc::Receiver<StreamFrame>,
        output: mpsc::Sender<StreamFrame>,
    ) -> Result<()> {
        let (attach, target) = match self.open(&session).await {
            Ok(opened) => opened,
            Err(e) => {
                let _ = output.send(StreamFrame::Status(SessionStatus::failed(e.to_string()))).await;
                return Err(e);
            }
        };
        let EngineAttach {
            output: engine_out,
            input: engine_in,
        } = attach;

        let mut upstream = tokio::spawn(pump_input(
            self.engine.clone(),
            input,
            engine_in,
            target.clone(),
        ));
        let mut downstream = tokio::spawn(pump_output(
            engine_out,
            output.clone(),
            session.tty,
            session.container_id.clone(),
        ));

        let finished = tokio::select! {
            _ = &mut upstream => None,
            res = &mut downstream => Some(res),
        };

        let Some(res) = finished else {
            debug!(container_id = %session.container_id, "Client closed the stream, draining engine output");
            if tokio::time::timeout(self.teardown_grace, &mut downstream).await.is_err() {
                debug!(container_id = %session.container_id, "Teardown grace elapsed");
                downstream.abort();
            }
            return Ok(());
        };
        upstream.abort();

        let res = res.unwrap_or_else(|e| {
            Err(ShimError::internal(
                EntityKind::Session,
                &session.container_id,
                format!("output task failed: {}", e),
            ))
        });
        if let Err(e) = res {
            let _ = output.send(StreamFrame::Status(SessionStatus::failed(e.to_string()))).await;
            return Err(e);
        }

        if session.kind != SessionKind::PortForward {
            if let Some(code) = self.exit_code(&target).await {
                let _ = output.send(StreamFrame::Status(SessionStatus::exited(code))).await;
            }
        }
        Ok(())
    }

    async fn open(&self, session: &StreamingSession) -> Result<(EngineAttach, EngineTarget)> {
        let id = session.container_id.as_str();
        let classify = |e: crate::engine::EngineError| e.classify(EntityKind::Container, id);

        match session.kind {
            SessionKind::Attach => {
                let attach = self
                    .engine
                    .attach_container(
                        id,
                        AttachConfig {
                            stdin: session.stdin,
                            stdout: session.stdout,
                            stderr: session.stderr,
                        },
                    )
                    .await
                    .map_err(classify)?;
                Ok((attach, EngineTarget::Container(id.to_string())))
            }
            SessionKind::Exec | SessionKind::PortForward => {
                let config = if session.kind == SessionKind::Exec {
                    ExecConfig {
                        cmd: session.cmd.clone(),
                        attach_stdin: session.stdin,
                        attach_stdout: session.stdout,
                        attach_stderr: session.stderr,
                        tty: session.tty,
                    }
                } else {
                    let port = session.ports.first().copied().ok_or_else(|| {
                        ShimError::InvalidArgument("no ports to forward".to_string())
                    })?;
                    ExecConfig {
                        cmd: port_forward_command(port),
                        attach_stdin: true,
                        attach_stdout: true,
                        attach_stderr: false,
                        tty: false,
                    }
                };
                let exec_id = self.engine.create_exec(id, config).await.map_err(classify)?;
                let attach = self
                    .engine
                    .start_exec(&exec_id)
                    .await
                    .map_err(|e| e.classify(EntityKind::Exec, &exec_id))?;
                info!(
                    container_id = %id,
                    exec_id = %exec_id,
                    kind = session.kind.as_str(),
                    "Streaming session started"
                );
                Ok((attach, EngineTarget::Exec(exec_id)))
            }
        }
    }

    async fn exit_code(&self, target: &EngineTarget) -> Option<i32> {
        match target {
            EngineTarget::Exec(exec_id) => match wait_exec_exit(self.engine.as_ref(), exec_id).await {
                Ok(code) => code.map(|c| c as i32),
                Err(e) => {
                    warn!(exec_id = %exec_id, error = %e, "Failed to inspect exec");
                    None
                }
            },
            EngineTarget::Container(id) => match self.engine.inspect_container(id).await {
                Ok(details) if !details.state.running => Some(details.state.exit_code as i32),
                Ok(_) => None,
                Err(e) => {
                    warn!(container_id = %id, error = %e, "Failed to inspect container");
                    None
                }
            },
        }
    }
}

/// Exit code of a finished exec, `None` if it is still running after a
/// short wait. The engine may report an exec as running for a moment after
/// its output has closed.
pub(crate) async fn wait_exec_exit(engine: &dyn EngineClient, exec_id: &str) -> EngineResult<Option<i64>> {
    for _ in 0..EXEC_EXIT_POLLS {
        let inspect = engine.inspect_exec(exec_id).await?;
        if !inspect.running {
            return Ok(inspect.exit_code);
        }
        tokio::time::sleep(EXEC_EXIT_POLL_INTERVAL).await;
    }
    Ok(None)
}

/// Relay run inside the sandbox that joins the exec's stdio to a local port.
fn port_forward_command(port: i32) -> Vec<String> {
    vec![
        "socat".to_string(),
        "-".to_string(),
        format!("TCP4:localhost:{}", port),
    ]
}

/// Client to engine: stdin bytes and resize events.
async fn pump_input(
    engine: Arc<dyn EngineClient>,
    mut input: mpsc::Receiver<StreamFrame>,
    mut stdin: InputSink,
    target: EngineTarget,
) {
    let mut stdin_open = true;
    while let Some(frame) = input.recv().await {
        match frame {
            StreamFrame::Stdin(data) if data.is_empty() => {
                if stdin_open {
                    stdin_open = false;
                    let _ = stdin.shutdown().await;
                }
            }
            StreamFrame::Stdin(data) => {
                if !stdin_open {
                    continue;
                }
                let written = async {
                    stdin.write_all(&data).await?;
                    stdin.flush().await
                };
                if let Err(e) = written.await {
                    debug!(error = %e, "Process stdin closed");
                    stdin_open = false;
                }
            }
            StreamFrame::Resize(size) => resize(engine.as_ref(), &target, size).await,
            other => debug!(frame = ?other, "Ignoring unexpected client frame"),
        }
    }
}

async fn resize(engine: &dyn EngineClient, target: &EngineTarget, size: TerminalSize) {
    let result = match target {
        EngineTarget::Exec(id) => engine.resize_exec_tty(id, size).await,
        EngineTarget::Container(id) => engine.resize_container_tty(id, size).await,
    };
    if let Err(e) = result {
        warn!(error = %e, width = size.width, height = size.height, "Terminal resize failed");
    }
}

/// Engine to client: output chunks as stdout/stderr frames. A TTY has a
/// single raw stream, reported as stdout.
async fn pump_output(
    mut engine_out: OutputStream,
    output: mpsc::Sender<StreamFrame>,
    tty: bool,
    container_id: String,
) -> Result<()> {
    while let Some(chunk) = engine_out.next().await {
        let chunk = chunk.map_err(|e| e.classify(EntityKind::Container, &container_id))?;
        let data = chunk.data.to_vec();
        let frame = match chunk.stream {
            LogStream::Stderr if !tty => StreamFrame::Stderr(data),
            _ => StreamFrame::Stdout(data),
        };
        if output.send(frame).await.is_err() {
            debug!(container_id = %container_id, "Client gone, dropping engine output");
            break;
        }
    }
    Ok(())
}

/// Accepts streaming connections from kubelet.
pub struct StreamingServer {
    router: StreamingRouter,
}

impl StreamingServer {
    pub fn new(router: StreamingRouter) -> Self {
        Self { router }
    }

    /// Bind the router's address and serve until the listener fails.
    pub async fn serve(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.router.addr()).await?;
        self.serve_listener(listener).await
    }

    pub async fn serve_listener(self, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "CRI streaming server listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let router = self.router.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, router).await {
                    warn!(peer = %peer, error = %e, "Streaming connection failed");
                }
            });
        }
    }
}

/// Handle an incoming connection: `GET /<kind>/<token>`, then the upgrade.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: StreamingRouter,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let Some(head) = read_request_head(&mut reader).await? else {
        return send_response(&mut write_half, 400, "Bad Request").await;
    };

    // Parse request line: GET /exec/<token> HTTP/1.1
    let path = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("");
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    let (kind, token) = match segments.as_slice() {
        [kind, token] => match SessionKind::from_path(kind) {
            Some(kind) => (kind, *token),
            None => return send_response(&mut write_half, 404, "Not Found").await,
        },
        _ => return send_response(&mut write_half, 404, "Not Found").await,
    };

    let session = match router.consume(token) {
        Ok(session) => session,
        Err(e) => {
            debug!(peer = %peer, error = %e, "Rejected streaming token");
            return send_response(&mut write_half, 404, "Session not found or expired").await;
        }
    };
    if session.kind != kind {
        return send_response(&mut write_half, 400, "Session kind mismatch").await;
    }

    info!(
        peer = %peer,
        kind = kind.as_str(),
        container_id = %session.container_id,
        "Streaming connection accepted"
    );

    let upgrade = "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: dockershim-stream/1\r\n\r\n";
    write_half.write_all(upgrade.as_bytes()).await?;

    let (in_tx, in_rx) = mpsc::channel(FRAME_QUEUE);
    let (out_tx, mut out_rx) = mpsc::channel::<StreamFrame>(FRAME_QUEUE);

    let reader_task = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => {
                    if in_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Streaming read ended");
                    break;
                }
            }
        }
    });

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &frame).await {
                debug!(error = %e, "Streaming write ended");
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    if let Err(e) = router.serve_session(session, in_rx, out_tx).await {
        warn!(peer = %peer, error = %e, "Streaming session failed");
    }
    reader_task.abort();
    let _ = writer_task.await;
    Ok(())
}

/// Read up to the blank line ending the request head. `None` when the peer
/// closed early or sent an oversized head. At most `MAX_REQUEST_HEAD` bytes
/// are consumed from `reader`.
async fn read_request_head<R>(reader: &mut R) -> std::io::Result<Option<String>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut limited = (&mut *reader).take(MAX_REQUEST_HEAD as u64);
    let mut head = Vec::new();
    loop {
        let start = head.len();
        let n = limited.read_until(b'\n', &mut head).await?;
        if n == 0 || head.last() != Some(&b'\n') {
            return Ok(None);
        }
        let line = &head[start..];
        if line == b"\r\n" || line == b"\n" {
            head.truncate(start);
            return Ok(String::from_utf8(head).ok());
        }
    }
}

/// Send a simple HTTP response.
async fn send_response<W>(stream: &mut W, status: u16, body: &str) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Error",
    };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        status_text,
        body.len(),
        body,
    );
    stream.write_all(response.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CreateContainerConfig, FakeEngine};

    fn config() -> StreamingConfig {
        StreamingConfig {
            addr: "127.0.0.1:10010".parse().unwrap(),
            token_ttl_secs: 60,
            max_inflight: 4,
            teardown_grace_ms: 2000,
        }
    }

    async fn running(engine: &FakeEngine, name: &str) -> String {
        engine.add_image("busybox:latest", 1);
        let id = engine
            .create_container(CreateContainerConfig {
                name: name.to_string(),
                image: "busybox:latest".to_string(),
                open_stdin: true,
                ..Default::default()
            })
            .await
            .unwrap();
        engine.start_container(&id).await.unwrap();
        id
    }

    fn token_of(url: &str) -> &str {
        url.rsplit('/').next().unwrap()
    }

    fn echo(container: &str) -> StreamingSession {
        StreamingSession::exec(
            container,
            vec!["echo".to_string(), "hi".to_string()],
            false,
            false,
            true,
            true,
        )
    }

    #[test]
    fn test_session_kind_paths() {
        for kind in [SessionKind::Exec, SessionKind::Attach, SessionKind::PortForward] {
            assert_eq!(SessionKind::from_path(kind.as_str()), Some(kind));
        }
        assert_eq!(SessionKind::from_path("shell"), None);
    }

    #[tokio::test]
    async fn test_issue_url() {
        let router = StreamingRouter::new(Arc::new(FakeEngine::new()), &config());
        let url = router.issue(echo("c1")).unwrap();
        assert!(url.starts_with("http://127.0.0.1:10010/exec/"));
        assert_eq!(token_of(&url).len(), 32);

        let url = router
            .issue(StreamingSession::port_forward("sb1", vec![8080]))
            .unwrap();
        assert!(url.contains("/portforward/"));
        assert_eq!(router.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_issue_validates_session() {
        let router = StreamingRouter::new(Arc::new(FakeEngine::new()), &config());
        let err = router
            .issue(StreamingSession::port_forward("sb1", vec![]))
            .unwrap_err();
        assert!(matches!(err, ShimError::InvalidArgument(_)));
        let err = router
            .issue(StreamingSession::exec("c1", vec![], false, false, true, true))
            .unwrap_err();
        assert!(matches!(err, ShimError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_port_forward_single_port() {
        let router = StreamingRouter::new(Arc::new(FakeEngine::new()), &config());
        for ports in [vec![8080, 9090], vec![0], vec![70000]] {
            let err = router
                .issue(StreamingSession::port_forward("sb1", ports))
                .unwrap_err();
            assert!(matches!(err, ShimError::InvalidArgument(_)));
        }
        assert_eq!(router.pending_count(), 0);
        router
            .issue(StreamingSession::port_forward("sb1", vec![8080]))
            .unwrap();
    }

    #[tokio::test]
    async fn test_token_is_single_use() {
        let router = StreamingRouter::new(Arc::new(FakeEngine::new()), &config());
        let url = router.issue(echo("c1")).unwrap();
        let token = token_of(&url);

        assert_eq!(router.consume(token).unwrap(), echo("c1"));
        assert!(router.consume(token).unwrap_err().is_not_found());
        assert!(router.consume("never-issued").unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_expires_unused() {
        let router = StreamingRouter::new(Arc::new(FakeEngine::new()), &config());
        let url = router.issue(echo("c1")).unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        let err = router.consume(token_of(&url)).unwrap_err();
        assert!(matches!(err, ShimError::NotFound { kind: EntityKind::Session, .. }));
        // Consumption failed but the token is still gone.
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inflight_limit_and_purge() {
        let router = StreamingRouter::new(Arc::new(FakeEngine::new()), &config());
        for _ in 0..4 {
            router.issue(echo("c1")).unwrap();
        }
        assert!(matches!(router.issue(echo("c1")), Err(ShimError::Unavailable(_))));

        tokio::time::advance(Duration::from_secs(61)).await;
        router.issue(echo("c1")).unwrap();
        assert_eq!(router.pending_count(), 1);
    }

    #[test]
    fn test_concurrent_issue_respects_limit() {
        let router = StreamingRouter::new(Arc::new(FakeEngine::new()), &config());
        let issued: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..32)
                .map(|_| scope.spawn(|| router.issue(echo("c1")).is_ok()))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap() as usize)
                .sum()
        });
        assert_eq!(issued, 4);
        assert_eq!(router.pending_count(), 4);
    }

    #[tokio::test]
    async fn test_concurrent_consume_single_winner() {
        let router = StreamingRouter::new(Arc::new(FakeEngine::new()), &config());
        let url = router.issue(echo("c1")).unwrap();
        let token = token_of(&url).to_string();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let router = router.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move { router.consume(&token).is_ok() }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    async fn run_session(
        router: &StreamingRouter,
        session: StreamingSession,
        frames: Vec<StreamFrame>,
    ) -> (Result<()>, Vec<StreamFrame>) {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        for frame in frames {
            in_tx.send(frame).await.unwrap();
        }
        let result = router.serve_session(session, in_rx, out_tx).await;
        drop(in_tx);
        let mut received = Vec::new();
        while let Some(frame) = out_rx.recv().await {
            received.push(frame);
        }
        (result, received)
    }

    #[tokio::test]
    async fn test_exec_session_output_and_status() {
        let engine = FakeEngine::new();
        let id = running(&engine, "c1").await;
        let router = StreamingRouter::new(Arc::new(engine), &config());

        let (result, frames) = run_session(&router, echo(&id), vec![]).await;
        result.unwrap();
        assert_eq!(
            frames,
            vec![
                StreamFrame::Stdout(b"hi\n".to_vec()),
                StreamFrame::Status(SessionStatus::exited(0)),
            ]
        );
    }

    #[tokio::test]
    async fn test_exec_stdin_eof() {
        let engine = FakeEngine::new();
        let id = running(&engine, "c1").await;
        let router = StreamingRouter::new(Arc::new(engine), &config());

        let session = StreamingSession::exec(&id, vec!["cat".to_string()], false, true, true, true);
        let (result, frames) = run_session(
            &router,
            session,
            vec![StreamFrame::Stdin(b"abc".to_vec()), StreamFrame::Stdin(Vec::new())],
        )
        .await;
        result.unwrap();
        assert_eq!(frames.first(), Some(&StreamFrame::Stdout(b"abc".to_vec())));
        assert_eq!(frames.last(), Some(&StreamFrame::Status(SessionStatus::exited(0))));
    }

    #[tokio::test]
    async fn test_exec_in_stopped_container_fails() {
        let engine = FakeEngine::new();
        let id = running(&engine, "c1").await;
        engine.exit_container(&id, 0, false);
        let router = StreamingRouter::new(Arc::new(engine), &config());

        let (result, frames) = run_session(&router, echo(&id), vec![]).await;
        assert!(matches!(result, Err(ShimError::Conflict { .. })));
        assert!(matches!(frames.as_slice(), [StreamFrame::Status(s)] if s.error.is_some()));
    }

    #[tokio::test]
    async fn test_port_forward_relays_bytes() {
        let engine = FakeEngine::new();
        let infra = running(&engine, "k8s_POD_web").await;
        let router = StreamingRouter::new(Arc::new(engine.clone()), &config());

        let (result, frames) = run_session(
            &router,
            StreamingSession::port_forward(&infra, vec![8080]),
            vec![StreamFrame::Stdin(b"ping".to_vec()), StreamFrame::Stdin(Vec::new())],
        )
        .await;
        result.unwrap();
        assert_eq!(frames, vec![StreamFrame::Stdout(b"ping".to_vec())]);
        assert!(engine
            .calls()
            .iter()
            .any(|c| c == &format!("create_exec {}", infra)));
    }

    #[tokio::test]
    async fn test_attach_resize_and_exit() {
        let engine = FakeEngine::new();
        let id = running(&engine, "c1").await;
        let router = StreamingRouter::new(Arc::new(engine.clone()), &config());

        let size = TerminalSize {
            width: 120,
            height: 40,
        };
        let session = StreamingSession::attach(&id, true, true, true, false);
        let (result, frames) = run_session(
            &router,
            session,
            vec![
                StreamFrame::Resize(size),
                StreamFrame::Stdin(b"echo hi\n".to_vec()),
                StreamFrame::Stdin(b"exit 3\n".to_vec()),
            ],
        )
        .await;
        result.unwrap();
        assert_eq!(engine.last_resize(&id), Some(size));
        assert_eq!(
            frames,
            vec![
                StreamFrame::Stdout(b"hi\n".to_vec()),
                StreamFrame::Status(SessionStatus::exited(3)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_close_tears_down_within_grace() {
        let engine = FakeEngine::new();
        let id = running(&engine, "c1").await;
        let router = StreamingRouter::new(Arc::new(engine), &config());

        let (in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, _out_rx) = mpsc::channel(16);
        drop(in_tx);

        let started = Instant::now();
        let session = StreamingSession::exec(
            &id,
            vec!["sleep".to_string(), "600".to_string()],
            false,
            false,
            true,
            true,
        );
        router.serve_session(session, in_rx, out_tx).await.unwrap();
        assert!(started.elapsed() <= Duration::from_secs(3));
    }

    async fn read_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if stream.read(&mut byte).await.unwrap() == 0 {
                break;
            }
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    #[tokio::test]
    async fn test_server_upgrade_and_replay() {
        let engine = FakeEngine::new();
        let id = running(&engine, "c1").await;
        let router = StreamingRouter::new(Arc::new(engine), &config());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(StreamingServer::new(router.clone()).serve_listener(listener));

        let url = router.issue(echo(&id)).unwrap();
        let request = format!("GET /exec/{} HTTP/1.1\r\nHost: x\r\n\r\n", token_of(&url));

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(request.as_bytes()).await.unwrap();
        assert!(read_head(&mut conn).await.starts_with("HTTP/1.1 101"));
        assert_eq!(
            read_frame(&mut conn).await.unwrap(),
            Some(StreamFrame::Stdout(b"hi\n".to_vec()))
        );
        assert_eq!(
            read_frame(&mut conn).await.unwrap(),
            Some(StreamFrame::Status(SessionStatus::exited(0)))
        );

        let mut replay = TcpStream::connect(addr).await.unwrap();
        replay.write_all(request.as_bytes()).await.unwrap();
        assert!(read_head(&mut replay).await.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn test_server_rejects_unknown_path() {
        let router = StreamingRouter::new(Arc::new(FakeEngine::new()), &config());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(StreamingServer::new(router).serve_listener(listener));

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"GET /shell/abc HTTP/1.1\r\n\r\n").await.unwrap();
        assert!(read_head(&mut conn).await.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn test_request_head_parsed() {
        let data = b"GET /exec/abc HTTP/1.1\r\nHost: node\r\n\r\nrest";
        let mut reader: &[u8] = data;
        let head = read_request_head(&mut reader).await.unwrap().unwrap();
        assert_eq!(head, "GET /exec/abc HTTP/1.1\r\nHost: node\r\n");
        assert_eq!(reader, b"rest");
    }

    #[tokio::test]
    async fn test_oversized_request_line_is_bounded() {
        let data = vec![b'A'; 4 * 1024 * 1024];
        let mut reader: &[u8] = &data;
        assert!(read_request_head(&mut reader).await.unwrap().is_none());
        assert_eq!(reader.len(), data.len() - MAX_REQUEST_HEAD);
    }

    #[tokio::test]
    async fn test_oversized_head_across_lines() {
        let mut data = b"GET /exec/abc HTTP/1.1\r\n".to_vec();
        for _ in 0..1000 {
            data.extend_from_slice(b"X-Filler: 0123456789\r\n");
        }
        data.extend_from_slice(b"\r\n");
        let mut reader: &[u8] = &data;
        assert!(read_request_head(&mut reader).await.unwrap().is_none());
    }
}
