//! Container log retrieval.
//!
//! Output is pulled from the engine and split into separate stdout and stderr
//! sinks. A single byte budget covers both sinks together; running out of it
//! ends the retrieval successfully.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use dockershim_core::log::{MAX_TAIL_LOG_BYTES, MAX_TAIL_LOG_LINES};
use dockershim_core::{EntityKind, LogDriver, LogEntry, LogOptions, LogStream, Result, ShimError};

use crate::engine::{EngineClient, LogRequest};

/// Byte budget shared by both output sinks.
#[derive(Debug)]
struct SharedBudget {
    remaining: Option<u64>,
}

impl SharedBudget {
    fn new(limit: Option<u64>) -> Self {
        Self { remaining: limit }
    }

    /// Reserve up to `len` bytes; returns how many may be written.
    fn take(&mut self, len: usize) -> usize {
        match self.remaining.as_mut() {
            None => len,
            Some(left) => {
                let granted = (*left).min(len as u64);
                *left -= granted;
                granted as usize
            }
        }
    }

    fn exhausted(&self) -> bool {
        self.remaining == Some(0)
    }
}

/// Retrieves and tails container logs through the engine.
#[derive(Clone)]
pub struct LogManager {
    engine: Arc<dyn EngineClient>,
}

impl LogManager {
    pub fn new(engine: Arc<dyn EngineClient>) -> Self {
        Self { engine }
    }

    /// Copy a container's logs into `stdout` and `stderr`.
    ///
    /// With `follow` set this keeps streaming until the container exits or
    /// `stop` resolves. Dropping the returned future also stops it. TTY
    /// containers have no separate stderr; all output goes to `stdout`.
    pub async fn get_container_logs<O, E, S>(
        &self,
        container_id: &str,
        opts: &LogOptions,
        stdout: &mut O,
        stderr: &mut E,
        stop: S,
    ) -> Result<()>
    where
        O: AsyncWrite + Unpin + Send,
        E: AsyncWrite + Unpin + Send,
        S: Future<Output = ()> + Send,
    {
        let mut budget = SharedBudget::new(opts.byte_limit());
        if budget.exhausted() {
            return Ok(());
        }

        let details = self
            .engine
            .inspect_container(container_id)
            .await
            .map_err(|e| e.classify(EntityKind::Container, container_id))?;

        let cutoff = opts.since_instant(Utc::now());
        let request = LogRequest {
            since: cutoff.map(|t| t.timestamp()).unwrap_or(0),
            tail: opts.tail(),
            timestamps: opts.timestamps,
            follow: opts.follow,
        };
        debug!(container_id, ?request, "Retrieving container logs");

        let mut output = self
            .engine
            .logs(container_id, request)
            .await
            .map_err(|e| e.classify(EntityKind::Container, container_id))?;

        tokio::pin!(stop);
        loop {
            let chunk = tokio::select! {
                chunk = output.next() => chunk,
                _ = &mut stop => {
                    debug!(container_id, "Log retrieval stopped by caller");
                    break;
                }
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| e.classify(EntityKind::Container, container_id))?;

            let stream = if details.tty {
                LogStream::Stdout
            } else {
                chunk.stream
            };
            let entry = LogEntry::new(stream, chunk.data.to_vec(), opts.timestamps);
            // The engine filters on whole seconds.
            if cutoff.is_some_and(|cutoff| entry.is_before(cutoff)) {
                continue;
            }

            let allowed = budget.take(entry.payload.len());
            let payload = &entry.payload[..allowed];
            let written = match entry.stream {
                LogStream::Stdout => stdout.write_all(payload).await,
                LogStream::Stderr => stderr.write_all(payload).await,
            };
            written.map_err(|e| {
                ShimError::internal(
                    EntityKind::Container,
                    container_id,
                    format!("writing {} logs: {}", entry.stream, e),
                )
            })?;

            if budget.exhausted() {
                debug!(container_id, "Log byte limit reached");
                break;
            }
        }

        stdout.flush().await.ok();
        stderr.flush().await.ok();
        Ok(())
    }

    /// Last lines of a container's output, bounded in lines and bytes.
    ///
    /// Used for termination messages. Failures give an empty string.
    pub async fn get_container_log_tail(&self, container_id: &str) -> String {
        let opts = LogOptions {
            tail_lines: Some(MAX_TAIL_LOG_LINES),
            ..Default::default()
        };
        let ring = RingBuffer::new(MAX_TAIL_LOG_BYTES);
        let mut out = ring.clone();
        let mut err = ring.clone();
        if let Err(e) = self
            .get_container_logs(container_id, &opts, &mut out, &mut err, std::future::pending())
            .await
        {
            warn!(container_id, error = %e, "Failed to read container log tail");
            return String::new();
        }
        ring.contents()
    }

    /// Whether the engine's logging driver supports pulling logs back.
    pub async fn is_cri_supported_log_driver(&self) -> Result<bool> {
        let info = self
            .engine
            .info()
            .await
            .map_err(|e| e.classify(EntityKind::Engine, "info"))?;
        let driver = info
            .logging_driver
            .parse::<LogDriver>()
            .unwrap_or_else(|never| match never {});
        debug!(driver = %driver, "Engine logging driver");
        Ok(driver.supports_cri_retrieval())
    }
}

/// Fixed-capacity byte ring. Writes past capacity evict the oldest bytes.
#[derive(Clone)]
struct RingBuffer {
    inner: Arc<Mutex<VecDeque<u8>>>,
    capacity: usize,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn contents(&self) -> String {
        let buf = self.inner.lock();
        let (a, b) = buf.as_slices();
        let mut bytes = Vec::with_capacity(buf.len());
        bytes.extend_from_slice(a);
        bytes.extend_from_slice(b);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl AsyncWrite for RingBuffer {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let mut buf = self.inner.lock();
        let keep = data.len().min(self.capacity);
        let overflow = (buf.len() + keep).saturating_sub(self.capacity);
        buf.drain(..overflow);
        buf.extend(&data[data.len() - keep..]);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CreateContainerConfig, EngineError, FakeEngine, OutputChunk};
    use chrono::TimeZone;
    use std::time::Duration;

    async fn setup(tty: bool) -> (FakeEngine, LogManager, String) {
        let engine = FakeEngine::new();
        engine.add_image("busybox:latest", 1);
        let id = engine
            .create_container(CreateContainerConfig {
                name: "logger".to_string(),
                image: "busybox:latest".to_string(),
                tty,
                ..Default::default()
            })
            .await
            .unwrap();
        engine.start_container(&id).await.unwrap();
        let manager = LogManager::new(Arc::new(engine.clone()));
        (engine, manager, id)
    }

    async fn collect(manager: &LogManager, id: &str, opts: LogOptions) -> (Vec<u8>, Vec<u8>) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        manager
            .get_container_logs(id, &opts, &mut out, &mut err, std::future::pending())
            .await
            .unwrap();
        (out, err)
    }

    #[test]
    fn test_shared_budget() {
        let mut budget = SharedBudget::new(Some(5));
        assert_eq!(budget.take(3), 3);
        assert_eq!(budget.take(3), 2);
        assert!(budget.exhausted());
        assert_eq!(budget.take(1), 0);

        let mut unlimited = SharedBudget::new(None);
        assert_eq!(unlimited.take(1 << 20), 1 << 20);
        assert!(!unlimited.exhausted());
    }

    #[tokio::test]
    async fn test_streams_are_split() {
        let (engine, manager, id) = setup(false).await;
        engine.emit_output(&id, OutputChunk::stdout("out\n"));
        engine.emit_output(&id, OutputChunk::stderr("err\n"));

        let (out, err) = collect(&manager, &id, LogOptions::default()).await;
        assert_eq!(out, b"out\n");
        assert_eq!(err, b"err\n");
    }

    #[tokio::test]
    async fn test_byte_limit_is_shared_and_succeeds() {
        let (engine, manager, id) = setup(false).await;
        engine.emit_output(&id, OutputChunk::stdout("aaaa"));
        engine.emit_output(&id, OutputChunk::stderr("bbbb"));
        engine.emit_output(&id, OutputChunk::stdout("cccc"));

        for limit in 0..=12i64 {
            let (out, err) = collect(
                &manager,
                &id,
                LogOptions {
                    limit_bytes: Some(limit),
                    ..Default::default()
                },
            )
            .await;
            assert_eq!((out.len() + err.len()) as i64, limit.min(12));
        }

        let (out, err) = collect(
            &manager,
            &id,
            LogOptions {
                limit_bytes: Some(6),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(out, b"aaaa");
        assert_eq!(err, b"bb");
    }

    #[tokio::test]
    async fn test_absolute_since_wins() {
        let (engine, manager, id) = setup(false).await;
        let old = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let newer = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        engine.emit_output_at(&id, OutputChunk::stdout("old\n"), old);
        engine.emit_output_at(&id, OutputChunk::stdout("new\n"), newer);

        // The relative cutoff alone would exclude both lines.
        let (out, _) = collect(
            &manager,
            &id,
            LogOptions {
                since_seconds: Some(10),
                since_time: Some(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(out, b"new\n");
    }

    #[tokio::test]
    async fn test_since_time_sub_second() {
        let (engine, manager, id) = setup(false).await;
        let second = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        engine.emit_output_at(
            &id,
            OutputChunk::stdout("early\n"),
            second + chrono::Duration::milliseconds(200),
        );
        engine.emit_output_at(
            &id,
            OutputChunk::stdout("late\n"),
            second + chrono::Duration::milliseconds(800),
        );

        let (out, _) = collect(
            &manager,
            &id,
            LogOptions {
                since_time: Some(second + chrono::Duration::milliseconds(500)),
                timestamps: true,
                ..Default::default()
            },
        )
        .await;
        let out = String::from_utf8(out).unwrap();
        assert!(out.ends_with(" late\n"), "{}", out);
        assert!(!out.contains("early"));
    }

    #[tokio::test]
    async fn test_tail_lines() {
        let (engine, manager, id) = setup(false).await;
        for line in ["1\n", "2\n", "3\n"] {
            engine.emit_output(&id, OutputChunk::stdout(line));
        }
        let (out, _) = collect(
            &manager,
            &id,
            LogOptions {
                tail_lines: Some(1),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(out, b"3\n");
    }

    #[tokio::test]
    async fn test_tty_output_goes_to_stdout() {
        let (engine, manager, id) = setup(true).await;
        engine.emit_output(&id, OutputChunk::stderr("prompt$ "));
        let (out, err) = collect(&manager, &id, LogOptions::default()).await;
        assert_eq!(out, b"prompt$ ");
        assert!(err.is_empty());
    }

    #[tokio::test]
    async fn test_follow_until_exit() {
        let (engine, manager, id) = setup(false).await;
        engine.emit_output(&id, OutputChunk::stdout("before\n"));

        let writer = engine.clone();
        let target = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.emit_output(&target, OutputChunk::stdout("after\n"));
            writer.exit_container(&target, 0, false);
        });

        let (out, _) = collect(
            &manager,
            &id,
            LogOptions {
                follow: true,
                ..Default::default()
            },
        )
        .await;
        assert_eq!(out, b"before\nafter\n");
    }

    #[tokio::test]
    async fn test_follow_stops_on_signal() {
        let (engine, manager, id) = setup(false).await;
        engine.emit_output(&id, OutputChunk::stdout("line\n"));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let stop = async move {
            let _ = rx.await;
        };

        let task_manager = manager.clone();
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let opts = LogOptions {
                follow: true,
                ..Default::default()
            };
            task_manager
                .get_container_logs(&task_id, &opts, &mut out, &mut err, stop)
                .await
                .map(|_| out)
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(()).unwrap();
        let out = handle.await.unwrap().unwrap();
        assert_eq!(out, b"line\n");
    }

    #[tokio::test]
    async fn test_missing_container() {
        let engine = FakeEngine::new();
        let manager = LogManager::new(Arc::new(engine));
        let mut out = Vec::new();
        let mut err = Vec::new();
        let result = manager
            .get_container_logs(
                "nope",
                &LogOptions::default(),
                &mut out,
                &mut err,
                std::future::pending(),
            )
            .await;
        assert!(matches!(result, Err(ShimError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_log_tail_bounds() {
        let (engine, manager, id) = setup(false).await;
        for n in 0..200 {
            engine.emit_output(&id, OutputChunk::stdout(format!("line {:03}\n", n)));
        }
        let tail = manager.get_container_log_tail(&id).await;
        assert_eq!(tail.lines().count(), MAX_TAIL_LOG_LINES as usize);
        assert!(tail.ends_with("line 199\n"));

        let big = "x".repeat(1000);
        for _ in 0..5 {
            engine.emit_output(&id, OutputChunk::stdout(format!("{}\n", big)));
        }
        let tail = manager.get_container_log_tail(&id).await;
        assert_eq!(tail.len(), MAX_TAIL_LOG_BYTES);
    }

    #[tokio::test]
    async fn test_log_tail_failure_is_empty() {
        let (engine, manager, id) = setup(false).await;
        engine.emit_output(&id, OutputChunk::stdout("x\n"));
        engine.inject_error("logs", EngineError::Transport("reset".to_string()));
        assert_eq!(manager.get_container_log_tail(&id).await, "");
    }

    #[tokio::test]
    async fn test_log_driver_support() {
        let engine = FakeEngine::new();
        let manager = LogManager::new(Arc::new(engine.clone()));
        assert!(manager.is_cri_supported_log_driver().await.unwrap());

        engine.set_logging_driver("journald");
        assert!(!manager.is_cri_supported_log_driver().await.unwrap());
    }

    #[test]
    fn test_ring_buffer_keeps_newest() {
        let mut ring = RingBuffer::new(4);
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        let _ = Pin::new(&mut ring).poll_write(&mut cx, b"abc");
        let _ = Pin::new(&mut ring).poll_write(&mut cx, b"def");
        assert_eq!(ring.contents(), "cdef");
        let _ = Pin::new(&mut ring).poll_write(&mut cx, b"0123456789");
        assert_eq!(ring.contents(), "6789");
    }
}
