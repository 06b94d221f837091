//! Worker process lifecycle: spawn, readiness probe, stop.
//!
//! Starting is bounded: each attempt spawns a fresh worker and waits for a
//! successful `api/version` reply under the reserved probe id. Only a worker
//! that answered is handed to the engine. Crash restarts and their backoff
//! are driven by the engine; this module only knows how to bring one worker up
//! or take it down.

use std::ffi::OsString;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;

use crate::error::BridgeError;
use crate::job::{JobId, JobPayload};
use crate::protocol::{self, Incoming};
use crate::transport::{Connection, Transport, TransportEvent};
use crate::types::{BridgeConfig, ChannelKind, TimeoutConfig, VersionInfo, WorkerConfig};

/// Pause between TCP connect attempts while the worker opens its port.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Produces a connection to a new worker.
///
/// [`ProcessSpawner`] launches the real process. Tests plug in an in-memory worker.
pub trait Spawner: Send + Sync + 'static {
    fn spawn(&self) -> impl Future<Output = Result<Connection>> + Send;
}

/// Launches the configured worker command and connects to it.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    worker: WorkerConfig,
    connect_timeout: Duration,
}

impl ProcessSpawner {
    #[must_use]
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            worker: config.worker.clone(),
            connect_timeout: config.timeouts.startup(),
        }
    }

    /// Arguments after the program: runtime args, `-jar`, server flags, port, then extras verbatim.
    fn command_args(&self, port: Option<u16>) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.worker.jvm_args.iter().map(OsString::from).collect();
        if let Some(jar) = &self.worker.jar {
            args.push("-jar".into());
            args.push(jar.into());
        }
        args.extend(self.worker.server_args.iter().map(OsString::from));
        if let Some(port) = port {
            args.push(port.to_string().into());
        }
        args.extend(self.worker.extra_args.iter().map(OsString::from));
        args
    }

    fn command(&self, port: Option<u16>) -> Result<Command> {
        let program = which::which(&self.worker.program)
            .with_context(|| format!("{} not found in PATH", self.worker.program))?;
        if let Some(jar) = &self.worker.jar
            && !jar.is_file()
        {
            bail!("worker jar {} does not exist", jar.display());
        }

        let mut cmd = Command::new(program);
        cmd.args(self.command_args(port))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        Ok(cmd)
    }

    fn spawn_stdio(&self) -> Result<Connection> {
        let mut child = self
            .command(None)?
            .spawn()
            .with_context(|| format!("spawning {}", self.worker.program))?;
        let stdout = child.stdout.take().context("no stdout from child")?;
        let stdin = child.stdin.take().context("no stdin from child")?;
        Ok(Connection::new(stdout, stdin).with_child(child))
    }

    async fn spawn_tcp(&self) -> Result<Connection> {
        let port = free_port().await?;
        let mut cmd = self.command(Some(port))?;
        cmd.stdin(Stdio::null()).stdout(Stdio::null());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {}", self.worker.program))?;

        let deadline = tokio::time::Instant::now() + self.connect_timeout;
        let stream = loop {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(stream) => break stream,
                Err(e) if tokio::time::Instant::now() < deadline => {
                    if let Some(status) = child.try_wait().context("polling worker")? {
                        bail!("worker exited with {status} before accepting connections");
                    }
                    tracing::trace!(port, "Worker not listening yet: {e}");
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("connecting to worker on port {port}"));
                }
            }
        };
        stream.set_nodelay(true).context("configuring worker socket")?;
        let (read, write) = stream.into_split();
        Ok(Connection::new(read, write).with_child(child))
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&self) -> impl Future<Output = Result<Connection>> + Send {
        async move {
            match self.worker.channel {
                ChannelKind::Stdio => self.spawn_stdio(),
                ChannelKind::Tcp => self.spawn_tcp().await,
            }
        }
    }
}

/// Ask the OS for a loopback port nobody is listening on.
async fn free_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("reserving a local port")?;
    Ok(listener.local_addr().context("reading local port")?.port())
}

/// A worker that answered its readiness probe.
pub(crate) struct Started {
    pub transport: Transport,
    pub version: Option<VersionInfo>,
}

/// Bring up one ready worker, trying up to `start_attempts` times.
pub(crate) async fn start_worker<S: Spawner>(
    spawner: &S,
    timeouts: TimeoutConfig,
) -> Result<Started, BridgeError> {
    let attempts = timeouts.start_attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match try_start(spawner, timeouts.startup()).await {
            Ok(started) => {
                tracing::info!(attempt, "Worker ready");
                return Ok(started);
            }
            Err(e) => {
                tracing::warn!(attempt, "Worker start attempt failed: {e:#}");
                last_error = Some(e);
            }
        }
    }
    Err(BridgeError::Startup(last_error.map_or_else(
        || "no start attempts were made".to_string(),
        |e| format!("{e:#}"),
    )))
}

async fn try_start<S: Spawner>(spawner: &S, wait: Duration) -> Result<Started> {
    let connection = spawner.spawn().await.context("spawning worker")?;
    let mut transport = Transport::open(connection);
    match probe(&mut transport, wait).await {
        Ok(result) => Ok(Started {
            transport,
            version: serde_json::from_value(result).ok(),
        }),
        Err(e) => {
            transport.shutdown(Duration::ZERO).await;
            Err(e)
        }
    }
}

/// Send the readiness probe and wait for its reply. Other frames are ignored.
async fn probe(transport: &mut Transport, wait: Duration) -> Result<Value> {
    let frame = protocol::encode_request(JobId::PROBE, &JobPayload::Version)?;
    transport.send(frame).await?;

    let reply = tokio::time::timeout(wait, async {
        loop {
            match transport.next_event().await {
                TransportEvent::Frame(Incoming::Response { id, outcome }) if id == JobId::PROBE => {
                    return outcome.context("worker rejected the readiness probe");
                }
                TransportEvent::Frame(other) => {
                    tracing::debug!(?other, "Ignoring frame before worker is ready");
                }
                TransportEvent::Closed(reason) => {
                    bail!("worker exited before becoming ready: {reason}");
                }
            }
        }
    })
    .await;

    reply.map_err(|_| anyhow!("no readiness reply within {}s", wait.as_secs()))?
}

/// Ask the worker to exit, then close the channel. Never waits on a reply.
pub(crate) async fn stop_worker(mut transport: Transport, id: JobId, grace: Duration) {
    match protocol::encode_request(id, &JobPayload::Shutdown) {
        Ok(frame) => {
            if transport.send(frame).await.is_err() {
                tracing::debug!("Worker channel already closed at shutdown");
            }
        }
        Err(e) => tracing::warn!("Could not encode shutdown request: {e}"),
    }
    transport.shutdown(grace).await;
}
