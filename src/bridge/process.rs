//! Plugin process lifecycle
//!
//! [`PluginProcess::launch`] spawns a plugin binary, connects to it, runs the
//! handshake and hands back a process whose [`RpcClient`] is serving. The
//! child never outlives the handle: a failed launch kills and reaps it, a dead
//! connection kills it, and `close` kills it after the grace period.
//!
//! ## Endpoints
//!
//! - [`Endpoint::UnixSocket`] (default): the host listens on a fresh socket in
//!   a private temporary directory and passes its path to the plugin in
//!   `SNAPWIRE_ENDPOINT`. The plugin's stdout stays free for its own use.
//! - [`Endpoint::Stdio`]: frames travel over the child's stdin/stdout.

use crate::bridge::frame::{PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN};
use crate::bridge::host_runtime::{BridgeError, RpcClient};
use crate::bridge::io::HandshakeRequest;
use crate::capability::{
    CapabilityDescriptor, CapabilityKind, ExporterClient, ImporterClient, StorageClient,
};
use crate::config::BridgeConfig;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Environment variable naming the socket a plugin must connect to.
pub const ENDPOINT_ENV: &str = "SNAPWIRE_ENDPOINT";

/// Liveness of a plugin process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Launching,
    Handshaking,
    Serving,
    /// GOODBYE sent; in-flight calls finish, new calls are refused
    Draining,
    /// Terminal. A dead plugin is never resurrected.
    Dead,
}

/// Transport between host and plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endpoint {
    #[default]
    UnixSocket,
    Stdio,
}

/// How to start a plugin.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub kind: CapabilityKind,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    /// Handed to the capability implementation in the handshake
    pub config: BTreeMap<String, String>,
    pub endpoint: Endpoint,
    pub min_version: u32,
    pub max_version: u32,
    pub bridge: BridgeConfig,
}

impl LaunchOptions {
    pub fn new(kind: CapabilityKind) -> Self {
        Self {
            kind,
            args: Vec::new(),
            envs: Vec::new(),
            config: BTreeMap::new(),
            endpoint: Endpoint::default(),
            min_version: PROTOCOL_VERSION_MIN,
            max_version: PROTOCOL_VERSION_MAX,
            bridge: BridgeConfig::default(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn versions(mut self, min_version: u32, max_version: u32) -> Self {
        self.min_version = min_version;
        self.max_version = max_version;
        self
    }

    pub fn bridge(mut self, bridge: BridgeConfig) -> Self {
        self.bridge = bridge;
        self
    }

    fn handshake_request(&self) -> HandshakeRequest {
        HandshakeRequest {
            kind: self.kind,
            min_version: self.min_version,
            max_version: self.max_version,
            limits: self.bridge.limits(),
            config: self.config.clone(),
        }
    }
}

/// A running plugin and its connection.
pub struct PluginProcess {
    path: PathBuf,
    pid: Option<u32>,
    client: RpcClient,
    child: Arc<Mutex<Child>>,
    closing: Arc<AtomicBool>,
    grace_period: Duration,
    watchdog: JoinHandle<()>,
    _socket_dir: Option<tempfile::TempDir>,
}

impl std::fmt::Debug for PluginProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginProcess")
            .field("path", &self.path)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}

impl PluginProcess {
    /// Spawn `path`, connect, and negotiate capability and protocol version.
    pub async fn launch(path: impl AsRef<Path>, options: LaunchOptions) -> Result<Self, BridgeError> {
        let path = path.as_ref().to_path_buf();
        options
            .bridge
            .validate()
            .map_err(|reason| BridgeError::Launch(format!("invalid bridge config: {}", reason)))?;
        debug!(path = %path.display(), state = ?PluginState::Launching, endpoint = ?options.endpoint, "launching plugin");

        let mut command = Command::new(&path);
        command
            .args(&options.args)
            .envs(options.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let spawn_err =
            |e: std::io::Error| BridgeError::Launch(format!("failed to spawn '{}': {}", path.display(), e));

        let (child, client, socket_dir) = match options.endpoint {
            Endpoint::Stdio => {
                command
                    .env_remove(ENDPOINT_ENV)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped());
                let mut child = command.spawn().map_err(spawn_err)?;
                let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
                    (Some(stdin), Some(stdout)) => (stdin, stdout),
                    _ => {
                        reap(&mut child).await;
                        return Err(BridgeError::Launch("child stdio not captured".to_string()));
                    }
                };
                let client = handshake_child(&mut child, stdout, stdin, &options).await?;
                (child, client, None)
            }
            Endpoint::UnixSocket => {
                let dir = tempfile::Builder::new()
                    .prefix("snapwire-")
                    .tempdir()
                    .map_err(|e| BridgeError::Launch(format!("socket directory: {}", e)))?;
                let socket_path = dir
                    .path()
                    .join(format!("{}.sock", uuid::Uuid::new_v4().simple()));
                let listener = UnixListener::bind(&socket_path)
                    .map_err(|e| BridgeError::Launch(format!("bind {}: {}", socket_path.display(), e)))?;

                command
                    .env(ENDPOINT_ENV, &socket_path)
                    .stdin(Stdio::null())
                    .stdout(Stdio::inherit());
                let mut child = command.spawn().map_err(spawn_err)?;

                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted.map_err(|e| BridgeError::Launch(format!("accept: {}", e))),
                    status = child.wait() => Err(BridgeError::Launch(match status {
                        Ok(status) => format!("plugin exited before connecting ({})", status),
                        Err(e) => format!("plugin exited before connecting: {}", e),
                    })),
                    _ = tokio::time::sleep(options.bridge.handshake_timeout()) => {
                        Err(BridgeError::Launch("plugin did not connect in time".to_string()))
                    }
                };
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        reap(&mut child).await;
                        return Err(e);
                    }
                };

                let (rd, wr) = stream.into_split();
                let client = handshake_child(&mut child, rd, wr, &options).await?;
                (child, client, Some(dir))
            }
        };

        let pid = child.id();
        let child = Arc::new(Mutex::new(child));
        let closing = Arc::new(AtomicBool::new(false));
        let watchdog = tokio::spawn(watchdog(
            client.state_watch(),
            child.clone(),
            closing.clone(),
        ));

        info!(path = %path.display(), pid, capability = %options.kind, "plugin serving");

        Ok(Self {
            path,
            pid,
            client,
            child,
            closing,
            grace_period: options.bridge.grace_period(),
            watchdog,
            _socket_dir: socket_dir,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> PluginState {
        self.client.state()
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    pub fn descriptor(&self) -> &CapabilityDescriptor {
        self.client.descriptor()
    }

    fn expect_kind(&self, kind: CapabilityKind) -> Result<(), BridgeError> {
        let actual = self.descriptor().kind;
        if actual != kind {
            return Err(BridgeError::Protocol(format!(
                "plugin serves {}, not {}",
                actual, kind
            )));
        }
        Ok(())
    }

    pub fn exporter(&self) -> Result<ExporterClient, BridgeError> {
        self.expect_kind(CapabilityKind::Exporter)?;
        Ok(ExporterClient::new(self.client.clone()))
    }

    pub fn importer(&self) -> Result<ImporterClient, BridgeError> {
        self.expect_kind(CapabilityKind::Importer)?;
        Ok(ImporterClient::new(self.client.clone()))
    }

    pub fn storage(&self) -> Result<StorageClient, BridgeError> {
        self.expect_kind(CapabilityKind::Storage)?;
        Ok(StorageClient::new(self.client.clone()))
    }

    /// Kill the plugin outright. Outstanding calls fail with `PeerLost`.
    pub async fn kill(&self) -> Result<(), BridgeError> {
        let mut child = self.child.lock().await;
        child.start_kill()?;
        Ok(())
    }

    /// Send GOODBYE, wait up to the grace period for in-flight calls to drain
    /// and the process to exit, then kill it.
    pub async fn close(self) -> Result<ExitStatus, BridgeError> {
        self.closing.store(true, Ordering::SeqCst);
        self.client.goodbye();

        let mut child = self.child.lock().await;
        let status = match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(pid = self.pid, grace = ?self.grace_period, "plugin still running after GOODBYE, killing");
                child.kill().await?;
                child.wait().await?
            }
        };
        drop(child);

        let _ = tokio::time::timeout(self.grace_period, self.client.closed()).await;
        info!(path = %self.path.display(), pid = self.pid, %status, "plugin exited");
        Ok(status)
    }
}

impl Drop for PluginProcess {
    fn drop(&mut self) {
        self.watchdog.abort();
    }
}

async fn handshake_child<R, W>(
    child: &mut Child,
    reader: R,
    writer: W,
    options: &LaunchOptions,
) -> Result<RpcClient, BridgeError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    debug!(pid = child.id(), state = ?PluginState::Handshaking, "plugin connected");
    match RpcClient::attach(reader, writer, options.handshake_request(), &options.bridge).await {
        Ok(client) => Ok(client),
        Err(e) => {
            warn!(pid = child.id(), error = %e, "handshake failed, killing plugin");
            reap(child).await;
            Err(match e {
                e @ BridgeError::Handshake(_) => e,
                other => BridgeError::Handshake(other.to_string()),
            })
        }
    }
}

/// Kill and wait, so no zombie is left behind.
async fn reap(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!(error = %e, "kill after failed launch");
    }
}

/// Kill the child once its connection dies, unless the host is closing it.
async fn watchdog(
    mut state: watch::Receiver<PluginState>,
    child: Arc<Mutex<Child>>,
    closing: Arc<AtomicBool>,
) {
    if state.wait_for(|s| *s == PluginState::Dead).await.is_err() {
        return;
    }
    if closing.load(Ordering::SeqCst) {
        return;
    }
    let mut child = child.lock().await;
    if let Ok(None) = child.try_wait() {
        warn!(pid = child.id(), "connection lost, killing plugin");
        let _ = child.kill().await;
    }
}
