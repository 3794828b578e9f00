//! Host-side RPC dispatcher
//!
//! [`RpcClient`] owns one connection to one plugin and multiplexes any number
//! of concurrent calls over it.
//!
//! ## Architecture
//!
//! ```text
//! callers ──► RpcClient ──► writer task ──► connection ──► plugin
//!                 ▲                                          │
//!                 └──────── reader task ◄────────────────────┘
//! ```
//!
//! - A single writer task owns the sink, so every frame is written whole.
//! - A single reader task owns the source and routes frames by call id into
//!   the outstanding-call table.
//! - A heartbeat task pings the plugin; an unanswered ping is peer loss.
//!
//! ## Frame Routing (plugin → host)
//!
//! - RES/CHUNK/END/ERR: delivered to the call with that id; terminal frames
//!   remove the call from the table
//! - ACK: returns upload window credit to the call with that id
//! - LOG: re-emitted through `tracing`, never delivered
//! - HEARTBEAT: answers our ping, or is echoed back if the plugin pings us
//! - Frames for unknown ids are logged and dropped
//! - A cancelled call stays in the table until its terminal frame arrives so
//!   late frames are absorbed silently

use crate::bridge::frame::{codes, flags, CallId, Frame, FrameType, Limits, Method};
use crate::bridge::io::{
    handshake_async, AsyncFrameReader, AsyncFrameWriter, HandshakeRequest, HandshakeResult,
    WireError,
};
use crate::bridge::process::PluginState;
use crate::capability::CapabilityDescriptor;
use crate::config::BridgeConfig;
use crate::logging::emit_plugin_log;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors surfaced to callers of the bridge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Plugin connection lost")]
    PeerLost,

    #[error("Stream ended without END marker")]
    TruncatedStream,

    #[error("Size mismatch: declared {declared} bytes, got {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("Plugin returned error: [{code}] {message}")]
    Capability { code: String, message: String },

    #[error("Call cancelled")]
    Cancelled,

    #[error("Launch failed: {0}")]
    Launch(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Bridge is closed")]
    Closed,
}

impl BridgeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BridgeError::Capability { code, .. } if code == codes::NOT_FOUND)
    }

    /// Map a terminal ERR frame to the error the caller sees.
    pub fn from_err_frame(frame: &Frame) -> Self {
        let code = frame.error_code().unwrap_or(codes::HANDLER_ERROR);
        let message = frame.error_message().unwrap_or_default().to_string();
        match code {
            codes::CANCELLED => BridgeError::Cancelled,
            codes::PROTOCOL_ERROR => BridgeError::Protocol(message),
            codes::SIZE_MISMATCH => BridgeError::SizeMismatch {
                declared: frame.meta_u64("declared").unwrap_or_default(),
                actual: frame.meta_u64("actual").unwrap_or_default(),
            },
            _ => BridgeError::Capability {
                code: code.to_string(),
                message,
            },
        }
    }
}

impl From<WireError> for BridgeError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Handshake(msg) => BridgeError::Handshake(msg),
            WireError::Protocol(msg) => BridgeError::Protocol(msg),
            WireError::Malformed { reason, .. } => BridgeError::Protocol(reason),
            e @ WireError::FrameTooLarge { .. } => BridgeError::Protocol(e.to_string()),
            other => BridgeError::Io(other.to_string()),
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Io(e.to_string())
    }
}

// =============================================================================
// CALL OPTIONS
// =============================================================================

/// Cancellation signal a caller can trip from another task.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Abandon the call after this long. Falls back to the configured default.
    pub deadline: Option<Duration>,
    pub cancel: Option<CancelHandle>,
}

impl CallOptions {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

async fn wait_cancel(handle: Option<&CancelHandle>) {
    match handle {
        Some(h) => h.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// SHARED CONNECTION STATE
// =============================================================================

type Delivery = Result<Frame, BridgeError>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One entry of the outstanding-call table.
struct CallSlot {
    method: Method,
    /// None once the caller abandoned the call
    tx: Option<mpsc::UnboundedSender<Delivery>>,
    /// Upload window credit, returned by ACK frames
    credit: Option<Arc<Semaphore>>,
    /// Chunks delivered to the caller but not yet acknowledged
    unacked: Arc<AtomicUsize>,
}

struct Shared {
    calls: Mutex<HashMap<CallId, CallSlot>>,
    writer_tx: mpsc::UnboundedSender<Frame>,
    next_id: AtomicU64,
    next_ping: AtomicU64,
    pings: Mutex<HashSet<u64>>,
    in_flight: Arc<Semaphore>,
    limits: Limits,
    descriptor: CapabilityDescriptor,
    default_deadline: Option<Duration>,
    state: watch::Sender<PluginState>,
}

impl Shared {
    fn state(&self) -> PluginState {
        *self.state.borrow()
    }

    fn send(&self, frame: Frame) -> Result<(), BridgeError> {
        self.writer_tx.send(frame).map_err(|_| BridgeError::PeerLost)
    }

    /// Resolve a call with `err` and forget it.
    fn fail_call(&self, id: CallId, err: BridgeError) {
        let slot = lock(&self.calls).remove(&id);
        if let Some(tx) = slot.and_then(|s| s.tx) {
            let _ = tx.send(Err(err));
        }
    }

    /// The plugin broke the protocol on one call: fail it locally and tell the plugin to stop.
    fn violation(&self, id: CallId, reason: String) {
        warn!(call_id = id, %reason, "protocol violation");
        if lock(&self.calls).contains_key(&id) {
            self.fail_call(id, BridgeError::Protocol(reason));
            let _ = self.send(Frame::cancel(id));
        }
    }

    /// Abandon a call: the waiter sees `Cancelled`, the plugin gets `notice`,
    /// and the slot stays to absorb whatever the plugin still sends.
    fn abandon(&self, id: CallId, notice: Frame) -> bool {
        let tx = {
            let mut calls = lock(&self.calls);
            match calls.get_mut(&id) {
                Some(slot) => slot.tx.take(),
                None => None,
            }
        };
        match tx {
            Some(tx) => {
                debug!(call_id = id, "call abandoned");
                let _ = tx.send(Err(BridgeError::Cancelled));
                let _ = self.send(notice);
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding call and mark the connection dead.
    fn connection_lost(&self, reason: &str, err: BridgeError) {
        let previous = self.state.send_replace(PluginState::Dead);
        self.in_flight.close();
        let slots: Vec<(CallId, CallSlot)> = lock(&self.calls).drain().collect();
        let outstanding = slots.iter().filter(|(_, s)| s.tx.is_some()).count();

        if outstanding > 0 || previous == PluginState::Serving {
            warn!(%reason, outstanding, "plugin connection lost");
        } else {
            debug!(%reason, "plugin connection closed");
        }

        for (id, slot) in slots {
            if let Some(credit) = slot.credit {
                credit.close();
            }
            if let Some(tx) = slot.tx {
                trace!(call_id = id, method = ?slot.method, "failing outstanding call");
                let _ = tx.send(Err(err.clone()));
            }
        }
    }

    fn route(&self, frame: Frame) {
        match frame.frame_type {
            FrameType::Log => {
                emit_plugin_log(
                    frame.id,
                    frame.log_level().unwrap_or("info"),
                    frame.log_message().unwrap_or_default(),
                );
            }
            FrameType::Heartbeat => {
                let ours = lock(&self.pings).remove(&frame.id);
                if !ours {
                    let _ = self.send(Frame::heartbeat(frame.id));
                }
            }
            FrameType::Ack => {
                let credit = frame.len.unwrap_or_default() as usize;
                let calls = lock(&self.calls);
                if let Some(permits) = calls.get(&frame.id).and_then(|s| s.credit.as_ref()) {
                    permits.add_permits(credit);
                }
            }
            FrameType::Res | FrameType::Chunk | FrameType::End | FrameType::Err => {
                self.deliver(frame);
            }
            FrameType::Hello | FrameType::Req | FrameType::Cancel | FrameType::Goodbye => {
                self.violation(
                    frame.id,
                    format!("{:?} frame is never sent by a plugin", frame.frame_type),
                );
            }
        }
    }

    fn deliver(&self, frame: Frame) {
        let id = frame.id;
        let terminal = frame.frame_type.is_terminal();

        let mut calls = lock(&self.calls);
        let Some(slot) = calls.get(&id) else {
            warn!(call_id = id, frame_type = ?frame.frame_type, "frame for unknown call id dropped");
            return;
        };

        let sender = slot.tx.clone();
        let overrun = frame.frame_type == FrameType::Chunk
            && slot.unacked.fetch_add(1, Ordering::SeqCst) >= self.limits.window;
        if terminal || overrun {
            calls.remove(&id);
        }
        drop(calls);

        let Some(tx) = sender else {
            trace!(call_id = id, frame_type = ?frame.frame_type, "late frame for abandoned call absorbed");
            return;
        };

        if overrun {
            warn!(call_id = id, window = self.limits.window, "plugin exceeded stream window");
            let _ = tx.send(Err(BridgeError::Protocol(format!(
                "more than {} unacknowledged chunks in flight",
                self.limits.window
            ))));
            let _ = self.send(Frame::cancel(id));
        } else {
            let _ = tx.send(Ok(frame));
        }
    }
}

// =============================================================================
// PENDING CALL
// =============================================================================

/// Caller-side half of one outstanding call.
///
/// Dropping an unfinished call cancels it.
pub(crate) struct PendingCall {
    id: CallId,
    method: Method,
    rx: mpsc::UnboundedReceiver<Delivery>,
    shared: Arc<Shared>,
    credit: Option<Arc<Semaphore>>,
    unacked: Arc<AtomicUsize>,
    deadline: Option<Instant>,
    cancel: Option<CancelHandle>,
    done: bool,
    _permit: OwnedSemaphorePermit,
}

impl PendingCall {
    pub(crate) fn id(&self) -> CallId {
        self.id
    }

    pub(crate) fn method(&self) -> Method {
        self.method
    }

    /// Next frame of this call. Terminal frames and errors finish the call.
    pub(crate) async fn recv(&mut self) -> Result<Frame, BridgeError> {
        if self.done {
            return Err(BridgeError::Closed);
        }

        let deadline = self.deadline;
        let (outcome, local_cancel) = tokio::select! {
            biased;
            _ = wait_cancel(self.cancel.as_ref()) => (Err(BridgeError::Cancelled), true),
            _ = wait_deadline(deadline) => {
                debug!(call_id = self.id, method = ?self.method, "deadline elapsed");
                (Err(BridgeError::Cancelled), true)
            }
            msg = self.rx.recv() => (msg.unwrap_or(Err(BridgeError::PeerLost)), false),
        };

        if local_cancel {
            self.cancel();
            return outcome;
        }
        match outcome {
            Ok(frame) => {
                if frame.frame_type.is_terminal() {
                    self.done = true;
                }
                Ok(frame)
            }
            Err(e) => {
                self.done = true;
                Err(e)
            }
        }
    }

    /// Return one chunk of window credit to the plugin.
    pub(crate) fn ack(&self) {
        let _ = self
            .unacked
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if !self.done {
            let _ = self.shared.send(Frame::ack(self.id, 1));
        }
    }

    pub(crate) fn cancel(&mut self) {
        if !self.done {
            self.done = true;
            self.shared.abandon(self.id, Frame::cancel(self.id));
        }
    }

    /// The plugin misbehaved on this call.
    pub(crate) fn violation(&mut self, reason: String) -> BridgeError {
        self.done = true;
        self.shared.violation(self.id, reason.clone());
        BridgeError::Protocol(reason)
    }

    fn expect_res(&mut self, frame: Frame) -> Result<Vec<u8>, BridgeError> {
        match frame.frame_type {
            FrameType::Res => Ok(frame.payload.unwrap_or_default()),
            FrameType::Err => Err(BridgeError::from_err_frame(&frame)),
            other => Err(self.violation(format!("unexpected {:?} in place of RES", other))),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.cancel();
    }
}

// =============================================================================
// RPC CLIENT
// =============================================================================

struct TaskSet {
    shared: Weak<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        // Outstanding streams may outlive the client; wake them before the
        // reader goes away.
        if let Some(shared) = self.shared.upgrade() {
            if shared.state() != PluginState::Dead {
                shared.connection_lost("client dropped", BridgeError::Closed);
            }
        }
        for handle in lock(&self.handles).drain(..) {
            handle.abort();
        }
    }
}

/// Host end of a plugin connection.
#[derive(Clone)]
pub struct RpcClient {
    shared: Arc<Shared>,
    tasks: Arc<TaskSet>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("capability", &self.shared.descriptor.kind)
            .field("state", &self.shared.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl RpcClient {
    /// Handshake over an already-connected stream pair and start dispatching.
    pub async fn attach<R, W>(
        reader: R,
        writer: W,
        request: HandshakeRequest,
        config: &BridgeConfig,
    ) -> Result<Self, BridgeError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut reader = AsyncFrameReader::new(reader);
        let mut writer = AsyncFrameWriter::new(writer);

        let handshake = tokio::time::timeout(
            config.handshake_timeout(),
            handshake_async(&mut reader, &mut writer, &request),
        )
        .await
        .map_err(|_| BridgeError::Handshake("timed out waiting for plugin HELLO".to_string()))??;

        info!(
            capability = %handshake.descriptor.kind,
            version = handshake.descriptor.version,
            plugin = %handshake.descriptor.name,
            max_chunk = handshake.limits.max_chunk,
            window = handshake.limits.window,
            "plugin handshake complete"
        );

        Ok(Self::start(reader, writer, handshake, config))
    }

    fn start<R, W>(
        reader: AsyncFrameReader<R>,
        writer: AsyncFrameWriter<W>,
        handshake: HandshakeResult,
        config: &BridgeConfig,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(PluginState::Serving);

        let shared = Arc::new(Shared {
            calls: Mutex::new(HashMap::new()),
            writer_tx,
            next_id: AtomicU64::new(1),
            next_ping: AtomicU64::new(1),
            pings: Mutex::new(HashSet::new()),
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            limits: handshake.limits,
            descriptor: handshake.descriptor,
            default_deadline: config.default_deadline(),
            state,
        });

        let mut handles = vec![
            tokio::spawn(writer_loop(Arc::downgrade(&shared), writer, writer_rx)),
            tokio::spawn(reader_loop(shared.clone(), reader)),
        ];
        if !config.heartbeat_interval().is_zero() {
            handles.push(tokio::spawn(heartbeat_loop(
                shared.clone(),
                config.heartbeat_interval(),
                config.heartbeat_timeout(),
            )));
        }

        let tasks = Arc::new(TaskSet {
            shared: Arc::downgrade(&shared),
            handles: Mutex::new(handles),
        });
        Self { shared, tasks }
    }

    pub fn descriptor(&self) -> &CapabilityDescriptor {
        &self.shared.descriptor
    }

    pub fn limits(&self) -> Limits {
        self.shared.limits
    }

    pub fn state(&self) -> PluginState {
        self.shared.state()
    }

    pub fn is_alive(&self) -> bool {
        self.state() == PluginState::Serving
    }

    /// Calls currently in the outstanding-call table (abandoned ones included).
    pub fn in_flight(&self) -> usize {
        lock(&self.shared.calls).len()
    }

    pub(crate) fn state_watch(&self) -> watch::Receiver<PluginState> {
        self.shared.state.subscribe()
    }

    /// Resolves once the connection is dead.
    pub async fn closed(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|s| *s == PluginState::Dead).await;
    }

    /// Ask the plugin to drain and exit. New calls fail with `Closed`.
    pub fn goodbye(&self) {
        let mut sent = false;
        self.shared.state.send_if_modified(|s| {
            if *s == PluginState::Serving {
                *s = PluginState::Draining;
                sent = true;
            }
            sent
        });
        if sent {
            debug!("sending GOODBYE");
            let _ = self.shared.send(Frame::goodbye());
        }
    }

    /// Cancel an outstanding call by id. Returns false if it already finished.
    pub fn cancel(&self, id: CallId) -> bool {
        self.shared.abandon(id, Frame::cancel(id))
    }

    fn check_open(&self, method: Method) -> Result<(), BridgeError> {
        match self.state() {
            PluginState::Serving => {}
            PluginState::Dead => return Err(BridgeError::PeerLost),
            _ => return Err(BridgeError::Closed),
        }
        if !self.shared.descriptor.supports(method) {
            return Err(BridgeError::Capability {
                code: codes::NO_HANDLER.to_string(),
                message: format!("{:?} is not offered by this plugin", method),
            });
        }
        Ok(())
    }

    async fn start_call(
        &self,
        method: Method,
        args: Vec<u8>,
        flag_bits: u8,
        declared_len: Option<u64>,
        opts: &CallOptions,
    ) -> Result<PendingCall, BridgeError> {
        self.check_open(method)?;

        let deadline = opts
            .deadline
            .or(self.shared.default_deadline)
            .map(|d| Instant::now() + d);

        let permit = tokio::select! {
            biased;
            _ = wait_cancel(opts.cancel.as_ref()) => return Err(BridgeError::Cancelled),
            _ = wait_deadline(deadline) => return Err(BridgeError::Cancelled),
            permit = self.shared.in_flight.clone().acquire_owned() => permit,
        };
        let permit = match permit {
            Ok(p) => p,
            Err(_) => return Err(self.check_open(method).err().unwrap_or(BridgeError::Closed)),
        };
        self.check_open(method)?;

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let credit = (flag_bits & flags::STREAM_REQUEST != 0)
            .then(|| Arc::new(Semaphore::new(self.shared.limits.window)));
        let unacked = Arc::new(AtomicUsize::new(0));

        lock(&self.shared.calls).insert(
            id,
            CallSlot {
                method,
                tx: Some(tx),
                credit: credit.clone(),
                unacked: unacked.clone(),
            },
        );

        let call = PendingCall {
            id,
            method,
            rx,
            shared: self.shared.clone(),
            credit,
            unacked,
            deadline,
            cancel: opts.cancel.clone(),
            done: false,
            _permit: permit,
        };

        debug!(call_id = id, method = ?method, "call started");
        self.shared
            .send(Frame::req(id, method, args, flag_bits, declared_len))?;
        Ok(call)
    }

    /// Unary call: REQ → RES.
    pub async fn call(&self, method: Method, args: Vec<u8>) -> Result<Vec<u8>, BridgeError> {
        self.call_with(method, args, CallOptions::default()).await
    }

    pub async fn call_with(
        &self,
        method: Method,
        args: Vec<u8>,
        opts: CallOptions,
    ) -> Result<Vec<u8>, BridgeError> {
        let mut call = self.start_call(method, args, 0, None, &opts).await?;
        let frame = call.recv().await?;
        call.expect_res(frame)
    }

    /// Request-streamed call: REQ + CHUNK... + END → RES.
    ///
    /// `source` is read lazily, one chunk per window credit. A stalled read
    /// still yields to the deadline or cancel. `declared_len` is advisory;
    /// the plugin rejects a body of a different length with `SizeMismatch`.
    pub async fn call_upload<S>(
        &self,
        method: Method,
        args: Vec<u8>,
        mut source: S,
        declared_len: Option<u64>,
        opts: CallOptions,
    ) -> Result<Vec<u8>, BridgeError>
    where
        S: AsyncRead + Unpin,
    {
        let mut call = self
            .start_call(method, args, flags::STREAM_REQUEST, declared_len, &opts)
            .await?;
        let credit = match call.credit.clone() {
            Some(c) => c,
            None => return Err(BridgeError::Protocol("upload without window".to_string())),
        };

        let mut buf = vec![0u8; self.shared.limits.max_chunk.max(1)];
        let mut index = 0u64;
        let mut total = 0u64;

        loop {
            // A stalled source must not outlive the deadline or a cancel.
            let read = tokio::select! {
                biased;
                early = call.recv() => {
                    let frame = early?;
                    return call.expect_res(frame);
                }
                read = read_full(&mut source, &mut buf) => read,
            };
            let n = match read {
                Ok(n) => n,
                Err(e) => {
                    warn!(call_id = call.id, error = %e, "upload source failed");
                    call.done = true;
                    call.shared
                        .abandon(call.id, Frame::err(call.id, codes::IO_ERROR, &e.to_string()));
                    return Err(BridgeError::Io(e.to_string()));
                }
            };
            if n == 0 {
                break;
            }

            tokio::select! {
                biased;
                early = call.recv() => {
                    // The plugin answered before taking the whole body.
                    let frame = early?;
                    return call.expect_res(frame);
                }
                permit = credit.acquire() => match permit {
                    Ok(p) => p.forget(),
                    Err(_) => return Err(BridgeError::PeerLost),
                },
            }

            call.shared
                .send(Frame::chunk(call.id, index, buf[..n].to_vec()))?;
            index += 1;
            total += n as u64;
        }

        trace!(call_id = call.id, chunks = index, bytes = total, "upload body sent");
        call.shared.send(Frame::end(call.id, total, false))?;

        let frame = call.recv().await?;
        call.expect_res(frame)
    }

    /// Response-streamed call: REQ → CHUNK... + END.
    ///
    /// Waits for the first frame, so an immediate failure (not found,
    /// invalid arguments) is returned here rather than from the stream.
    pub async fn call_streaming(
        &self,
        method: Method,
        args: Vec<u8>,
        opts: CallOptions,
    ) -> Result<crate::bridge::stream::ResponseStream, BridgeError> {
        let mut call = self
            .start_call(method, args, flags::STREAM_RESPONSE, None, &opts)
            .await?;
        let first = call.recv().await?;
        match first.frame_type {
            FrameType::Chunk | FrameType::End => {
                Ok(crate::bridge::stream::ResponseStream::new(call, first))
            }
            FrameType::Err => Err(BridgeError::from_err_frame(&first)),
            other => Err(call.violation(format!("unexpected {:?} opening a stream", other))),
        }
    }
}

/// Fill `buf` from `source`, stopping early only at end of input.
async fn read_full<S: AsyncRead + Unpin>(source: &mut S, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

// =============================================================================
// CONNECTION TASKS
// =============================================================================

async fn writer_loop<W: AsyncWrite + Unpin>(
    shared: Weak<Shared>,
    mut writer: AsyncFrameWriter<W>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = rx.recv().await {
        trace!(call_id = frame.id, frame_type = ?frame.frame_type, "writing frame");
        match writer.write(&frame).await {
            Ok(()) => {}
            Err(e @ WireError::FrameTooLarge { .. }) => {
                // Nothing was written; only this call is affected.
                if let Some(shared) = shared.upgrade() {
                    shared.violation(frame.id, e.to_string());
                }
            }
            Err(e) => {
                if let Some(shared) = shared.upgrade() {
                    shared.connection_lost(&e.to_string(), BridgeError::PeerLost);
                }
                break;
            }
        }
    }
    trace!("writer task exiting");
}

async fn reader_loop<R: AsyncRead + Unpin>(shared: Arc<Shared>, mut reader: AsyncFrameReader<R>) {
    loop {
        match reader.read().await {
            Ok(Some(frame)) => {
                trace!(call_id = frame.id, frame_type = ?frame.frame_type, "read frame");
                shared.route(frame);
            }
            Ok(None) => {
                shared.connection_lost("plugin closed the connection", BridgeError::PeerLost);
                break;
            }
            Err(WireError::Malformed { id: Some(id), reason }) => {
                shared.violation(id, reason);
            }
            Err(WireError::Malformed { id: None, reason }) => {
                warn!(%reason, "dropping malformed frame");
            }
            Err(e) => {
                shared.connection_lost(&e.to_string(), BridgeError::PeerLost);
                break;
            }
        }
    }
}

async fn heartbeat_loop(shared: Arc<Shared>, interval: Duration, timeout: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        if shared.state() == PluginState::Dead {
            break;
        }

        let ping = shared.next_ping.fetch_add(1, Ordering::SeqCst);
        lock(&shared.pings).insert(ping);
        if shared.send(Frame::heartbeat(ping)).is_err() {
            break;
        }

        tokio::time::sleep(timeout).await;
        if lock(&shared.pings).remove(&ping) {
            shared.connection_lost("heartbeat unanswered", BridgeError::PeerLost);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_error_from_err_frames() {
        let not_found = BridgeError::from_err_frame(&Frame::err(1, codes::NOT_FOUND, "no state"));
        assert!(not_found.is_not_found());

        assert_eq!(
            BridgeError::from_err_frame(&Frame::err(1, codes::CANCELLED, "stopped")),
            BridgeError::Cancelled
        );
        assert!(matches!(
            BridgeError::from_err_frame(&Frame::err(1, codes::PROTOCOL_ERROR, "bad index")),
            BridgeError::Protocol(m) if m == "bad index"
        ));

        let mut frame = Frame::err(1, codes::SIZE_MISMATCH, "short body");
        if let Some(meta) = frame.meta.as_mut() {
            meta.insert("declared".to_string(), ciborium::Value::Integer(10u64.into()));
            meta.insert("actual".to_string(), ciborium::Value::Integer(7u64.into()));
        }
        assert_eq!(
            BridgeError::from_err_frame(&frame),
            BridgeError::SizeMismatch { declared: 10, actual: 7 }
        );
    }

    #[test]
    fn test_bridge_error_display() {
        let err = BridgeError::Capability {
            code: "NOT_FOUND".to_string(),
            message: "no such lock".to_string(),
        };
        assert_eq!(err.to_string(), "Plugin returned error: [NOT_FOUND] no such lock");
        assert!(!BridgeError::PeerLost.is_not_found());
    }

    #[test]
    fn test_wire_error_conversion() {
        let malformed = WireError::Malformed { id: Some(3), reason: "bad flags".to_string() };
        assert_eq!(BridgeError::from(malformed), BridgeError::Protocol("bad flags".to_string()));
        assert!(matches!(
            BridgeError::from(WireError::UnexpectedEof),
            BridgeError::Io(_)
        ));
        assert!(matches!(
            BridgeError::from(WireError::Handshake("nope".to_string())),
            BridgeError::Handshake(_)
        ));
    }

    #[tokio::test]
    async fn test_cancel_handle_wakes_waiter() {
        let handle = CancelHandle::new();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.cancelled().await })
        };
        tokio::task::yield_now().await;
        assert!(!handle.is_cancelled());
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_handle_already_cancelled_resolves() {
        let handle = CancelHandle::new();
        handle.cancel();
        tokio::time::timeout(Duration::from_millis(100), handle.cancelled())
            .await
            .expect("pre-cancelled handle resolves immediately");
    }

    #[tokio::test]
    async fn test_read_full_fills_across_short_reads() {
        let (mut tx, mut rx) = tokio::io::duplex(4);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            tx.write_all(b"abcdefghij").await.unwrap();
        });
        let mut buf = [0u8; 8];
        assert_eq!(read_full(&mut rx, &mut buf).await.unwrap(), 8);
        assert_eq!(&buf, b"abcdefgh");
        writer.await.unwrap();
        assert_eq!(read_full(&mut rx, &mut buf).await.unwrap(), 2);
        assert_eq!(read_full(&mut rx, &mut buf).await.unwrap(), 0);
    }
}
