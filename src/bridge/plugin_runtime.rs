//! Plugin-side runtime
//!
//! A plugin binary builds a [`PluginRuntime`] for its capability, registers a
//! handler per method and calls [`PluginRuntime::run`]. The runtime performs
//! the handshake, then dispatches calls:
//!
//! ```ignore
//! fn main() -> Result<(), PluginError> {
//!     snapwire::logging::init();
//!     PluginRuntime::new(CapabilityKind::Storage, "mem-storage", "0.1.0")
//!         .with_factory(|config| Ok(storage_methods(Arc::new(MemStorage::new(config)))))
//!         .run()
//! }
//! ```
//!
//! ## Threads
//!
//! - reader thread: decodes frames from the connection into the event channel
//! - dispatch loop (the calling thread): routes events, answers heartbeats,
//!   starts handlers, tracks active calls
//! - writer thread: the only writer of the connection, drains the output channel
//! - handler threads: one per call, or a single worker when the capability is
//!   [`Concurrency::Serialized`]
//!
//! Handlers never see frames. They read the request body through
//! [`BodyReader`] and answer through [`Responder`]; the runtime sends the
//! terminal RES, END or ERR when the handler returns.

use crate::bridge::frame::{
    codes, flags, CallId, CallShape, Frame, FrameType, Limits, Method, CHUNK_OVERHEAD,
    PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN,
};
use crate::bridge::io::{
    handshake_accept, to_cbor, from_cbor, FrameReader, FrameWriter, PluginOffer, WireError,
};
use crate::bridge::process::ENDPOINT_ENV;
use crate::capability::{CapabilityKind, Concurrency};
use crossbeam_channel::{Receiver, Sender};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace, warn};

/// Launch configuration received in the host HELLO.
pub type PluginConfig = BTreeMap<String, String>;

/// Handler for one method.
pub type HandlerFn =
    Arc<dyn Fn(&mut Request, &Responder) -> Result<(), PluginError> + Send + Sync>;

/// Handlers for a capability, as produced by the capability builders.
pub type MethodTable = Vec<(Method, HandlerFn)>;

type Factory = Box<dyn FnOnce(&PluginConfig) -> Result<MethodTable, PluginError> + Send>;

// =============================================================================
// ERRORS
// =============================================================================

/// Errors raised by plugin handlers and the plugin runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PluginError {
    /// Passed to the host verbatim as an ERR code and message
    #[error("[{code}] {message}")]
    Capability { code: String, message: String },

    #[error("Call cancelled")]
    Cancelled,

    #[error("Size mismatch: declared {declared} bytes, got {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("No handler registered for {0:?}")]
    NoHandler(Method),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Wire error: {0}")]
    Wire(String),

    #[error("Connection closed")]
    Closed,
}

impl PluginError {
    pub fn capability(code: &str, message: impl Into<String>) -> Self {
        PluginError::Capability {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::capability(codes::NOT_FOUND, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::capability(codes::INVALID_ARGUMENT, message)
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::capability(codes::HANDLER_ERROR, message)
    }

    /// ERR code sent to the host.
    pub fn code(&self) -> &str {
        match self {
            PluginError::Capability { code, .. } => code,
            PluginError::Cancelled => codes::CANCELLED,
            PluginError::SizeMismatch { .. } => codes::SIZE_MISMATCH,
            PluginError::Protocol(_) | PluginError::Wire(_) => codes::PROTOCOL_ERROR,
            PluginError::NoHandler(_) => codes::NO_HANDLER,
            PluginError::Io(_) | PluginError::Closed => codes::IO_ERROR,
        }
    }

    fn to_err_frame(&self, id: CallId) -> Frame {
        let message = match self {
            PluginError::Capability { message, .. } => message.clone(),
            other => other.to_string(),
        };
        let mut frame = Frame::err(id, self.code(), &message);
        if let (PluginError::SizeMismatch { declared, actual }, Some(meta)) = (self, frame.meta.as_mut()) {
            meta.insert("declared".to_string(), ciborium::Value::Integer((*declared).into()));
            meta.insert("actual".to_string(), ciborium::Value::Integer((*actual).into()));
        }
        frame
    }
}

impl From<io::Error> for PluginError {
    fn from(e: io::Error) -> Self {
        // BodyReader wraps its failures; unwrap them so the ERR code survives `?`.
        if let Some(inner) = e.get_ref().and_then(|r| r.downcast_ref::<PluginError>()) {
            return inner.clone();
        }
        PluginError::Io(e.to_string())
    }
}

impl From<WireError> for PluginError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Malformed { reason, .. } => PluginError::Protocol(reason),
            WireError::Protocol(msg) => PluginError::Protocol(msg),
            WireError::Io(e) => PluginError::Io(e.to_string()),
            other => PluginError::Wire(other.to_string()),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// CANCELLATION
// =============================================================================

/// Per-call cancellation flag. Tripped by CANCEL from the host or by loss of
/// the connection; checked at every chunk and result boundary.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    signal: Receiver<()>,
    // Dropping the sender wakes every select! waiting on `signal`.
    trigger: Arc<Mutex<Option<Sender<()>>>>,
}

impl CancelToken {
    fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            signal: rx,
            trigger: Arc::new(Mutex::new(Some(tx))),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        lock(&self.trigger).take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the call has been cancelled.
    pub fn check(&self) -> Result<(), PluginError> {
        if self.is_cancelled() {
            return Err(PluginError::Cancelled);
        }
        Ok(())
    }
}

// =============================================================================
// REQUEST SIDE
// =============================================================================

enum BodyEvent {
    Chunk { index: u64, payload: Vec<u8> },
    End { total: u64 },
    Abort(PluginError),
}

/// Request body of an upload call, read lazily as chunks arrive.
///
/// Each consumed chunk returns one unit of window credit to the host. Reaching
/// end of input means the END marker arrived and the byte count matched.
pub struct BodyReader {
    id: CallId,
    rx: Receiver<BodyEvent>,
    out: Sender<Frame>,
    cancel: CancelToken,
    unacked: Arc<AtomicUsize>,
    declared: Option<u64>,
    buf: Vec<u8>,
    pos: usize,
    next_index: u64,
    received: u64,
    finished: bool,
    failure: Option<PluginError>,
}

impl BodyReader {
    /// Length the host declared in the request, if any. Advisory.
    pub fn declared_len(&self) -> Option<u64> {
        self.declared
    }

    /// Bytes consumed so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    fn next_event(&mut self) -> Result<(), PluginError> {
        let event = crossbeam_channel::select! {
            recv(self.rx) -> event => event.map_err(|_| PluginError::Closed)?,
            recv(self.cancel.signal) -> _ => return Err(PluginError::Cancelled),
        };

        match event {
            BodyEvent::Chunk { index, payload } => {
                if index != self.next_index {
                    return Err(PluginError::Protocol(format!(
                        "chunk index {} out of order, expected {}",
                        index, self.next_index
                    )));
                }
                self.next_index += 1;
                self.received += payload.len() as u64;
                let _ = self
                    .unacked
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
                let _ = self.out.send(Frame::ack(self.id, 1));
                self.buf = payload;
                self.pos = 0;
            }
            BodyEvent::End { total } => {
                if total != self.received {
                    return Err(PluginError::SizeMismatch {
                        declared: total,
                        actual: self.received,
                    });
                }
                if let Some(declared) = self.declared {
                    if declared != self.received {
                        return Err(PluginError::SizeMismatch {
                            declared,
                            actual: self.received,
                        });
                    }
                }
                self.finished = true;
            }
            BodyEvent::Abort(e) => return Err(e),
        }
        Ok(())
    }
}

impl Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pos < self.buf.len() {
                let n = buf.len().min(self.buf.len() - self.pos);
                buf[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if let Some(ref e) = self.failure {
                return Err(io::Error::new(io::ErrorKind::Other, e.clone()));
            }
            if self.finished {
                return Ok(0);
            }
            if let Err(e) = self.next_event() {
                self.failure = Some(e.clone());
                return Err(io::Error::new(io::ErrorKind::Other, e));
            }
        }
    }
}

/// One incoming call as seen by a handler.
pub struct Request {
    id: CallId,
    method: Method,
    args: Vec<u8>,
    body: Option<BodyReader>,
    cancel: CancelToken,
    config: Arc<PluginConfig>,
}

impl Request {
    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Raw argument bytes of the REQ.
    pub fn args(&self) -> &[u8] {
        &self.args
    }

    /// Decode CBOR arguments. Undecodable arguments are `INVALID_ARGUMENT`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PluginError> {
        from_cbor(&self.args)
            .map_err(|e| PluginError::invalid(format!("bad arguments for {:?}: {}", self.method, e)))
    }

    /// Streamed request body. Only upload methods carry one.
    pub fn body(&mut self) -> Result<&mut BodyReader, PluginError> {
        let method = self.method;
        self.body
            .as_mut()
            .ok_or_else(|| PluginError::Protocol(format!("{:?} carries no request body", method)))
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// =============================================================================
// RESPONSE SIDE
// =============================================================================

#[derive(Default)]
struct ResponderState {
    result: Option<Vec<u8>>,
    available: usize,
    next_index: u64,
    bytes: u64,
    items: u64,
    short_read: bool,
}

/// Answer channel of one call.
///
/// Unary and upload calls set a result with [`reply`](Self::reply); download
/// calls [`write`](Self::write) bytes; result-streaming calls emit
/// [`item`](Self::item)s. Stream output waits for window credit and stops
/// with `Cancelled` once the call is cancelled.
pub struct Responder {
    id: CallId,
    method: Method,
    streaming: bool,
    max_chunk: usize,
    max_frame: usize,
    out: Sender<Frame>,
    credit: Receiver<u64>,
    cancel: CancelToken,
    finished: Arc<AtomicBool>,
    state: Mutex<ResponderState>,
}

impl Responder {
    /// Set the payload of the RES frame.
    pub fn reply(&self, payload: Vec<u8>) -> Result<(), PluginError> {
        if self.streaming {
            return Err(PluginError::Protocol(format!(
                "{:?} streams its response; use write or item",
                self.method
            )));
        }
        lock(&self.state).result = Some(payload);
        Ok(())
    }

    /// Set a CBOR-encoded RES payload.
    pub fn reply_cbor<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), PluginError> {
        self.reply(to_cbor(value)?)
    }

    /// Append bytes to a byte stream, split into chunks of at most `max_chunk`.
    pub fn write(&self, data: &[u8]) -> Result<(), PluginError> {
        for piece in data.chunks(self.max_chunk.max(1)) {
            self.send_chunk(piece.to_vec(), piece.len() as u64)?;
        }
        Ok(())
    }

    /// Stream everything `reader` yields. Returns the byte count.
    pub fn copy_from<R: Read>(&self, mut reader: R) -> Result<u64, PluginError> {
        let mut buf = vec![0u8; self.max_chunk.max(1)];
        let mut total = 0u64;
        loop {
            let mut filled = 0;
            while filled < buf.len() {
                match reader.read(&mut buf[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            if filled == 0 {
                return Ok(total);
            }
            self.send_chunk(buf[..filled].to_vec(), filled as u64)?;
            total += filled as u64;
        }
    }

    /// Emit one CBOR-encoded result. A result is never split, so it is
    /// bounded by what one CHUNK frame can carry rather than `max_chunk`.
    pub fn item<T: Serialize + ?Sized>(&self, item: &T) -> Result<(), PluginError> {
        let bytes = to_cbor(item)?;
        let room = self.max_frame.saturating_sub(CHUNK_OVERHEAD);
        if bytes.len() > room {
            return Err(PluginError::Protocol(format!(
                "result of {} bytes exceeds the {} a frame of {} can carry",
                bytes.len(),
                room,
                self.max_frame
            )));
        }
        self.send_chunk(bytes, 0)
    }

    /// Mark the byte stream as ending before the requested range.
    pub fn mark_short_read(&self) {
        lock(&self.state).short_read = true;
    }

    /// Send a log line to the host.
    pub fn log(&self, level: &str, message: &str) {
        let _ = self.out.send(Frame::log(self.id, level, message));
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn send_chunk(&self, payload: Vec<u8>, bytes: u64) -> Result<(), PluginError> {
        if !self.streaming {
            return Err(PluginError::Protocol(format!(
                "{:?} answers with a single result; use reply",
                self.method
            )));
        }

        let mut state = lock(&self.state);
        self.cancel.check()?;
        while let Ok(credit) = self.credit.try_recv() {
            state.available += credit as usize;
        }
        while state.available == 0 {
            crossbeam_channel::select! {
                recv(self.credit) -> credit => match credit {
                    Ok(credit) => state.available += credit as usize,
                    Err(_) => return Err(PluginError::Closed),
                },
                recv(self.cancel.signal) -> _ => return Err(PluginError::Cancelled),
            }
        }
        self.cancel.check()?;

        state.available -= 1;
        let index = state.next_index;
        state.next_index += 1;
        state.bytes += bytes;
        state.items += 1;
        self.out
            .send(Frame::chunk(self.id, index, payload))
            .map_err(|_| PluginError::Closed)
    }

    /// Send the terminal frame unless one has already gone out.
    fn finish(&self, outcome: Result<(), PluginError>) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let frame = match outcome {
            Ok(()) => {
                let mut state = lock(&self.state);
                if self.streaming {
                    let total = match self.method.shape() {
                        CallShape::Results => state.items,
                        _ => state.bytes,
                    };
                    Frame::end(self.id, total, state.short_read)
                } else {
                    Frame::res(self.id, state.result.take().unwrap_or_default())
                }
            }
            Err(e) => {
                debug!(call_id = self.id, method = ?self.method, error = %e, "call failed");
                e.to_err_frame(self.id)
            }
        };
        let _ = self.out.send(frame);
    }
}

// =============================================================================
// RUNTIME
// =============================================================================

enum Event {
    Frame(Frame),
    Malformed { id: Option<CallId>, reason: String },
    Closed(Option<String>),
    Finished(CallId),
}

/// Dispatch-loop view of a running call.
struct ActiveCall {
    cancel: CancelToken,
    finished: Arc<AtomicBool>,
    credit_tx: Option<Sender<u64>>,
    body_tx: Option<Sender<BodyEvent>>,
    body_unacked: Arc<AtomicUsize>,
}

type Job = Box<dyn FnOnce() + Send>;

/// Plugin-side dispatcher for one capability.
pub struct PluginRuntime {
    kind: CapabilityKind,
    name: String,
    version: String,
    min_version: u32,
    max_version: u32,
    concurrency: Concurrency,
    limits: Limits,
    handlers: HashMap<Method, HandlerFn>,
    factory: Option<Factory>,
}

impl PluginRuntime {
    pub fn new(kind: CapabilityKind, name: &str, version: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            version: version.to_string(),
            min_version: PROTOCOL_VERSION_MIN,
            max_version: PROTOCOL_VERSION_MAX,
            concurrency: Concurrency::Concurrent,
            limits: Limits::default(),
            handlers: HashMap::new(),
            factory: None,
        }
    }

    /// Protocol versions this plugin accepts.
    pub fn with_versions(mut self, min_version: u32, max_version: u32) -> Self {
        self.min_version = min_version;
        self.max_version = max_version;
        self
    }

    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Build the method table from the launch configuration, after the
    /// handshake. Every method of the capability is advertised.
    pub fn with_factory<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(&PluginConfig) -> Result<MethodTable, PluginError> + Send + 'static,
    {
        self.factory = Some(Box::new(factory));
        self
    }

    /// Register a handler for one method. Methods of other capabilities are
    /// refused.
    pub fn register_raw<F>(&mut self, method: Method, handler: F)
    where
        F: Fn(&mut Request, &Responder) -> Result<(), PluginError> + Send + Sync + 'static,
    {
        self.register_handler(method, Arc::new(handler));
    }

    pub fn register_table(&mut self, table: MethodTable) {
        for (method, handler) in table {
            self.register_handler(method, handler);
        }
    }

    fn register_handler(&mut self, method: Method, handler: HandlerFn) {
        if method.capability() != self.kind {
            warn!(?method, capability = %self.kind, "ignoring handler for a method of another capability");
            return;
        }
        self.handlers.insert(method, handler);
    }

    /// Methods advertised in the descriptor, in selector order.
    pub fn methods(&self) -> Vec<Method> {
        if self.factory.is_some() {
            return Method::for_capability(self.kind);
        }
        let mut methods: Vec<Method> = self.handlers.keys().copied().collect();
        methods.sort();
        methods
    }

    /// Connect to the host and serve until GOODBYE or disconnect.
    ///
    /// With `SNAPWIRE_ENDPOINT` set the plugin connects to that Unix socket;
    /// otherwise frames travel over stdin/stdout.
    pub fn run(self) -> Result<(), PluginError> {
        match std::env::var_os(ENDPOINT_ENV) {
            Some(path) => {
                debug!(endpoint = ?path, "connecting to host socket");
                let stream = std::os::unix::net::UnixStream::connect(&path)?;
                let reader = stream.try_clone()?;
                self.serve(reader, stream)
            }
            None => {
                debug!("serving over stdio");
                self.serve(BufReader::new(io::stdin()), BufWriter::new(io::stdout()))
            }
        }
    }

    /// Handshake and serve over an already-connected stream pair.
    pub fn serve<R, W>(mut self, reader: R, writer: W) -> Result<(), PluginError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let mut frame_reader = FrameReader::new(reader);
        let mut frame_writer = FrameWriter::new(writer);

        let offer = PluginOffer {
            kind: self.kind,
            min_version: self.min_version,
            max_version: self.max_version,
            methods: self.methods(),
            concurrency: self.concurrency,
            name: self.name.clone(),
            plugin_version: self.version.clone(),
            limits: self.limits,
        };
        let accepted = handshake_accept(&mut frame_reader, &mut frame_writer, &offer)?;
        let limits = accepted.limits;
        info!(
            capability = %self.kind,
            version = accepted.descriptor.version,
            max_chunk = limits.max_chunk,
            window = limits.window,
            "handshake accepted"
        );

        // A failed factory leaves the connection up; every call reports why.
        let mut init_error = None;
        if let Some(factory) = self.factory.take() {
            match factory(&accepted.config) {
                Ok(table) => self.register_table(table),
                Err(e) => {
                    warn!(error = %e, "capability initialisation failed");
                    init_error = Some(e);
                }
            }
        }
        let config = Arc::new(accepted.config);

        let (output_tx, output_rx) = crossbeam_channel::unbounded::<Frame>();
        let (events_tx, events_rx) = crossbeam_channel::unbounded::<Event>();

        let writer_handle = thread::spawn(move || writer_loop(frame_writer, output_rx));
        spawn_reader(frame_reader, events_tx.clone());

        let (jobs_tx, worker) = match self.concurrency {
            Concurrency::Serialized => {
                let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded::<Job>();
                let worker = thread::spawn(move || {
                    for job in jobs_rx {
                        job();
                    }
                });
                (Some(jobs_tx), Some(worker))
            }
            Concurrency::Concurrent => (None, None),
        };

        let mut active: HashMap<CallId, ActiveCall> = HashMap::new();
        let mut handler_threads: Vec<JoinHandle<()>> = Vec::new();
        let mut draining = false;

        loop {
            handler_threads.retain(|h| !h.is_finished());
            if draining && active.is_empty() {
                debug!("drained after GOODBYE");
                break;
            }

            let event = match events_rx.recv() {
                Ok(event) => event,
                Err(_) => break,
            };

            match event {
                Event::Frame(frame) => match frame.frame_type {
                    FrameType::Req => {
                        let id = frame.id;
                        if draining {
                            let _ = output_tx.send(Frame::err(id, codes::SHUTTING_DOWN, "plugin is shutting down"));
                            continue;
                        }
                        if active.contains_key(&id) {
                            let _ = output_tx.send(Frame::err(id, codes::PROTOCOL_ERROR, "call id already in use"));
                            continue;
                        }
                        if let Some(ref e) = init_error {
                            let _ = output_tx.send(e.to_err_frame(id));
                            continue;
                        }
                        let Some(method) = frame.method else {
                            continue;
                        };
                        let Some(handler) = self.handlers.get(&method).cloned() else {
                            let _ = output_tx.send(PluginError::NoHandler(method).to_err_frame(id));
                            continue;
                        };
                        if let Err(reason) = check_shape(method, frame.flags) {
                            let _ = output_tx.send(Frame::err(id, codes::PROTOCOL_ERROR, &reason));
                            continue;
                        }

                        trace!(call_id = id, ?method, "dispatching call");
                        let (call, job) = start_call(
                            frame,
                            method,
                            handler,
                            &limits,
                            &config,
                            &output_tx,
                            &events_tx,
                        );
                        active.insert(id, call);

                        match jobs_tx {
                            Some(ref jobs) => {
                                if jobs.send(job).is_err() {
                                    warn!(call_id = id, "serialized worker gone");
                                }
                            }
                            None => handler_threads.push(thread::spawn(job)),
                        }
                    }

                    FrameType::Chunk => {
                        let Some(call) = active.get_mut(&frame.id) else {
                            debug!(call_id = frame.id, "chunk for inactive call dropped");
                            continue;
                        };
                        let Some(body) = call.body_tx.clone() else {
                            warn!(call_id = frame.id, "chunk after end of request body dropped");
                            continue;
                        };
                        let outstanding = call.body_unacked.fetch_add(1, Ordering::SeqCst);
                        let event = if outstanding >= limits.window {
                            call.body_tx = None;
                            BodyEvent::Abort(PluginError::Protocol(format!(
                                "more than {} unacknowledged chunks in flight",
                                limits.window
                            )))
                        } else {
                            BodyEvent::Chunk {
                                index: frame.chunk_index.unwrap_or_default(),
                                payload: frame.payload.unwrap_or_default(),
                            }
                        };
                        let _ = body.send(event);
                    }

                    FrameType::End => {
                        if let Some(body) = active.get_mut(&frame.id).and_then(|c| c.body_tx.take()) {
                            let _ = body.send(BodyEvent::End {
                                total: frame.len.unwrap_or_default(),
                            });
                        }
                    }

                    FrameType::Err => {
                        // The host abandoned its upload.
                        if let Some(body) = active.get_mut(&frame.id).and_then(|c| c.body_tx.take()) {
                            let _ = body.send(BodyEvent::Abort(PluginError::capability(
                                frame.error_code().unwrap_or(codes::IO_ERROR),
                                frame.error_message().unwrap_or_default(),
                            )));
                        }
                    }

                    FrameType::Ack => {
                        if let Some(credit) = active.get(&frame.id).and_then(|c| c.credit_tx.as_ref()) {
                            let _ = credit.send(frame.len.unwrap_or_default());
                        }
                    }

                    FrameType::Cancel => {
                        if let Some(call) = active.get(&frame.id) {
                            debug!(call_id = frame.id, "cancel requested");
                            call.cancel.cancel();
                        }
                    }

                    FrameType::Heartbeat => {
                        let _ = output_tx.send(Frame::heartbeat(frame.id));
                    }

                    FrameType::Goodbye => {
                        info!(active = active.len(), "GOODBYE received, draining");
                        draining = true;
                    }

                    FrameType::Hello => {
                        let _ = output_tx.send(Frame::err(frame.id, codes::PROTOCOL_ERROR, "unexpected HELLO after handshake"));
                    }

                    FrameType::Res | FrameType::Log => {
                        warn!(call_id = frame.id, frame_type = ?frame.frame_type, "unexpected frame from host dropped");
                    }
                },

                Event::Malformed { id: Some(id), reason } => {
                    warn!(call_id = id, %reason, "malformed frame");
                    match active.get(&id) {
                        Some(call) => {
                            if !call.finished.swap(true, Ordering::SeqCst) {
                                let _ = output_tx.send(Frame::err(id, codes::PROTOCOL_ERROR, &reason));
                            }
                            call.cancel.cancel();
                        }
                        None => {
                            let _ = output_tx.send(Frame::err(id, codes::PROTOCOL_ERROR, &reason));
                        }
                    }
                }

                Event::Malformed { id: None, reason } => {
                    warn!(%reason, "dropping malformed frame");
                }

                Event::Finished(id) => {
                    active.remove(&id);
                }

                Event::Closed(reason) => {
                    if !active.is_empty() || !draining {
                        match reason {
                            Some(ref reason) => warn!(%reason, active = active.len(), "host connection failed"),
                            None => info!(active = active.len(), "host closed the connection"),
                        }
                    }
                    for call in active.values() {
                        call.cancel.cancel();
                    }
                    break;
                }
            }
        }

        drop(jobs_tx);
        if let Some(worker) = worker {
            let _ = worker.join();
        }
        for handle in handler_threads {
            let _ = handle.join();
        }

        drop(output_tx);
        if writer_handle.join().is_err() {
            warn!("writer thread panicked");
        }
        debug!("plugin runtime stopped");
        Ok(())
    }
}

/// REQ flags must match how the method moves data.
fn check_shape(method: Method, flag_bits: u8) -> Result<(), String> {
    let streams_request = flag_bits & flags::STREAM_REQUEST != 0;
    let streams_response = flag_bits & flags::STREAM_RESPONSE != 0;
    let expected = match method.shape() {
        CallShape::Unary => (false, false),
        CallShape::Upload => (true, false),
        CallShape::Download | CallShape::Results => (false, true),
    };
    if (streams_request, streams_response) != expected {
        return Err(format!(
            "{:?} called with flags {:#04x} that do not match its shape {:?}",
            method,
            flag_bits,
            method.shape()
        ));
    }
    Ok(())
}

fn start_call(
    frame: Frame,
    method: Method,
    handler: HandlerFn,
    limits: &Limits,
    config: &Arc<PluginConfig>,
    output_tx: &Sender<Frame>,
    events_tx: &Sender<Event>,
) -> (ActiveCall, Job) {
    let id = frame.id;
    let cancel = CancelToken::new();
    let finished = Arc::new(AtomicBool::new(false));
    let body_unacked = Arc::new(AtomicUsize::new(0));
    let streaming = frame.has_flag(flags::STREAM_RESPONSE);

    let (body_tx, body) = if frame.has_flag(flags::STREAM_REQUEST) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let body = BodyReader {
            id,
            rx,
            out: output_tx.clone(),
            cancel: cancel.clone(),
            unacked: body_unacked.clone(),
            declared: frame.len,
            buf: Vec::new(),
            pos: 0,
            next_index: 0,
            received: 0,
            finished: false,
            failure: None,
        };
        (Some(tx), Some(body))
    } else {
        (None, None)
    };

    let (credit_tx, credit_rx) = crossbeam_channel::unbounded();

    let request = Request {
        id,
        method,
        args: frame.payload.unwrap_or_default(),
        body,
        cancel: cancel.clone(),
        config: config.clone(),
    };
    let responder = Responder {
        id,
        method,
        streaming,
        max_chunk: limits.max_chunk,
        max_frame: limits.max_frame,
        out: output_tx.clone(),
        credit: credit_rx,
        cancel: cancel.clone(),
        finished: finished.clone(),
        state: Mutex::new(ResponderState {
            available: limits.window,
            ..ResponderState::default()
        }),
    };

    let events = events_tx.clone();
    let job: Job = Box::new(move || {
        let mut request = request;
        let outcome = if request.is_cancelled() {
            Err(PluginError::Cancelled)
        } else {
            handler(&mut request, &responder)
        };
        // A cancelled call never reports success.
        let outcome = if request.is_cancelled() {
            Err(PluginError::Cancelled)
        } else {
            outcome
        };
        responder.finish(outcome);
        let _ = events.send(Event::Finished(id));
    });

    let call = ActiveCall {
        cancel,
        finished,
        credit_tx: streaming.then_some(credit_tx),
        body_tx,
        body_unacked,
    };
    (call, job)
}

fn spawn_reader<R: Read + Send + 'static>(mut reader: FrameReader<R>, events: Sender<Event>) {
    thread::spawn(move || loop {
        let event = match reader.read() {
            Ok(Some(frame)) => Event::Frame(frame),
            Ok(None) => {
                let _ = events.send(Event::Closed(None));
                break;
            }
            Err(WireError::Malformed { id, reason }) => Event::Malformed { id, reason },
            Err(e) => {
                let _ = events.send(Event::Closed(Some(e.to_string())));
                break;
            }
        };
        if events.send(event).is_err() {
            break;
        }
    });
}

fn writer_loop<W: Write>(mut writer: FrameWriter<W>, output_rx: Receiver<Frame>) {
    for frame in output_rx {
        trace!(call_id = frame.id, frame_type = ?frame.frame_type, "writing frame");
        match writer.write(&frame) {
            Ok(()) => {}
            Err(e @ WireError::FrameTooLarge { .. }) => {
                warn!(call_id = frame.id, error = %e, "frame too large, failing call");
                let _ = writer.write(&Frame::err(frame.id, codes::PROTOCOL_ERROR, &e.to_string()));
            }
            Err(e) => {
                warn!(error = %e, "write failed, stopping writer");
                break;
            }
        }
    }
    if let Err(e) = writer.inner_mut().flush() {
        debug!(error = %e, "final flush failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc;
    use std::time::Duration;

    /// Raw host end: speaks frames directly so tests can misbehave.
    struct RawHost {
        reader: FrameReader<UnixStream>,
        writer: FrameWriter<UnixStream>,
    }

    impl RawHost {
        fn send(&mut self, frame: Frame) {
            self.writer.write(&frame).unwrap();
        }

        fn recv(&mut self) -> Frame {
            self.reader.read().unwrap().expect("plugin closed the connection")
        }

        /// Next frame that is not a LOG.
        fn recv_data(&mut self) -> Frame {
            loop {
                let frame = self.recv();
                if frame.frame_type != FrameType::Log {
                    return frame;
                }
            }
        }
    }

    fn host_hello(kind: CapabilityKind, window: u64) -> Frame {
        host_hello_limits(kind, 1_000_000, window)
    }

    fn host_hello_limits(kind: CapabilityKind, max_frame: u64, window: u64) -> Frame {
        let mut meta = BTreeMap::new();
        meta.insert("max_frame".to_string(), ciborium::Value::Integer(max_frame.into()));
        meta.insert("max_chunk".to_string(), ciborium::Value::Integer(4u64.into()));
        meta.insert("window".to_string(), ciborium::Value::Integer(window.into()));
        meta.insert("min_version".to_string(), ciborium::Value::Integer(1u64.into()));
        meta.insert("max_version".to_string(), ciborium::Value::Integer(1u64.into()));
        meta.insert("capability".to_string(), ciborium::Value::Text(kind.as_str().to_string()));
        meta.insert(
            "config".to_string(),
            ciborium::Value::Map(vec![(
                ciborium::Value::Text("greeting".to_string()),
                ciborium::Value::Text("hello".to_string()),
            )]),
        );
        Frame::hello(meta)
    }

    /// Start `runtime` on a socket pair and complete the handshake (max_chunk 4).
    fn start(runtime: PluginRuntime, window: u64) -> (RawHost, JoinHandle<Result<(), PluginError>>) {
        start_with(runtime, host_hello(CapabilityKind::Storage, window))
    }

    fn start_with(runtime: PluginRuntime, hello: Frame) -> (RawHost, JoinHandle<Result<(), PluginError>>) {
        let (host_end, plugin_end) = UnixStream::pair().unwrap();
        let plugin_reader = plugin_end.try_clone().unwrap();
        let handle = thread::spawn(move || runtime.serve(plugin_reader, plugin_end));

        let mut host = RawHost {
            reader: FrameReader::new(host_end.try_clone().unwrap()),
            writer: FrameWriter::new(host_end),
        };
        host.send(hello);
        let hello = host.recv();
        assert_eq!(hello.frame_type, FrameType::Hello);
        (host, handle)
    }

    fn storage_runtime() -> PluginRuntime {
        let mut runtime = PluginRuntime::new(CapabilityKind::Storage, "test", "0.0.1");
        runtime.register_raw(Method::Location, |req, res| {
            let greeting = req.config().get("greeting").cloned().unwrap_or_default();
            res.reply_cbor(&format!("{}:mem", greeting))
        });
        runtime.register_raw(Method::PutState, |req, res| {
            let mut body = Vec::new();
            req.body()?.read_to_end(&mut body)?;
            res.reply_cbor(&(body.len() as u64))
        });
        runtime.register_raw(Method::GetState, |_req, res| res.write(b"0123456789"));
        runtime.register_raw(Method::GetPackfile, |req, res| {
            res.log("info", "starting endless stream");
            loop {
                req.cancel_token().check()?;
                res.write(b"xx")?;
            }
        });
        runtime
    }

    #[test]
    fn test_result_too_large_for_a_frame_fails_the_handler() {
        let (outcome_tx, outcome_rx) = mpsc::channel();
        let mut runtime = PluginRuntime::new(CapabilityKind::Importer, "test", "0.0.1");
        runtime.register_raw(Method::Scan, move |_req, res| {
            res.item("a".repeat(50).as_str())?;
            // 152 encoded bytes: under max_frame, over what a CHUNK frame leaves
            let outcome = res.item("b".repeat(150).as_str());
            let failed = matches!(outcome, Err(PluginError::Protocol(_)));
            outcome_tx.send(failed).unwrap();
            outcome
        });
        let (mut host, _plugin) = start_with(runtime, host_hello_limits(CapabilityKind::Importer, 200, 4));

        host.send(Frame::req(2, Method::Scan, vec![], flags::STREAM_RESPONSE, None));
        let first = host.recv_data();
        assert_eq!(first.frame_type, FrameType::Chunk);
        let item: String = from_cbor(first.payload.as_deref().unwrap()).unwrap();
        assert_eq!(item.len(), 50);

        let terminal = host.recv_data();
        assert_eq!(terminal.frame_type, FrameType::Err);
        assert_eq!(terminal.error_code(), Some(codes::PROTOCOL_ERROR));
        assert!(outcome_rx.recv_timeout(Duration::from_secs(5)).unwrap());

        // The connection survives
        host.send(Frame::req(3, Method::Origin, vec![], 0, None));
        assert_eq!(host.recv_data().error_code(), Some(codes::NO_HANDLER));
    }

    #[test]
    fn test_unary_call_sees_launch_config() {
        let (mut host, _plugin) = start(storage_runtime(), 4);
        host.send(Frame::req(1, Method::Location, vec![], 0, None));
        let res = host.recv_data();
        assert_eq!(res.frame_type, FrameType::Res);
        let value: String = from_cbor(res.payload.as_deref().unwrap()).unwrap();
        assert_eq!(value, "hello:mem");
    }

    #[test]
    fn test_unregistered_method_is_no_handler() {
        let (mut host, _plugin) = start(storage_runtime(), 4);
        host.send(Frame::req(3, Method::GetLocks, vec![], 0, None));
        let err = host.recv_data();
        assert_eq!(err.error_code(), Some(codes::NO_HANDLER));
    }

    #[test]
    fn test_flags_not_matching_shape_are_rejected() {
        let (mut host, _plugin) = start(storage_runtime(), 4);
        host.send(Frame::req(4, Method::Location, vec![], flags::STREAM_RESPONSE, None));
        assert_eq!(host.recv_data().error_code(), Some(codes::PROTOCOL_ERROR));
    }

    #[test]
    fn test_upload_body_is_acked_and_counted() {
        let (mut host, _plugin) = start(storage_runtime(), 4);
        host.send(Frame::req(5, Method::PutState, vec![], flags::STREAM_REQUEST, Some(6)));
        host.send(Frame::chunk(5, 0, b"abcd".to_vec()));
        host.send(Frame::chunk(5, 1, b"ef".to_vec()));
        host.send(Frame::end(5, 6, false));

        let mut acks = 0;
        loop {
            let frame = host.recv_data();
            match frame.frame_type {
                FrameType::Ack => acks += frame.len.unwrap(),
                FrameType::Res => {
                    let n: u64 = from_cbor(frame.payload.as_deref().unwrap()).unwrap();
                    assert_eq!(n, 6);
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(acks, 2);
    }

    #[test]
    fn test_upload_declared_length_mismatch() {
        let (mut host, _plugin) = start(storage_runtime(), 4);
        host.send(Frame::req(6, Method::PutState, vec![], flags::STREAM_REQUEST, Some(10)));
        host.send(Frame::chunk(6, 0, b"abc".to_vec()));
        host.send(Frame::end(6, 3, false));

        let err = loop {
            let frame = host.recv_data();
            if frame.frame_type == FrameType::Err {
                break frame;
            }
        };
        assert_eq!(err.error_code(), Some(codes::SIZE_MISMATCH));
        assert_eq!(err.meta_u64("declared"), Some(10));
        assert_eq!(err.meta_u64("actual"), Some(3));
    }

    #[test]
    fn test_download_respects_window() {
        let (mut host, _plugin) = start(storage_runtime(), 1);
        host.send(Frame::req(7, Method::GetState, vec![], flags::STREAM_RESPONSE, None));

        let mut body = Vec::new();
        loop {
            let frame = host.recv_data();
            match frame.frame_type {
                FrameType::Chunk => {
                    assert!(frame.payload.as_ref().unwrap().len() <= 4, "chunks honour max_chunk");
                    body.extend_from_slice(frame.payload.as_deref().unwrap());
                    host.send(Frame::ack(7, 1));
                }
                FrameType::End => {
                    assert_eq!(frame.len, Some(10));
                    assert!(!frame.has_flag(flags::SHORT_READ));
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(body, b"0123456789");
    }

    #[test]
    fn test_no_chunk_beyond_window_without_ack() {
        let (host, _plugin) = start(storage_runtime(), 2);
        let RawHost { mut reader, mut writer } = host;
        writer.write(&Frame::req(8, Method::GetState, vec![], flags::STREAM_RESPONSE, None)).unwrap();

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            while let Ok(Some(frame)) = reader.read() {
                if tx.send(frame).is_err() {
                    break;
                }
            }
        });
        let timeout = Duration::from_secs(2);
        assert_eq!(rx.recv_timeout(timeout).unwrap().chunk_index, Some(0));
        assert_eq!(rx.recv_timeout(timeout).unwrap().chunk_index, Some(1));

        // Window exhausted: nothing more may arrive until we ACK.
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        writer.write(&Frame::ack(8, 1)).unwrap();
        assert_eq!(rx.recv_timeout(timeout).unwrap().chunk_index, Some(2));
    }

    #[test]
    fn test_cancel_stops_stream_with_cancelled() {
        let (mut host, _plugin) = start(storage_runtime(), 4);
        host.send(Frame::req(9, Method::GetPackfile, vec![], flags::STREAM_RESPONSE, None));
        let first = host.recv_data();
        assert_eq!(first.frame_type, FrameType::Chunk);
        host.send(Frame::cancel(9));

        let terminal = loop {
            let frame = host.recv_data();
            if frame.frame_type.is_terminal() {
                break frame;
            }
        };
        assert_eq!(terminal.error_code(), Some(codes::CANCELLED));
    }

    #[test]
    fn test_heartbeat_is_echoed() {
        let (mut host, _plugin) = start(storage_runtime(), 4);
        host.send(Frame::heartbeat(77));
        let echo = host.recv_data();
        assert_eq!(echo.frame_type, FrameType::Heartbeat);
        assert_eq!(echo.id, 77);
    }

    #[test]
    fn test_goodbye_drains_in_flight_and_refuses_new_calls() {
        let mut runtime = storage_runtime();
        runtime.register_raw(Method::DeleteLock, |_req, res| {
            thread::sleep(Duration::from_millis(150));
            res.reply(Vec::new())
        });
        let (mut host, plugin) = start(runtime, 4);
        host.send(Frame::req(1, Method::DeleteLock, vec![], 0, None));
        host.send(Frame::goodbye());
        host.send(Frame::req(2, Method::Location, vec![], 0, None));

        let refused = host.recv_data();
        assert_eq!(refused.id, 2);
        assert_eq!(refused.error_code(), Some(codes::SHUTTING_DOWN));
        let finished = host.recv_data();
        assert_eq!((finished.id, finished.frame_type), (1, FrameType::Res));
        assert!(plugin.join().unwrap().is_ok());
    }

    #[test]
    fn test_serialized_calls_run_in_arrival_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut runtime = PluginRuntime::new(CapabilityKind::Storage, "serial", "0.0.1")
            .with_concurrency(Concurrency::Serialized);
        let seen = order.clone();
        runtime.register_raw(Method::DeleteState, move |req, res| {
            let n: u64 = req.decode()?;
            if n == 1 {
                // Would let call 2 overtake if calls ran concurrently.
                thread::sleep(Duration::from_millis(100));
            }
            lock(&seen).push(n);
            res.reply(Vec::new())
        });

        let (mut host, _plugin) = start(runtime, 4);
        host.send(Frame::req(1, Method::DeleteState, to_cbor(&1u64).unwrap(), 0, None));
        host.send(Frame::req(2, Method::DeleteState, to_cbor(&2u64).unwrap(), 0, None));
        assert_eq!(host.recv_data().id, 1);
        assert_eq!(host.recv_data().id, 2);
        assert_eq!(*lock(&order), vec![1, 2]);
    }

    #[test]
    fn test_factory_failure_reported_per_call() {
        let runtime = PluginRuntime::new(CapabilityKind::Storage, "broken", "0.0.1")
            .with_factory(|_config| Err(PluginError::invalid("missing location")));
        let (mut host, _plugin) = start(runtime, 4);
        host.send(Frame::req(1, Method::Size, vec![], 0, None));
        let err = host.recv_data();
        assert_eq!(err.error_code(), Some(codes::INVALID_ARGUMENT));
        assert_eq!(err.error_message(), Some("missing location"));
    }

    #[test]
    fn test_register_refuses_foreign_methods() {
        let mut runtime = PluginRuntime::new(CapabilityKind::Importer, "imp", "0.0.1");
        runtime.register_raw(Method::GetStates, |_req, res| res.reply(Vec::new()));
        runtime.register_raw(Method::Origin, |_req, res| res.reply(Vec::new()));
        assert_eq!(runtime.methods(), vec![Method::Origin]);
    }

    #[test]
    fn test_io_error_roundtrip_preserves_plugin_error() {
        let original = PluginError::SizeMismatch { declared: 5, actual: 2 };
        let io_err = io::Error::new(io::ErrorKind::Other, original.clone());
        assert_eq!(PluginError::from(io_err), original);
        assert!(matches!(
            PluginError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone")),
            PluginError::Io(_)
        ));
    }
}
