//! CBOR I/O - Reading and Writing Frames
//!
//! Frames are written length-prefixed over any byte-oriented connection
//! (Unix socket or stdio pipes).
//!
//! ## Wire Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  4 bytes: u32 big-endian length                         │
//! ├─────────────────────────────────────────────────────────┤
//! │  N bytes: CBOR-encoded Frame                            │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! A length prefix above the negotiated `max_frame`, or a body cut short,
//! desynchronizes the stream and is fatal to the connection. A body that is
//! well delimited but malformed yields [`WireError::Malformed`], which only
//! fails the call it belongs to.

use crate::bridge::frame::{
    flags, keys, CallId, Frame, FrameType, Limits, Method, WIRE_VERSION,
};
use crate::capability::{CapabilityDescriptor, CapabilityKind, Concurrency};
use ciborium::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (16 MB) - hard limit to prevent memory exhaustion
const MAX_FRAME_HARD_LIMIT: usize = 16 * 1024 * 1024;

/// Errors that can occur during frame I/O
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("CBOR encoding error: {0}")]
    Encode(String),

    #[error("CBOR decoding error: {0}")]
    Decode(String),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Malformed frame (call {id:?}): {reason}")]
    Malformed { id: Option<CallId>, reason: String },

    #[error("Unexpected end of stream")]
    UnexpectedEof,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),
}

impl WireError {
    /// Whether the connection can no longer be trusted after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WireError::Malformed { .. })
    }

    fn malformed(id: Option<CallId>, reason: impl Into<String>) -> Self {
        WireError::Malformed { id, reason: reason.into() }
    }
}

/// Serialize a value as CBOR.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Deserialize a CBOR value.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    ciborium::from_reader(bytes).map_err(|e| WireError::Decode(e.to_string()))
}

fn uint(n: u64) -> Value {
    Value::Integer(n.into())
}

fn as_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Integer(i) => u64::try_from(i128::from(*i)).ok(),
        _ => None,
    }
}

/// Encode a frame to CBOR bytes
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, WireError> {
    let mut map: Vec<(Value, Value)> = Vec::with_capacity(10);

    map.push((uint(keys::VERSION), uint(frame.version as u64)));
    map.push((uint(keys::FRAME_TYPE), uint(frame.frame_type as u8 as u64)));
    map.push((uint(keys::ID), uint(frame.id)));

    if let Some(method) = frame.method {
        map.push((uint(keys::METHOD), uint(method as u16 as u64)));
    }

    if frame.flags != 0 {
        map.push((uint(keys::FLAGS), uint(frame.flags as u64)));
    }

    if let Some(ref meta) = frame.meta {
        let meta_map: Vec<(Value, Value)> = meta
            .iter()
            .map(|(k, v)| (Value::Text(k.clone()), v.clone()))
            .collect();
        map.push((uint(keys::META), Value::Map(meta_map)));
    }

    if let Some(ref payload) = frame.payload {
        map.push((uint(keys::PAYLOAD), Value::Bytes(payload.clone())));
    }

    if let Some(len) = frame.len {
        map.push((uint(keys::LEN), uint(len)));
    }

    if let Some(chunk_index) = frame.chunk_index {
        map.push((uint(keys::INDEX), uint(chunk_index)));
    }

    if let Some(checksum) = frame.checksum {
        map.push((uint(keys::CHECKSUM), uint(checksum)));
    }

    to_cbor(&Value::Map(map))
}

/// Decode a frame from CBOR bytes.
///
/// Validation failures after the call id has been read carry that id so the
/// caller can fail just the affected call.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, WireError> {
    let value: Value = ciborium::from_reader(bytes)
        .map_err(|e| WireError::malformed(None, format!("undecodable CBOR: {}", e)))?;

    let map = match value {
        Value::Map(m) => m,
        _ => return Err(WireError::malformed(None, "expected map")),
    };

    let mut lookup: BTreeMap<u64, Value> = BTreeMap::new();
    for (k, v) in map {
        if let Some(key) = as_u64(&k) {
            lookup.insert(key, v);
        }
    }

    let id = lookup
        .get(&keys::ID)
        .and_then(as_u64)
        .ok_or_else(|| WireError::malformed(None, "missing id"))?;
    let bad = |reason: String| WireError::malformed(Some(id), reason);

    let version = lookup
        .get(&keys::VERSION)
        .and_then(as_u64)
        .ok_or_else(|| bad("missing version".to_string()))?;
    if version != WIRE_VERSION as u64 {
        return Err(bad(format!("unsupported wire version {}", version)));
    }

    let frame_type_raw = lookup
        .get(&keys::FRAME_TYPE)
        .and_then(as_u64)
        .ok_or_else(|| bad("missing frame_type".to_string()))?;
    let frame_type = u8::try_from(frame_type_raw)
        .ok()
        .and_then(FrameType::from_u8)
        .ok_or_else(|| bad(format!("invalid frame_type: {}", frame_type_raw)))?;

    let method = match lookup.get(&keys::METHOD) {
        None => None,
        Some(v) => {
            let raw = as_u64(v).ok_or_else(|| bad("method is not an integer".to_string()))?;
            let method = u16::try_from(raw)
                .ok()
                .and_then(Method::from_u16)
                .ok_or_else(|| bad(format!("unknown method selector: {:#06x}", raw)))?;
            Some(method)
        }
    };

    let flag_bits = match lookup.get(&keys::FLAGS) {
        None => 0u8,
        Some(v) => as_u64(v)
            .and_then(|n| u8::try_from(n).ok())
            .ok_or_else(|| bad("flags out of range".to_string()))?,
    };
    if flag_bits & !flags::KNOWN != 0 {
        return Err(bad(format!("unknown flag bits: {:#04x}", flag_bits)));
    }
    if flag_bits & !Frame::allowed_flags(frame_type) != 0 {
        return Err(bad(format!(
            "flag combination {:#04x} not valid on {:?}",
            flag_bits, frame_type
        )));
    }

    let meta = lookup.get(&keys::META).and_then(|v| match v {
        Value::Map(m) => {
            let mut result = BTreeMap::new();
            for (k, v) in m {
                if let Value::Text(key) = k {
                    result.insert(key.clone(), v.clone());
                }
            }
            Some(result)
        }
        _ => None,
    });

    let payload = lookup.get(&keys::PAYLOAD).and_then(|v| match v {
        Value::Bytes(b) => Some(b.clone()),
        _ => None,
    });

    let frame = Frame {
        version: version as u8,
        frame_type,
        id,
        method,
        flags: flag_bits,
        meta,
        payload,
        len: lookup.get(&keys::LEN).and_then(as_u64),
        chunk_index: lookup.get(&keys::INDEX).and_then(as_u64),
        checksum: lookup.get(&keys::CHECKSUM).and_then(as_u64),
    };

    // Validate required fields based on frame type
    match frame.frame_type {
        FrameType::Req => {
            if frame.method.is_none() {
                return Err(bad("REQ frame missing method".to_string()));
            }
        }
        FrameType::Chunk => {
            let payload = frame
                .payload
                .as_ref()
                .ok_or_else(|| bad("CHUNK frame missing payload".to_string()))?;
            if frame.chunk_index.is_none() {
                return Err(bad("CHUNK frame missing chunk_index".to_string()));
            }
            let checksum = frame
                .checksum
                .ok_or_else(|| bad("CHUNK frame missing checksum".to_string()))?;
            if checksum != Frame::compute_checksum(payload) {
                return Err(bad(format!(
                    "CHUNK checksum mismatch at index {}",
                    frame.chunk_index.unwrap_or_default()
                )));
            }
        }
        FrameType::End => {
            if !frame.has_flag(flags::FINAL) {
                return Err(bad("END frame without FINAL flag".to_string()));
            }
        }
        FrameType::Err => {
            if !frame.has_flag(flags::ERROR) {
                return Err(bad("ERR frame without ERROR flag".to_string()));
            }
        }
        FrameType::Ack => {
            if frame.len.is_none() {
                return Err(bad("ACK frame missing credit".to_string()));
            }
        }
        _ => {}
    }

    Ok(frame)
}

fn check_size(size: usize, limits: &Limits) -> Result<(), WireError> {
    let max = limits.max_frame.min(MAX_FRAME_HARD_LIMIT);
    if size > max {
        return Err(WireError::FrameTooLarge { size, max });
    }
    Ok(())
}

/// Write a length-prefixed CBOR frame to a writer
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame, limits: &Limits) -> Result<(), WireError> {
    let bytes = encode_frame(frame)?;
    check_size(bytes.len(), limits)?;

    let len = bytes.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&bytes)?;
    writer.flush()?;

    Ok(())
}

/// Write a length-prefixed CBOR frame to an async writer
pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
    limits: &Limits,
) -> Result<(), WireError> {
    let bytes = encode_frame(frame)?;
    check_size(bytes.len(), limits)?;

    // One buffer, one write: frames never interleave even if the sink is shared.
    let mut buf = Vec::with_capacity(4 + bytes.len());
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(&bytes);
    writer.write_all(&buf).await?;
    writer.flush().await?;

    Ok(())
}

/// Read a length-prefixed CBOR frame from an async reader
///
/// Returns Ok(None) on clean EOF, Err(UnexpectedEof) on partial read.
pub async fn read_frame_async<R: AsyncRead + Unpin>(
    reader: &mut R,
    limits: &Limits,
) -> Result<Option<Frame>, WireError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(WireError::Io(e)),
    }

    let length = u32::from_be_bytes(len_buf) as usize;
    check_size(length, limits)?;

    let mut body = vec![0u8; length];
    if let Err(e) = reader.read_exact(&mut body).await {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Err(WireError::UnexpectedEof);
        } else {
            return Err(WireError::Io(e));
        }
    }

    decode_frame(&body).map(Some)
}

/// Read a length-prefixed CBOR frame from a reader
///
/// Returns Ok(None) on clean EOF, Err(UnexpectedEof) on partial read.
pub fn read_frame<R: Read>(reader: &mut R, limits: &Limits) -> Result<Option<Frame>, WireError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(WireError::Io(e)),
    }

    let length = u32::from_be_bytes(len_buf) as usize;
    check_size(length, limits)?;

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            WireError::UnexpectedEof
        } else {
            WireError::Io(e)
        }
    })?;

    decode_frame(&body).map(Some)
}

/// Blocking frame reader
pub struct FrameReader<R: Read> {
    reader: R,
    limits: Limits,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            limits: Limits::default(),
        }
    }

    /// Update limits (after handshake)
    pub fn set_limits(&mut self, limits: Limits) {
        self.limits = limits;
    }

    pub fn read(&mut self) -> Result<Option<Frame>, WireError> {
        read_frame(&mut self.reader, &self.limits)
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }
}

/// Blocking frame writer
#[derive(Debug)]
pub struct FrameWriter<W: Write> {
    writer: W,
    limits: Limits,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            limits: Limits::default(),
        }
    }

    /// Update limits (after handshake)
    pub fn set_limits(&mut self, limits: Limits) {
        self.limits = limits;
    }

    pub fn write(&mut self, frame: &Frame) -> Result<(), WireError> {
        write_frame(&mut self.writer, frame, &self.limits)
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.writer
    }
}

/// Async frame reader
pub struct AsyncFrameReader<R: AsyncRead + Unpin> {
    reader: R,
    limits: Limits,
}

impl<R: AsyncRead + Unpin> AsyncFrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            limits: Limits::default(),
        }
    }

    /// Update limits (after handshake)
    pub fn set_limits(&mut self, limits: Limits) {
        self.limits = limits;
    }

    pub async fn read(&mut self) -> Result<Option<Frame>, WireError> {
        read_frame_async(&mut self.reader, &self.limits).await
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }
}

/// Async frame writer
pub struct AsyncFrameWriter<W: AsyncWrite + Unpin> {
    writer: W,
    limits: Limits,
}

impl<W: AsyncWrite + Unpin> AsyncFrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            limits: Limits::default(),
        }
    }

    /// Update limits (after handshake)
    pub fn set_limits(&mut self, limits: Limits) {
        self.limits = limits;
    }

    pub async fn write(&mut self, frame: &Frame) -> Result<(), WireError> {
        write_frame_async(&mut self.writer, frame, &self.limits).await
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }
}

// =============================================================================
// HANDSHAKE
// =============================================================================

/// What the host asks for in its HELLO.
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    pub kind: CapabilityKind,
    pub min_version: u32,
    pub max_version: u32,
    pub limits: Limits,
    /// Launch configuration handed to the capability implementation
    pub config: BTreeMap<String, String>,
}

/// Host-side handshake outcome.
#[derive(Debug, Clone)]
pub struct HandshakeResult {
    pub limits: Limits,
    pub descriptor: CapabilityDescriptor,
}

/// What the plugin is able to serve.
#[derive(Debug, Clone)]
pub struct PluginOffer {
    pub kind: CapabilityKind,
    pub min_version: u32,
    pub max_version: u32,
    pub methods: Vec<Method>,
    pub concurrency: Concurrency,
    pub name: String,
    pub plugin_version: String,
    pub limits: Limits,
}

/// Plugin-side handshake outcome.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub descriptor: CapabilityDescriptor,
    pub limits: Limits,
    pub config: BTreeMap<String, String>,
}

fn limits_meta(meta: &mut BTreeMap<String, Value>, limits: &Limits) {
    meta.insert("max_frame".to_string(), uint(limits.max_frame as u64));
    meta.insert("max_chunk".to_string(), uint(limits.max_chunk as u64));
    meta.insert("window".to_string(), uint(limits.window as u64));
}

fn hello_limits(frame: &Frame) -> Limits {
    let defaults = Limits::default();
    let positive = |key: &str, fallback: usize| {
        frame
            .meta_u64(key)
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .unwrap_or(fallback)
    };
    Limits {
        max_frame: positive("max_frame", defaults.max_frame),
        max_chunk: positive("max_chunk", defaults.max_chunk),
        window: positive("window", defaults.window),
    }
}

fn hello_config(frame: &Frame) -> BTreeMap<String, String> {
    let mut config = BTreeMap::new();
    if let Some(Value::Map(entries)) = frame.meta.as_ref().and_then(|m| m.get("config")) {
        for (k, v) in entries {
            if let (Value::Text(k), Value::Text(v)) = (k, v) {
                config.insert(k.clone(), v.clone());
            }
        }
    }
    config
}

fn handshake_refusal(frame: &Frame) -> WireError {
    WireError::Handshake(format!(
        "plugin refused: [{}] {}",
        frame.error_code().unwrap_or("UNKNOWN"),
        frame.error_message().unwrap_or("no message")
    ))
}

/// Perform the HELLO exchange (host side - sends first).
///
/// Fails if the plugin refuses, offers a different capability, or picks a
/// version outside the requested range.
pub async fn handshake_async<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
    reader: &mut AsyncFrameReader<R>,
    writer: &mut AsyncFrameWriter<W>,
    request: &HandshakeRequest,
) -> Result<HandshakeResult, WireError> {
    let mut meta = BTreeMap::new();
    limits_meta(&mut meta, &request.limits);
    meta.insert("min_version".to_string(), uint(request.min_version as u64));
    meta.insert("max_version".to_string(), uint(request.max_version as u64));
    meta.insert("capability".to_string(), Value::Text(request.kind.as_str().to_string()));
    let config = request
        .config
        .iter()
        .map(|(k, v)| (Value::Text(k.clone()), Value::Text(v.clone())))
        .collect();
    meta.insert("config".to_string(), Value::Map(config));
    writer.write(&Frame::hello(meta)).await?;

    let their_frame = reader.read().await?.ok_or_else(|| {
        WireError::Handshake("connection closed before receiving HELLO".to_string())
    })?;

    match their_frame.frame_type {
        FrameType::Hello => {}
        FrameType::Err => return Err(handshake_refusal(&their_frame)),
        other => {
            return Err(WireError::Handshake(format!("expected HELLO, got {:?}", other)));
        }
    }

    let descriptor_json = their_frame
        .meta_bytes("descriptor")
        .ok_or_else(|| WireError::Handshake("plugin HELLO missing descriptor".to_string()))?;
    let descriptor = CapabilityDescriptor::from_json(descriptor_json)
        .map_err(|e| WireError::Handshake(format!("invalid descriptor: {}", e)))?;

    if descriptor.kind != request.kind {
        return Err(WireError::Handshake(format!(
            "capability mismatch: wanted {}, plugin serves {}",
            request.kind, descriptor.kind
        )));
    }
    if descriptor.version < request.min_version || descriptor.version > request.max_version {
        return Err(WireError::Handshake(format!(
            "plugin chose protocol version {} outside {}..={}",
            descriptor.version, request.min_version, request.max_version
        )));
    }
    if let Some(stray) = descriptor.methods.iter().find(|m| m.capability() != request.kind) {
        return Err(WireError::Handshake(format!(
            "descriptor lists {:?} which is not a {} method",
            stray, request.kind
        )));
    }

    let limits = request.limits.negotiate(&hello_limits(&their_frame));
    limits
        .validate()
        .map_err(|reason| WireError::Handshake(format!("unusable limits: {}", reason)))?;
    reader.set_limits(limits);
    writer.set_limits(limits);

    Ok(HandshakeResult { limits, descriptor })
}

/// Accept the HELLO exchange (plugin side - receives first).
///
/// On capability mismatch or disjoint version ranges an ERR frame with id 0
/// is sent back before failing, so the host sees why.
pub fn handshake_accept<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    offer: &PluginOffer,
) -> Result<Accepted, WireError> {
    let their_frame = reader.read()?.ok_or_else(|| {
        WireError::Handshake("connection closed before receiving HELLO".to_string())
    })?;

    if their_frame.frame_type != FrameType::Hello {
        return Err(WireError::Handshake(format!(
            "expected HELLO, got {:?}",
            their_frame.frame_type
        )));
    }

    let refuse = |writer: &mut FrameWriter<W>, message: String| -> WireError {
        let _ = writer.write(&Frame::err(0, crate::bridge::frame::codes::HANDSHAKE, &message));
        WireError::Handshake(message)
    };

    let wanted = their_frame.meta_text("capability").and_then(CapabilityKind::parse);
    if wanted != Some(offer.kind) {
        let message = format!(
            "capability mismatch: host wants {:?}, plugin serves {}",
            their_frame.meta_text("capability"),
            offer.kind
        );
        return Err(refuse(writer, message));
    }

    let host_min = their_frame.meta_u64("min_version").unwrap_or(0);
    let host_max = their_frame.meta_u64("max_version").unwrap_or(0);
    let lo = host_min.max(offer.min_version as u64);
    let hi = host_max.min(offer.max_version as u64);
    if lo > hi {
        let message = format!(
            "no common protocol version: host {}..={}, plugin {}..={}",
            host_min, host_max, offer.min_version, offer.max_version
        );
        return Err(refuse(writer, message));
    }

    let limits = offer.limits.negotiate(&hello_limits(&their_frame));
    if let Err(reason) = limits.validate() {
        return Err(refuse(writer, format!("unusable limits: {}", reason)));
    }
    let descriptor = CapabilityDescriptor {
        kind: offer.kind,
        version: hi as u32,
        methods: offer.methods.clone(),
        concurrency: offer.concurrency,
        name: offer.name.clone(),
        plugin_version: offer.plugin_version.clone(),
    };
    let descriptor_json = descriptor
        .to_json()
        .map_err(|e| WireError::Encode(e.to_string()))?;

    let mut meta = BTreeMap::new();
    limits_meta(&mut meta, &limits);
    meta.insert("version".to_string(), uint(hi));
    meta.insert("descriptor".to_string(), Value::Bytes(descriptor_json));
    writer.write(&Frame::hello(meta))?;

    reader.set_limits(limits);
    writer.set_limits(limits);

    Ok(Accepted {
        descriptor,
        limits,
        config: hello_config(&their_frame),
    })
}
