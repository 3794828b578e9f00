//! CBOR Frame Types for the plugin bridge
//!
//! Every message exchanged between host and plugin is a [`Frame`]: a CBOR map
//! with integer keys, sent length-prefixed over the connection (see `io.rs`).
//!
//! ## Frame Format
//!
//! ```text
//! {
//!   0: version (u8, always 1)
//!   1: frame_type (u8)
//!   2: id (u64 call id, 0 for connection-level frames)
//!   3: method (u16, REQ only)
//!   4: flags (u8 bit set, see [`flags`])
//!   5: meta (map, optional)
//!   6: payload (bstr, optional)
//!   7: len (u64, optional - declared body length on REQ, total on END, credit on ACK)
//!   8: chunk_index (u64, CHUNK only)
//!   9: checksum (u64, CHUNK only - FNV-1a of payload)
//! }
//! ```
//!
//! ## Frame Types
//!
//! - HELLO (0): Handshake, once per connection in each direction
//! - REQ (1): Start a call
//! - RES (2): Single complete response of a unary call
//! - CHUNK (3): One piece of a byte stream or one scan result
//! - END (4): Stream complete marker
//! - LOG (5): Log line emitted by a plugin handler
//! - ERR (6): Terminal error of a call (or of the handshake when id is 0)
//! - HEARTBEAT (7): Liveness ping, echoed with the same id
//! - ACK (8): Stream credit returned by the consumer of a stream
//! - CANCEL (9): Host abandons a call
//! - GOODBYE (10): Host asks the plugin to drain and exit

use crate::capability::CapabilityKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Wire format version carried in every frame.
pub const WIRE_VERSION: u8 = 1;

/// Lowest protocol version this build can speak.
pub const PROTOCOL_VERSION_MIN: u32 = 1;

/// Highest protocol version this build can speak.
pub const PROTOCOL_VERSION_MAX: u32 = 1;

/// Default maximum frame size (3.5 MB). Larger payloads must be streamed.
pub const DEFAULT_MAX_FRAME: usize = 3_670_016;

/// Default maximum chunk size (256 KB)
pub const DEFAULT_MAX_CHUNK: usize = 262_144;

/// Upper bound on the encoded size of a CHUNK frame minus its payload: map
/// header, version, type, id, index, checksum and the byte-string header.
pub const CHUNK_OVERHEAD: usize = 64;

/// Default number of unacknowledged chunks a stream sender may have in flight.
pub const DEFAULT_WINDOW: usize = 16;

/// Call identifier, unique per open call on a connection.
pub type CallId = u64;

/// Frame type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    Hello = 0,
    Req = 1,
    Res = 2,
    Chunk = 3,
    End = 4,
    Log = 5,
    Err = 6,
    Heartbeat = 7,
    Ack = 8,
    Cancel = 9,
    Goodbye = 10,
}

impl FrameType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(FrameType::Hello),
            1 => Some(FrameType::Req),
            2 => Some(FrameType::Res),
            3 => Some(FrameType::Chunk),
            4 => Some(FrameType::End),
            5 => Some(FrameType::Log),
            6 => Some(FrameType::Err),
            7 => Some(FrameType::Heartbeat),
            8 => Some(FrameType::Ack),
            9 => Some(FrameType::Cancel),
            10 => Some(FrameType::Goodbye),
            _ => None,
        }
    }

    /// Terminal frames close a call on the receiving side.
    pub fn is_terminal(self) -> bool {
        matches!(self, FrameType::Res | FrameType::End | FrameType::Err)
    }
}

/// Envelope flag bits.
pub mod flags {
    /// REQ: a byte stream follows the request (CHUNK... END).
    pub const STREAM_REQUEST: u8 = 0x01;
    /// REQ: the caller expects a streamed response instead of RES.
    pub const STREAM_RESPONSE: u8 = 0x02;
    /// END/ERR/RES: last frame of the call in this direction.
    pub const FINAL: u8 = 0x04;
    /// ERR: the call failed.
    pub const ERROR: u8 = 0x08;
    /// END: the stream holds fewer bytes than requested because the object ended.
    pub const SHORT_READ: u8 = 0x10;

    pub const KNOWN: u8 = STREAM_REQUEST | STREAM_RESPONSE | FINAL | ERROR | SHORT_READ;
}

/// Error codes carried in ERR frames.
pub mod codes {
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const CANCELLED: &str = "CANCELLED";
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    pub const SIZE_MISMATCH: &str = "SIZE_MISMATCH";
    pub const NO_HANDLER: &str = "NO_HANDLER";
    pub const HANDLER_ERROR: &str = "HANDLER_ERROR";
    pub const INVALID_ARGUMENT: &str = "INVALID_ARGUMENT";
    pub const IO_ERROR: &str = "IO_ERROR";
    pub const SHUTTING_DOWN: &str = "SHUTTING_DOWN";
    pub const HANDSHAKE: &str = "HANDSHAKE";
}

/// Method selector. The high byte names the capability, the low byte the method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u16)]
pub enum Method {
    ExporterRoot = 0x0101,
    CreateDirectory = 0x0102,
    StoreFile = 0x0103,
    SetPermissions = 0x0104,
    ExporterClose = 0x0105,

    Origin = 0x0201,
    Type = 0x0202,
    ImporterRoot = 0x0203,
    Scan = 0x0204,
    OpenReader = 0x0205,
    ImporterClose = 0x0206,

    Create = 0x0301,
    Open = 0x0302,
    Location = 0x0303,
    Mode = 0x0304,
    Size = 0x0305,
    GetStates = 0x0306,
    PutState = 0x0307,
    GetState = 0x0308,
    DeleteState = 0x0309,
    GetPackfiles = 0x030a,
    PutPackfile = 0x030b,
    GetPackfile = 0x030c,
    GetPackfileBlob = 0x030d,
    DeletePackfile = 0x030e,
    GetLocks = 0x030f,
    PutLock = 0x0310,
    GetLock = 0x0311,
    DeleteLock = 0x0312,
    StorageClose = 0x0313,
}

/// How a method moves data across the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallShape {
    /// REQ → RES
    Unary,
    /// REQ + CHUNK... + END → RES
    Upload,
    /// REQ → CHUNK... + END, each chunk a slice of bytes
    Download,
    /// REQ → CHUNK... + END, each chunk one CBOR-encoded result
    Results,
}

impl Method {
    pub const ALL: [Method; 30] = [
        Method::ExporterRoot,
        Method::CreateDirectory,
        Method::StoreFile,
        Method::SetPermissions,
        Method::ExporterClose,
        Method::Origin,
        Method::Type,
        Method::ImporterRoot,
        Method::Scan,
        Method::OpenReader,
        Method::ImporterClose,
        Method::Create,
        Method::Open,
        Method::Location,
        Method::Mode,
        Method::Size,
        Method::GetStates,
        Method::PutState,
        Method::GetState,
        Method::DeleteState,
        Method::GetPackfiles,
        Method::PutPackfile,
        Method::GetPackfile,
        Method::GetPackfileBlob,
        Method::DeletePackfile,
        Method::GetLocks,
        Method::PutLock,
        Method::GetLock,
        Method::DeleteLock,
        Method::StorageClose,
    ];

    pub fn from_u16(v: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| *m as u16 == v)
    }

    pub fn capability(self) -> CapabilityKind {
        match (self as u16) >> 8 {
            0x01 => CapabilityKind::Exporter,
            0x02 => CapabilityKind::Importer,
            _ => CapabilityKind::Storage,
        }
    }

    pub fn shape(self) -> CallShape {
        match self {
            Method::StoreFile | Method::PutState | Method::PutPackfile | Method::PutLock => CallShape::Upload,
            Method::OpenReader
            | Method::GetState
            | Method::GetPackfile
            | Method::GetPackfileBlob
            | Method::GetLock => CallShape::Download,
            Method::Scan => CallShape::Results,
            _ => CallShape::Unary,
        }
    }

    /// Every method belonging to one capability, in selector order.
    pub fn for_capability(kind: CapabilityKind) -> Vec<Method> {
        Self::ALL.iter().copied().filter(|m| m.capability() == kind).collect()
    }
}

/// Negotiated protocol limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Maximum encoded frame size in bytes
    pub max_frame: usize,
    /// Maximum chunk payload size in bytes
    pub max_chunk: usize,
    /// Maximum unacknowledged chunks per stream
    pub window: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame: DEFAULT_MAX_FRAME,
            max_chunk: DEFAULT_MAX_CHUNK,
            window: DEFAULT_WINDOW,
        }
    }
}

impl Limits {
    /// Component-wise minimum of both sides' limits, clamped.
    pub fn negotiate(&self, theirs: &Limits) -> Limits {
        Limits {
            max_frame: self.max_frame.min(theirs.max_frame),
            max_chunk: self.max_chunk.min(theirs.max_chunk),
            window: self.window.min(theirs.window),
        }
        .clamped()
    }

    /// Shrink `max_chunk` so a full CHUNK frame fits in `max_frame`, and keep
    /// the window open.
    pub fn clamped(self) -> Limits {
        Limits {
            max_frame: self.max_frame,
            max_chunk: self.max_chunk.min(self.max_payload()),
            window: self.window.max(1),
        }
    }

    /// Largest payload a single CHUNK frame can carry.
    pub fn max_payload(&self) -> usize {
        self.max_frame.saturating_sub(CHUNK_OVERHEAD)
    }

    /// Refuse limits under which no chunk payload fits in a frame.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_payload() == 0 {
            return Err(format!(
                "max_frame {} leaves no room for chunk payload ({} bytes of envelope)",
                self.max_frame, CHUNK_OVERHEAD
            ));
        }
        if self.max_chunk == 0 {
            return Err("max_chunk must be at least 1".to_string());
        }
        Ok(())
    }
}

/// A CBOR protocol frame (the call envelope).
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Wire format version (always [`WIRE_VERSION`])
    pub version: u8,
    pub frame_type: FrameType,
    /// Call id for correlation
    pub id: CallId,
    /// Method selector (REQ only)
    pub method: Option<Method>,
    /// Flag bits, see [`flags`]
    pub flags: u8,
    pub meta: Option<BTreeMap<String, ciborium::Value>>,
    pub payload: Option<Vec<u8>>,
    /// Declared body length (REQ), total length (END), or credit count (ACK)
    pub len: Option<u64>,
    pub chunk_index: Option<u64>,
    /// FNV-1a checksum of payload (CHUNK only)
    pub checksum: Option<u64>,
}

impl Frame {
    pub fn new(frame_type: FrameType, id: CallId) -> Self {
        Self {
            version: WIRE_VERSION,
            frame_type,
            id,
            method: None,
            flags: 0,
            meta: None,
            payload: None,
            len: None,
            chunk_index: None,
            checksum: None,
        }
    }

    /// Create a HELLO frame carrying handshake metadata.
    pub fn hello(meta: BTreeMap<String, ciborium::Value>) -> Self {
        let mut frame = Self::new(FrameType::Hello, 0);
        frame.meta = Some(meta);
        frame
    }

    /// Create a REQ frame. `declared_len` is the advisory body length of an upload.
    pub fn req(id: CallId, method: Method, args: Vec<u8>, flags: u8, declared_len: Option<u64>) -> Self {
        let mut frame = Self::new(FrameType::Req, id);
        frame.method = Some(method);
        frame.flags = flags;
        frame.payload = Some(args);
        frame.len = declared_len;
        frame
    }

    /// Create a RES frame holding the complete response of a unary call.
    pub fn res(id: CallId, payload: Vec<u8>) -> Self {
        let mut frame = Self::new(FrameType::Res, id);
        frame.flags = flags::FINAL;
        frame.payload = Some(payload);
        frame
    }

    /// Create a CHUNK frame. The checksum is computed here.
    pub fn chunk(id: CallId, chunk_index: u64, payload: Vec<u8>) -> Self {
        let mut frame = Self::new(FrameType::Chunk, id);
        frame.checksum = Some(Self::compute_checksum(&payload));
        frame.chunk_index = Some(chunk_index);
        frame.payload = Some(payload);
        frame
    }

    /// Create an END frame. `total` is the byte count (or result count) of the stream.
    pub fn end(id: CallId, total: u64, short_read: bool) -> Self {
        let mut frame = Self::new(FrameType::End, id);
        frame.flags = flags::FINAL;
        if short_read {
            frame.flags |= flags::SHORT_READ;
        }
        frame.len = Some(total);
        frame
    }

    /// Create a LOG frame
    pub fn log(id: CallId, level: &str, message: &str) -> Self {
        let mut meta = BTreeMap::new();
        meta.insert("level".to_string(), ciborium::Value::Text(level.to_string()));
        meta.insert("message".to_string(), ciborium::Value::Text(message.to_string()));

        let mut frame = Self::new(FrameType::Log, id);
        frame.meta = Some(meta);
        frame
    }

    /// Create an ERR frame
    pub fn err(id: CallId, code: &str, message: &str) -> Self {
        let mut meta = BTreeMap::new();
        meta.insert("code".to_string(), ciborium::Value::Text(code.to_string()));
        meta.insert("message".to_string(), ciborium::Value::Text(message.to_string()));

        let mut frame = Self::new(FrameType::Err, id);
        frame.flags = flags::FINAL | flags::ERROR;
        frame.meta = Some(meta);
        frame
    }

    /// Create an ACK frame returning `credit` chunks of window to the sender.
    pub fn ack(id: CallId, credit: u64) -> Self {
        let mut frame = Self::new(FrameType::Ack, id);
        frame.len = Some(credit);
        frame
    }

    pub fn cancel(id: CallId) -> Self {
        Self::new(FrameType::Cancel, id)
    }

    /// Either side can send; the receiver must respond with HEARTBEAT using the same id.
    pub fn heartbeat(id: CallId) -> Self {
        Self::new(FrameType::Heartbeat, id)
    }

    pub fn goodbye() -> Self {
        Self::new(FrameType::Goodbye, 0)
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }

    /// Get error code if this is an ERR frame
    pub fn error_code(&self) -> Option<&str> {
        if self.frame_type != FrameType::Err {
            return None;
        }
        self.meta_text("code")
    }

    /// Get error message if this is an ERR frame
    pub fn error_message(&self) -> Option<&str> {
        if self.frame_type != FrameType::Err {
            return None;
        }
        self.meta_text("message")
    }

    /// Get log level if this is a LOG frame
    pub fn log_level(&self) -> Option<&str> {
        if self.frame_type != FrameType::Log {
            return None;
        }
        self.meta_text("level")
    }

    /// Get log message if this is a LOG frame
    pub fn log_message(&self) -> Option<&str> {
        if self.frame_type != FrameType::Log {
            return None;
        }
        self.meta_text("message")
    }

    pub fn meta_text(&self, key: &str) -> Option<&str> {
        self.meta.as_ref().and_then(|m| match m.get(key) {
            Some(ciborium::Value::Text(s)) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn meta_bytes(&self, key: &str) -> Option<&[u8]> {
        self.meta.as_ref().and_then(|m| match m.get(key) {
            Some(ciborium::Value::Bytes(b)) => Some(b.as_slice()),
            _ => None,
        })
    }

    pub fn meta_u64(&self, key: &str) -> Option<u64> {
        self.meta.as_ref().and_then(|m| match m.get(key) {
            Some(ciborium::Value::Integer(i)) => u64::try_from(i128::from(*i)).ok(),
            _ => None,
        })
    }

    /// Compute FNV-1a 64-bit checksum of bytes.
    pub fn compute_checksum(data: &[u8]) -> u64 {
        const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
        const FNV_PRIME: u64 = 0x100000001b3;

        let mut hash = FNV_OFFSET_BASIS;
        for &byte in data {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }

    /// Flag bits a frame of this type may carry.
    pub fn allowed_flags(frame_type: FrameType) -> u8 {
        match frame_type {
            FrameType::Req => flags::STREAM_REQUEST | flags::STREAM_RESPONSE,
            FrameType::Res => flags::FINAL,
            FrameType::End => flags::FINAL | flags::SHORT_READ,
            FrameType::Err => flags::FINAL | flags::ERROR,
            _ => 0,
        }
    }
}

/// Integer keys for CBOR map fields
pub mod keys {
    pub const VERSION: u64 = 0;
    pub const FRAME_TYPE: u64 = 1;
    pub const ID: u64 = 2;
    pub const METHOD: u64 = 3;
    pub const FLAGS: u64 = 4;
    pub const META: u64 = 5;
    pub const PAYLOAD: u64 = 6;
    pub const LEN: u64 = 7;
    pub const INDEX: u64 = 8;
    pub const CHECKSUM: u64 = 9;
}
