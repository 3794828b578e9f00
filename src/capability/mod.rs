//! Capability types shared by host and plugin
//!
//! A plugin implements exactly one capability. The host-side proxies
//! ([`ExporterClient`], [`ImporterClient`], [`StorageClient`]) turn typed calls
//! into bridge calls; the plugin-side traits ([`Exporter`], [`Importer`],
//! [`Storage`]) are what plugin authors implement, wired into the runtime by
//! [`exporter_methods`], [`importer_methods`] and [`storage_methods`].

pub mod exporter;
pub mod importer;
pub mod storage;

pub use exporter::{exporter_methods, Exporter, ExporterClient};
pub use importer::{importer_methods, Importer, ImporterClient, ScanIter};
pub use storage::{storage_methods, Storage, StorageClient};

use crate::bridge::frame::Method;
use crate::bridge::host_runtime::BridgeError;
use crate::bridge::io::{from_cbor, to_cbor};
use crate::bridge::plugin_runtime::{HandlerFn, PluginError, Request, Responder};
use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::SystemTime;

/// The role a plugin process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapabilityKind {
    Exporter,
    Importer,
    Storage,
}

impl CapabilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::Exporter => "exporter",
            CapabilityKind::Importer => "importer",
            CapabilityKind::Storage => "storage",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exporter" => Some(CapabilityKind::Exporter),
            "importer" => Some(CapabilityKind::Importer),
            "storage" => Some(CapabilityKind::Storage),
            _ => None,
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the plugin-side implementation accepts overlapping calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Concurrency {
    /// Each call runs on its own thread as soon as it arrives.
    #[default]
    Concurrent,
    /// Calls run one at a time in arrival order.
    Serialized,
}

/// Advertised by the plugin in its HELLO. Immutable for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub kind: CapabilityKind,
    /// Negotiated protocol version
    pub version: u32,
    pub methods: Vec<Method>,
    #[serde(default)]
    pub concurrency: Concurrency,
    /// Plugin name, informational
    #[serde(default)]
    pub name: String,
    /// Plugin release, informational
    #[serde(default)]
    pub plugin_version: String,
}

impl CapabilityDescriptor {
    pub fn supports(&self, method: Method) -> bool {
        self.methods.contains(&method)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Length of a content address in bytes.
pub const MAC_LEN: usize = 32;

/// Content address naming a State, Packfile or Lock. Opaque to the bridge.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Mac(pub [u8; MAC_LEN]);

impl Mac {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; MAC_LEN]>::try_from(bytes).ok().map(Mac)
    }

    pub fn as_bytes(&self) -> &[u8; MAC_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mac({})", self.to_hex())
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Mac {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Mac {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MacVisitor;

        impl<'de> Visitor<'de> for MacVisitor {
            type Value = Mac;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{} bytes", MAC_LEN)
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Mac, E> {
                Mac::from_slice(v).ok_or_else(|| E::invalid_length(v.len(), &self))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Mac, A::Error> {
                let mut out = [0u8; MAC_LEN];
                for (i, slot) in out.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(Mac(out))
            }
        }

        deserializer.deserialize_bytes(MacVisitor)
    }
}

/// Storage access mode bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Mode(pub u32);

impl Mode {
    pub const READ: Mode = Mode(0x1);
    pub const WRITE: Mode = Mode(0x2);
    pub const READ_WRITE: Mode = Mode(0x3);

    pub fn contains(self, other: Mode) -> bool {
        self.0 & other.0 == other.0
    }
}

/// File metadata carried by scans and `SetPermissions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: i64,
    pub mode: u32,
    pub mod_time: SystemTime,
    pub dev: u64,
    pub ino: u64,
    pub uid: u64,
    pub gid: u64,
    pub nlink: u32,
    pub username: String,
    pub groupname: String,
}

impl FileInfo {
    /// Minimal metadata for a regular file of the given size.
    pub fn regular(name: &str, size: i64, mode: u32) -> Self {
        Self {
            name: name.to_string(),
            size,
            mode,
            mod_time: SystemTime::UNIX_EPOCH,
            dev: 0,
            ino: 0,
            uid: 0,
            gid: 0,
            nlink: 1,
            username: String::new(),
            groupname: String::new(),
        }
    }
}

/// One scanned entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub pathname: String,
    pub file_info: FileInfo,
    /// Symlink target, if the entry is a link
    pub target: Option<String>,
    pub is_xattr: bool,
    pub xattr_name: Option<String>,
}

/// A per-entry failure. The scan continues after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanError {
    pub pathname: String,
    pub message: String,
}

/// One importable unit produced by an Importer's scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanResult {
    Record(ScanRecord),
    Error(ScanError),
}

impl ScanResult {
    pub fn pathname(&self) -> &str {
        match self {
            ScanResult::Record(r) => &r.pathname,
            ScanResult::Error(e) => &e.pathname,
        }
    }
}

// =============================================================================
// ADAPTER PLUMBING
// =============================================================================

pub(crate) fn encode_args<T: Serialize + ?Sized>(args: &T) -> Result<Vec<u8>, BridgeError> {
    to_cbor(args).map_err(|e| BridgeError::Protocol(format!("cannot encode arguments: {}", e)))
}

pub(crate) fn decode_reply<T: DeserializeOwned>(method: Method, bytes: &[u8]) -> Result<T, BridgeError> {
    from_cbor(bytes).map_err(|e| BridgeError::Protocol(format!("undecodable {:?} reply: {}", method, e)))
}

/// One method table entry.
pub(crate) fn entry<F>(method: Method, handler: F) -> (Method, HandlerFn)
where
    F: Fn(&mut Request, &Responder) -> Result<(), PluginError> + Send + Sync + 'static,
{
    (method, Arc::new(handler))
}

/// Hand the request body to `store`, then consume whatever it left unread so
/// the END total and declared length are always checked.
pub(crate) fn receive_body<T>(
    req: &mut Request,
    store: impl FnOnce(&mut dyn Read, Option<u64>) -> Result<T, PluginError>,
) -> Result<T, PluginError> {
    let body = req.body()?;
    let declared = body.declared_len();
    let value = store(&mut *body, declared)?;
    io::copy(body, &mut io::sink())?;
    Ok(value)
}
