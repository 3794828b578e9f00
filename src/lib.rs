//! Snapwire - process-isolated capability plugins
//!
//! A host delegates Exporter, Importer and Storage work to plugin binaries.
//! This crate is both ends of the bridge: the host launches a plugin and gets
//! a typed client ([`StorageClient`], [`ImporterClient`], [`ExporterClient`]);
//! the plugin implements a capability trait and serves it with
//! [`PluginRuntime`].

pub mod bridge;
pub mod capability;
pub mod config;
pub mod logging;

pub use bridge::{
    BridgeError, ByteStream, CallOptions, CancelHandle, Endpoint, LaunchOptions, PluginError,
    PluginProcess, PluginRuntime, PluginState, ResultStream, RpcClient,
};
pub use capability::{
    exporter_methods, importer_methods, storage_methods, CapabilityDescriptor, CapabilityKind,
    Concurrency, Exporter, ExporterClient, FileInfo, Importer, ImporterClient, Mac, Mode, ScanError,
    ScanIter, ScanRecord, ScanResult, Storage, StorageClient, MAC_LEN,
};
pub use config::BridgeConfig;
