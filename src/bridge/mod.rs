//! Snapwire bridge: capability calls across a process boundary
//!
//! Layers:
//! - **Wire** (`frame`, `io`): CBOR frames, length-prefixed, plus the HELLO exchange
//! - **Host** (`process`, `host_runtime`, `stream`): launches a plugin and
//!   multiplexes typed calls over one connection
//! - **Plugin** (`plugin_runtime`): handshakes with the host and dispatches
//!   calls to capability handlers

pub mod frame;
pub mod io;
pub mod stream;
pub mod host_runtime;
pub mod process;
pub mod plugin_runtime;

#[cfg(test)]
mod integration_tests;

pub use frame::{CallId, CallShape, Frame, FrameType, Limits, Method};
pub use host_runtime::{BridgeError, CallOptions, CancelHandle, RpcClient};
pub use plugin_runtime::{
    BodyReader, CancelToken, HandlerFn, MethodTable, PluginConfig, PluginError, PluginRuntime, Request,
    Responder,
};
pub use process::{Endpoint, LaunchOptions, PluginProcess, PluginState};
pub use stream::{ByteStream, ResponseStream, ResultStream, StreamEnd};
