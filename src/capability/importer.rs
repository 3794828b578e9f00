//! Importer capability: reads source data to back up

use super::{decode_reply, encode_args, entry, ScanResult};
use crate::bridge::frame::Method;
use crate::bridge::host_runtime::{BridgeError, CallOptions, RpcClient};
use crate::bridge::plugin_runtime::{MethodTable, PluginError};
use crate::bridge::stream::{ByteStream, ResultStream};
use std::io::Read;
use std::sync::Arc;
use tracing::debug;

/// Lazy scan output. Dropped as soon as the host abandons the scan.
///
/// A per-entry problem is an `Ok(ScanResult::Error)` and the scan goes on; an
/// `Err` ends the scan, after whatever was already delivered.
pub type ScanIter = Box<dyn Iterator<Item = Result<ScanResult, PluginError>> + Send>;

/// Plugin-side importer implementation.
pub trait Importer: Send + Sync {
    fn origin(&self) -> Result<String, PluginError>;
    /// Source type, e.g. `fs` or `s3`.
    fn kind(&self) -> Result<String, PluginError>;
    fn root(&self) -> Result<String, PluginError>;
    fn scan(&self) -> Result<ScanIter, PluginError>;
    fn open_reader(&self, pathname: &str) -> Result<Box<dyn Read + Send>, PluginError>;
    fn close(&self) -> Result<(), PluginError>;
}

/// Method table serving `importer`.
pub fn importer_methods<I: Importer + 'static>(importer: Arc<I>) -> MethodTable {
    let i = importer.clone();
    let origin = entry(Method::Origin, move |_req, res| res.reply_cbor(&i.origin()?));
    let i = importer.clone();
    let kind = entry(Method::Type, move |_req, res| res.reply_cbor(&i.kind()?));
    let i = importer.clone();
    let root = entry(Method::ImporterRoot, move |_req, res| res.reply_cbor(&i.root()?));

    let i = importer.clone();
    let scan = entry(Method::Scan, move |req, res| {
        let results = i.scan()?;
        let mut produced = 0u64;
        for result in results {
            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    debug!(call_id = req.id(), produced, error = %e, "scan failed");
                    return Err(e);
                }
            };
            if let Err(e) = res.item(&result) {
                debug!(call_id = req.id(), produced, error = %e, "scan stopped");
                return Err(e);
            }
            produced += 1;
        }
        Ok(())
    });

    let i = importer.clone();
    let open_reader = entry(Method::OpenReader, move |req, res| {
        let pathname: String = req.decode()?;
        let reader = i.open_reader(&pathname)?;
        res.copy_from(reader)?;
        Ok(())
    });

    let close = entry(Method::ImporterClose, move |_req, res| {
        importer.close()?;
        res.reply(Vec::new())
    });

    vec![origin, kind, root, scan, open_reader, close]
}

/// Host-side proxy for an importer plugin.
#[derive(Debug, Clone)]
pub struct ImporterClient {
    rpc: RpcClient,
    opts: CallOptions,
}

impl ImporterClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self {
            rpc,
            opts: CallOptions::default(),
        }
    }

    /// A client whose calls all carry `opts`, e.g. a shorter deadline or a
    /// shared cancel handle.
    pub fn with_options(mut self, opts: CallOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    async fn text(&self, method: Method) -> Result<String, BridgeError> {
        let reply = self.rpc.call_with(method, Vec::new(), self.opts.clone()).await?;
        decode_reply(method, &reply)
    }

    pub async fn origin(&self) -> Result<String, BridgeError> {
        self.text(Method::Origin).await
    }

    /// Source type (`Type` on the wire).
    pub async fn kind(&self) -> Result<String, BridgeError> {
        self.text(Method::Type).await
    }

    pub async fn root(&self) -> Result<String, BridgeError> {
        self.text(Method::ImporterRoot).await
    }

    /// Start a scan. Results arrive lazily in production order; dropping the
    /// stream stops the plugin-side scan.
    pub async fn scan(&self) -> Result<ResultStream<ScanResult>, BridgeError> {
        self.scan_with(self.opts.clone()).await
    }

    pub async fn scan_with(&self, opts: CallOptions) -> Result<ResultStream<ScanResult>, BridgeError> {
        let stream = self.rpc.call_streaming(Method::Scan, Vec::new(), opts).await?;
        Ok(ResultStream::new(stream))
    }

    /// Contents of one scanned file.
    pub async fn open_reader(&self, pathname: &str) -> Result<ByteStream, BridgeError> {
        let stream = self
            .rpc
            .call_streaming(Method::OpenReader, encode_args(pathname)?, self.opts.clone())
            .await?;
        Ok(ByteStream::new(stream))
    }

    pub async fn close(&self) -> Result<(), BridgeError> {
        self.rpc.call_with(Method::ImporterClose, Vec::new(), self.opts.clone()).await?;
        Ok(())
    }
}
