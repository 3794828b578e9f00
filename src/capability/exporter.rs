//! Exporter capability: writes restored data to a destination

use super::{encode_args, decode_reply, entry, receive_body, FileInfo};
use crate::bridge::frame::Method;
use crate::bridge::host_runtime::{BridgeError, CallOptions, RpcClient};
use crate::bridge::plugin_runtime::{MethodTable, PluginError};
use std::io::Read;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Plugin-side exporter implementation.
pub trait Exporter: Send + Sync {
    fn root(&self) -> Result<String, PluginError>;
    fn create_directory(&self, pathname: &str) -> Result<(), PluginError>;
    /// `size` is the length the host declared; the bridge fails the call with
    /// `SIZE_MISMATCH` if the body disagrees.
    fn store_file(&self, pathname: &str, reader: &mut dyn Read, size: u64) -> Result<(), PluginError>;
    fn set_permissions(&self, pathname: &str, info: &FileInfo) -> Result<(), PluginError>;
    fn close(&self) -> Result<(), PluginError>;
}

/// Method table serving `exporter`.
pub fn exporter_methods<E: Exporter + 'static>(exporter: Arc<E>) -> MethodTable {
    let e = exporter.clone();
    let root = entry(Method::ExporterRoot, move |_req, res| res.reply_cbor(&e.root()?));

    let e = exporter.clone();
    let create_directory = entry(Method::CreateDirectory, move |req, res| {
        let pathname: String = req.decode()?;
        e.create_directory(&pathname)?;
        res.reply(Vec::new())
    });

    let e = exporter.clone();
    let store_file = entry(Method::StoreFile, move |req, res| {
        let pathname: String = req.decode()?;
        receive_body(req, |body, declared| {
            e.store_file(&pathname, body, declared.unwrap_or_default())
        })?;
        res.reply(Vec::new())
    });

    let e = exporter.clone();
    let set_permissions = entry(Method::SetPermissions, move |req, res| {
        let (pathname, info): (String, FileInfo) = req.decode()?;
        e.set_permissions(&pathname, &info)?;
        res.reply(Vec::new())
    });

    let close = entry(Method::ExporterClose, move |_req, res| {
        exporter.close()?;
        res.reply(Vec::new())
    });

    vec![root, create_directory, store_file, set_permissions, close]
}

/// Host-side proxy for an exporter plugin.
#[derive(Debug, Clone)]
pub struct ExporterClient {
    rpc: RpcClient,
    opts: CallOptions,
}

impl ExporterClient {
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

    pub async fn root(&self) -> Result<String, BridgeError> {
        let reply = self.rpc.call_with(Method::ExporterRoot, Vec::new(), self.opts.clone()).await?;
        decode_reply(Method::ExporterRoot, &reply)
    }

    pub async fn create_directory(&self, pathname: &str) -> Result<(), BridgeError> {
        self.rpc.call_with(Method::CreateDirectory, encode_args(pathname)?, self.opts.clone()).await?;
        Ok(())
    }

    /// Stream `reader` into `pathname`. `size` is advisory; a body of a
    /// different length fails with `SizeMismatch`.
    pub async fn store_file<R: AsyncRead + Unpin>(&self, pathname: &str, reader: R, size: u64) -> Result<(), BridgeError> {
        self.rpc
            .call_upload(
                Method::StoreFile,
                encode_args(pathname)?,
                reader,
                Some(size),
                self.opts.clone(),
            )
            .await?;
        Ok(())
    }

    pub async fn set_permissions(&self, pathname: &str, info: &FileInfo) -> Result<(), BridgeError> {
        self.rpc
            .call_with(Method::SetPermissions, encode_args(&(pathname, info))?, self.opts.clone())
            .await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), BridgeError> {
        self.rpc.call_with(Method::ExporterClose, Vec::new(), self.opts.clone()).await?;
        Ok(())
    }
}
