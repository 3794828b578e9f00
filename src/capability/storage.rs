//! Storage capability: a content-addressed backend
//!
//! States, packfiles and locks are opaque byte objects named by a [`Mac`].
//! Put is idempotent and deleting a missing address succeeds; a missing
//! address on read is `NOT_FOUND`.

use super::{decode_reply, encode_args, entry, receive_body, Mac, Mode};
use crate::bridge::frame::Method;
use crate::bridge::host_runtime::{BridgeError, CallOptions, RpcClient};
use crate::bridge::plugin_runtime::{HandlerFn, MethodTable, PluginError, Responder};
use crate::bridge::stream::ByteStream;
use std::io::Read;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Plugin-side storage implementation.
pub trait Storage: Send + Sync {
    /// Initialise a new repository from an opaque configuration blob.
    fn create(&self, config: &[u8]) -> Result<(), PluginError>;
    /// Open the repository and return its configuration blob.
    fn open(&self) -> Result<Vec<u8>, PluginError>;
    fn location(&self) -> Result<String, PluginError>;
    fn mode(&self) -> Result<Mode, PluginError>;
    /// Total bytes stored, or -1 when unknown.
    fn size(&self) -> Result<i64, PluginError>;

    fn get_states(&self) -> Result<Vec<Mac>, PluginError>;
    fn put_state(&self, mac: Mac, reader: &mut dyn Read) -> Result<u64, PluginError>;
    fn get_state(&self, mac: Mac) -> Result<Box<dyn Read + Send>, PluginError>;
    fn delete_state(&self, mac: Mac) -> Result<(), PluginError>;

    fn get_packfiles(&self) -> Result<Vec<Mac>, PluginError>;
    fn put_packfile(&self, mac: Mac, reader: &mut dyn Read) -> Result<u64, PluginError>;
    fn get_packfile(&self, mac: Mac) -> Result<Box<dyn Read + Send>, PluginError>;
    /// Reader positioned at `offset`. The adapter stops after `length` bytes
    /// and flags a short read when the reader ends first.
    fn get_packfile_blob(&self, mac: Mac, offset: u64, length: u64) -> Result<Box<dyn Read + Send>, PluginError>;
    fn delete_packfile(&self, mac: Mac) -> Result<(), PluginError>;

    fn get_locks(&self) -> Result<Vec<Mac>, PluginError>;
    fn put_lock(&self, mac: Mac, reader: &mut dyn Read) -> Result<u64, PluginError>;
    fn get_lock(&self, mac: Mac) -> Result<Box<dyn Read + Send>, PluginError>;
    fn delete_lock(&self, mac: Mac) -> Result<(), PluginError>;

    fn close(&self) -> Result<(), PluginError>;
}

fn put_handler<S, F>(method: Method, storage: Arc<S>, put: F) -> (Method, HandlerFn)
where
    S: Storage + 'static,
    F: Fn(&S, Mac, &mut dyn Read) -> Result<u64, PluginError> + Send + Sync + 'static,
{
    entry(method, move |req, res| {
        let mac: Mac = req.decode()?;
        let written = receive_body(req, |body, _declared| put(storage.as_ref(), mac, body))?;
        res.reply_cbor(&written)
    })
}

fn get_handler<S, F>(method: Method, storage: Arc<S>, get: F) -> (Method, HandlerFn)
where
    S: Storage + 'static,
    F: Fn(&S, Mac) -> Result<Box<dyn Read + Send>, PluginError> + Send + Sync + 'static,
{
    entry(method, move |req, res| {
        let mac: Mac = req.decode()?;
        let reader = get(storage.as_ref(), mac)?;
        res.copy_from(reader)?;
        Ok(())
    })
}

fn unit_handler<S, F>(method: Method, storage: Arc<S>, op: F) -> (Method, HandlerFn)
where
    S: Storage + 'static,
    F: Fn(&S, Mac) -> Result<(), PluginError> + Send + Sync + 'static,
{
    entry(method, move |req, res| {
        let mac: Mac = req.decode()?;
        op(storage.as_ref(), mac)?;
        res.reply(Vec::new())
    })
}

fn list_handler<S, F>(method: Method, storage: Arc<S>, list: F) -> (Method, HandlerFn)
where
    S: Storage + 'static,
    F: Fn(&S) -> Result<Vec<Mac>, PluginError> + Send + Sync + 'static,
{
    entry(method, move |_req, res| res.reply_cbor(&list(storage.as_ref())?))
}

fn send_blob(res: &Responder, reader: Box<dyn Read + Send>, length: u64) -> Result<(), PluginError> {
    let sent = res.copy_from(reader.take(length))?;
    if sent < length {
        res.mark_short_read();
    }
    Ok(())
}

/// Method table serving `storage`.
pub fn storage_methods<S: Storage + 'static>(storage: Arc<S>) -> MethodTable {
    let s = storage.clone();
    let create = entry(Method::Create, move |req, res| {
        s.create(req.args())?;
        res.reply(Vec::new())
    });
    let s = storage.clone();
    let open = entry(Method::Open, move |_req, res| res.reply(s.open()?));
    let s = storage.clone();
    let location = entry(Method::Location, move |_req, res| res.reply_cbor(&s.location()?));
    let s = storage.clone();
    let mode = entry(Method::Mode, move |_req, res| res.reply_cbor(&s.mode()?));
    let s = storage.clone();
    let size = entry(Method::Size, move |_req, res| res.reply_cbor(&s.size()?));
    let s = storage.clone();
    let blob = entry(Method::GetPackfileBlob, move |req, res| {
        let (mac, offset, length): (Mac, u64, u64) = req.decode()?;
        let reader = s.get_packfile_blob(mac, offset, length)?;
        send_blob(res, reader, length)
    });
    let s = storage.clone();
    let close = entry(Method::StorageClose, move |_req, res| {
        s.close()?;
        res.reply(Vec::new())
    });

    vec![
        create,
        open,
        location,
        mode,
        size,
        list_handler(Method::GetStates, storage.clone(), |s| s.get_states()),
        put_handler(Method::PutState, storage.clone(), |s, mac, r| s.put_state(mac, r)),
        get_handler(Method::GetState, storage.clone(), |s, mac| s.get_state(mac)),
        unit_handler(Method::DeleteState, storage.clone(), |s, mac| s.delete_state(mac)),
        list_handler(Method::GetPackfiles, storage.clone(), |s| s.get_packfiles()),
        put_handler(Method::PutPackfile, storage.clone(), |s, mac, r| s.put_packfile(mac, r)),
        get_handler(Method::GetPackfile, storage.clone(), |s, mac| s.get_packfile(mac)),
        blob,
        unit_handler(Method::DeletePackfile, storage.clone(), |s, mac| s.delete_packfile(mac)),
        list_handler(Method::GetLocks, storage.clone(), |s| s.get_locks()),
        put_handler(Method::PutLock, storage.clone(), |s, mac, r| s.put_lock(mac, r)),
        get_handler(Method::GetLock, storage.clone(), |s, mac| s.get_lock(mac)),
        unit_handler(Method::DeleteLock, storage, |s, mac| s.delete_lock(mac)),
        close,
    ]
}

/// Host-side proxy for a storage plugin.
#[derive(Debug, Clone)]
pub struct StorageClient {
    rpc: RpcClient,
    opts: CallOptions,
}

impl StorageClient {
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

    async fn unary<T: serde::de::DeserializeOwned>(&self, method: Method, args: Vec<u8>) -> Result<T, BridgeError> {
        let reply = self.rpc.call_with(method, args, self.opts.clone()).await?;
        decode_reply(method, &reply)
    }

    async fn unit(&self, method: Method, mac: Mac) -> Result<(), BridgeError> {
        self.rpc.call_with(method, encode_args(&mac)?, self.opts.clone()).await?;
        Ok(())
    }

    async fn put<R: AsyncRead + Unpin>(
        &self,
        method: Method,
        mac: Mac,
        reader: R,
        size: Option<u64>,
    ) -> Result<u64, BridgeError> {
        let reply = self
            .rpc
            .call_upload(method, encode_args(&mac)?, reader, size, self.opts.clone())
            .await?;
        decode_reply(method, &reply)
    }

    async fn get(&self, method: Method, mac: Mac) -> Result<ByteStream, BridgeError> {
        let stream = self
            .rpc
            .call_streaming(method, encode_args(&mac)?, self.opts.clone())
            .await?;
        Ok(ByteStream::new(stream))
    }

    /// Initialise the repository with an opaque configuration blob.
    pub async fn create(&self, config: &[u8]) -> Result<(), BridgeError> {
        self.rpc.call_with(Method::Create, config.to_vec(), self.opts.clone()).await?;
        Ok(())
    }

    /// Open the repository, returning its configuration blob.
    pub async fn open(&self) -> Result<Vec<u8>, BridgeError> {
        self.rpc.call_with(Method::Open, Vec::new(), self.opts.clone()).await
    }

    pub async fn location(&self) -> Result<String, BridgeError> {
        self.unary(Method::Location, Vec::new()).await
    }

    pub async fn mode(&self) -> Result<Mode, BridgeError> {
        self.unary(Method::Mode, Vec::new()).await
    }

    pub async fn size(&self) -> Result<i64, BridgeError> {
        self.unary(Method::Size, Vec::new()).await
    }

    pub async fn get_states(&self) -> Result<Vec<Mac>, BridgeError> {
        self.unary(Method::GetStates, Vec::new()).await
    }

    /// Upload a state. `size`, when given, must match the bytes `reader` yields.
    pub async fn put_state<R: AsyncRead + Unpin>(&self, mac: Mac, reader: R, size: Option<u64>) -> Result<u64, BridgeError> {
        self.put(Method::PutState, mac, reader, size).await
    }

    pub async fn get_state(&self, mac: Mac) -> Result<ByteStream, BridgeError> {
        self.get(Method::GetState, mac).await
    }

    pub async fn delete_state(&self, mac: Mac) -> Result<(), BridgeError> {
        self.unit(Method::DeleteState, mac).await
    }

    pub async fn get_packfiles(&self) -> Result<Vec<Mac>, BridgeError> {
        self.unary(Method::GetPackfiles, Vec::new()).await
    }

    pub async fn put_packfile<R: AsyncRead + Unpin>(&self, mac: Mac, reader: R, size: Option<u64>) -> Result<u64, BridgeError> {
        self.put(Method::PutPackfile, mac, reader, size).await
    }

    pub async fn get_packfile(&self, mac: Mac) -> Result<ByteStream, BridgeError> {
        self.get(Method::GetPackfile, mac).await
    }

    /// `length` bytes of a packfile starting at `offset`. The stream holds
    /// fewer only when it ends flagged as a short read.
    pub async fn get_packfile_blob(&self, mac: Mac, offset: u64, length: u64) -> Result<ByteStream, BridgeError> {
        let stream = self
            .rpc
            .call_streaming(
                Method::GetPackfileBlob,
                encode_args(&(mac, offset, length))?,
                self.opts.clone(),
            )
            .await?;
        Ok(ByteStream::with_expected_len(stream, length))
    }

    pub async fn delete_packfile(&self, mac: Mac) -> Result<(), BridgeError> {
        self.unit(Method::DeletePackfile, mac).await
    }

    pub async fn get_locks(&self) -> Result<Vec<Mac>, BridgeError> {
        self.unary(Method::GetLocks, Vec::new()).await
    }

    pub async fn put_lock<R: AsyncRead + Unpin>(&self, mac: Mac, reader: R, size: Option<u64>) -> Result<u64, BridgeError> {
        self.put(Method::PutLock, mac, reader, size).await
    }

    pub async fn get_lock(&self, mac: Mac) -> Result<ByteStream, BridgeError> {
        self.get(Method::GetLock, mac).await
    }

    pub async fn delete_lock(&self, mac: Mac) -> Result<(), BridgeError> {
        self.unit(Method::DeleteLock, mac).await
    }

    pub async fn close(&self) -> Result<(), BridgeError> {
        self.rpc.call_with(Method::StorageClose, Vec::new(), self.opts.clone()).await?;
        Ok(())
    }
}
