//! Host-side stream receivers
//!
//! A response stream is a sequence of CHUNK frames closed by END (or ERR) on
//! one call id. Chunks are pulled lazily; each consumed chunk returns one unit
//! of window credit to the plugin. Dropping a stream before END cancels the
//! call.

use crate::bridge::frame::{flags, CallId, Frame, FrameType};
use crate::bridge::host_runtime::{BridgeError, PendingCall};
use crate::bridge::io::from_cbor;
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// How a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamEnd {
    /// Bytes (byte streams) or items (result streams) the sender reports
    pub total: u64,
    /// The object ended before the requested range did
    pub short_read: bool,
}

/// Raw chunk sequence of one response-streamed call.
pub struct ResponseStream {
    call: PendingCall,
    peeked: Option<Frame>,
    next_index: u64,
    items: u64,
    bytes: u64,
    end: Option<StreamEnd>,
}

impl ResponseStream {
    pub(crate) fn new(call: PendingCall, first: Frame) -> Self {
        Self {
            call,
            peeked: Some(first),
            next_index: 0,
            items: 0,
            bytes: 0,
            end: None,
        }
    }

    pub fn id(&self) -> CallId {
        self.call.id()
    }

    /// Payload of the next chunk, or `None` once END has been received.
    pub async fn next_payload(&mut self) -> Result<Option<Vec<u8>>, BridgeError> {
        if self.end.is_some() {
            return Ok(None);
        }

        let frame = match self.peeked.take() {
            Some(frame) => frame,
            None => match self.call.recv().await {
                Ok(frame) => frame,
                // The connection died between END-less chunks.
                Err(BridgeError::PeerLost) => return Err(BridgeError::TruncatedStream),
                Err(e) => return Err(e),
            },
        };

        match frame.frame_type {
            FrameType::Chunk => {
                let index = frame.chunk_index.unwrap_or(u64::MAX);
                if index != self.next_index {
                    return Err(self.call.violation(format!(
                        "chunk index {} out of order, expected {}",
                        index, self.next_index
                    )));
                }
                self.next_index += 1;
                self.call.ack();

                let payload = frame.payload.unwrap_or_default();
                self.items += 1;
                self.bytes += payload.len() as u64;
                Ok(Some(payload))
            }
            FrameType::End => {
                let end = StreamEnd {
                    total: frame.len.unwrap_or_default(),
                    short_read: frame.has_flag(flags::SHORT_READ),
                };
                tracing::trace!(
                    call_id = self.id(),
                    method = ?self.call.method(),
                    chunks = self.items,
                    bytes = self.bytes,
                    "stream complete"
                );
                self.end = Some(end);
                Ok(None)
            }
            FrameType::Err => Err(BridgeError::from_err_frame(&frame)),
            other => Err(self
                .call
                .violation(format!("unexpected {:?} inside a stream", other))),
        }
    }

    /// END marker, once received.
    pub fn end(&self) -> Option<StreamEnd> {
        self.end
    }

    pub fn items_received(&self) -> u64 {
        self.items
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes
    }

    /// Abandon the stream. The plugin stops at its next checkpoint.
    pub fn cancel(mut self) {
        self.call.cancel();
    }

    fn violation(&mut self, reason: String) -> BridgeError {
        self.call.violation(reason)
    }
}

impl fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream")
            .field("id", &self.id())
            .field("method", &self.call.method())
            .field("items", &self.items)
            .field("bytes", &self.bytes)
            .field("end", &self.end)
            .finish()
    }
}

/// Byte stream returned by `GetState`, `GetPackfile`, `GetPackfileBlob`,
/// `GetLock` and `OpenReader`.
pub struct ByteStream {
    inner: ResponseStream,
    /// Exact length asked for, when the call names a range
    expected_len: Option<u64>,
}

impl ByteStream {
    pub fn new(inner: ResponseStream) -> Self {
        Self {
            inner,
            expected_len: None,
        }
    }

    /// Stream that must hold exactly `len` bytes unless END carries SHORT_READ.
    pub fn with_expected_len(inner: ResponseStream, len: u64) -> Self {
        Self {
            inner,
            expected_len: Some(len),
        }
    }

    pub fn id(&self) -> CallId {
        self.inner.id()
    }

    /// Next chunk of bytes, or `None` at the end of the stream.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, BridgeError> {
        match self.inner.next_payload().await? {
            Some(chunk) => {
                if let Some(expected) = self.expected_len {
                    if self.inner.bytes_received() > expected {
                        let actual = self.inner.bytes_received();
                        self.inner.violation(format!(
                            "range of {} bytes overrun ({} received)",
                            expected, actual
                        ));
                        return Err(BridgeError::SizeMismatch {
                            declared: expected,
                            actual,
                        });
                    }
                }
                Ok(Some(chunk))
            }
            None => {
                self.check_end()?;
                Ok(None)
            }
        }
    }

    fn check_end(&self) -> Result<(), BridgeError> {
        let actual = self.inner.bytes_received();
        let end = self.inner.end().unwrap_or(StreamEnd {
            total: actual,
            short_read: false,
        });
        if end.total != actual {
            return Err(BridgeError::SizeMismatch {
                declared: end.total,
                actual,
            });
        }
        if let Some(expected) = self.expected_len {
            let ok = if end.short_read {
                actual <= expected
            } else {
                actual == expected
            };
            if !ok {
                return Err(BridgeError::SizeMismatch {
                    declared: expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Collect the remaining bytes.
    pub async fn read_to_end(mut self) -> Result<Vec<u8>, BridgeError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Copy the remaining bytes into `sink`, returning how many were written.
    pub async fn copy_to<W: AsyncWrite + Unpin>(mut self, sink: &mut W) -> Result<u64, BridgeError> {
        let mut written = 0u64;
        while let Some(chunk) = self.next_chunk().await? {
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        sink.flush().await?;
        Ok(written)
    }

    /// True once END arrived flagged SHORT_READ.
    pub fn is_short_read(&self) -> bool {
        self.inner.end().map(|e| e.short_read).unwrap_or(false)
    }

    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received()
    }

    pub fn cancel(self) {
        self.inner.cancel();
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStream")
            .field("id", &self.id())
            .field("expected_len", &self.expected_len)
            .field("bytes", &self.inner.bytes_received())
            .finish()
    }
}

/// Lazy, forward-only sequence of typed results, one per chunk.
pub struct ResultStream<T> {
    inner: ResponseStream,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> ResultStream<T> {
    pub fn new(inner: ResponseStream) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> CallId {
        self.inner.id()
    }

    /// Next result in production order, or `None` at the end.
    pub async fn next(&mut self) -> Result<Option<T>, BridgeError> {
        match self.inner.next_payload().await? {
            Some(bytes) => match from_cbor(&bytes) {
                Ok(item) => Ok(Some(item)),
                Err(e) => Err(self.inner.violation(format!("undecodable result: {}", e))),
            },
            None => {
                let received = self.inner.items_received();
                match self.inner.end() {
                    Some(end) if end.total != received => Err(BridgeError::Protocol(format!(
                        "END reports {} results, received {}",
                        end.total, received
                    ))),
                    _ => Ok(None),
                }
            }
        }
    }

    /// Drain the stream into a vector.
    pub async fn collect(mut self) -> Result<Vec<T>, BridgeError> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await? {
            out.push(item);
        }
        Ok(out)
    }

    pub fn cancel(self) {
        self.inner.cancel();
    }
}

impl<T> fmt::Debug for ResultStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultStream")
            .field("id", &self.inner.id())
            .field("items", &self.inner.items_received())
            .finish()
    }
}
