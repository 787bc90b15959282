//! Framing: byte streams in and out of discrete JSON payloads
//!
//! A [`Framing`] is a factory: given a reader and a writable sink it returns
//! a [`FramedChannel`] that sends and receives whole message payloads.
//! Concrete wire formats live in submodules:
//!
//! - [`raw`] -- no delimiter; inbound payloads are split by a streaming JSON
//!   decoder, outbound bytes are written verbatim.
//! - [`line`] -- one payload per LF-terminated line.
//! - [`varint`] -- each payload prefixed by a LEB128-style unsigned varint
//!   length.
//! - [`header`] -- an HTTP-like header block (`Content-Length`, optional
//!   `Content-Type`) terminated by a blank line. The `json` and `lsp`
//!   presets pin the MIME type.
//! - [`pipe`] -- in-process helpers pairing two endpoints for tests.
//!
//! # Design
//!
//! Every framed channel owns a background reader task that decodes frames
//! off the stream and pumps them into an unbounded channel; `recv` drains
//! that channel and `close` cancels the task via a
//! [`CancellationToken`]. Framing errors are fatal to the channel: they are
//! delivered once through `recv` and the session that observes them stops.

use std::fmt;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RpcError};

pub mod header;
pub mod line;
pub mod pipe;
pub mod raw;
pub mod varint;

/// MIME type pinned by the [`Framing::json`] preset.
pub const MIME_JSON: &str = "application/json";

/// MIME type pinned by the [`Framing::lsp`] preset.
pub const MIME_LSP: &str = "application/vscode-jsonrpc; charset=utf-8";

pub(crate) type DynReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
pub(crate) type DynWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A bidirectional carrier of discrete message payloads.
///
/// `recv` yields `Ok(None)` on a clean end of stream (EOF or local close)
/// and `Err` on a framing or transport fault; both end the session that
/// observes them. `send` and `recv` may be called concurrently from
/// different tasks.
#[async_trait::async_trait]
pub trait Channel: Send + Sync + fmt::Debug {
    /// Send one complete payload.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Receive the next payload, `Ok(None)` at end of stream.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Close the channel. Best effort: pending reads unblock with
    /// `Ok(None)` and later sends fail.
    async fn close(&self);
}

/// Selects the wire format a [`FramedChannel`] speaks.
///
/// # Examples
///
/// ```
/// use switchboard::framing::Framing;
///
/// assert_eq!(Framing::from_name("line"), Some(Framing::Line));
/// assert_eq!(Framing::from_name("lsp"), Some(Framing::lsp()));
/// assert_eq!(
///     Framing::from_name("header:application/json"),
///     Some(Framing::json()),
/// );
/// assert_eq!(Framing::from_name("morse"), None);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Framing {
    /// Verbatim bytes out, streaming JSON decoder in.
    Raw,
    /// One LF-terminated payload per line.
    Line,
    /// LEB128-style unsigned varint length prefix.
    Varint,
    /// HTTP-like header block; the optional MIME type is emitted on send
    /// and enforced against inbound `Content-Type` headers.
    Header(Option<String>),
}

impl Framing {
    /// Header framing pinned to `application/json`.
    pub fn json() -> Self {
        Framing::Header(Some(MIME_JSON.to_string()))
    }

    /// Header framing pinned to the LSP MIME type.
    pub fn lsp() -> Self {
        Framing::Header(Some(MIME_LSP.to_string()))
    }

    /// Resolve one of the external framing names: `raw`, `line`, `lsp`,
    /// `varint`, `header`, or `header:<mime>`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "raw" => Some(Framing::Raw),
            "line" => Some(Framing::Line),
            "varint" => Some(Framing::Varint),
            "lsp" => Some(Framing::lsp()),
            "header" => Some(Framing::Header(None)),
            _ => name
                .strip_prefix("header:")
                .map(|mime| Framing::Header(Some(mime.to_string()))),
        }
    }

    /// Bind this framing to a reader and a writable sink.
    ///
    /// Must be called from within a Tokio runtime: the returned channel
    /// spawns its background reader task immediately.
    pub fn channel<R, W>(&self, reader: R, writer: W) -> FramedChannel
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        FramedChannel::new(self.clone(), Box::new(reader), Box::new(writer))
    }
}

async fn read_frame(
    framing: &Framing,
    reader: &mut DynReader,
    buf: &mut BytesMut,
) -> Result<Option<Vec<u8>>> {
    match framing {
        Framing::Raw => raw::read_frame(reader, buf).await,
        Framing::Line => line::read_frame(reader).await,
        Framing::Varint => varint::read_frame(reader).await,
        Framing::Header(mime) => header::read_frame(reader, mime.as_deref()).await,
    }
}

/// A [`Channel`] speaking one of the [`Framing`] wire formats over a boxed
/// reader/writer pair.
pub struct FramedChannel {
    framing: Framing,
    writer: Mutex<Option<DynWriter>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Result<Vec<u8>>>>,
    cancel: CancellationToken,
}

impl FramedChannel {
    pub(crate) fn new(
        framing: Framing,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: DynWriter,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        // Background reader task: decode frames off the stream until EOF,
        // a framing fault, or cancellation. A fault is delivered once and
        // ends the task.
        let pump_cancel = cancel.clone();
        let pump_framing = framing.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = BytesMut::new();
            loop {
                tokio::select! {
                    biased;

                    _ = pump_cancel.cancelled() => break,

                    frame = read_frame(&pump_framing, &mut reader, &mut buf) => match frame {
                        Ok(Some(bytes)) => {
                            if tx.send(Ok(bytes)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            break;
                        }
                    }
                }
            }
        });

        Self {
            framing,
            writer: Mutex::new(Some(writer)),
            inbound: Mutex::new(rx),
            cancel,
        }
    }

    /// The framing this channel speaks.
    pub fn framing(&self) -> &Framing {
        &self.framing
    }
}

#[async_trait::async_trait]
impl Channel for FramedChannel {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or(RpcError::Channel("channel is closed".to_string()))?;
        match &self.framing {
            Framing::Raw => raw::write_frame(writer, payload).await,
            Framing::Line => line::write_frame(writer, payload).await,
            Framing::Varint => varint::write_frame(writer, payload).await,
            Framing::Header(mime) => header::write_frame(writer, mime.as_deref(), payload).await,
        }
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn close(&self) {
        self.cancel.cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

impl Drop for FramedChannel {
    fn drop(&mut self) {
        // Stop the background reader task; the writer half is dropped with
        // the struct.
        self.cancel.cancel();
    }
}

impl fmt::Debug for FramedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedChannel")
            .field("framing", &self.framing)
            .finish_non_exhaustive()
    }
}
