//! In-process channel pairs for tests and embedding
//!
//! Two helpers pair endpoints without any real transport:
//!
//! - [`pipe`] runs a [`Framing`] over an in-memory duplex stream, so the
//!   actual wire bytes are produced and parsed.
//! - [`direct`] skips byte framing entirely and passes payloads between the
//!   two ends as values. Use it when a test exercises dispatch or
//!   correlation logic and the framing layer is noise.

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RpcError};
use crate::framing::{Channel, FramedChannel, Framing};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Pair two [`FramedChannel`] endpoints over an in-memory duplex stream.
///
/// Payloads sent on either end arrive on the other, passing through the
/// framing's real encoder and decoder.
///
/// # Examples
///
/// ```no_run
/// use switchboard::framing::{pipe::pipe, Channel, Framing};
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let (a, b) = pipe(&Framing::Line);
/// a.send(br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).await?;
/// let got = b.recv().await?;
/// assert!(got.is_some());
/// # Ok(())
/// # }
/// ```
pub fn pipe(framing: &Framing) -> (FramedChannel, FramedChannel) {
    let (left, right) = tokio::io::duplex(PIPE_CAPACITY);
    let (left_read, left_write) = tokio::io::split(left);
    let (right_read, right_write) = tokio::io::split(right);
    (
        framing.channel(left_read, left_write),
        framing.channel(right_read, right_write),
    )
}

/// Pair two [`DirectChannel`] endpoints that exchange payloads in memory
/// with no byte framing.
pub fn direct() -> (DirectChannel, DirectChannel) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (DirectChannel::new(a_tx, a_rx), DirectChannel::new(b_tx, b_rx))
}

/// One end of a [`direct`] pair.
///
/// Closing an end drops its sender, so the peer observes end of stream;
/// the local receiver unblocks through a cancellation token.
#[derive(Debug)]
pub struct DirectChannel {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    cancel: CancellationToken,
}

impl DirectChannel {
    fn new(tx: mpsc::UnboundedSender<Vec<u8>>, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait::async_trait]
impl Channel for DirectChannel {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        let guard = self.tx.lock().await;
        let tx = guard
            .as_ref()
            .ok_or(RpcError::Channel("channel is closed".to_string()))?;
        tx.send(payload.to_vec())
            .map_err(|_| RpcError::Channel("peer channel is closed".to_string()))?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => Ok(None),
            payload = rx.recv() => Ok(payload),
        }
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.tx.lock().await.take();
    }
}
