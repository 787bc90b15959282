//! Client correlator: calls, notifications, and batches over one channel
//!
//! A [`Client`] owns its [`Channel`] for the duration of its life. It
//! assigns monotonically increasing request ids, tracks in-flight calls in
//! a pending table keyed by the canonical id string, and runs a single
//! background reader that decodes inbound payloads and wakes the matching
//! waiter. Server-pushed notifications (inbound messages with a `method`
//! and no id) are dispatched to handlers registered with
//! [`Client::on_notification`].
//!
//! # Cancellation
//!
//! A call whose [`Context`] is cancelled (or whose deadline elapses) before
//! the response arrives removes its pending entry and returns the
//! cancellation error; the late response, if it ever comes, is discarded by
//! the reader. No cancel message is sent to the server: the JSON-RPC 2.0
//! wire format has none. [`Client::close`] cancels every pending call with
//! the stopped error and closes the channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::context::{Context, EncodeContextHook};
use crate::error::{Result, RpcError};
use crate::framing::Channel;
use crate::types::{self, Request, Response};

mod batch;

pub use batch::{Batch, Spec};
use batch::Slot;

/// A notification handler: called with the raw `params` value when a
/// matching server notification arrives.
type NotificationHandler = Box<dyn Fn(Option<Value>) + Send + Sync + 'static>;

/// Client construction options.
#[derive(Default)]
pub struct ClientOptions {
    /// Hook annotating the outbound params of every call and notification
    /// with context-derived metadata. Defaults to sending params verbatim.
    pub encode_context: Option<EncodeContextHook>,
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("encode_context", &self.encode_context.is_some())
            .finish()
    }
}

/// A JSON-RPC 2.0 client bound to a single channel.
///
/// # Examples
///
/// ```no_run
/// use serde_json::json;
/// use switchboard::client::{Client, ClientOptions};
/// use switchboard::framing::pipe;
/// use switchboard::Context;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let (client_end, _server_end) = pipe::direct();
/// let client = Client::new(client_end, ClientOptions::default());
/// let sum: i64 = client.call(&Context::new(), "Math.Add", json!([2, 3])).await?;
/// assert_eq!(sum, 5);
/// client.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    core: Arc<ClientCore>,
}

impl Client {
    /// Bind a client to a channel and start its reader.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<C: Channel + 'static>(channel: C, options: ClientOptions) -> Self {
        let core = Arc::new(ClientCore {
            channel: Arc::new(channel),
            next_id: AtomicU64::new(1),
            pending: StdMutex::new(Some(HashMap::new())),
            notification_handlers: StdMutex::new(HashMap::new()),
            encode_context: options.encode_context,
            stop: CancellationToken::new(),
        });
        tokio::spawn(Arc::clone(&core).read_loop());
        Self { core }
    }

    /// Issue a call and await its typed result.
    ///
    /// An error response from the peer surfaces as
    /// [`RpcError::ErrorResponse`], preserving its code. Cancellation and
    /// deadline expiry surface as [`RpcError::Cancelled`]; the stale
    /// response is discarded when it arrives.
    pub async fn call<P, R>(&self, ctx: &Context, method: &str, params: P) -> Result<R>
    where
        P: Serialize + Send,
        R: DeserializeOwned,
    {
        let params = self.core.wire_params(ctx, into_params(params)?)?;

        let id = self.core.next_id.fetch_add(1, Ordering::SeqCst);
        let id_value = Value::from(id);
        let key = id_value.to_string();

        // Register the pending slot before sending so the response can
        // never arrive before we are ready to receive it.
        let (tx, rx) = oneshot::channel();
        {
            let mut guard = lock(&self.core.pending);
            let Some(table) = guard.as_mut() else {
                return Err(RpcError::ClientStopped.into());
            };
            table.insert(key.clone(), tx);
        }

        let body = match serde_json::to_vec(&Request::call(id_value, method, params)) {
            Ok(body) => body,
            Err(e) => {
                self.core.untrack(&key);
                return Err(RpcError::Serialization(e).into());
            }
        };
        if let Err(e) = self.core.channel.send(&body).await {
            self.core.untrack(&key);
            return Err(e);
        }

        let deadline = ctx.deadline();
        let response = tokio::select! {
            biased;

            _ = ctx.cancelled() => {
                self.core.untrack(&key);
                return Err(RpcError::Cancelled.into());
            }

            _ = tokio::time::sleep(deadline.unwrap_or(Duration::MAX)), if deadline.is_some() => {
                self.core.untrack(&key);
                return Err(RpcError::Cancelled.into());
            }

            res = rx => match res {
                Ok(response) => response,
                Err(_) => return Err(RpcError::ClientStopped.into()),
            }
        };

        let value = response.into_result().map_err(RpcError::ErrorResponse)?;
        serde_json::from_value(value).map_err(|e| RpcError::Serialization(e).into())
    }

    /// Send a notification. Returns once the bytes are handed to the
    /// channel; no response is ever owed.
    pub async fn notify<P: Serialize + Send>(
        &self,
        ctx: &Context,
        method: &str,
        params: P,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::ClientStopped.into());
        }
        let params = self.core.wire_params(ctx, into_params(params)?)?;
        let body = serde_json::to_vec(&Request::notification(method, params))?;
        self.core.channel.send(&body).await
    }

    /// Submit a batch of specs as one JSON array and return its handle.
    ///
    /// Responses may arrive in any order; [`Batch::wait`] restores spec
    /// order by id.
    pub async fn batch(&self, ctx: &Context, specs: Vec<Spec>) -> Result<Batch> {
        let mut requests = Vec::with_capacity(specs.len());
        let mut slots = Vec::with_capacity(specs.len());
        let mut keys = Vec::new();

        for spec in specs {
            let params = self.core.wire_params(ctx, spec.params)?;
            if spec.notify {
                requests.push(Request::notification(spec.method, params));
                slots.push(Slot::Notification);
                continue;
            }

            let id = self.core.next_id.fetch_add(1, Ordering::SeqCst);
            let id_value = Value::from(id);
            let key = id_value.to_string();
            let (tx, rx) = oneshot::channel();
            let registered = {
                let mut guard = lock(&self.core.pending);
                match guard.as_mut() {
                    Some(table) => {
                        table.insert(key.clone(), tx);
                        true
                    }
                    None => false,
                }
            };
            if !registered {
                self.core.untrack_all(&keys);
                return Err(RpcError::ClientStopped.into());
            }
            keys.push(key);
            requests.push(Request::call(id_value, spec.method, params));
            slots.push(Slot::Call(rx));
        }

        let body = match serde_json::to_vec(&requests) {
            Ok(body) => body,
            Err(e) => {
                self.core.untrack_all(&keys);
                return Err(RpcError::Serialization(e).into());
            }
        };
        if let Err(e) = self.core.channel.send(&body).await {
            self.core.untrack_all(&keys);
            return Err(e);
        }

        Ok(Batch { slots })
    }

    /// Register a handler for a server-pushed notification. Registering a
    /// second handler for the same method replaces the first.
    pub fn on_notification(
        &self,
        method: impl Into<String>,
        f: impl Fn(Option<Value>) + Send + Sync + 'static,
    ) {
        lock(&self.core.notification_handlers).insert(method.into(), Box::new(f));
    }

    /// Cancel all pending calls with the stopped error and close the
    /// channel. Safe to call repeatedly.
    pub async fn close(&self) {
        self.core.stop.cancel();
        self.core.channel.close().await;
        self.core.fail_pending();
    }

    /// Whether the client has been closed or its reader has exited.
    pub fn is_closed(&self) -> bool {
        self.core.stop.is_cancelled() || lock(&self.core.pending).is_none()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("next_id", &self.core.next_id.load(Ordering::Relaxed))
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

struct ClientCore {
    channel: Arc<dyn Channel>,
    /// Monotonically increasing request id counter.
    next_id: AtomicU64,
    /// In-flight calls keyed by canonical id string. `None` once the
    /// client is closed or its reader has exited.
    pending: StdMutex<Option<HashMap<String, oneshot::Sender<Response>>>>,
    notification_handlers: StdMutex<HashMap<String, NotificationHandler>>,
    encode_context: Option<EncodeContextHook>,
    stop: CancellationToken,
}

impl ClientCore {
    async fn read_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                biased;

                _ = self.stop.cancelled() => break,

                frame = self.channel.recv() => match frame {
                    Ok(Some(payload)) => self.dispatch_inbound(&payload),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("client channel failed: {e:#}");
                        break;
                    }
                }
            }
        }
        self.fail_pending();
    }

    /// Classify one inbound payload: a response, a response batch, or a
    /// server-pushed notification.
    fn dispatch_inbound(&self, payload: &[u8]) {
        let value: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("failed to parse inbound payload: {e}");
                return;
            }
        };
        match value {
            Value::Array(items) => {
                for item in items {
                    self.deliver(item);
                }
            }
            item => self.deliver(item),
        }
    }

    fn deliver(&self, value: Value) {
        let is_notification =
            value.get("method").is_some() && value.get("id").map_or(true, Value::is_null);
        if is_notification {
            let method = value
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let params = value.get("params").cloned();
            let handlers = lock(&self.notification_handlers);
            match handlers.get(&method) {
                Some(handler) => handler(params),
                None => tracing::debug!("no handler for notification {method:?}; ignoring"),
            }
            return;
        }

        let response: Response = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("discarding malformed inbound message: {e}");
                return;
            }
        };
        let Some(key) = types::id_key(&response.id) else {
            tracing::warn!(
                "server reported an unmatched error: {}",
                response
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "(no error object)".to_string())
            );
            return;
        };

        let sender = lock(&self.pending).as_mut().and_then(|t| t.remove(&key));
        match sender {
            // The waiter may have been cancelled in the meantime.
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => tracing::debug!("discarding late response for id {key}"),
        }
    }

    fn wire_params(&self, ctx: &Context, params: Option<Value>) -> Result<Option<Value>> {
        match &self.encode_context {
            Some(hook) => hook(ctx, params),
            None => Ok(params),
        }
    }

    fn untrack(&self, key: &str) {
        if let Some(table) = lock(&self.pending).as_mut() {
            table.remove(key);
        }
    }

    fn untrack_all(&self, keys: &[String]) {
        if let Some(table) = lock(&self.pending).as_mut() {
            for key in keys {
                table.remove(key);
            }
        }
    }

    /// Drop every pending sender so waiters resolve to the stopped error,
    /// and refuse new registrations.
    fn fail_pending(&self) {
        if let Some(table) = lock(&self.pending).take() {
            if !table.is_empty() {
                tracing::debug!("failing {} pending calls", table.len());
            }
        }
    }
}

/// Serialize caller params; `null` encodes as absence of the field.
fn into_params<P: Serialize>(params: P) -> Result<Option<Value>> {
    let value = serde_json::to_value(params)?;
    Ok(if value.is_null() { None } else { Some(value) })
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
