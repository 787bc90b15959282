//! Server dispatcher: receive loop, batch queue, bounded execution
//!
//! A [`Server`] accepts framed request payloads from a [`Channel`],
//! dispatches them (individually or in batches) to the handlers resolved by
//! an [`Assigner`], and writes well-formed responses back. Two
//! persistent workers drive a session:
//!
//! - The **receive loop** decodes each inbound payload into a batch of
//!   requests and pushes it onto an unbounded queue. Payloads that fail to
//!   decode are answered directly with a `-32700` error under a `null` id;
//!   an empty batch is answered with `-32600`. Channel faults and EOF end
//!   the session.
//! - The **dispatch loop** pops batches, validates each request under the
//!   core locks (id normalization and duplicate detection against the
//!   active-id set, version marker, method presence, assigner lookup), and
//!   spawns a batch executor. Executors run every runnable request on its
//!   own task, each gated by a counting semaphore, so handler concurrency
//!   across all batches never exceeds [`ServerOptions::concurrency`].
//!
//! Each batch's responses are aggregated and written as a single payload
//! (an array exactly when the batch arrived as one), so response batches
//! are never interleaved on the wire.
//!
//! # Shutdown
//!
//! [`Server::stop`] records the terminal state, cancels the dispatch
//! workers, and closes the channel, which unblocks the receive loop.
//! Batches still sitting in the queue are drained: their calls are dropped
//! (the peer is gone or going), but their notifications still run, since a
//! notification cannot be reported back to the client any other way. EOF
//! from the channel is the same clean termination. [`Server::wait`] joins
//! every worker and returns the first fault, or `Ok` for a clean stop.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::context::{Context, RequestContextHook};
use crate::error::{code, error_object_from, Result, RpcError};
use crate::framing::Channel;
use crate::handler::{Assigner, Handler};
use crate::types::{self, ErrorObject, Request, Response, VERSION};

mod info;

pub use info::ServerStatus;
use info::ServerMetrics;

/// Name of the built-in introspection method.
pub const SERVER_INFO_METHOD: &str = "rpc.serverInfo";

/// Server construction options.
pub struct ServerOptions {
    /// Maximum number of handlers executing at once, across all batches.
    /// The default of 1 serializes handler execution.
    pub concurrency: usize,
    /// Accept requests with an empty version marker (relaxed v1 mode).
    pub allow_v1: bool,
    /// Serve the built-in `rpc.serverInfo` method.
    pub introspection: bool,
    /// Hook deriving each handler's context from the inbound request.
    /// Defaults to a fresh context per request.
    pub request_context: Option<RequestContextHook>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            allow_v1: false,
            introspection: true,
            request_context: None,
        }
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("concurrency", &self.concurrency)
            .field("allow_v1", &self.allow_v1)
            .field("introspection", &self.introspection)
            .finish_non_exhaustive()
    }
}

/// A JSON-RPC 2.0 server bound to a single channel.
///
/// Constructed detached; [`Server::start`] binds it to a channel and spawns
/// its workers, [`Server::stop`] requests an orderly shutdown, and
/// [`Server::wait`] joins the workers and reports the terminal state.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use serde_json::{json, Value};
/// use switchboard::framing::pipe;
/// use switchboard::handler::{handler_fn, MethodMap};
/// use switchboard::server::{Server, ServerOptions};
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let methods = MethodMap::new().with(
///     "ping",
///     handler_fn(|_ctx, _req| async { Ok(json!("pong")) }),
/// );
/// let (server_end, _client_end) = pipe::direct();
/// let server = Server::new(Arc::new(methods), ServerOptions::default());
/// server.start(server_end);
/// server.stop();
/// server.wait().await?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    core: Arc<ServerCore>,
}

impl Server {
    /// Construct an unstarted server around an assigner.
    pub fn new(assigner: Arc<dyn Assigner>, options: ServerOptions) -> Self {
        let ServerOptions {
            concurrency,
            allow_v1,
            introspection,
            request_context,
        } = options;
        Self {
            core: Arc::new(ServerCore {
                assigner,
                allow_v1,
                introspection,
                request_context,
                semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
                metrics: ServerMetrics::default(),
                channel: StdMutex::new(None),
                active: StdMutex::new(HashSet::new()),
                stop: CancellationToken::new(),
                started: AtomicBool::new(false),
                tracker: TaskTracker::new(),
                terminal: StdMutex::new(None),
            }),
        }
    }

    /// Bind the server to a channel and spawn its workers.
    ///
    /// # Panics
    ///
    /// Panics if the server was already started; starting twice is a
    /// programming error.
    pub fn start<C: Channel + 'static>(&self, channel: C) {
        if self.core.started.swap(true, Ordering::SeqCst) {
            panic!("server is already started");
        }
        let channel: Arc<dyn Channel> = Arc::new(channel);
        *lock(&self.core.channel) = Some(Arc::clone(&channel));

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let core = Arc::clone(&self.core);
        let recv_channel = Arc::clone(&channel);
        self.core
            .tracker
            .spawn(async move { core.receive_loop(recv_channel, queue_tx).await });

        let core = Arc::clone(&self.core);
        self.core
            .tracker
            .spawn(async move { core.dispatch_loop(channel, queue_rx).await });

        self.core.tracker.close();
    }

    /// Request an orderly shutdown. Safe to call repeatedly; only the
    /// first call decides the terminal state.
    pub fn stop(&self) {
        self.core.halt(Terminal::Clean);
    }

    /// Join all workers and return the terminal error. A stop, a client
    /// disconnect (EOF), and a mid-stream parse failure reported to the
    /// peer are all clean terminations.
    ///
    /// # Panics
    ///
    /// Panics if the server was never started.
    pub async fn wait(&self) -> Result<()> {
        assert!(
            self.core.started.load(Ordering::SeqCst),
            "server is not started"
        );
        self.core.tracker.wait().await;
        match lock(&self.core.terminal).take() {
            Some(Terminal::Fault(e)) => Err(e),
            _ => Ok(()),
        }
    }

    /// Push a notification to the connected client, outside any request
    /// cycle.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let channel = lock(&self.core.channel).clone();
        let Some(channel) = channel else {
            return Err(RpcError::ServerStopped.into());
        };
        if self.core.stop.is_cancelled() {
            return Err(RpcError::ServerStopped.into());
        }
        let body = serde_json::to_vec(&Request::notification(method, params))?;
        channel.send(&body).await?;
        self.core.metrics.add_bytes_out(body.len());
        Ok(())
    }

    /// The snapshot served by `rpc.serverInfo`.
    pub fn server_status(&self) -> ServerStatus {
        self.core.metrics.snapshot(self.core.assigner.names())
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("started", &self.core.started.load(Ordering::Relaxed))
            .field("stopped", &self.core.stop.is_cancelled())
            .finish_non_exhaustive()
    }
}

enum Terminal {
    Clean,
    Fault(anyhow::Error),
}

struct ServerCore {
    assigner: Arc<dyn Assigner>,
    allow_v1: bool,
    introspection: bool,
    request_context: Option<RequestContextHook>,
    semaphore: Arc<Semaphore>,
    metrics: ServerMetrics,
    channel: StdMutex<Option<Arc<dyn Channel>>>,
    active: StdMutex<HashSet<String>>,
    stop: CancellationToken,
    started: AtomicBool,
    tracker: TaskTracker,
    terminal: StdMutex<Option<Terminal>>,
}

/// A decoded inbound payload: one or more requests, and whether they
/// arrived wrapped in a JSON array.
struct InboundBatch {
    requests: Vec<Request>,
    wrapped: bool,
}

/// One request of a batch after validation.
struct Task {
    request: Request,
    /// `Some(id)` when a response is owed under that id; `None` for
    /// notifications.
    response_id: Option<Value>,
    /// The key registered in the active-id set, released after the
    /// response batch is flushed.
    id_key: Option<String>,
    disposition: Disposition,
}

enum Disposition {
    Run(Arc<dyn Handler>),
    ServerInfo,
    Reject(ErrorObject),
}

impl ServerCore {
    fn halt(&self, terminal: Terminal) {
        {
            let mut slot = lock(&self.terminal);
            if slot.is_none() {
                *slot = Some(terminal);
            }
        }
        self.stop.cancel();
        if let Some(channel) = lock(&self.channel).clone() {
            self.tracker.spawn(async move { channel.close().await });
        }
    }

    async fn receive_loop(
        self: Arc<Self>,
        channel: Arc<dyn Channel>,
        queue: mpsc::UnboundedSender<InboundBatch>,
    ) {
        loop {
            match channel.recv().await {
                Ok(Some(payload)) => {
                    self.metrics.add_bytes_in(payload.len());
                    self.ingest(&channel, &queue, &payload).await;
                }
                Ok(None) => {
                    self.halt(Terminal::Clean);
                    break;
                }
                Err(e) => {
                    tracing::warn!("receive channel failed: {e:#}");
                    self.halt(Terminal::Fault(e));
                    break;
                }
            }
        }
    }

    /// Decode one payload into a batch and queue it, or answer it directly
    /// when it cannot be queued.
    async fn ingest(
        &self,
        channel: &Arc<dyn Channel>,
        queue: &mpsc::UnboundedSender<InboundBatch>,
        payload: &[u8],
    ) {
        let value: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("rejecting unparseable payload: {e}");
                self.respond_standalone(channel, code::PARSE_ERROR, format!("invalid request payload: {e}"))
                    .await;
                return;
            }
        };

        let (items, wrapped) = match value {
            Value::Array(items) => {
                if items.is_empty() {
                    self.respond_standalone(
                        channel,
                        code::INVALID_REQUEST,
                        "empty request batch".to_string(),
                    )
                    .await;
                    return;
                }
                (items, true)
            }
            item @ Value::Object(_) => (vec![item], false),
            _ => {
                self.respond_standalone(
                    channel,
                    code::PARSE_ERROR,
                    "request payload must be an object or an array".to_string(),
                )
                .await;
                return;
            }
        };

        let mut requests = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<Request>(item) {
                Ok(req) => requests.push(req),
                Err(e) => {
                    self.respond_standalone(
                        channel,
                        code::PARSE_ERROR,
                        format!("malformed request object: {e}"),
                    )
                    .await;
                    return;
                }
            }
        }

        // The queue is unbounded; send only fails once the dispatcher has
        // exited, and then the batch is moot anyway.
        let _ = queue.send(InboundBatch { requests, wrapped });
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        channel: Arc<dyn Channel>,
        mut queue: mpsc::UnboundedReceiver<InboundBatch>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = self.stop.cancelled() => break,

                batch = queue.recv() => match batch {
                    Some(batch) => self.dispatch_batch(&channel, batch),
                    None => break,
                }
            }
        }

        // Shutdown drain: queued calls are dropped, queued notifications
        // are still honored. They run under a fresh context because the
        // server's own token is already cancelled.
        queue.close();
        while let Ok(batch) = queue.try_recv() {
            for request in batch.requests {
                if request.is_notification() {
                    self.spawn_retained_notification(request);
                }
            }
        }
    }

    /// Validate each request of a batch under the core locks and hand the
    /// batch to an executor task. The next batch can begin validation
    /// while this one's handlers are still running.
    fn dispatch_batch(self: &Arc<Self>, channel: &Arc<dyn Channel>, batch: InboundBatch) {
        let mut tasks = Vec::with_capacity(batch.requests.len());
        {
            let mut active = lock(&self.active);
            for mut request in batch.requests {
                self.metrics.add_request();
                let mut response_id = None;
                let mut id_key = None;
                let mut reject: Option<ErrorObject> = None;

                match request.id.take() {
                    None => {}
                    Some(id) if types::is_valid_id(&id) => {
                        let norm = types::normalize_id(&id);
                        let key = norm.to_string();
                        if active.contains(&key) {
                            reject = Some(ErrorObject::new(
                                code::INVALID_REQUEST,
                                format!("duplicate request id {key}"),
                            ));
                        } else {
                            active.insert(key.clone());
                            id_key = Some(key);
                        }
                        request.id = Some(norm.clone());
                        response_id = Some(norm);
                    }
                    Some(id) => {
                        reject = Some(ErrorObject::new(
                            code::INVALID_REQUEST,
                            format!("request id must be a string or a number, not {id}"),
                        ));
                        response_id = Some(Value::Null);
                    }
                }

                let disposition = match reject {
                    Some(err) => Disposition::Reject(err),
                    None => self.classify(&request),
                };
                tasks.push(Task {
                    request,
                    response_id,
                    id_key,
                    disposition,
                });
            }
        }

        let core = Arc::clone(self);
        let channel = Arc::clone(channel);
        let wrapped = batch.wrapped;
        self.tracker
            .spawn(async move { core.execute_batch(channel, tasks, wrapped).await });
    }

    /// Version, method, and assigner checks for one request.
    fn classify(&self, request: &Request) -> Disposition {
        let version_ok =
            request.version == VERSION || (self.allow_v1 && request.version.is_empty());
        if !version_ok {
            return Disposition::Reject(ErrorObject::new(
                code::INVALID_REQUEST,
                format!("incorrect version marker {:?}", request.version),
            ));
        }
        if request.method.is_empty() {
            return Disposition::Reject(ErrorObject::new(
                code::INVALID_REQUEST,
                "empty method name",
            ));
        }
        if self.introspection && request.method == SERVER_INFO_METHOD {
            return Disposition::ServerInfo;
        }
        match self.assigner.assign(&request.method) {
            Some(handler) => Disposition::Run(handler),
            None => Disposition::Reject(ErrorObject::new(
                code::METHOD_NOT_FOUND,
                format!("no such method {:?}", request.method),
            )),
        }
    }

    /// Run every task of a batch in parallel, aggregate the non-notification
    /// responses, and flush them as one payload.
    async fn execute_batch(
        self: Arc<Self>,
        channel: Arc<dyn Channel>,
        tasks: Vec<Task>,
        wrapped: bool,
    ) {
        let mut keys = Vec::new();
        let mut response_ids = Vec::with_capacity(tasks.len());
        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            if let Some(key) = &task.id_key {
                keys.push(key.clone());
            }
            response_ids.push(task.response_id.clone());
            let core = Arc::clone(&self);
            handles.push(tokio::spawn(core.run_task(task, true)));
        }

        let mut responses = Vec::new();
        for (response_id, joined) in response_ids
            .into_iter()
            .zip(futures::future::join_all(handles).await)
        {
            match joined {
                Ok(Some(resp)) => responses.push(resp),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("request task panicked: {e}");
                    if let Some(id) = response_id {
                        responses.push(Response::error(
                            id,
                            ErrorObject::new(code::INTERNAL_ERROR, "request handler panicked"),
                        ));
                    }
                }
            }
        }

        if !responses.is_empty() {
            self.write_body(&channel, &responses, wrapped).await;
        }

        // Ids stay in the active set until their responses are flushed.
        if !keys.is_empty() {
            let mut active = lock(&self.active);
            for key in keys {
                active.remove(&key);
            }
        }
    }

    /// Run one task to its response. Rejections short-circuit; runnable
    /// tasks pass through the concurrency semaphore.
    async fn run_task(self: Arc<Self>, task: Task, cancel_on_stop: bool) -> Option<Response> {
        let Task {
            request,
            response_id,
            disposition,
            ..
        } = task;

        let disposition = match disposition {
            Disposition::Reject(err) => {
                return match response_id {
                    Some(id) => Some(Response::error(id, err)),
                    None => {
                        tracing::debug!(
                            method = %request.method,
                            "dropping invalid notification: {err}"
                        );
                        None
                    }
                };
            }
            runnable => runnable,
        };

        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return None,
        };

        let mut ctx = match &self.request_context {
            Some(hook) => hook(&request),
            None => Context::new(),
        };
        let shared = Arc::new(request.clone());
        ctx.attach_request(Arc::clone(&shared));

        // Well-behaved handlers unblock when the server stops.
        let guard = if cancel_on_stop {
            let stop = self.stop.clone();
            let token = ctx.cancellation().clone();
            Some(tokio::spawn(async move {
                stop.cancelled().await;
                token.cancel();
            }))
        } else {
            None
        };

        let outcome = match disposition {
            Disposition::Run(handler) => handler.call(ctx, request).await,
            Disposition::ServerInfo => {
                serde_json::to_value(self.metrics.snapshot(self.assigner.names()))
                    .map_err(Into::into)
            }
            Disposition::Reject(_) => return None,
        };

        if let Some(guard) = guard {
            guard.abort();
        }
        drop(permit);

        match response_id {
            Some(id) => Some(match outcome {
                Ok(value) => Response::result(id, value),
                Err(e) => Response::error(id, error_object_from(&e)),
            }),
            None => {
                if let Err(e) = outcome {
                    tracing::error!(
                        method = %shared.method,
                        "notification handler failed: {e:#}"
                    );
                }
                None
            }
        }
    }

    fn spawn_retained_notification(self: &Arc<Self>, request: Request) {
        self.metrics.add_request();
        let disposition = self.classify(&request);
        let task = Task {
            request,
            response_id: None,
            id_key: None,
            disposition,
        };
        let core = Arc::clone(self);
        self.tracker.spawn(async move {
            core.run_task(task, false).await;
        });
    }

    async fn respond_standalone(&self, channel: &Arc<dyn Channel>, code: i64, message: String) {
        let resp = Response::error(Value::Null, ErrorObject::new(code, message));
        self.write_body(channel, &[resp], false).await;
    }

    /// Serialize and write one response payload. A failed write is fatal
    /// to the session: the framing may be mid-frame and cannot be trusted.
    async fn write_body(&self, channel: &Arc<dyn Channel>, responses: &[Response], wrapped: bool) {
        let body = if wrapped {
            serde_json::to_vec(&responses)
        } else {
            serde_json::to_vec(&responses[0])
        };
        let body = match body {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("failed to serialize response batch: {e}");
                return;
            }
        };
        if let Err(e) = channel.send(&body).await {
            tracing::warn!("response write failed: {e:#}");
            self.halt(Terminal::Fault(e));
            return;
        }
        self.metrics.add_bytes_out(body.len());
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::framing::pipe::{direct, DirectChannel};
    use crate::handler::{handler_fn, MethodMap};

    fn int_params(req: &Request) -> Result<Vec<i64>> {
        let params = req.params.clone().unwrap_or(Value::Null);
        let items: Vec<i64> = serde_json::from_value(params)
            .map_err(|_| RpcError::InvalidParams("want an array of integers".to_string()))?;
        Ok(items)
    }

    fn math_methods() -> MethodMap {
        MethodMap::new()
            .with(
                "Math.Add",
                handler_fn(|_ctx, req| async move {
                    Ok(json!(int_params(&req)?.iter().sum::<i64>()))
                }),
            )
            .with(
                "Math.Sub",
                handler_fn(|_ctx, req| async move {
                    let args = int_params(&req)?;
                    if args.len() != 2 {
                        return Err(
                            RpcError::InvalidParams("want exactly two integers".to_string()).into(),
                        );
                    }
                    Ok(json!(args[0] - args[1]))
                }),
            )
            .with("Log", handler_fn(|_ctx, _req| async { Ok(Value::Null) }))
    }

    fn start_math_server(options: ServerOptions) -> (Server, DirectChannel) {
        let (server_end, client_end) = direct();
        let server = Server::new(Arc::new(math_methods()), options);
        server.start(server_end);
        (server, client_end)
    }

    async fn send_json(ch: &DirectChannel, v: Value) {
        ch.send(&serde_json::to_vec(&v).unwrap()).await.unwrap();
    }

    async fn recv_json(ch: &DirectChannel) -> Value {
        let payload = tokio::time::timeout(Duration::from_secs(5), ch.recv())
            .await
            .expect("timed out waiting for a response")
            .expect("channel failed")
            .expect("channel closed before a response arrived");
        serde_json::from_slice(&payload).expect("response is not valid JSON")
    }

    #[tokio::test]
    async fn test_call_produces_result() {
        let (server, client) = start_math_server(ServerOptions::default());

        send_json(
            &client,
            json!({"jsonrpc": "2.0", "id": 1, "method": "Math.Add", "params": [2, 3]}),
        )
        .await;

        let resp = recv_json(&client).await;
        assert_eq!(resp["jsonrpc"], "2.0");
        assert_eq!(resp["id"], 1);
        assert_eq!(resp["result"], 5);
        assert!(resp.get("error").is_none());

        server.stop();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_skips_notification_responses() {
        let (server, client) = start_math_server(ServerOptions::default());

        send_json(
            &client,
            json!([
                {"jsonrpc": "2.0", "id": 1, "method": "Math.Add", "params": [1, 1]},
                {"jsonrpc": "2.0", "id": 2, "method": "Math.Sub", "params": [5, 2]},
                {"jsonrpc": "2.0", "method": "Log", "params": ["hi"]},
            ]),
        )
        .await;

        let resp = recv_json(&client).await;
        let arr = resp.as_array().expect("batch response must be an array");
        assert_eq!(arr.len(), 2, "one entry per non-notification request");

        // Order on the wire is not guaranteed; match by id.
        for entry in arr {
            match entry["id"].as_i64().unwrap() {
                1 => assert_eq!(entry["result"], 2),
                2 => assert_eq!(entry["result"], 3),
                other => panic!("unexpected response id {other}"),
            }
        }

        server.stop();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_single_request_gets_scalar_response() {
        let (server, client) = start_math_server(ServerOptions::default());
        send_json(
            &client,
            json!({"jsonrpc": "2.0", "id": 3, "method": "Math.Add", "params": []}),
        )
        .await;
        let resp = recv_json(&client).await;
        assert!(
            !resp.is_array(),
            "a bare request must get a bare response, got {resp}"
        );
        server.stop();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_method_not_found() {
        let (server, client) = start_math_server(ServerOptions::default());
        send_json(&client, json!({"jsonrpc": "2.0", "id": 1, "method": "Nope"})).await;
        let resp = recv_json(&client).await;
        assert_eq!(resp["error"]["code"], -32601);
        server.stop();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_payload_answered_and_session_continues() {
        let (server, client) = start_math_server(ServerOptions::default());

        client.send(b"{oops").await.unwrap();
        let resp = recv_json(&client).await;
        assert_eq!(resp["id"], Value::Null);
        assert_eq!(resp["error"]["code"], -32700);

        // The session keeps accepting further messages.
        send_json(
            &client,
            json!({"jsonrpc": "2.0", "id": 2, "method": "Math.Add", "params": [1, 2]}),
        )
        .await;
        let resp = recv_json(&client).await;
        assert_eq!(resp["id"], 2);
        assert_eq!(resp["result"], 3);

        server.stop();
        assert!(server.wait().await.is_ok(), "parse failures are not fatal");
    }

    #[tokio::test]
    async fn test_empty_batch_invalid_request() {
        let (server, client) = start_math_server(ServerOptions::default());
        send_json(&client, json!([])).await;
        let resp = recv_json(&client).await;
        assert_eq!(resp["id"], Value::Null);
        assert_eq!(resp["error"]["code"], -32600);
        server.stop();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_scalar_payload_is_a_parse_error() {
        let (server, client) = start_math_server(ServerOptions::default());
        send_json(&client, json!(42)).await;
        let resp = recv_json(&client).await;
        assert_eq!(resp["error"]["code"], -32700);
        server.stop();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_non_scalar_id_rejected_under_null_id() {
        let (server, client) = start_math_server(ServerOptions::default());
        send_json(
            &client,
            json!({"jsonrpc": "2.0", "id": [1], "method": "Math.Add", "params": []}),
        )
        .await;
        let resp = recv_json(&client).await;
        assert_eq!(resp["id"], Value::Null);
        assert_eq!(resp["error"]["code"], -32600);
        server.stop();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_explicit_null_id_rejected_not_silently_dropped() {
        let (server, client) = start_math_server(ServerOptions::default());
        send_json(
            &client,
            json!({"jsonrpc": "2.0", "id": null, "method": "Math.Add", "params": [1, 1]}),
        )
        .await;
        let resp = recv_json(&client).await;
        assert_eq!(resp["id"], Value::Null);
        assert_eq!(
            resp["error"]["code"], -32600,
            "a null id is not a scalar and not absent, so the request is invalid"
        );
        server.stop();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected_without_disturbing_first() {
        let gate = Arc::new(Notify::new());
        let release = Arc::clone(&gate);
        let methods = math_methods().with(
            "Slow.Wait",
            handler_fn(move |_ctx, _req| {
                let gate = Arc::clone(&gate);
                async move {
                    gate.notified().await;
                    Ok(json!("done"))
                }
            }),
        );

        let (server_end, client) = direct();
        let server = Server::new(Arc::new(methods), ServerOptions::default());
        server.start(server_end);

        send_json(&client, json!({"jsonrpc": "2.0", "id": 7, "method": "Slow.Wait"})).await;
        // Give the first request time to enter the active set.
        tokio::time::sleep(Duration::from_millis(30)).await;

        send_json(
            &client,
            json!({"jsonrpc": "2.0", "id": 7, "method": "Math.Add", "params": [1, 1]}),
        )
        .await;
        let resp = recv_json(&client).await;
        assert_eq!(resp["error"]["code"], -32600, "second id 7 must be rejected");
        assert_eq!(resp["id"], 7);

        release.notify_one();
        let resp = recv_json(&client).await;
        assert_eq!(resp["id"], 7);
        assert_eq!(resp["result"], "done", "first id 7 completes undisturbed");

        server.stop();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_id_released_after_response() {
        let (server, client) = start_math_server(ServerOptions::default());
        for round in 0..2 {
            send_json(
                &client,
                json!({"jsonrpc": "2.0", "id": 5, "method": "Math.Add", "params": [round, 1]}),
            )
            .await;
            let resp = recv_json(&client).await;
            assert_eq!(resp["result"], round + 1, "round {round} must succeed");
        }
        server.stop();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_detection_compares_canonical_ids() {
        let gate = Arc::new(Notify::new());
        let release = Arc::clone(&gate);
        let methods = MethodMap::new().with(
            "Slow.Wait",
            handler_fn(move |_ctx, _req| {
                let gate = Arc::clone(&gate);
                async move {
                    gate.notified().await;
                    Ok(json!("done"))
                }
            }),
        );
        let (server_end, client) = direct();
        let server = Server::new(Arc::new(methods), ServerOptions::default());
        server.start(server_end);

        send_json(&client, json!({"jsonrpc": "2.0", "id": 1, "method": "Slow.Wait"})).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        // 1.0 normalizes to 1 and therefore collides.
        send_json(&client, json!({"jsonrpc": "2.0", "id": 1.0, "method": "Slow.Wait"})).await;
        let resp = recv_json(&client).await;
        assert_eq!(resp["error"]["code"], -32600);

        release.notify_one();
        let resp = recv_json(&client).await;
        assert_eq!(resp["result"], "done");

        server.stop();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_notification_error_produces_no_response() {
        let (server, client) = start_math_server(ServerOptions::default());

        // Unknown method as a notification: no response, even on error.
        send_json(&client, json!({"jsonrpc": "2.0", "method": "Nope"})).await;
        send_json(
            &client,
            json!({"jsonrpc": "2.0", "id": 9, "method": "Math.Add", "params": [4, 5]}),
        )
        .await;

        let resp = recv_json(&client).await;
        assert_eq!(resp["id"], 9, "the only response belongs to the call");

        server.stop();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_all_notification_workload_writes_no_bytes() {
        let (server, client) = start_math_server(ServerOptions::default());

        for _ in 0..3 {
            send_json(&client, json!({"jsonrpc": "2.0", "method": "Log", "params": ["hi"]})).await;
        }
        send_json(
            &client,
            json!([
                {"jsonrpc": "2.0", "method": "Log"},
                {"jsonrpc": "2.0", "method": "Log"},
            ]),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = server.server_status();
        assert_eq!(status.bytes_out, 0, "notifications must produce no bytes");
        assert!(status.bytes_in > 0);
        assert_eq!(status.requests, 5);

        server.stop();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_version_marker_enforced_by_default() {
        let (server, client) = start_math_server(ServerOptions::default());
        send_json(&client, json!({"id": 1, "method": "Math.Add", "params": []})).await;
        let resp = recv_json(&client).await;
        assert_eq!(resp["error"]["code"], -32600);
        server.stop();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_v1_mode_accepts_unversioned_requests() {
        let options = ServerOptions {
            allow_v1: true,
            ..Default::default()
        };
        let (server, client) = start_math_server(options);
        send_json(&client, json!({"id": 1, "method": "Math.Add", "params": [1, 2]})).await;
        let resp = recv_json(&client).await;
        assert_eq!(resp["result"], 3);
        server.stop();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_version_still_rejected_in_v1_mode() {
        let options = ServerOptions {
            allow_v1: true,
            ..Default::default()
        };
        let (server, client) = start_math_server(options);
        send_json(
            &client,
            json!({"jsonrpc": "1.5", "id": 1, "method": "Math.Add", "params": []}),
        )
        .await;
        let resp = recv_json(&client).await;
        assert_eq!(resp["error"]["code"], -32600);
        server.stop();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_method_name_rejected() {
        let (server, client) = start_math_server(ServerOptions::default());
        send_json(&client, json!({"jsonrpc": "2.0", "id": 1, "method": ""})).await;
        let resp = recv_json(&client).await;
        assert_eq!(resp["error"]["code"], -32600);
        server.stop();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_info_snapshot() {
        let (server, client) = start_math_server(ServerOptions::default());

        send_json(
            &client,
            json!({"jsonrpc": "2.0", "id": 1, "method": "Math.Add", "params": [1, 1]}),
        )
        .await;
        recv_json(&client).await;

        send_json(&client, json!({"jsonrpc": "2.0", "id": 2, "method": "rpc.serverInfo"})).await;
        let resp = recv_json(&client).await;
        let result = &resp["result"];
        assert_eq!(result["methods"], json!(["Log", "Math.Add", "Math.Sub"]));
        assert!(result["requests"].as_u64().unwrap() >= 2);
        assert!(result["bytesIn"].as_u64().unwrap() > 0);
        assert!(result["bytesOut"].as_u64().unwrap() > 0);

        server.stop();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_introspection_can_be_disabled() {
        let options = ServerOptions {
            introspection: false,
            ..Default::default()
        };
        let (server, client) = start_math_server(options);
        send_json(&client, json!({"jsonrpc": "2.0", "id": 1, "method": "rpc.serverInfo"})).await;
        let resp = recv_json(&client).await;
        assert_eq!(resp["error"]["code"], -32601);
        server.stop();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_error_code_carried_through() {
        let (server, client) = start_math_server(ServerOptions::default());
        send_json(
            &client,
            json!({"jsonrpc": "2.0", "id": 1, "method": "Math.Sub", "params": [1]}),
        )
        .await;
        let resp = recv_json(&client).await;
        assert_eq!(resp["error"]["code"], -32602);
        server.stop();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_plain_handler_error_wrapped_as_internal() {
        let methods = MethodMap::new().with(
            "Fail",
            handler_fn(|_ctx, _req| async { Err(anyhow::anyhow!("handler exploded")) }),
        );
        let (server_end, client) = direct();
        let server = Server::new(Arc::new(methods), ServerOptions::default());
        server.start(server_end);

        send_json(&client, json!({"jsonrpc": "2.0", "id": 1, "method": "Fail"})).await;
        let resp = recv_json(&client).await;
        assert_eq!(resp["error"]["code"], -32603);
        assert!(resp["error"]["message"]
            .as_str()
            .unwrap()
            .contains("handler exploded"));

        server.stop();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_semaphore() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (current_h, peak_h) = (Arc::clone(&current), Arc::clone(&peak));

        let methods = MethodMap::new().with(
            "Busy",
            handler_fn(move |_ctx, _req| {
                let current = Arc::clone(&current_h);
                let peak = Arc::clone(&peak_h);
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }),
        );

        let (server_end, client) = direct();
        let options = ServerOptions {
            concurrency: 2,
            ..Default::default()
        };
        let server = Server::new(Arc::new(methods), options);
        server.start(server_end);

        let calls: Vec<Value> = (1..=6)
            .map(|id| json!({"jsonrpc": "2.0", "id": id, "method": "Busy"}))
            .collect();
        send_json(&client, Value::Array(calls)).await;

        let resp = recv_json(&client).await;
        assert_eq!(resp.as_array().unwrap().len(), 6);
        assert!(
            peak.load(Ordering::SeqCst) <= 2,
            "more than two handlers ran at once"
        );

        server.stop();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_context_hook_and_attached_request() {
        let methods = MethodMap::new().with(
            "WhoAmI",
            handler_fn(|ctx, _req| async move {
                let method = ctx.request().map(|r| r.method.clone());
                let tag = ctx.metadata().cloned();
                Ok(json!({ "method": method, "tag": tag }))
            }),
        );

        let hook: RequestContextHook =
            Arc::new(|_req| Context::new().with_metadata(json!("hooked")));
        let options = ServerOptions {
            request_context: Some(hook),
            ..Default::default()
        };
        let (server_end, client) = direct();
        let server = Server::new(Arc::new(methods), options);
        server.start(server_end);

        send_json(&client, json!({"jsonrpc": "2.0", "id": 1, "method": "WhoAmI"})).await;
        let resp = recv_json(&client).await;
        assert_eq!(resp["result"]["method"], "WhoAmI");
        assert_eq!(resp["result"]["tag"], "hooked");

        server.stop();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_cancels_inflight_handler_context() {
        let methods = MethodMap::new().with(
            "Hang",
            handler_fn(|ctx, _req| async move {
                ctx.cancelled().await;
                Err(RpcError::Cancelled.into())
            }),
        );
        let (server_end, client) = direct();
        let server = Server::new(Arc::new(methods), ServerOptions::default());
        server.start(server_end);

        send_json(&client, json!({"jsonrpc": "2.0", "id": 1, "method": "Hang"})).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        server.stop();
        let result = tokio::time::timeout(Duration::from_secs(5), server.wait())
            .await
            .expect("stop must unblock a context-aware handler");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_peer_eof_is_clean_termination() {
        let (server, client) = start_math_server(ServerOptions::default());
        client.close().await;
        let result = tokio::time::timeout(Duration::from_secs(5), server.wait())
            .await
            .expect("EOF must terminate the server");
        assert!(result.is_ok(), "EOF is not an error");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (server, _client) = start_math_server(ServerOptions::default());
        server.stop();
        server.stop();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    #[should_panic(expected = "already started")]
    async fn test_double_start_panics() {
        let (server, _client) = start_math_server(ServerOptions::default());
        let (extra, _other) = direct();
        server.start(extra);
    }

    #[tokio::test]
    async fn test_shutdown_drain_runs_retained_notifications() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_h = Arc::clone(&hits);
        let methods = MethodMap::new().with(
            "Log",
            handler_fn(move |_ctx, _req| {
                let hits = Arc::clone(&hits_h);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }),
        );
        let server = Server::new(Arc::new(methods), ServerOptions::default());
        let (server_end, client) = direct();
        let channel: Arc<dyn Channel> = Arc::new(server_end);

        // Feed the dispatcher a queue that already holds work, with the
        // stop signal already raised: the drain must run every queued
        // notification and drop the queued call.
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        queue_tx
            .send(InboundBatch {
                requests: vec![
                    Request::call(json!(1), "Log", None),
                    Request::notification("Log", None),
                ],
                wrapped: true,
            })
            .unwrap();
        queue_tx
            .send(InboundBatch {
                requests: vec![Request::notification("Log", None)],
                wrapped: false,
            })
            .unwrap();

        let core = Arc::clone(&server.core);
        core.stop.cancel();
        Arc::clone(&core).dispatch_loop(channel, queue_rx).await;
        core.tracker.close();
        core.tracker.wait().await;

        assert_eq!(
            hits.load(Ordering::SeqCst),
            2,
            "every retained notification must run"
        );
        let got = tokio::time::timeout(Duration::from_millis(100), client.recv()).await;
        assert!(got.is_err(), "the dropped call must produce no response");
    }
}
