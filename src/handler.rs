//! Method handlers and the name-to-handler assigner
//!
//! A [`Handler`] services a single request: it receives the per-request
//! [`Context`] and the decoded [`Request`] and returns either a result value
//! or an error. Errors that downcast to [`crate::RpcError`] or
//! [`crate::types::ErrorObject`] keep their code on the wire; anything else
//! is reported as `-32603 Internal error`.
//!
//! An [`Assigner`] resolves method names to handlers for the dispatcher.
//! [`MethodMap`] is the ordinary implementation; the trait exists so
//! embedders can route names dynamically (prefix routers, reflection, ...).
//! The dispatcher calls `assign` concurrently after startup, so
//! implementations must be safe for concurrent reads.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::context::Context;
use crate::error::Result;
use crate::types::Request;

/// A method handler.
///
/// Handlers run on the server's task pool, bounded by the dispatcher's
/// concurrency semaphore. The context's cancellation token fires when the
/// server stops; long-running handlers should observe it.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    /// Service one request and produce its result value.
    async fn call(&self, ctx: Context, req: Request) -> Result<Value>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait::async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Context, Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn call(&self, ctx: Context, req: Request) -> Result<Value> {
        (self.f)(ctx, req).await
    }
}

/// Wrap an async closure as a [`Handler`].
///
/// # Examples
///
/// ```
/// use serde_json::{json, Value};
/// use switchboard::handler::handler_fn;
///
/// let handler = handler_fn(|_ctx, req| async move {
///     let params = req.params.unwrap_or(Value::Null);
///     Ok(json!({ "echo": params }))
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Context, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Resolves method names to handlers for the dispatcher.
pub trait Assigner: Send + Sync {
    /// Resolve a method name. `None` means the method does not exist and
    /// the dispatcher reports `-32601 Method not found`.
    fn assign(&self, method: &str) -> Option<Arc<dyn Handler>>;

    /// The method names this assigner serves, sorted. Used by the built-in
    /// `rpc.serverInfo` introspection method.
    fn names(&self) -> Vec<String>;
}

/// A plain name-to-handler mapping.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use switchboard::handler::{handler_fn, Assigner, MethodMap};
///
/// let map = MethodMap::new()
///     .with("ping", handler_fn(|_ctx, _req| async { Ok(json!("pong")) }));
/// assert!(map.assign("ping").is_some());
/// assert!(map.assign("nope").is_none());
/// ```
#[derive(Default)]
pub struct MethodMap {
    methods: HashMap<String, Arc<dyn Handler>>,
}

impl MethodMap {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous handler for the name.
    pub fn insert(&mut self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        self.methods.insert(name.into(), handler);
    }

    /// Builder-style [`MethodMap::insert`].
    pub fn with(mut self, name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.insert(name, handler);
        self
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether the map has no methods.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl Assigner for MethodMap {
    fn assign(&self, method: &str) -> Option<Arc<dyn Handler>> {
        self.methods.get(method).cloned()
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for MethodMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodMap")
            .field("methods", &self.names())
            .finish()
    }
}
