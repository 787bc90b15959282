//! Per-request context and the hook points around it
//!
//! A [`Context`] is the sole carrier of per-request cross-cutting state:
//! cancellation, an optional deadline, optional caller metadata, and (on the
//! server side) the inbound request itself. The two hook aliases defined
//! here are the integration seam for metadata, deadlines, and auth tokens
//! without complicating the wire format:
//!
//! - [`RequestContextHook`] -- the server derives the context a handler runs
//!   under from the decoded request. The default is a fresh context.
//! - [`EncodeContextHook`] -- the client splices context-derived metadata
//!   into the outbound params of every call and notification. The default
//!   sends params verbatim.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::Request;

/// Per-request context.
///
/// Cheap to clone; clones share the same cancellation token.
///
/// # Examples
///
/// ```
/// use switchboard::Context;
///
/// let ctx = Context::new();
/// assert!(!ctx.is_cancelled());
/// ctx.cancellation().cancel();
/// assert!(ctx.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Duration>,
    metadata: Option<Value>,
    request: Option<Arc<Request>>,
}

impl Context {
    /// A fresh context with no deadline, no metadata, and its own
    /// cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cancellation token. Use this to tie the context to an
    /// externally owned token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Attach a deadline. Client calls give up with a cancellation error
    /// when no response arrives within this duration.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attach caller metadata. The value is opaque to the runtime; an
    /// [`EncodeContextHook`] may splice it into outbound params.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// The cancellation token backing this context.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Resolves when the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Whether the context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The deadline, if one was set.
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// The caller metadata, if any.
    pub fn metadata(&self) -> Option<&Value> {
        self.metadata.as_ref()
    }

    /// The inbound request this context was derived for. `Some` inside
    /// server handlers (and framework wrappers around them), `None`
    /// elsewhere.
    pub fn request(&self) -> Option<&Request> {
        self.request.as_deref()
    }

    /// Attach the inbound request before handler invocation.
    pub(crate) fn attach_request(&mut self, request: Arc<Request>) {
        self.request = Some(request);
    }
}

/// Server hook deriving the context a handler runs under from the decoded
/// request. Invoked once per admitted request, before handler invocation.
pub type RequestContextHook = Arc<dyn Fn(&Request) -> Context + Send + Sync>;

/// Client hook annotating the outbound params of every call and
/// notification with context-derived metadata. Returns the params to place
/// on the wire.
pub type EncodeContextHook =
    Arc<dyn Fn(&Context, Option<Value>) -> Result<Option<Value>> + Send + Sync>;
