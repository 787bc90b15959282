//! Client-side batch submission
//!
//! A batch is described by a list of [`Spec`] values, submitted as one
//! JSON array, and awaited through the [`Batch`] handle. Responses may
//! arrive in any order; [`Batch::wait`] returns them positionally, matched
//! back to their submission index by id. Notification specs reserve no
//! response slot: their position is filled by an empty placeholder.

use std::fmt;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Result, RpcError};
use crate::types::Response;

/// Describes one request of a batch.
#[derive(Debug, Clone)]
pub struct Spec {
    /// Method name to invoke.
    pub method: String,
    /// Parameters, placed on the wire verbatim (after the client's
    /// context-encoding hook, if any).
    pub params: Option<Value>,
    /// When `true`, the request is sent without an id and no response is
    /// awaited.
    pub notify: bool,
}

impl Spec {
    /// A call spec: a response slot is reserved for it.
    pub fn call(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            notify: false,
        }
    }

    /// A notification spec: fire-and-forget within the batch.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            notify: true,
        }
    }
}

pub(crate) enum Slot {
    Call(oneshot::Receiver<Response>),
    Notification,
}

/// Handle to a submitted batch.
pub struct Batch {
    pub(crate) slots: Vec<Slot>,
}

impl Batch {
    /// Number of specs submitted, notifications included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the batch had no specs.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Await every response and return them in spec order.
    ///
    /// Call slots resolve to the result value or the peer's error;
    /// notification slots resolve to `Ok(Value::Null)` immediately. A slot
    /// whose response can no longer arrive (the client was closed or its
    /// reader died) resolves to the stopped error.
    pub async fn wait(self) -> Vec<Result<Value>> {
        let mut results = Vec::with_capacity(self.slots.len());
        for slot in self.slots {
            match slot {
                Slot::Notification => results.push(Ok(Value::Null)),
                Slot::Call(rx) => match rx.await {
                    Ok(resp) => results.push(
                        resp.into_result()
                            .map_err(|e| RpcError::ErrorResponse(e).into()),
                    ),
                    Err(_) => results.push(Err(RpcError::ClientStopped.into())),
                },
            }
        }
        results
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch").field("len", &self.len()).finish()
    }
}
