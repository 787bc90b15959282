//! Error types for Switchboard
//!
//! This module defines all error types used throughout the runtime, using
//! `thiserror` for ergonomic error handling, along with the numeric JSON-RPC
//! error codes each variant maps to on the wire.
//!
//! Handlers and callers work with [`RpcError`] through the crate-wide
//! [`Result`] alias. The server recovers structured codes from handler
//! errors by downcasting through `anyhow`; anything it does not recognize is
//! reported to the peer as `-32603 Internal error`.

use thiserror::Error;

use crate::types::ErrorObject;

/// Numeric error codes defined by JSON-RPC 2.0 plus the codes reserved by
/// this runtime.
pub mod code {
    /// Invalid JSON was received, or a request payload had the wrong shape.
    pub const PARSE_ERROR: i64 = -32700;
    /// The request object is not a valid JSON-RPC 2.0 request.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The requested method does not exist on this server.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// The method parameters are invalid for the requested method.
    pub const INVALID_PARAMS: i64 = -32602;
    /// An internal error occurred while handling the request.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// A transport or runtime fault outside the JSON-RPC layer.
    pub const SYSTEM_ERROR: i64 = -32000;
    /// The request was cancelled before a response arrived.
    pub const CANCELLED: i64 = -32001;
    /// The server or client was stopped while the request was in flight.
    pub const SERVER_STOPPED: i64 = -32002;
}

/// Main error type for Switchboard operations
///
/// This enum encompasses all possible errors that can occur during framing,
/// dispatch, handler execution, and client correlation. Every variant maps
/// to a JSON-RPC error code via [`RpcError::code`].
#[derive(Error, Debug)]
pub enum RpcError {
    /// A payload could not be decoded as a JSON-RPC message.
    #[error("parse error: {0}")]
    Parse(String),

    /// The request failed structural validation (bad id, bad version,
    /// missing method, duplicate id, empty batch).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No handler is assigned to the requested method.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// The handler rejected the request parameters.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// The handler failed for a reason it did not classify.
    #[error("internal error: {0}")]
    Internal(String),

    /// A runtime fault outside the JSON-RPC layer.
    #[error("system error: {0}")]
    System(String),

    /// The caller's context was cancelled (or its deadline elapsed) before
    /// the response arrived. Never sent over the wire.
    #[error("request cancelled")]
    Cancelled,

    /// The server was stopped while the request was pending.
    #[error("the server has been stopped")]
    ServerStopped,

    /// The client was closed while the request was pending.
    #[error("the client has been stopped")]
    ClientStopped,

    /// A structured error object, either returned by the remote peer or
    /// produced by a handler that chose its own code.
    #[error("{0}")]
    ErrorResponse(ErrorObject),

    /// The framing layer or underlying transport failed. Fatal to the
    /// session it occurred on.
    #[error("channel error: {0}")]
    Channel(String),

    /// JSON serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// The JSON-RPC error code this error is reported under.
    pub fn code(&self) -> i64 {
        match self {
            RpcError::Parse(_) => code::PARSE_ERROR,
            RpcError::InvalidRequest(_) => code::INVALID_REQUEST,
            RpcError::MethodNotFound(_) => code::METHOD_NOT_FOUND,
            RpcError::InvalidParams(_) => code::INVALID_PARAMS,
            RpcError::Internal(_) => code::INTERNAL_ERROR,
            RpcError::Cancelled => code::CANCELLED,
            RpcError::ServerStopped | RpcError::ClientStopped => code::SERVER_STOPPED,
            RpcError::ErrorResponse(e) => e.code,
            RpcError::System(_)
            | RpcError::Channel(_)
            | RpcError::Serialization(_)
            | RpcError::Io(_) => code::SYSTEM_ERROR,
        }
    }

    /// Render this error as a wire-level error object.
    ///
    /// Structured [`RpcError::ErrorResponse`] errors are carried through
    /// unchanged; every other variant becomes `{code, message}`.
    pub fn error_object(&self) -> ErrorObject {
        match self {
            RpcError::ErrorResponse(e) => e.clone(),
            other => ErrorObject::new(other.code(), other.to_string()),
        }
    }
}

impl From<ErrorObject> for RpcError {
    fn from(obj: ErrorObject) -> Self {
        RpcError::ErrorResponse(obj)
    }
}

/// Map an arbitrary handler error to the error object reported to the peer.
///
/// Errors that downcast to [`RpcError`] or [`ErrorObject`] keep their code;
/// anything else is wrapped as `-32603 Internal error`.
pub fn error_object_from(err: &anyhow::Error) -> ErrorObject {
    if let Some(rpc) = err.downcast_ref::<RpcError>() {
        rpc.error_object()
    } else if let Some(obj) = err.downcast_ref::<ErrorObject>() {
        obj.clone()
    } else {
        ErrorObject::new(code::INTERNAL_ERROR, err.to_string())
    }
}

/// Result type alias for Switchboard operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;
