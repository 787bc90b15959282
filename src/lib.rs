//! Switchboard - framed JSON-RPC 2.0 client and server runtime
//!
//! This library provides a complete JSON-RPC 2.0 session layer over any
//! bidirectional byte stream: a server that dispatches framed requests
//! (individually or in batches) to user-supplied handlers with bounded
//! concurrency, and a client that issues calls, notifications, and batches
//! with request/response correlation and cancellation.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `framing`: byte-level protocols delimiting discrete JSON payloads
//!   (`raw`, `line`, `varint`, header-based, plus in-process pipes)
//! - `types`: on-wire request/response shapes and id normalization
//! - `handler`: the `Handler` trait and the method-name `Assigner`
//! - `server`: the dispatcher (receive loop, batch queue, worker pool)
//! - `client`: the correlator (pending-call table, reader, batches)
//! - `context`: per-request cancellation, deadlines, and metadata hooks
//! - `error`: error types, JSON-RPC error codes, and result aliases
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use switchboard::framing::pipe;
//! use switchboard::handler::{handler_fn, MethodMap};
//! use switchboard::{Client, ClientOptions, Context, Server, ServerOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let methods = MethodMap::new().with(
//!         "Math.Add",
//!         handler_fn(|_ctx, req| async move {
//!             let args: Vec<i64> = serde_json::from_value(req.params.unwrap_or(json!([])))?;
//!             Ok(json!(args.iter().sum::<i64>()))
//!         }),
//!     );
//!
//!     let (server_end, client_end) = pipe::direct();
//!     let server = Server::new(Arc::new(methods), ServerOptions::default());
//!     server.start(server_end);
//!
//!     let client = Client::new(client_end, ClientOptions::default());
//!     let sum: i64 = client.call(&Context::new(), "Math.Add", json!([2, 3])).await?;
//!     assert_eq!(sum, 5);
//!
//!     client.close().await;
//!     server.stop();
//!     server.wait().await
//! }
//! ```

pub mod client;
pub mod context;
pub mod error;
pub mod framing;
pub mod handler;
pub mod server;
pub mod types;

// Re-export commonly used types
pub use client::{Batch, Client, ClientOptions, Spec};
pub use context::Context;
pub use error::{Result, RpcError};
pub use framing::{Channel, FramedChannel, Framing};
pub use handler::{handler_fn, Assigner, Handler, MethodMap};
pub use server::{Server, ServerOptions, ServerStatus};
pub use types::{ErrorObject, Request, Response};
