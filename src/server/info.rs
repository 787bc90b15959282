//! Server introspection counters
//!
//! The dispatcher tallies dispatched requests and payload bytes in each
//! direction; [`ServerStatus`] is the snapshot served by the built-in
//! `rpc.serverInfo` method and by [`crate::server::Server::server_status`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub(crate) struct ServerMetrics {
    requests: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl ServerMetrics {
    pub fn add_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_in(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, methods: Vec<String>) -> ServerStatus {
        ServerStatus {
            methods,
            requests: self.requests.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

/// A snapshot of the server's methods and traffic counters.
///
/// # Examples
///
/// ```
/// use switchboard::server::ServerStatus;
///
/// let status: ServerStatus = serde_json::from_str(
///     r#"{"methods":["Math.Add"],"requests":3,"bytesIn":120,"bytesOut":90}"#,
/// ).unwrap();
/// assert_eq!(status.requests, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    /// Method names served by the assigner, sorted.
    pub methods: Vec<String>,
    /// Requests dispatched since start, notifications included.
    pub requests: u64,
    /// Payload bytes received.
    #[serde(rename = "bytesIn")]
    pub bytes_in: u64,
    /// Payload bytes written.
    #[serde(rename = "bytesOut")]
    pub bytes_out: u64,
}
