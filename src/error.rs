//! Error types for the datagram, file and CLI boundaries.
//!
//! [`Space`](crate::space::Space) itself never fails: its preconditions are data-range checks
//! enforced at these boundaries. Errors here are either fatal (the owning task or process exits)
//! or, where the underlying condition is transient, not modeled as `Err` at all.

use std::net::SocketAddr;

/// Configuration-time failures: a bad bind address, an oversize `ss` stdin payload.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid bind address {addr}: {source}")]
    InvalidAddress { addr: String, #[source] source: std::io::Error },

    #[error("buffer overflow")]
    BufferOverflow,
}

/// Fatal transport failures: dial/listen failure, a write failure in the client or relay.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("could not resolve {host}: {source}")]
    Resolve { host: String, #[source] source: std::io::Error },

    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, #[source] source: std::io::Error },

    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: SocketAddr, #[source] source: std::io::Error },

    #[error("write to {addr} failed: {source}")]
    Write { addr: SocketAddr, #[source] source: std::io::Error },
}
