//! Unified error type.

use std::net::SocketAddr;

use thiserror::Error;

/// The error type returned by splitgate's fallible operations.
///
/// Proxy-level failures seen by a caller (a refused backend, a broken
/// upstream) are expressed as a `502` response or a closed socket, not as
/// `Error`s. This type surfaces infrastructure failures: binding the port,
/// reading configuration, reaching a backend from inside a connection task.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid value for {var}: {value:?}")]
    Config { var: &'static str, value: String },

    #[error("backend {addr} unreachable: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream: {0}")]
    Upstream(#[from] hyper::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
