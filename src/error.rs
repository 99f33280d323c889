//! Error types for the forwarder.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced by the forwarding core.
///
/// Accept and relay failures are deliberately absent: they are handled where
/// they happen and never leave the accept loop or the connection.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Bad or missing listen/destination parameters.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The listening socket could not be bound.
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The destination could not be reached for one client.
    #[error("can not connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("forwarder already started")]
    AlreadyStarted,

    #[error("forwarder has been stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, ForwardError>;
