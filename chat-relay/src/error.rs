use std::{io, net::SocketAddr, time::Duration};

use thiserror::Error;

/// Why a client connection attempt or write to the relay failed.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("timed out after {timeout:?} connecting to {addr}")]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },

    #[error("failed to send name handshake: {0}")]
    Handshake(#[source] io::Error),

    #[error("failed to write to server: {0}")]
    Write(#[source] io::Error),

    #[error("timed out after {0:?} writing to server")]
    WriteTimeout(Duration),

    #[error("session stopped")]
    Stopped,
}

/// Settings rejected at startup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("listen backlog must be at least 1")]
    ZeroBacklog,

    #[error("reconnect base delay must be greater than zero")]
    ZeroReconnectBase,

    #[error("reconnect base delay {base:?} exceeds maximum {max:?}")]
    ReconnectBaseExceedsMax { base: Duration, max: Duration },

    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
}
