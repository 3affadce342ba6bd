//! Error types for the relay

use std::net::SocketAddr;

use thiserror::Error;

/// Why a requested display name was refused during the handshake.
///
/// Always recoverable: the client is told and asked again.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameError {
    #[error("name is shorter than 2 characters")]
    TooShort,

    #[error("name is longer than 16 characters")]
    TooLong,

    #[error("name contains the presence separator")]
    Separator,

    #[error("name is already taken")]
    Taken,
}

/// Server-level failures
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
