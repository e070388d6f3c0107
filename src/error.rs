//! Startup and lifecycle errors.
//!
//! Everything here is fatal to startup. Per-connection failures never become
//! a `ServerError`; they surface as failed completions and end that
//! connection only.

use crate::transport::TransportError;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to initialize networking: {0}")]
    Initialize(#[from] TransportError),

    #[error("invalid listen address '{0}': expected an IPv4 literal")]
    Address(String),

    #[error("failed to create listening socket: {0}")]
    Socket(#[source] io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to create completion port: {0}")]
    CompletionPort(#[source] io::Error),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("cannot {operation} while {state}")]
    InvalidState {
        state: &'static str,
        operation: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, ServerError>;
