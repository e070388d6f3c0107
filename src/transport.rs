//! Secure transport hook.
//!
//! The relay does not speak TLS itself. A [`SecureTransport`] is consulted
//! at startup, for every accepted peer before its first receive is posted,
//! when a peer goes away, and at shutdown. [`Plaintext`] accepts everyone.

use mio::net::TcpStream;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("secure transport unavailable: {0}")]
    Unavailable(String),

    #[error("handshake with {peer} failed: {reason}")]
    HandshakeFailed { peer: SocketAddr, reason: String },
}

/// Session setup and teardown for accepted peers.
///
/// Called from worker threads, so implementations must be thread-safe.
pub trait SecureTransport: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Prepare the transport. Failure aborts startup.
    fn initialize(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Establish a session with a freshly accepted peer.
    ///
    /// On error the peer is dropped without ever being registered.
    fn establish(&self, stream: &TcpStream, peer: SocketAddr) -> Result<(), TransportError>;

    /// The peer's session is over.
    fn teardown(&self, _peer: SocketAddr) {}

    /// Release the transport. Called once, at shutdown.
    fn shutdown(&self) {}
}

/// No encryption; every peer is accepted.
#[derive(Debug, Default, Clone, Copy)]
pub struct Plaintext;

impl SecureTransport for Plaintext {
    fn name(&self) -> &str {
        "plaintext"
    }

    fn establish(&self, _stream: &TcpStream, _peer: SocketAddr) -> Result<(), TransportError> {
        Ok(())
    }
}
