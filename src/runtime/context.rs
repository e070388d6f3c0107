//! Per-operation state.
//!
//! An [`OperationContext`] is created right before an accept, receive or send
//! is submitted to the completion port. From then on it has exactly one
//! owner: the port while the operation is outstanding, then the worker that
//! dequeued the completion. Dropping it is the release, so a context can be
//! neither released twice nor released while the port still holds it.
//!
//! All contexts come from a [`ContextAllocator`], which stamps ids and keeps
//! allocation/release counts for diagnostics and leak checks.

use crate::runtime::buffer::OpBuffer;
use crate::runtime::connection::ConnId;
use mio::net::TcpStream;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Kind of asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Accept on the listening socket.
    Accept,
    /// Receive into the context buffer.
    Receive,
    /// Send the context buffer.
    Send,
}

/// Allocation and release counters for operation contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextStats {
    pub allocated: u64,
    pub released: u64,
}

impl ContextStats {
    /// Contexts allocated but not yet released.
    pub fn outstanding(&self) -> u64 {
        self.allocated - self.released
    }
}

/// Factory for operation contexts.
#[derive(Debug)]
pub struct ContextAllocator {
    buffer_size: usize,
    next_id: AtomicU64,
    allocated: AtomicU64,
    released: AtomicU64,
}

impl ContextAllocator {
    /// Create an allocator whose receive/send buffers hold `buffer_size` bytes.
    pub fn new(buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size,
            next_id: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
            released: AtomicU64::new(0),
        })
    }

    /// Capacity of every receive/send buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Context for one accept on the listener.
    pub fn accept(self: &Arc<Self>) -> OperationContext {
        // Accepted peers are handed over as sockets, so no staging buffer.
        self.allocate(OpKind::Accept, None, OpBuffer::with_capacity(0))
    }

    /// Context for one receive on `conn`.
    pub fn receive(self: &Arc<Self>, conn: ConnId) -> OperationContext {
        self.allocate(
            OpKind::Receive,
            Some(conn),
            OpBuffer::with_capacity(self.buffer_size),
        )
    }

    /// Context for one send of `payload` to `conn`.
    ///
    /// Payloads longer than the buffer size are truncated; see
    /// [`OperationContext::is_truncated`].
    pub fn send(self: &Arc<Self>, conn: ConnId, payload: &[u8]) -> OperationContext {
        let mut context = self.allocate(
            OpKind::Send,
            Some(conn),
            OpBuffer::from_payload(payload, self.buffer_size),
        );
        context.truncated = payload.len() > self.buffer_size;
        context
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> ContextStats {
        // Read released first so a concurrent release never makes the
        // snapshot report more releases than allocations.
        let released = self.released.load(Ordering::Acquire);
        let allocated = self.allocated.load(Ordering::Acquire);
        ContextStats {
            allocated,
            released,
        }
    }

    fn allocate(
        self: &Arc<Self>,
        kind: OpKind,
        conn: Option<ConnId>,
        buffer: OpBuffer,
    ) -> OperationContext {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.allocated.fetch_add(1, Ordering::AcqRel);
        OperationContext {
            id,
            kind,
            conn,
            buffer,
            sent: 0,
            truncated: false,
            accepted: None,
            allocator: Arc::clone(self),
        }
    }
}

/// State of one in-flight operation.
#[derive(Debug)]
pub struct OperationContext {
    id: u64,
    kind: OpKind,
    /// Owning connection. `None` for accepts.
    conn: Option<ConnId>,
    buffer: OpBuffer,
    /// Bytes of `buffer` already written by a send.
    sent: usize,
    truncated: bool,
    /// Socket produced by a completed accept.
    accepted: Option<(TcpStream, SocketAddr)>,
    allocator: Arc<ContextAllocator>,
}

impl OperationContext {
    /// Process-unique operation id, for tracing.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// The connection this operation belongs to.
    pub fn conn(&self) -> Option<ConnId> {
        self.conn
    }

    /// Bytes staged in the buffer (received data, or the send payload).
    pub fn payload(&self) -> &[u8] {
        self.buffer.filled()
    }

    /// True if a send payload was cut down to the buffer size.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Take the socket produced by a completed accept.
    pub fn take_accepted(&mut self) -> Option<(TcpStream, SocketAddr)> {
        self.accepted.take()
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut OpBuffer {
        &mut self.buffer
    }

    pub(crate) fn set_accepted(&mut self, stream: TcpStream, peer: SocketAddr) {
        self.accepted = Some((stream, peer));
    }

    /// Send bytes not yet written.
    pub(crate) fn unsent(&self) -> &[u8] {
        &self.buffer.filled()[self.sent..]
    }

    pub(crate) fn advance_sent(&mut self, n: usize) {
        self.sent = (self.sent + n).min(self.buffer.len());
    }

    /// Bytes written so far by a send.
    pub(crate) fn sent(&self) -> usize {
        self.sent
    }
}

impl Drop for OperationContext {
    fn drop(&mut self) {
        self.allocator.released.fetch_add(1, Ordering::AcqRel);
    }
}
