//! Connection state machine and the registry of live connections.
//!
//! A connection moves `Accepting -> Active -> Disconnecting -> Closed`. The
//! move into `Disconnecting` happens at most once, and whoever makes it owns
//! the teardown: removing the registry entry, closing the socket and marking
//! the connection closed. That is what keeps removal exactly-once when several
//! completions for the same peer fail at the same time.

use crate::runtime::arena::{Arena, Key};
use crate::runtime::context::{ContextAllocator, OperationContext};
use crate::runtime::lock;
use crate::runtime::port::IoHandle;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Connection identifier. Doubles as the socket's completion key.
pub type ConnId = Key;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted; handshake and registration in progress.
    Accepting,
    /// Registered, with a receive outstanding.
    Active,
    /// A failed or zero-byte completion was seen; teardown in progress.
    Disconnecting,
    /// Socket closed and registry entry gone.
    Closed,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    /// Process-unique, never reused (unlike the slot in `id`).
    serial: u64,
    peer: SocketAddr,
    io: Arc<IoHandle>,
    state: Mutex<ConnState>,
    /// Set while a receive is outstanding.
    receiving: AtomicBool,
}

impl Connection {
    /// Create a connection in the `Accepting` state.
    pub fn new(id: ConnId, serial: u64, peer: SocketAddr, io: Arc<IoHandle>) -> Self {
        Self {
            id,
            serial,
            peer,
            io,
            state: Mutex::new(ConnState::Accepting),
            receiving: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn io(&self) -> &Arc<IoHandle> {
        &self.io
    }

    pub fn state(&self) -> ConnState {
        *lock(&self.state)
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnState::Active
    }

    /// `Accepting -> Active`. False if the connection was torn down first.
    pub fn activate(&self) -> bool {
        let mut state = lock(&self.state);
        if *state != ConnState::Accepting {
            return false;
        }
        *state = ConnState::Active;
        true
    }

    /// Start teardown. Only the first caller gets `true`.
    pub fn begin_disconnect(&self) -> bool {
        let mut state = lock(&self.state);
        match *state {
            ConnState::Accepting | ConnState::Active => {
                *state = ConnState::Disconnecting;
                true
            }
            ConnState::Disconnecting | ConnState::Closed => false,
        }
    }

    pub fn mark_closed(&self) {
        *lock(&self.state) = ConnState::Closed;
    }

    /// True while a receive is outstanding.
    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::Acquire)
    }

    /// Post the connection's receive.
    ///
    /// Fails without submitting anything if the connection is not active or
    /// a receive is already outstanding.
    pub fn post_receive(&self, contexts: &Arc<ContextAllocator>) -> io::Result<()> {
        if !self.is_active() {
            return Err(not_active());
        }
        if self.receiving.swap(true, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "receive already outstanding",
            ));
        }

        let result = self.io.submit(contexts.receive(self.id));
        if result.is_err() {
            self.receiving.store(false, Ordering::Release);
        }
        result
    }

    /// The outstanding receive has completed.
    pub fn receive_completed(&self) {
        self.receiving.store(false, Ordering::Release);
    }

    /// Submit a send. The context is released right away if submission fails.
    pub fn post_send(&self, context: OperationContext) -> io::Result<()> {
        if !self.is_active() {
            return Err(not_active());
        }
        self.io.submit(context)
    }
}

fn not_active() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection is not active")
}

/// Live connections, keyed by [`ConnId`].
///
/// The lock is only held for structural changes and snapshots; nothing in
/// here performs I/O.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: Mutex<Arena<Arc<Connection>>>,
    max_connections: usize,
    next_serial: AtomicU64,
}

impl ConnectionRegistry {
    /// Create a registry admitting at most `max_connections` connections.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Mutex::new(Arena::with_capacity(max_connections.min(4096))),
            max_connections,
            next_serial: AtomicU64::new(1),
        }
    }

    /// Claim an id for a connection being admitted.
    ///
    /// Returns `None` when live plus pending connections reach the limit.
    pub fn reserve(&self) -> Option<ConnId> {
        let mut connections = lock(&self.connections);
        if connections.len() + connections.reserved() >= self.max_connections {
            return None;
        }
        Some(connections.reserve())
    }

    /// Give back a reserved id that will never be added.
    pub fn cancel(&self, id: ConnId) -> bool {
        lock(&self.connections).cancel(id)
    }

    /// Add a connection under its reserved id.
    ///
    /// Hands the connection back if the reservation is gone.
    pub fn add(&self, conn: Arc<Connection>) -> Result<(), Arc<Connection>> {
        lock(&self.connections).fill(conn.id(), conn)
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<Connection>> {
        lock(&self.connections).get(id).cloned()
    }

    /// Remove a connection. `None` if it was already removed.
    pub fn remove(&self, id: ConnId) -> Option<Arc<Connection>> {
        lock(&self.connections).remove(id)
    }

    /// Current members.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        lock(&self.connections)
            .iter()
            .map(|(_, conn)| Arc::clone(conn))
            .collect()
    }

    /// Call `f` for each member of a snapshot, without holding the lock.
    pub fn for_each<F: FnMut(&Arc<Connection>)>(&self, mut f: F) {
        for conn in self.snapshot() {
            f(&conn);
        }
    }

    /// Remove every member. Pending reservations are kept.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        lock(&self.connections)
            .drain()
            .into_iter()
            .map(|(_, conn)| conn)
            .collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of connections admitted.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Next process-unique connection serial.
    pub fn next_serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }
}
