//! Completion-port runtime.
//!
//! - `port`: completion port over mio (epoll/kqueue)
//! - `arena`: generation-checked ids used as completion keys
//! - `context`: per-operation state and its allocator
//! - `buffer`: fixed-capacity operation buffers
//! - `connection`: connection state machine and registry
//! - `listener`: listening socket, pending accepts, admission
//! - `dispatcher`: worker pool routing completions
//! - `broadcast`: fan-out of received payloads
//! - `stats`: server counters
//!
//! Everything the workers share lives in one [`Runtime`], built once by the
//! server and handed to every worker by `Arc`.

pub mod arena;
pub mod broadcast;
pub mod buffer;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod listener;
pub mod port;
pub mod stats;

use crate::transport::SecureTransport;
use broadcast::BroadcastRouter;
use connection::{Connection, ConnectionRegistry};
use context::ContextAllocator;
use listener::Listener;
use port::CompletionPort;
use stats::ServerStats;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;

/// State shared by the listener, the workers and the router.
pub struct Runtime {
    pub(crate) port: CompletionPort,
    pub(crate) listener: Listener,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) router: BroadcastRouter,
    pub(crate) contexts: Arc<ContextAllocator>,
    pub(crate) transport: Arc<dyn SecureTransport>,
    pub(crate) stats: ServerStats,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("listener", &self.listener)
            .field("registry", &self.registry)
            .field("router", &self.router)
            .field("transport", &self.transport.name())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Tear a connection down. Safe to call from any number of completions
    /// for the same connection; only the first does anything and returns
    /// true.
    pub(crate) fn disconnect(&self, conn: &Connection) -> bool {
        if !conn.begin_disconnect() {
            return false;
        }

        self.registry.remove(conn.id());
        self.port.close_handle(conn.io());
        conn.mark_closed();
        self.transport.teardown(conn.peer());

        let online = self.stats.disconnected();
        info!(
            conn = %conn.id(),
            serial = conn.serial(),
            peer = %conn.peer(),
            online,
            "client disconnected"
        );
        true
    }

    /// Disconnect every registered connection. Returns how many this call
    /// tore down.
    ///
    /// Members leave the registry through `disconnect`, after their state has
    /// moved past `Active`. Whatever is still registered afterwards (added
    /// after the snapshot, or mid-teardown on a worker) is swept at the end.
    pub(crate) fn disconnect_all(&self) -> usize {
        let mut closed = 0;
        self.registry.for_each(|conn| {
            if self.disconnect(conn) {
                closed += 1;
            }
        });
        for conn in self.registry.drain() {
            if self.disconnect(&conn) {
                closed += 1;
            }
        }
        closed
    }
}

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
