//! Worker pool draining the completion port.
//!
//! Every worker blocks on the same port and handles whatever completes next,
//! so work for one connection may land on any worker. Per connection, the
//! single outstanding receive keeps receive handling sequential.

use crate::error::ServerError;
use crate::runtime::connection::{ConnId, Connection};
use crate::runtime::context::{OpKind, OperationContext};
use crate::runtime::listener::on_accept_complete;
use crate::runtime::port::{CompletionKey, CompletionPacket, PortError};
use crate::runtime::Runtime;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace};

/// Fixed pool of worker threads.
#[derive(Debug)]
pub struct Dispatcher {
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn `threads` workers over `rt`'s completion port.
    ///
    /// If a spawn fails the port is closed, so workers already running exit,
    /// and they are joined before the error is returned.
    pub fn spawn(rt: &Arc<Runtime>, threads: usize) -> Result<Self, ServerError> {
        let mut workers = Vec::with_capacity(threads);

        for worker_id in 0..threads {
            let worker_rt = Arc::clone(rt);
            let spawned = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, &worker_rt));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    rt.port.close();
                    Self { workers }.join();
                    return Err(ServerError::Spawn(e));
                }
            }
        }

        debug!(threads, "dispatcher started");
        Ok(Self { workers })
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker. They only exit once the port is closed.
    pub fn join(self) {
        for handle in self.workers {
            if handle.join().is_err() {
                error!("worker panicked");
            }
        }
    }
}

fn worker_loop(worker: usize, rt: &Runtime) {
    trace!(worker, "worker started");
    loop {
        match rt.port.get_queued_completion() {
            Ok(packet) => dispatch(rt, packet),
            Err(PortError::Closed) => break,
        }
    }
    trace!(worker, "worker stopped");
}

/// Route one completion by operation kind. The context is released when
/// this returns.
pub(crate) fn dispatch(rt: &Runtime, packet: CompletionPacket) {
    let CompletionPacket {
        key,
        result,
        context,
    } = packet;

    match context.kind() {
        OpKind::Accept => on_accept_complete(rt, result, context),
        OpKind::Receive => on_receive(rt, key, result, &context),
        OpKind::Send => on_send(rt, key, result, &context),
    }
}

fn lookup(rt: &Runtime, key: CompletionKey) -> Option<Arc<Connection>> {
    rt.registry.get(ConnId::from_u64(key))
}

fn on_receive(rt: &Runtime, key: CompletionKey, result: io::Result<usize>, context: &OperationContext) {
    // The connection may already be gone; its stale key resolves to nothing.
    let Some(conn) = lookup(rt, key) else {
        trace!(key, op = context.id(), "receive for a closed connection");
        return;
    };
    conn.receive_completed();

    match result {
        Ok(0) => {
            debug!(conn = %conn.id(), "peer closed");
            rt.disconnect(&conn);
        }
        Ok(n) => {
            rt.stats.received(n);
            trace!(conn = %conn.id(), bytes = n, "received");

            if let Err(e) = conn.post_receive(&rt.contexts) {
                debug!(conn = %conn.id(), error = %e, "failed to post receive");
                rt.disconnect(&conn);
            }
            rt.router.broadcast(
                conn.id(),
                context.payload(),
                &rt.registry,
                &rt.contexts,
                &rt.stats,
            );
        }
        Err(e) => {
            debug!(conn = %conn.id(), error = %e, "receive failed");
            rt.disconnect(&conn);
        }
    }
}

fn on_send(rt: &Runtime, key: CompletionKey, result: io::Result<usize>, context: &OperationContext) {
    match result {
        Ok(n) if n > 0 => {
            trace!(key, op = context.id(), bytes = n, "sent");
        }
        Ok(_) => disconnect_key(rt, key, "send wrote nothing"),
        Err(e) => {
            trace!(key, op = context.id(), error = %e, "send failed");
            disconnect_key(rt, key, "send failed");
        }
    }
}

fn disconnect_key(rt: &Runtime, key: CompletionKey, reason: &'static str) {
    if let Some(conn) = lookup(rt, key) {
        debug!(conn = %conn.id(), reason, "dropping connection");
        rt.disconnect(&conn);
    }
}
