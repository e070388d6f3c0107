//! Listening socket, pending accepts and admission of new peers.

use crate::error::ServerError;
use crate::runtime::connection::Connection;
use crate::runtime::context::{ContextAllocator, OperationContext};
use crate::runtime::port::{CompletionKey, CompletionPort, IoHandle};
use crate::runtime::{lock, Runtime};
use mio::net::{TcpListener, TcpStream};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Completion key of the listening socket. Arena keys never reach it.
pub const LISTENER_KEY: CompletionKey = u64::MAX;

/// Attempts per accept before giving up on keeping the pool full.
const ACCEPT_RETRIES: usize = 3;

/// Bounds of the pause before replacing an accept that failed for lack of
/// descriptors or memory. Doubles per consecutive failure.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(1);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_millis(100);

/// The listening socket, associated with the completion port.
#[derive(Debug)]
pub struct Listener {
    handle: Arc<IoHandle>,
    local_addr: SocketAddr,
    backoff: Mutex<Duration>,
}

impl Listener {
    /// Bind, listen and associate with `port`.
    pub fn bind(addr: SocketAddr, backlog: i32, port: &CompletionPort) -> Result<Self, ServerError> {
        let socket = create_listener(addr, backlog)?;
        let local_addr = socket.local_addr().map_err(ServerError::Socket)?;
        let handle = port
            .associate_listener(TcpListener::from_std(socket), LISTENER_KEY)
            .map_err(ServerError::CompletionPort)?;

        Ok(Self {
            handle,
            local_addr,
            backoff: Mutex::new(Duration::ZERO),
        })
    }

    /// Address actually bound. Differs from the requested one for port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Accepts currently waiting for a peer.
    pub fn pending(&self) -> usize {
        self.handle.pending()
    }

    /// Issue one accept.
    pub fn post_accept(&self, contexts: &Arc<ContextAllocator>) -> io::Result<()> {
        self.handle.submit(contexts.accept())
    }

    /// Issue `count` accepts, retrying failed submissions a few times.
    /// Returns the number issued.
    pub fn post_accepts(&self, count: usize, contexts: &Arc<ContextAllocator>) -> usize {
        let mut posted = 0;
        for _ in 0..count {
            for attempt in 1..=ACCEPT_RETRIES {
                match self.post_accept(contexts) {
                    Ok(()) => {
                        posted += 1;
                        break;
                    }
                    Err(e) if self.is_closed() => {
                        trace!(error = %e, "listener closed, accept not posted");
                        return posted;
                    }
                    Err(e) => {
                        warn!(attempt, error = %e, "failed to post accept");
                    }
                }
            }
        }
        posted
    }

    /// Stop accepting. Pending accepts complete as aborted.
    pub fn close(&self, port: &CompletionPort) {
        port.close_handle(&self.handle);
    }

    /// Pause owed before replacing an accept that ended with `error`.
    ///
    /// While the process is out of descriptors the peer stays in the backlog
    /// and the listener stays readable, so every replacement fails at once.
    /// The pause grows across such failures; any other outcome resets it.
    fn backoff_after(&self, error: Option<&io::Error>) -> Option<Duration> {
        let mut backoff = lock(&self.backoff);
        match error {
            Some(e) if is_resource_exhaustion(e) => {
                *backoff = (*backoff * 2).clamp(ACCEPT_BACKOFF_MIN, ACCEPT_BACKOFF_MAX);
                Some(*backoff)
            }
            _ => {
                *backoff = Duration::ZERO;
                None
            }
        }
    }
}

fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

fn create_listener(addr: SocketAddr, backlog: i32) -> Result<std::net::TcpListener, ServerError> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(ServerError::Socket)?;

    socket.set_reuse_address(true).map_err(ServerError::Socket)?;
    socket.set_nonblocking(true).map_err(ServerError::Socket)?;
    socket
        .bind(&addr.into())
        .map_err(|source| ServerError::Bind { addr, source })?;
    socket
        .listen(backlog)
        .map_err(|source| ServerError::Listen { addr, source })?;

    Ok(socket.into())
}

/// Handle a completed accept: replace it, then admit the peer.
pub(crate) fn on_accept_complete(
    rt: &Runtime,
    result: io::Result<usize>,
    mut context: OperationContext,
) {
    let (accepted, backoff) = match result {
        Ok(_) => (context.take_accepted(), rt.listener.backoff_after(None)),
        Err(e) if rt.listener.is_closed() => {
            trace!(error = %e, "accept aborted");
            return;
        }
        Err(e) => {
            let backoff = rt.listener.backoff_after(Some(&e));
            match backoff {
                Some(delay) => warn!(error = %e, ?delay, "accept failed, out of resources"),
                None => debug!(error = %e, "accept failed"),
            }
            (None, backoff)
        }
    };
    drop(context);

    if let Some(delay) = backoff {
        thread::sleep(delay);
    }

    // Refill before admitting.
    rt.listener.post_accepts(1, &rt.contexts);

    if let Some((stream, peer)) = accepted {
        admit(rt, stream, peer);
    }
}

/// Register an accepted peer and post its first receive.
///
/// Dropping `stream` on any early return closes the candidate socket.
fn admit(rt: &Runtime, stream: TcpStream, peer: SocketAddr) {
    let Some(id) = rt.registry.reserve() else {
        rt.stats.rejected();
        warn!(peer = %peer, max = rt.registry.capacity(), "connection limit reached, dropping peer");
        return;
    };

    if let Err(e) = rt.transport.establish(&stream, peer) {
        rt.registry.cancel(id);
        rt.stats.rejected();
        warn!(peer = %peer, transport = rt.transport.name(), error = %e, "handshake failed, dropping peer");
        return;
    }

    let io = match rt.port.associate_stream(stream, id.to_u64()) {
        Ok(io) => io,
        Err(e) => {
            rt.registry.cancel(id);
            rt.transport.teardown(peer);
            debug!(peer = %peer, error = %e, "failed to associate accepted socket");
            return;
        }
    };

    let conn = Arc::new(Connection::new(id, rt.registry.next_serial(), peer, io));
    let online = rt.stats.connected();
    if let Err(conn) = rt.registry.add(Arc::clone(&conn)) {
        conn.begin_disconnect();
        rt.port.close_handle(conn.io());
        conn.mark_closed();
        rt.transport.teardown(peer);
        rt.stats.disconnected();
        return;
    }

    // Shutdown may have drained the registry in between; it owns cleanup then.
    if !conn.activate() {
        return;
    }
    info!(conn = %id, serial = conn.serial(), peer = %peer, online, "client connected");

    if let Err(e) = conn.post_receive(&rt.contexts) {
        debug!(conn = %id, error = %e, "failed to post first receive");
        rt.disconnect(&conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::broadcast::BroadcastPolicy;
    use crate::runtime::context::OpKind;
    use crate::runtime::testing::runtime;
    use std::time::Instant;

    #[test]
    fn test_bind_reports_ephemeral_port() {
        let port = CompletionPort::new().unwrap();
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), 16, &port).unwrap();
        assert_ne!(listener.local_addr().port(), 0);
        assert_eq!(port.associated(), 1);
    }

    #[test]
    fn test_bind_conflict_is_a_bind_error() {
        let port = CompletionPort::new().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let err = Listener::bind(addr, 16, &port).unwrap_err();
        assert!(matches!(err, ServerError::Bind { addr: a, .. } if a == addr));
    }

    #[test]
    fn test_post_accepts_and_close() {
        let port = CompletionPort::new().unwrap();
        let contexts = ContextAllocator::new(64);
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), 16, &port).unwrap();

        assert_eq!(listener.post_accepts(4, &contexts), 4);
        assert_eq!(listener.pending(), 4);

        let _client = std::net::TcpStream::connect(listener.local_addr()).unwrap();
        let packet = port
            .get_queued_completion_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(packet.key, LISTENER_KEY);
        assert_eq!(packet.context.kind(), OpKind::Accept);
        assert_eq!(listener.pending(), 3);
        drop(packet);

        listener.close(&port);
        assert!(listener.is_closed());
        assert_eq!(listener.post_accepts(2, &contexts), 0);

        // The three parked accepts come back aborted
        for _ in 0..3 {
            let packet = port
                .get_queued_completion_timeout(Duration::from_secs(5))
                .unwrap()
                .unwrap();
            assert_eq!(
                packet.result.unwrap_err().kind(),
                io::ErrorKind::ConnectionAborted
            );
        }
        assert_eq!(contexts.stats().outstanding(), 0);
    }

    fn emfile() -> io::Error {
        io::Error::from_raw_os_error(libc::EMFILE)
    }

    #[test]
    fn test_backoff_grows_while_exhausted() {
        let rt = runtime(64, BroadcastPolicy::All);
        let listener = &rt.listener;

        assert_eq!(listener.backoff_after(Some(&emfile())), Some(ACCEPT_BACKOFF_MIN));
        assert_eq!(
            listener.backoff_after(Some(&io::Error::from_raw_os_error(libc::ENFILE))),
            Some(ACCEPT_BACKOFF_MIN * 2)
        );
        for _ in 0..16 {
            listener.backoff_after(Some(&emfile()));
        }
        assert_eq!(listener.backoff_after(Some(&emfile())), Some(ACCEPT_BACKOFF_MAX));

        // A peer that gave up before being accepted is not exhaustion
        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(listener.backoff_after(Some(&aborted)), None);
        assert_eq!(listener.backoff_after(Some(&emfile())), Some(ACCEPT_BACKOFF_MIN));

        // So is a success
        assert_eq!(listener.backoff_after(None), None);
        assert_eq!(listener.backoff_after(Some(&emfile())), Some(ACCEPT_BACKOFF_MIN));
    }

    #[test]
    fn test_exhausted_accepts_are_replaced_slowly() {
        let rt = runtime(64, BroadcastPolicy::All);

        let started = Instant::now();
        let mut replaced = 0;
        while started.elapsed() < Duration::from_millis(300) {
            on_accept_complete(&rt, Err(emfile()), rt.contexts.accept());
            replaced += 1;
        }

        // Each failure still leaves one accept waiting for the next peer
        assert_eq!(rt.listener.pending(), replaced);
        assert!(replaced < 20, "{replaced} accepts reposted in 300ms");
        assert_eq!(rt.contexts.stats().allocated, 2 * replaced as u64);
    }
}
