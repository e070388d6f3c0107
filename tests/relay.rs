//! End-to-end tests: a real relay on `127.0.0.1:0` driven by blocking
//! `std::net::TcpStream` clients.
//!
//! Servers run on background workers (`Server::start`), so each test keeps
//! the calling thread free to play the clients. Anything the server does
//! asynchronously (admission, disconnect cleanup) is awaited by polling with
//! a deadline rather than by sleeping a fixed time.

use chat_relay::{
    BroadcastPolicy, Config, SecureTransport, Server, ServerState, TransportError,
};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

fn config() -> Config {
    Config {
        port: 0,
        threads: 4,
        ..Config::default()
    }
}

fn start(config: Config) -> (Server, SocketAddr) {
    start_with(Server::new(config))
}

fn start_with(mut server: Server) -> (Server, SocketAddr) {
    let config = server.config().clone();
    server.initialize().unwrap();
    let addr = server.start_listening(&config.host, config.port).unwrap();
    server.start(config.threads).unwrap();
    (server, addr)
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    stream
}

/// Poll `condition` until it holds or the timeout passes.
fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).unwrap();
    buf
}

/// True if nothing arrives on `stream` within a short window.
fn stays_silent(stream: &mut TcpStream) -> bool {
    stream
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let mut buf = [0u8; 1];
    let silent = matches!(
        stream.read(&mut buf),
        Err(ref e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
    );
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    silent
}

fn connect_all(server: &Server, addr: SocketAddr, count: usize) -> Vec<TcpStream> {
    let clients: Vec<_> = (0..count).map(|_| connect(addr)).collect();
    assert!(wait_until(|| server.connection_count() == count));
    clients
}

// ── Fan-out ──────────────────────────────────────────────────────────────────

#[test]
fn test_broadcast_all_includes_sender() {
    let (server, addr) = start(config());
    let mut clients = connect_all(&server, addr, 3);

    clients[0].write_all(b"hi").unwrap();

    for client in &mut clients {
        assert_eq!(read_exactly(client, 2), b"hi");
    }
    assert!(wait_until(|| server.stats().sends_issued == 3));
    assert_eq!(server.stats().broadcasts, 1);
}

#[test]
fn test_broadcast_others_skips_sender() {
    let (server, addr) = start(Config {
        broadcast: BroadcastPolicy::Others,
        ..config()
    });
    let mut clients = connect_all(&server, addr, 3);

    clients[0].write_all(b"hi").unwrap();

    assert_eq!(read_exactly(&mut clients[1], 2), b"hi");
    assert_eq!(read_exactly(&mut clients[2], 2), b"hi");
    assert!(stays_silent(&mut clients[0]));
}

#[test]
fn test_payload_larger_than_buffer_arrives_in_chunks() {
    // One worker keeps the two chunks of a sender in order across targets.
    let (server, addr) = start(Config {
        buffer_size: 16,
        threads: 1,
        ..config()
    });
    let mut clients = connect_all(&server, addr, 2);

    clients[0].write_all(b"hello world!!!!!!").unwrap();

    for client in &mut clients {
        let first = read_exactly(client, 16);
        assert_eq!(first, b"hello world!!!!!");
        assert_eq!(read_exactly(client, 1), b"!");
    }

    let stats = server.stats();
    assert_eq!(stats.bytes_received, 17);
    assert!(stats.receives >= 2);
}

#[test]
fn test_many_messages_keep_order_per_sender() {
    let (server, addr) = start(Config {
        threads: 1,
        ..config()
    });
    let mut clients = connect_all(&server, addr, 2);

    let mut expected = Vec::new();
    for i in 0..50 {
        let line = format!("line {i}\n");
        clients[0].write_all(line.as_bytes()).unwrap();
        expected.extend_from_slice(line.as_bytes());
    }

    for client in &mut clients {
        assert_eq!(read_exactly(client, expected.len()), expected);
    }
}

// ── Connections ──────────────────────────────────────────────────────────────

#[test]
fn test_connect_without_data_registers_and_posts_receive() {
    let cfg = config();
    let pending = cfg.pending_accepts as u64;
    let (server, addr) = start(cfg);

    let _client = connect(addr);

    // The replacement accept plus the first receive
    assert!(wait_until(|| server.connection_count() == 1
        && server.context_stats().outstanding() == pending + 1));

    let stats = server.stats();
    assert_eq!(stats.online, 1);
    assert_eq!(stats.broadcasts, 0);
    assert_eq!(stats.sends_issued, 0);
}

#[test]
fn test_disconnect_removes_connection() {
    let (server, addr) = start(config());
    let mut clients = connect_all(&server, addr, 2);

    drop(clients.remove(0));

    assert!(wait_until(|| server.connection_count() == 1));
    assert!(wait_until(|| server.stats().online == 1));

    // The survivor still gets relayed traffic
    clients[0].write_all(b"still here").unwrap();
    assert_eq!(read_exactly(&mut clients[0], 10), b"still here");
}

#[test]
fn test_connection_limit_drops_extra_peers() {
    let (server, addr) = start(Config {
        max_connections: 1,
        ..config()
    });
    let _first = connect_all(&server, addr, 1);

    let mut extra = connect(addr);
    assert!(wait_until(|| server.stats().rejected == 1));

    let mut buf = [0u8; 1];
    match extra.read(&mut buf) {
        Ok(n) => assert_eq!(n, 0),
        Err(e) => assert_ne!(e.kind(), io::ErrorKind::WouldBlock),
    }
    assert_eq!(server.connection_count(), 1);
}

struct Rejecting;

impl SecureTransport for Rejecting {
    fn name(&self) -> &str {
        "rejecting"
    }

    fn establish(
        &self,
        _stream: &mio::net::TcpStream,
        peer: SocketAddr,
    ) -> Result<(), TransportError> {
        Err(TransportError::HandshakeFailed {
            peer,
            reason: "no certificate".into(),
        })
    }
}

#[test]
fn test_failed_handshake_drops_peer() {
    let (server, addr) = start_with(Server::with_transport(config(), Arc::new(Rejecting)));

    let mut client = connect(addr);
    assert!(wait_until(|| server.stats().rejected == 1));

    let mut buf = [0u8; 1];
    match client.read(&mut buf) {
        Ok(n) => assert_eq!(n, 0),
        Err(e) => assert_ne!(e.kind(), io::ErrorKind::WouldBlock),
    }
    assert_eq!(server.connection_count(), 0);
    assert_eq!(server.stats().accepted, 0);
}

#[test]
fn test_concurrent_churn_leaves_nothing_behind() {
    const CLIENTS: usize = 8;
    const ROUNDS: usize = 25;

    let (mut server, addr) = start(Config {
        threads: 8,
        ..config()
    });

    let churners: Vec<_> = (0..CLIENTS)
        .map(|c| {
            thread::spawn(move || {
                for round in 0..ROUNDS {
                    let mut client = connect(addr);
                    if round % 3 == 2 {
                        // Gone before sending anything
                        continue;
                    }
                    client.write_all(format!("{c}:{round}").as_bytes()).unwrap();
                    // At least our own chunk comes back; others may be mixed in
                    let mut buf = [0u8; 64];
                    assert!(client.read(&mut buf).unwrap() > 0);
                }
            })
        })
        .collect();
    for churner in churners {
        churner.join().unwrap();
    }

    // Peers that hung up early may still be sitting in the backlog
    let total = (CLIENTS * ROUNDS) as u64;
    assert!(wait_until(|| server.stats().accepted == total));
    assert!(wait_until(|| server.connection_count() == 0));
    assert!(wait_until(|| server.stats().online == 0));
    assert_eq!(server.stats().rejected, 0);

    server.shutdown();
    let contexts = server.context_stats();
    assert_eq!(contexts.allocated, contexts.released);
}

// ── Lifecycle ────────────────────────────────────────────────────────────────

#[test]
fn test_shutdown_releases_every_context() {
    let (mut server, addr) = start(config());
    let mut clients = connect_all(&server, addr, 3);

    for (i, client) in clients.iter_mut().enumerate() {
        client.write_all(format!("msg {i}").as_bytes()).unwrap();
    }
    for client in &mut clients {
        read_exactly(client, 15);
    }

    server.shutdown();
    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(server.connection_count(), 0);
    assert_eq!(server.stats().online, 0);

    let contexts = server.context_stats();
    assert!(contexts.allocated > 0);
    assert_eq!(contexts.allocated, contexts.released);

    // Clients see the connection go away
    for client in &mut clients {
        let mut buf = [0u8; 1];
        match client.read(&mut buf) {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert_ne!(e.kind(), io::ErrorKind::WouldBlock),
        }
    }
}

#[test]
fn test_run_blocks_until_stopped() {
    let mut server = Server::new(config());
    server.initialize().unwrap();
    let addr = server.start_listening("127.0.0.1", 0).unwrap();
    let stop = server.stop_handle();

    let runner = thread::spawn(move || {
        server.run(2).unwrap();
        server.shutdown();
        server
    });

    let mut client = connect(addr);
    client.write_all(b"ping").unwrap();
    assert_eq!(read_exactly(&mut client, 4), b"ping");

    stop.stop();
    let server = runner.join().unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
}
