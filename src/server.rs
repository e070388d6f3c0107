//! Server lifecycle.
//!
//! `Uninitialized -> Initialized -> Listening -> Running -> ShuttingDown ->
//! Stopped`. Each step checks the state it starts from, so calls made out of
//! order fail with [`ServerError::InvalidState`] instead of half-building a
//! server. [`Server::shutdown`] works from any state and is idempotent.

use crate::config::Config;
use crate::error::{Result, ServerError};
use crate::runtime::broadcast::BroadcastRouter;
use crate::runtime::connection::ConnectionRegistry;
use crate::runtime::context::{ContextAllocator, ContextStats};
use crate::runtime::dispatcher::Dispatcher;
use crate::runtime::listener::Listener;
use crate::runtime::port::CompletionPort;
use crate::runtime::stats::{ServerStats, StatsSnapshot};
use crate::runtime::{lock, Runtime};
use crate::transport::{Plaintext, SecureTransport};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use tracing::{info, warn};

/// Lifecycle state of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Uninitialized,
    Initialized,
    Listening,
    Running,
    ShuttingDown,
    Stopped,
}

impl ServerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerState::Uninitialized => "uninitialized",
            ServerState::Initialized => "initialized",
            ServerState::Listening => "listening",
            ServerState::Running => "running",
            ServerState::ShuttingDown => "shutting down",
            ServerState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    fn stop(&self) {
        *lock(&self.stopped) = true;
        self.cond.notify_all();
    }

    fn is_stopped(&self) -> bool {
        *lock(&self.stopped)
    }

    fn wait(&self) {
        let mut stopped = lock(&self.stopped);
        while !*stopped {
            stopped = self
                .cond
                .wait(stopped)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Requests that a running server stop. Cheap to clone and `Send`, so it can
/// be moved into a signal handler or another thread.
#[derive(Debug, Clone)]
pub struct StopHandle {
    signal: Arc<StopSignal>,
}

impl StopHandle {
    /// Wake [`Server::run`] / [`Server::wait`]. Teardown is left to
    /// [`Server::shutdown`].
    pub fn stop(&self) {
        self.signal.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.signal.is_stopped()
    }
}

/// The relay server.
pub struct Server {
    config: Config,
    transport: Arc<dyn SecureTransport>,
    state: ServerState,
    runtime: Option<Arc<Runtime>>,
    dispatcher: Option<Dispatcher>,
    stop: Arc<StopSignal>,
}

impl Server {
    /// Create a plaintext server.
    pub fn new(config: Config) -> Self {
        Self::with_transport(config, Arc::new(Plaintext))
    }

    /// Create a server that admits peers through `transport`.
    pub fn with_transport(config: Config, transport: Arc<dyn SecureTransport>) -> Self {
        Self {
            config,
            transport,
            state: ServerState::Uninitialized,
            runtime: None,
            dispatcher: None,
            stop: Arc::new(StopSignal::default()),
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            signal: Arc::clone(&self.stop),
        }
    }

    /// Bound listening address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime.as_ref().map(|rt| rt.listener.local_addr())
    }

    /// Registered connections.
    pub fn connection_count(&self) -> usize {
        self.runtime.as_ref().map_or(0, |rt| rt.registry.len())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.runtime
            .as_ref()
            .map(|rt| rt.stats.snapshot())
            .unwrap_or_default()
    }

    /// Operation context allocations and releases so far.
    pub fn context_stats(&self) -> ContextStats {
        self.runtime
            .as_ref()
            .map(|rt| rt.contexts.stats())
            .unwrap_or_default()
    }

    /// Prepare the networking subsystem.
    pub fn initialize(&mut self) -> Result<()> {
        self.expect_state(ServerState::Uninitialized, "initialize")?;
        self.transport.initialize()?;
        self.state = ServerState::Initialized;
        info!(transport = self.transport.name(), "networking initialized");
        Ok(())
    }

    /// Bind and listen on `host:port` and create the completion port.
    ///
    /// `host` must be an IPv4 literal. Returns the bound address, which
    /// carries the real port when `port` is 0.
    pub fn start_listening(&mut self, host: &str, port: u16) -> Result<SocketAddr> {
        self.expect_state(ServerState::Initialized, "start listening")?;

        let ip: Ipv4Addr = host
            .parse()
            .map_err(|_| ServerError::Address(host.to_string()))?;
        let completion_port = CompletionPort::new().map_err(ServerError::CompletionPort)?;
        let listener = Listener::bind(
            SocketAddr::from((ip, port)),
            self.config.backlog,
            &completion_port,
        )?;
        let local_addr = listener.local_addr();

        self.runtime = Some(Arc::new(Runtime {
            port: completion_port,
            listener,
            registry: ConnectionRegistry::new(self.config.max_connections),
            router: BroadcastRouter::new(self.config.broadcast),
            contexts: ContextAllocator::new(self.config.buffer_size),
            transport: Arc::clone(&self.transport),
            stats: ServerStats::new(),
        }));
        self.state = ServerState::Listening;

        info!(addr = %local_addr, backlog = self.config.backlog, "listening");
        Ok(local_addr)
    }

    /// Spawn `threads` workers and seed the pending accepts. Does not block.
    ///
    /// Values below 1 mean 1.
    pub fn start(&mut self, threads: usize) -> Result<()> {
        self.expect_state(ServerState::Listening, "start")?;
        let rt = match &self.runtime {
            Some(rt) => Arc::clone(rt),
            None => {
                return Err(ServerError::InvalidState {
                    state: self.state.as_str(),
                    operation: "start",
                })
            }
        };

        let threads = threads.max(1);
        self.dispatcher = Some(Dispatcher::spawn(&rt, threads)?);

        let wanted = self.config.pending_accepts;
        let posted = rt.listener.post_accepts(wanted, &rt.contexts);
        if posted < wanted {
            warn!(posted, wanted, "not every pending accept could be posted");
        }

        self.state = ServerState::Running;
        info!(
            threads,
            pending_accepts = posted,
            buffer_size = self.config.buffer_size,
            broadcast = ?self.config.broadcast,
            "server running"
        );
        Ok(())
    }

    /// [`start`](Self::start), then block until a stop is requested.
    pub fn run(&mut self, threads: usize) -> Result<()> {
        self.start(threads)?;
        self.wait();
        Ok(())
    }

    /// Block until a [`StopHandle`] requests a stop.
    pub fn wait(&self) {
        self.stop.wait();
    }

    /// Tear everything down. Idempotent.
    ///
    /// Closes the listener, disconnects every client, closes the completion
    /// port (which ends the workers), joins the workers and releases the
    /// networking subsystem.
    pub fn shutdown(&mut self) {
        match self.state {
            ServerState::ShuttingDown | ServerState::Stopped => return,
            ServerState::Uninitialized => {
                self.state = ServerState::Stopped;
                self.stop.stop();
                return;
            }
            _ => {}
        }
        self.state = ServerState::ShuttingDown;
        info!("shutting down");

        if let Some(rt) = &self.runtime {
            rt.listener.close(&rt.port);
            let closed = rt.disconnect_all();
            rt.port.close();
            info!(closed, "connections closed");
        }

        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.join();
        }

        // Workers may have admitted peers after the first sweep.
        if let Some(rt) = &self.runtime {
            rt.disconnect_all();
        }

        self.transport.shutdown();
        self.stop.stop();
        self.state = ServerState::Stopped;

        let stats = self.stats();
        let contexts = self.context_stats();
        info!(
            accepted = stats.accepted,
            receives = stats.receives,
            bytes_received = stats.bytes_received,
            contexts_allocated = contexts.allocated,
            contexts_released = contexts.released,
            "server stopped"
        );
    }

    fn expect_state(&self, expected: ServerState, operation: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(ServerError::InvalidState {
                state: self.state.as_str(),
                operation,
            });
        }
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state)
            .field("local_addr", &self.local_addr())
            .field("transport", &self.transport.name())
            .finish_non_exhaustive()
    }
}
