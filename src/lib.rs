//! chat-relay: a completion-port driven TCP relay.
//!
//! Every chunk a client sends is copied to the connected clients (the sender
//! included, unless the `others` policy is configured). The relay is driven
//! by a completion port: accepts, receives and sends are submitted together
//! with their buffers, and a fixed pool of worker threads handles whatever
//! completes next.
//!
//! ```no_run
//! use chat_relay::{Config, Server};
//!
//! let config = Config::default();
//! let mut server = Server::new(config.clone());
//! server.initialize()?;
//! let addr = server.start_listening(&config.host, config.port)?;
//! println!("listening on {addr}");
//! server.run(config.threads)?;
//! server.shutdown();
//! # Ok::<(), chat_relay::ServerError>(())
//! ```

pub mod config;
pub mod error;
pub mod runtime;
pub mod server;
pub mod transport;

pub use config::{Config, ConfigError};
pub use error::ServerError;
pub use runtime::broadcast::BroadcastPolicy;
pub use runtime::context::ContextStats;
pub use runtime::stats::StatsSnapshot;
pub use server::{Server, ServerState, StopHandle};
pub use transport::{Plaintext, SecureTransport, TransportError};
