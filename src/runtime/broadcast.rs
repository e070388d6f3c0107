//! Fan-out of received payloads.

use crate::runtime::connection::{ConnId, Connection, ConnectionRegistry};
use crate::runtime::context::ContextAllocator;
use crate::runtime::stats::ServerStats;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Who receives a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BroadcastPolicy {
    /// Every connection, the sender included.
    #[default]
    All,
    /// Every connection except the sender.
    Others,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Delivery {
    /// Sends submitted.
    pub sent: usize,
    /// Targets whose send could not be submitted.
    pub failed: usize,
}

/// Turns one received payload into a send per target.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastRouter {
    policy: BroadcastPolicy,
}

impl BroadcastRouter {
    pub fn new(policy: BroadcastPolicy) -> Self {
        Self { policy }
    }

    /// Whether `conn` receives what `sender` sent. Connections that are not
    /// active are never targeted.
    pub fn is_target(&self, sender: ConnId, conn: &Connection) -> bool {
        conn.is_active()
            && match self.policy {
                BroadcastPolicy::All => true,
                BroadcastPolicy::Others => conn.id() != sender,
            }
    }

    /// Send `payload` to every target among the members of `registry`.
    ///
    /// Each target gets its own send context holding a copy of the payload,
    /// cut down to the buffer size if longer. A failed submission releases
    /// that context and moves on; the target's own receive path notices the
    /// disconnect.
    pub fn broadcast(
        &self,
        sender: ConnId,
        payload: &[u8],
        registry: &ConnectionRegistry,
        contexts: &Arc<ContextAllocator>,
        stats: &ServerStats,
    ) -> Delivery {
        let mut delivery = Delivery::default();
        if payload.is_empty() {
            return delivery;
        }
        stats.broadcast();

        registry.for_each(|target| {
            if !self.is_target(sender, target) {
                return;
            }

            let context = contexts.send(target.id(), payload);
            if context.is_truncated() {
                debug!(
                    conn = %target.id(),
                    len = payload.len(),
                    capacity = contexts.buffer_size(),
                    "payload truncated"
                );
            }

            match target.post_send(context) {
                Ok(()) => {
                    stats.send_issued();
                    delivery.sent += 1;
                }
                Err(e) => {
                    stats.send_failed();
                    delivery.failed += 1;
                    warn!(conn = %target.id(), peer = %target.peer(), error = %e, "send failed, peer is a disconnect candidate");
                }
            }
        });

        trace!(conn = %sender, sent = delivery.sent, failed = delivery.failed, "broadcast");
        delivery
    }
}
