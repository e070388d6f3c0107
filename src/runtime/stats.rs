//! Server counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by workers and the listener.
#[derive(Debug, Default)]
pub struct ServerStats {
    online: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    receives: AtomicU64,
    bytes_received: AtomicU64,
    sends_issued: AtomicU64,
    send_failures: AtomicU64,
    broadcasts: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Registered connections right now.
    pub online: u64,
    /// Connections admitted since start.
    pub accepted: u64,
    /// Accepted sockets dropped by the connection limit or the handshake.
    pub rejected: u64,
    /// Receive completions carrying data.
    pub receives: u64,
    pub bytes_received: u64,
    /// Sends successfully submitted.
    pub sends_issued: u64,
    /// Sends whose submission failed.
    pub send_failures: u64,
    /// Payloads handed to the router.
    pub broadcasts: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection was admitted. Returns the new online count.
    pub fn connected(&self) -> u64 {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.online.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// A connection went away. Returns the new online count.
    pub fn disconnected(&self) -> u64 {
        let prev = self
            .online
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    pub fn rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn received(&self, bytes: usize) {
        self.receives.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn send_issued(&self) {
        self.sends_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_failed(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broadcast(&self) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn online(&self) -> u64 {
        self.online.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            online: self.online.load(Ordering::Acquire),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            receives: self.receives.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            sends_issued: self.sends_issued.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_counter() {
        let stats = ServerStats::new();
        assert_eq!(stats.connected(), 1);
        assert_eq!(stats.connected(), 2);
        assert_eq!(stats.disconnected(), 1);
        assert_eq!(stats.disconnected(), 0);
        // Never wraps below zero
        assert_eq!(stats.disconnected(), 0);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.online, 0);
        assert_eq!(snapshot.accepted, 2);
    }

    #[test]
    fn test_traffic_counters() {
        let stats = ServerStats::new();
        stats.received(10);
        stats.received(6);
        stats.broadcast();
        stats.send_issued();
        stats.send_issued();
        stats.send_failed();
        stats.rejected();

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                online: 0,
                accepted: 0,
                rejected: 1,
                receives: 2,
                bytes_received: 16,
                sends_issued: 2,
                send_failures: 1,
                broadcasts: 1,
            }
        );
    }
}
