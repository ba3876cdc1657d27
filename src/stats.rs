//! Connection accounting shared between the event loop and external readers.
//!
//! The event loop is the only writer; atomics let an operator tool (or the
//! `/stats` command handler) read the counters without locks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lifetime and current client counters.
#[derive(Debug)]
pub struct ServerStats {
    /// Total connections accepted since startup
    total_clients: AtomicU64,
    /// Connections currently open
    current_clients: AtomicU64,
}

impl ServerStats {
    /// Create a new counter set, shared via `Arc`.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            total_clients: AtomicU64::new(0),
            current_clients: AtomicU64::new(0),
        })
    }

    /// Record a successfully accepted connection.
    pub(crate) fn record_accept(&self) {
        self.total_clients.fetch_add(1, Ordering::SeqCst);
        self.current_clients.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a connection teardown. Clamped at zero.
    pub(crate) fn record_disconnect(&self) {
        let _ = self
            .current_clients
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Total connections accepted since startup.
    pub fn total_clients(&self) -> u64 {
        self.total_clients.load(Ordering::SeqCst)
    }

    /// Connections currently open.
    pub fn current_clients(&self) -> u64 {
        self.current_clients.load(Ordering::SeqCst)
    }

    /// Textual rendering used by the `/stats` reply.
    pub fn render(&self) -> String {
        format!(
            "total_clients={} current_clients={}",
            self.total_clients(),
            self.current_clients()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_increments_both() {
        let stats = ServerStats::new();
        stats.record_accept();
        stats.record_accept();

        assert_eq!(stats.total_clients(), 2);
        assert_eq!(stats.current_clients(), 2);
    }

    #[test]
    fn test_disconnect_decrements_current_only() {
        let stats = ServerStats::new();
        stats.record_accept();
        stats.record_accept();
        stats.record_disconnect();

        assert_eq!(stats.total_clients(), 2);
        assert_eq!(stats.current_clients(), 1);
    }

    #[test]
    fn test_disconnect_clamps_at_zero() {
        let stats = ServerStats::new();
        stats.record_disconnect();
        assert_eq!(stats.current_clients(), 0);

        stats.record_accept();
        stats.record_disconnect();
        stats.record_disconnect();
        assert_eq!(stats.current_clients(), 0);
        assert_eq!(stats.total_clients(), 1);
    }

    #[test]
    fn test_render() {
        let stats = ServerStats::new();
        stats.record_accept();
        assert_eq!(stats.render(), "total_clients=1 current_clients=1");
    }
}
