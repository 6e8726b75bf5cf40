//! Host port allocation for workloads.
//!
//! Each workload gets one host port for its private channel. Two rules keep
//! concurrent launches from colliding:
//!
//! 1. Reservations are globally serialized — the scan runs inside a single
//!    mutex, so two concurrent reservations can never pick the same port.
//! 2. A reserved port goes on a blacklist and stays there until the
//!    workload is confirmed stopped, covering the window where the OS-level
//!    probe would already report the port as free again.
//!
//! The allocator is a field of the orchestrator, never shared process-wide;
//! tests construct their own.

use crate::error::{Error, Result};
use std::collections::HashSet;
use std::net::TcpListener;
use tokio::sync::Mutex;

/// Upper bound of the scan range (top of the IANA registered-port space).
const PORT_SCAN_END: u16 = 49151;

#[derive(Debug, Default)]
struct PortTable {
    blacklist: HashSet<u16>,
}

/// Serialized, blacklist-aware port allocator.
#[derive(Debug, Default)]
pub struct PortAllocator {
    inner: Mutex<PortTable>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the first usable port at or above `start_port`.
    ///
    /// A port is usable when it is not blacklisted and a probe bind on
    /// `127.0.0.1` succeeds. The chosen port is blacklisted before the lock
    /// is released.
    pub async fn reserve(&self, service_id: &str, start_port: u16) -> Result<u16> {
        let mut table = self.inner.lock().await;
        for port in start_port..=PORT_SCAN_END {
            if table.blacklist.contains(&port) {
                continue;
            }
            if !probe(port) {
                continue;
            }
            table.blacklist.insert(port);
            tracing::debug!(service_id, port, "reserved service port");
            return Ok(port);
        }
        Err(Error::PortAllocation(format!(
            "no free port in {}..={} for service '{}'",
            start_port, PORT_SCAN_END, service_id
        )))
    }

    /// Release a port after its workload is confirmed stopped.
    pub async fn release(&self, port: u16) {
        let mut table = self.inner.lock().await;
        if table.blacklist.remove(&port) {
            tracing::debug!(port, "released service port");
        }
    }

    /// Release every reserved port (full-registry shutdown).
    pub async fn release_all(&self) {
        self.inner.lock().await.blacklist.clear();
    }

    /// Whether a port is currently reserved.
    pub async fn is_reserved(&self, port: u16) -> bool {
        self.inner.lock().await.blacklist.contains(&port)
    }
}

/// Probe whether the OS would let us bind `127.0.0.1:port` right now.
/// The listener is dropped immediately — the blacklist, not the bind,
/// is what holds the reservation.
fn probe(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reserve_returns_start_port_when_free() {
        let allocator = PortAllocator::new();
        // Find a port the OS will actually give us, then start the scan there.
        let probe_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let free = probe_listener.local_addr().unwrap().port();
        drop(probe_listener);

        let port = allocator.reserve("svc", free).await.unwrap();
        assert_eq!(port, free);
        assert!(allocator.is_reserved(port).await);
    }

    #[tokio::test]
    async fn reserve_skips_blacklisted_ports() {
        let allocator = PortAllocator::new();
        let first = allocator.reserve("a", 21100).await.unwrap();
        let second = allocator.reserve("b", 21100).await.unwrap();
        assert_ne!(first, second);
        assert!(second > first);
    }

    #[tokio::test]
    async fn reserve_skips_os_bound_ports() {
        let allocator = PortAllocator::new();
        let holder = TcpListener::bind("127.0.0.1:0").unwrap();
        let held = holder.local_addr().unwrap().port();

        let port = allocator.reserve("svc", held).await.unwrap();
        assert_ne!(port, held);
        drop(holder);
    }

    #[tokio::test]
    async fn release_makes_port_reusable() {
        let allocator = PortAllocator::new();
        let port = allocator.reserve("svc", 22100).await.unwrap();
        allocator.release(port).await;
        assert!(!allocator.is_reserved(port).await);

        let again = allocator.reserve("svc", port).await.unwrap();
        assert_eq!(again, port);
    }

    #[tokio::test]
    async fn concurrent_reservations_are_distinct() {
        use std::sync::Arc;

        let allocator = Arc::new(PortAllocator::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let alloc = Arc::clone(&allocator);
            handles.push(tokio::spawn(async move {
                alloc.reserve(&format!("svc-{i}"), 23100).await.unwrap()
            }));
        }

        let mut ports = Vec::new();
        for handle in handles {
            ports.push(handle.await.unwrap());
        }
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 8, "all reserved ports should be distinct");
    }

    #[tokio::test]
    async fn exhausted_range_is_an_allocation_error() {
        let allocator = PortAllocator::new();
        // Blacklist the entire tail of the range so the scan has nowhere to go.
        {
            let mut table = allocator.inner.lock().await;
            for port in (PORT_SCAN_END - 32)..=PORT_SCAN_END {
                table.blacklist.insert(port);
            }
        }
        let err = allocator.reserve("svc", PORT_SCAN_END - 32).await.unwrap_err();
        assert!(matches!(err, Error::PortAllocation(_)));
    }
}
