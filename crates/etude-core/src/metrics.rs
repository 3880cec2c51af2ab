// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

/// Server-wide counters, updated lock-free from every worker.
#[repr(C, align(64))]
#[derive(Debug)]
pub struct ServerMetrics {
    req_count: AtomicUsize,
    active_conns: AtomicUsize,
    bytes_sent: AtomicUsize,
}

/// Point-in-time copy of [`ServerMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests: usize,
    pub active_connections: usize,
    pub bytes_sent: usize,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            req_count: AtomicUsize::new(0),
            active_conns: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
        }
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn requests(&self) -> usize {
        self.req_count.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> usize {
        self.active_conns.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests(),
            active_connections: self.active_connections(),
            bytes_sent: self.bytes_sent(),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
