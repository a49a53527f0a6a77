//! Metrics collection for the broker connection manager
//!
//! Counters live on each client instance; there is no process-wide registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Client metrics collector
#[derive(Debug, Default)]
pub struct ClientMetrics {
    // Request metrics
    pub requests_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub responses_received: AtomicU64,
    pub request_timeouts: AtomicU64,
    pub requests_failed: AtomicU64,
    pub response_latency_sum: AtomicU64,
    pub response_latency_count: AtomicU64,

    // Connection metrics
    pub connections_created: AtomicU64,
    pub connections_failed: AtomicU64,
    pub connection_errors: AtomicU64,
    pub reconnects: AtomicU64,
    pub protocol_violations: AtomicU64,

    // Topology metrics
    pub metadata_refreshes: AtomicU64,
    pub metadata_refresh_failures: AtomicU64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request written to a socket
    pub fn record_request_sent(&self, byte_count: u64) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a response matched to its request
    pub fn record_response(&self, latency: Duration) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
        self.response_latency_sum
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.response_latency_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request that failed its deadline
    pub fn record_timeout(&self) {
        self.request_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record requests failed by a connection teardown
    pub fn record_requests_failed(&self, count: u64) {
        self.requests_failed.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a completed dial
    pub fn record_connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dial that never connected
    pub fn record_connection_failed(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a scheduled redial
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a metadata refresh attempt
    pub fn record_metadata_refresh(&self, success: bool) {
        if success {
            self.metadata_refreshes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metadata_refresh_failures
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get average response latency in microseconds
    pub fn average_response_latency_us(&self) -> f64 {
        let sum = self.response_latency_sum.load(Ordering::Relaxed);
        let count = self.response_latency_count.load(Ordering::Relaxed);

        if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        }
    }

    /// Get snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            request_timeouts: self.request_timeouts.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            average_response_latency_us: self.average_response_latency_us(),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            metadata_refreshes: self.metadata_refreshes.load(Ordering::Relaxed),
            metadata_refresh_failures: self.metadata_refresh_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub requests_sent: u64,
    pub bytes_sent: u64,
    pub responses_received: u64,
    pub request_timeouts: u64,
    pub requests_failed: u64,
    pub average_response_latency_us: f64,
    pub connections_created: u64,
    pub connections_failed: u64,
    pub connection_errors: u64,
    pub reconnects: u64,
    pub protocol_violations: u64,
    pub metadata_refreshes: u64,
    pub metadata_refresh_failures: u64,
}
