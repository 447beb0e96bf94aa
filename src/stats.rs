//! Statistics tracking for the resolver and the tunnel.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for resolver activity.
#[derive(Default)]
pub struct DnsStats {
    pub requests: AtomicU64,
    pub cache_hits: AtomicU64,
    pub stale_hits: AtomicU64,
    pub upstream: AtomicU64,
    pub coalesced: AtomicU64,
    pub failures: AtomicU64,
    /// Cumulative upstream time in microseconds for averaging.
    total_upstream_time_us: AtomicU64,
}

impl DnsStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, stale: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        if stale {
            self.stale_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_miss(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream(&self, response_time_ms: f64, ok: bool) {
        self.upstream.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.total_upstream_time_us
            .fetch_add((response_time_ms * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> DnsStatsSnapshot {
        let requests = self.requests.swap(0, Ordering::Relaxed);
        let cache_hits = self.cache_hits.swap(0, Ordering::Relaxed);
        let stale_hits = self.stale_hits.swap(0, Ordering::Relaxed);
        let upstream = self.upstream.swap(0, Ordering::Relaxed);
        let coalesced = self.coalesced.swap(0, Ordering::Relaxed);
        let failures = self.failures.swap(0, Ordering::Relaxed);
        let total_us = self.total_upstream_time_us.swap(0, Ordering::Relaxed);

        let avg_upstream_ms = if upstream > 0 {
            (total_us as f64 / upstream as f64) / 1000.0
        } else {
            0.0
        };

        DnsStatsSnapshot {
            requests,
            cache_hits,
            stale_hits,
            upstream,
            coalesced,
            failures,
            avg_upstream_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DnsStatsSnapshot {
    pub requests: u64,
    pub cache_hits: u64,
    pub stale_hits: u64,
    pub upstream: u64,
    pub coalesced: u64,
    pub failures: u64,
    pub avg_upstream_ms: f64,
}

/// Atomic counters for routed flows.
#[derive(Default)]
pub struct TunnelStats {
    pub tcp_flows: AtomicU64,
    pub udp_packets: AtomicU64,
    pub udp_sessions: AtomicU64,
    pub rejected: AtomicU64,
    pub dropped: AtomicU64,
}

impl TunnelStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tcp(&self) {
        self.tcp_flows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp_packet(&self) {
        self.udp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp_session(&self) {
        self.udp_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Flow abandoned on a preprocess, dispatch or dial failure.
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> TunnelStatsSnapshot {
        TunnelStatsSnapshot {
            tcp_flows: self.tcp_flows.swap(0, Ordering::Relaxed),
            udp_packets: self.udp_packets.swap(0, Ordering::Relaxed),
            udp_sessions: self.udp_sessions.swap(0, Ordering::Relaxed),
            rejected: self.rejected.swap(0, Ordering::Relaxed),
            dropped: self.dropped.swap(0, Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStatsSnapshot {
    pub tcp_flows: u64,
    pub udp_packets: u64,
    pub udp_sessions: u64,
    pub rejected: u64,
    pub dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_snapshot_resets_and_averages() {
        let stats = DnsStats::new();
        stats.record_hit(false);
        stats.record_hit(true);
        stats.record_miss();
        stats.record_upstream(2.0, true);
        stats.record_upstream(4.0, false);

        let snap = stats.snapshot_and_reset();
        assert_eq!(snap.requests, 3);
        assert_eq!(snap.cache_hits, 2);
        assert_eq!(snap.stale_hits, 1);
        assert_eq!(snap.failures, 1);
        assert!((snap.avg_upstream_ms - 3.0).abs() < 1e-6);

        assert_eq!(stats.snapshot_and_reset().requests, 0);
    }

    #[test]
    fn tunnel_counters() {
        let stats = TunnelStats::new();
        stats.record_tcp();
        stats.record_udp_packet();
        stats.record_udp_packet();
        stats.record_dropped();

        let snap = stats.snapshot_and_reset();
        assert_eq!(snap.tcp_flows, 1);
        assert_eq!(snap.udp_packets, 2);
        assert_eq!(snap.dropped, 1);
    }
}
