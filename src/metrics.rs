#![forbid(unsafe_code)]

// Server metrics - lock-free counters and a Prometheus latency histogram

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

const PREFIX: &str = "sfu_signaling";

/// Histogram buckets: upper bound in microseconds, Prometheus `le` label
const BUCKETS: [(u64, &str); 10] = [
    (1_000, "0.001"),
    (5_000, "0.005"),
    (10_000, "0.01"),
    (25_000, "0.025"),
    (50_000, "0.05"),
    (100_000, "0.1"),
    (250_000, "0.25"),
    (500_000, "0.5"),
    (1_000_000, "1"),
    (5_000_000, "5"),
];

/// Cumulative histogram with fixed buckets
struct Histogram {
    buckets: [AtomicU64; BUCKETS.len()],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    fn observe(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (counter, (bound, _)) in self.buckets.iter().zip(BUCKETS) {
            if us <= bound {
                counter.fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (counter, (_, label)) in self.buckets.iter().zip(BUCKETS) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {}", counter.load(Relaxed));
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub messages_received_total: u64,
    pub messages_sent_total: u64,
    pub errors_total: u64,
    pub rooms_created_total: u64,
    pub peers_created_total: u64,
    pub joins_total: u64,
    pub cleanups_total: u64,
    pub producers_created_total: u64,
    pub consumers_created_total: u64,
}

/// Server-wide metrics, cheap to clone
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    connections_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    errors_total: AtomicU64,
    rooms_created_total: AtomicU64,
    peers_created_total: AtomicU64,
    joins_total: AtomicU64,
    cleanups_total: AtomicU64,
    producers_created_total: AtomicU64,
    consumers_created_total: AtomicU64,

    connections_active: AtomicU64,

    request_handling: Histogram,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections_total: AtomicU64::new(0),
                messages_received_total: AtomicU64::new(0),
                messages_sent_total: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
                rooms_created_total: AtomicU64::new(0),
                peers_created_total: AtomicU64::new(0),
                joins_total: AtomicU64::new(0),
                cleanups_total: AtomicU64::new(0),
                producers_created_total: AtomicU64::new(0),
                consumers_created_total: AtomicU64::new(0),
                connections_active: AtomicU64::new(0),
                request_handling: Histogram::new(),
            }),
        }
    }

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_received(&self) {
        self.inner.messages_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_sent(&self) {
        self.inner.messages_sent_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_created(&self) {
        self.inner.rooms_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_peers_created(&self) {
        self.inner.peers_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_cleanups(&self) {
        self.inner.cleanups_total.fetch_add(1, Relaxed);
    }

    pub fn inc_producers_created(&self) {
        self.inner.producers_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_consumers_created(&self) {
        self.inner.consumers_created_total.fetch_add(1, Relaxed);
    }

    /// Increments `connections_active`; the returned guard decrements it on drop
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn observe_request_handling(&self, duration: Duration) {
        self.inner.request_handling.observe(duration);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let i = &self.inner;
        MetricsSnapshot {
            connections_total: i.connections_total.load(Relaxed),
            connections_active: i.connections_active.load(Relaxed),
            messages_received_total: i.messages_received_total.load(Relaxed),
            messages_sent_total: i.messages_sent_total.load(Relaxed),
            errors_total: i.errors_total.load(Relaxed),
            rooms_created_total: i.rooms_created_total.load(Relaxed),
            peers_created_total: i.peers_created_total.load(Relaxed),
            joins_total: i.joins_total.load(Relaxed),
            cleanups_total: i.cleanups_total.load(Relaxed),
            producers_created_total: i.producers_created_total.load(Relaxed),
            consumers_created_total: i.consumers_created_total.load(Relaxed),
        }
    }

    /// Render all metrics in Prometheus text exposition format.
    /// Room and peer gauges are computed on demand by the caller.
    pub fn render_prometheus(&self, rooms_active: usize, peers_active: usize) -> String {
        let mut out = String::with_capacity(4096);
        let s = self.snapshot();

        let counters = [
            ("connections_total", "Total WebSocket connections", s.connections_total),
            ("messages_received_total", "Total frames received from clients", s.messages_received_total),
            ("messages_sent_total", "Total frames sent to clients", s.messages_sent_total),
            ("errors_total", "Total failed requests", s.errors_total),
            ("rooms_created_total", "Total rooms created", s.rooms_created_total),
            ("peers_created_total", "Total peers created", s.peers_created_total),
            ("joins_total", "Total room joins", s.joins_total),
            ("cleanups_total", "Total peers torn down after disconnect or hang-up", s.cleanups_total),
            ("producers_created_total", "Total producers created", s.producers_created_total),
            ("consumers_created_total", "Total consumers created", s.consumers_created_total),
        ];
        for (name, help, value) in counters {
            render_metric(&mut out, name, "counter", help, value);
        }

        render_metric(&mut out, "connections_active", "gauge", "Currently open WebSocket connections", s.connections_active);
        render_metric(&mut out, "rooms_active", "gauge", "Rooms currently held in memory", rooms_active as u64);
        render_metric(&mut out, "peers_active", "gauge", "Peers currently held in memory", peers_active as u64);

        self.inner.request_handling.render(
            &format!("{PREFIX}_request_handling_seconds"),
            "Request handling latency in seconds",
            &mut out,
        );

        out
    }
}

/// Decrements `connections_active` on drop, so the gauge stays right even
/// when a connection task panics
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_metric(out: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {PREFIX}_{name} {help}");
    let _ = writeln!(out, "# TYPE {PREFIX}_{name} {kind}");
    let _ = writeln!(out, "{PREFIX}_{name} {value}");
}
