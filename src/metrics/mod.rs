// SPDX-License-Identifier: MIT
//! In-process counters, gauges, and latency histograms.
//!
//! All values are plain atomics incremented inline — no external metrics
//! library. Rendered in Prometheus text format by `GET /metrics` on the
//! health endpoint. Failures to record are impossible by construction;
//! nothing here can abort the operation being measured.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Fixed histogram buckets for request latency, in milliseconds.
const LATENCY_BUCKETS_MS: [u64; 8] = [5, 10, 25, 50, 100, 250, 1000, 5000];

/// Latency histogram with fixed buckets plus sum/count.
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; 8],
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    pub fn observe_ms(&self, ms: u64) {
        for (i, bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
            if ms <= *bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn render(&self, name: &str, out: &mut String) {
        use std::fmt::Write as _;
        for (i, bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
            let _ = writeln!(
                out,
                "{name}_bucket{{le=\"{bound}\"}} {}",
                self.buckets[i].load(Ordering::Relaxed)
            );
        }
        let count = self.count.load(Ordering::Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let _ = writeln!(
            out,
            "{name}_sum {}",
            self.sum_ms.load(Ordering::Relaxed)
        );
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Gateway-wide performance counters shared across all connections and tasks.
#[derive(Debug)]
pub struct GatewayMetrics {
    /// Total client connections accepted since start.
    pub connections_total: AtomicU64,
    /// Currently open client connections.
    pub connections_active: AtomicI64,
    /// Total control-plane messages dispatched.
    pub messages_total: AtomicU64,
    /// Messages rejected by the per-connection rate limiter.
    pub rate_limited_total: AtomicU64,
    /// Total agents spawned.
    pub agents_spawned_total: AtomicU64,
    /// Currently live agents.
    pub agents_live: AtomicI64,
    /// Total provider requests routed.
    pub provider_requests_total: AtomicU64,
    /// Provider requests that ended in failure after retry/failover.
    pub provider_failures_total: AtomicU64,
    /// Failover hops taken.
    pub provider_failovers_total: AtomicU64,
    /// Memories saved.
    pub memories_saved_total: AtomicU64,
    /// Bus events fanned out to clients.
    pub events_broadcast_total: AtomicU64,
    /// Provider round-trip latency.
    pub provider_latency: LatencyHistogram,
    /// Control-plane request handling latency.
    pub request_latency: LatencyHistogram,
    pub started_at: Instant,
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicI64::new(0),
            messages_total: AtomicU64::new(0),
            rate_limited_total: AtomicU64::new(0),
            agents_spawned_total: AtomicU64::new(0),
            agents_live: AtomicI64::new(0),
            provider_requests_total: AtomicU64::new(0),
            provider_failures_total: AtomicU64::new(0),
            provider_failovers_total: AtomicU64::new(0),
            memories_saved_total: AtomicU64::new(0),
            events_broadcast_total: AtomicU64::new(0),
            provider_latency: LatencyHistogram::default(),
            request_latency: LatencyHistogram::default(),
            started_at: Instant::now(),
        }
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render every metric in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::with_capacity(2048);

        let counters: [(&str, &AtomicU64); 9] = [
            ("agentd_connections_total", &self.connections_total),
            ("agentd_messages_total", &self.messages_total),
            ("agentd_rate_limited_total", &self.rate_limited_total),
            ("agentd_agents_spawned_total", &self.agents_spawned_total),
            ("agentd_provider_requests_total", &self.provider_requests_total),
            ("agentd_provider_failures_total", &self.provider_failures_total),
            ("agentd_provider_failovers_total", &self.provider_failovers_total),
            ("agentd_memories_saved_total", &self.memories_saved_total),
            ("agentd_events_broadcast_total", &self.events_broadcast_total),
        ];
        for (name, v) in counters {
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {}", v.load(Ordering::Relaxed));
        }

        let gauges: [(&str, &AtomicI64); 2] = [
            ("agentd_connections_active", &self.connections_active),
            ("agentd_agents_live", &self.agents_live),
        ];
        for (name, v) in gauges {
            let _ = writeln!(out, "# TYPE {name} gauge");
            let _ = writeln!(out, "{name} {}", v.load(Ordering::Relaxed));
        }

        let _ = writeln!(out, "# TYPE agentd_uptime_seconds gauge");
        let _ = writeln!(
            out,
            "agentd_uptime_seconds {}",
            self.started_at.elapsed().as_secs()
        );

        let _ = writeln!(out, "# TYPE agentd_provider_latency_ms histogram");
        self.provider_latency.render("agentd_provider_latency_ms", &mut out);
        let _ = writeln!(out, "# TYPE agentd_request_latency_ms histogram");
        self.request_latency.render("agentd_request_latency_ms", &mut out);

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_counters_and_gauges() {
        let m = GatewayMetrics::new();
        m.connections_total.fetch_add(3, Ordering::Relaxed);
        m.agents_live.store(2, Ordering::Relaxed);
        let text = m.render_prometheus();
        assert!(text.contains("agentd_connections_total 3"));
        assert!(text.contains("agentd_agents_live 2"));
        assert!(text.contains("# TYPE agentd_connections_total counter"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let m = GatewayMetrics::new();
        m.provider_latency.observe_ms(7);
        m.provider_latency.observe_ms(40);
        let text = m.render_prometheus();
        // 7ms lands in le=10 and everything above; 40ms in le=50 and above.
        assert!(text.contains("agentd_provider_latency_ms_bucket{le=\"10\"} 1"));
        assert!(text.contains("agentd_provider_latency_ms_bucket{le=\"50\"} 2"));
        assert!(text.contains("agentd_provider_latency_ms_bucket{le=\"+Inf\"} 2"));
        assert!(text.contains("agentd_provider_latency_ms_count 2"));
    }
}
