//! Metrics collection for the Anima runtime.
//!
//! A process-wide [`MetricsRegistry`] holds named counters, gauges and
//! latency histograms. Snapshots serialize to JSON for the file exporter and
//! render to Prometheus text for the introspection surface.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub mod file;

/// Default latency bucket upper bounds, in seconds.
const LATENCY_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// A fixed-bucket latency histogram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Histogram {
    /// Upper bounds of each bucket, in seconds, ascending.
    pub buckets: Vec<f64>,
    /// Observation counts per bucket; one extra slot for +Inf.
    pub counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: LATENCY_BUCKETS.to_vec(),
            counts: vec![0; LATENCY_BUCKETS.len() + 1],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        let idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.buckets.len());
        self.counts[idx] += 1;
        self.sum += value;
        self.count += 1;
    }
}

/// Point-in-time snapshot of all metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Unix timestamp (seconds) when the snapshot was taken.
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub histograms: BTreeMap<String, Histogram>,
}

/// Process-wide metrics registry. Cheap to clone via `Arc`.
pub struct MetricsRegistry {
    started: Instant,
    counters: RwLock<BTreeMap<String, u64>>,
    gauges: RwLock<BTreeMap<String, f64>>,
    histograms: RwLock<BTreeMap<String, Histogram>>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            counters: RwLock::new(BTreeMap::new()),
            gauges: RwLock::new(BTreeMap::new()),
            histograms: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Increment a counter by `by`.
    pub fn incr(&self, name: &str, by: u64) {
        *self.counters.write().entry(name.to_string()).or_insert(0) += by;
    }

    /// Read a counter (0 if never incremented).
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.read().get(name).copied().unwrap_or(0)
    }

    /// Set a gauge to an absolute value.
    pub fn set_gauge(&self, name: &str, value: f64) {
        self.gauges.write().insert(name.to_string(), value);
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.read().get(name).copied()
    }

    /// Record a latency observation, in seconds.
    pub fn observe(&self, name: &str, seconds: f64) {
        self.histograms
            .write()
            .entry(name.to_string())
            .or_insert_with(Histogram::new)
            .observe(seconds);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: chrono::Utc::now().timestamp().max(0) as u64,
            uptime_seconds: self.uptime_seconds(),
            counters: self.counters.read().clone(),
            gauges: self.gauges.read().clone(),
            histograms: self.histograms.read().clone(),
        }
    }

    /// Render the current state in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();
        for (name, value) in &snapshot.counters {
            let name = sanitize(name);
            out.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
        }
        for (name, value) in &snapshot.gauges {
            let name = sanitize(name);
            out.push_str(&format!("# TYPE {name} gauge\n{name} {value}\n"));
        }
        for (name, hist) in &snapshot.histograms {
            let name = sanitize(name);
            out.push_str(&format!("# TYPE {name} histogram\n"));
            let mut cumulative = 0u64;
            for (bound, count) in hist.buckets.iter().zip(hist.counts.iter()) {
                cumulative += count;
                out.push_str(&format!("{name}_bucket{{le=\"{bound}\"}} {cumulative}\n"));
            }
            cumulative += hist.counts.last().copied().unwrap_or(0);
            out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {cumulative}\n"));
            out.push_str(&format!("{name}_sum {}\n", hist.sum));
            out.push_str(&format!("{name}_count {}\n", hist.count));
        }
        out.push_str(&format!(
            "# TYPE anima_uptime_seconds gauge\nanima_uptime_seconds {}\n",
            snapshot.uptime_seconds
        ));
        out
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = MetricsRegistry::new();
        m.incr("llm.chat.ok", 1);
        m.incr("llm.chat.ok", 2);
        assert_eq!(m.counter("llm.chat.ok"), 3);
        assert_eq!(m.counter("llm.chat.err"), 0);
    }

    #[test]
    fn gauges_overwrite() {
        let m = MetricsRegistry::new();
        m.set_gauge("scheduler.tick", 5.0);
        m.set_gauge("scheduler.tick", 7.0);
        assert_eq!(m.gauge("scheduler.tick"), Some(7.0));
    }

    #[test]
    fn histogram_buckets_observations() {
        let m = MetricsRegistry::new();
        m.observe("llm.chat.latency", 0.07); // second bucket (<= 0.1)
        m.observe("llm.chat.latency", 120.0); // overflow bucket
        let snapshot = m.snapshot();
        let hist = &snapshot.histograms["llm.chat.latency"];
        assert_eq!(hist.count, 2);
        assert_eq!(hist.counts[1], 1);
        assert_eq!(*hist.counts.last().unwrap(), 1);
        assert!((hist.sum - 120.07).abs() < 1e-9);
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let m = MetricsRegistry::new();
        m.incr("events.published", 4);
        m.observe("tick.duration", 0.3);
        let json = serde_json::to_string(&m.snapshot()).unwrap();
        let back: MetricsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.counters["events.published"], 4);
        assert_eq!(back.histograms["tick.duration"].count, 1);
    }

    #[test]
    fn prometheus_rendering_contains_series() {
        let m = MetricsRegistry::new();
        m.incr("llm.calls.total", 2);
        m.set_gauge("bus.queue.depth", 3.0);
        m.observe("llm.chat.latency", 0.2);
        let text = m.render_prometheus();
        assert!(text.contains("llm_calls_total 2"));
        assert!(text.contains("bus_queue_depth 3"));
        assert!(text.contains("llm_chat_latency_bucket{le=\"0.25\"} 1"));
        assert!(text.contains("llm_chat_latency_count 1"));
        assert!(text.contains("anima_uptime_seconds"));
    }

    #[test]
    fn histogram_cumulative_buckets_are_monotonic() {
        let m = MetricsRegistry::new();
        for v in [0.01, 0.2, 0.9, 4.0, 50.0] {
            m.observe("lat", v);
        }
        let text = m.render_prometheus();
        assert!(text.contains("lat_bucket{le=\"+Inf\"} 5"));
    }
}
