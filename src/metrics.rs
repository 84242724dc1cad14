//! Metrics sink: publishes pipeline and lottery counters through
//! `prometheus`, matching the rest of this crate's ambient-stack crates.

use std::sync::Arc;

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

/// A place to publish counters and histograms; `NoopSink` in tests,
/// `PrometheusSink` in production.
pub trait MetricsSink: Send + Sync {
    fn publish_counter(&self, name: &str, labels: &[(&str, &str)], value: u64);
    fn publish_histogram(&self, name: &str, value: f64);
}

/// Discards everything. Used when a caller doesn't want metrics overhead
/// (unit tests, `betanetd --no-metrics`-style embedding).
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn publish_counter(&self, _name: &str, _labels: &[(&str, &str)], _value: u64) {}
    fn publish_histogram(&self, _name: &str, _value: f64) {}
}

/// Prometheus-backed sink. Counters are created lazily per metric name on
/// first use and registered against a process-wide registry so `render()`
/// can serve them from a `/metrics` endpoint.
pub struct PrometheusSink {
    registry: Registry,
    counters: std::sync::Mutex<std::collections::HashMap<String, IntCounterVec>>,
}

impl PrometheusSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: REGISTRY.clone(),
            counters: std::sync::Mutex::new(std::collections::HashMap::new()),
        })
    }

    /// Render all registered metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer).ok();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl MetricsSink for PrometheusSink {
    fn publish_counter(&self, name: &str, labels: &[(&str, &str)], value: u64) {
        let label_names: Vec<&str> = labels.iter().map(|(k, _)| *k).collect();
        let label_values: Vec<&str> = labels.iter().map(|(_, v)| *v).collect();

        let mut counters = self.counters.lock().unwrap();
        let counter = counters.entry(name.to_string()).or_insert_with(|| {
            let opts = Opts::new(name, format!("betanet_mixcore counter: {name}"));
            let vec = IntCounterVec::new(opts, &label_names)
                .expect("static metric name/labels are valid");
            self.registry
                .register(Box::new(vec.clone()))
                .expect("metric not already registered under this name");
            vec
        });

        if let Ok(metric) = counter.get_metric_with_label_values(&label_values) {
            metric.inc_by(value);
        }
    }

    fn publish_histogram(&self, _name: &str, _value: f64) {
        // Histograms need per-name bucket configuration this sink doesn't
        // carry yet; counters cover today's dashboards.
    }
}
