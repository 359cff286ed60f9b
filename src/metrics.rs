//! Process metrics (SPEC_FULL.md §15).
//!
//! No file in this crate's retrieved corpus instantiates the `prometheus`
//! crate directly, so this registry is built from the crate's own published
//! API rather than adapted from an example — the counters/gauges tracked are
//! exactly the ones named in SPEC_FULL.md's ambient-metrics section and the
//! `MetricsSnapshot` shape in `management.rs`.

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntGauge, Registry};

pub struct Metrics {
    pub registry: Registry,
    pub active_pairs: IntGauge,
    pub sessions_admitted_total: IntCounter,
    pub sessions_denied_total: IntCounter,
    pub routing_evaluations_total: IntCounter,
    pub media_relay_healthy_instances: IntGauge,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();
        let active_pairs = IntGauge::new("b2bua_active_pairs", "Currently active B2BUA pairs").expect("metric names are static and valid");
        let sessions_admitted_total =
            IntCounter::new("b2bua_sessions_admitted_total", "Sessions admitted by the session tracker").expect("metric names are static and valid");
        let sessions_denied_total =
            IntCounter::new("b2bua_sessions_denied_total", "Sessions denied by the session tracker").expect("metric names are static and valid");
        let routing_evaluations_total =
            IntCounter::new("b2bua_routing_evaluations_total", "Routing rule evaluations performed").expect("metric names are static and valid");
        let media_relay_healthy_instances =
            IntGauge::new("b2bua_media_relay_healthy_instances", "Healthy media-relay instances").expect("metric names are static and valid");

        for collector in [
            Box::new(active_pairs.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(sessions_admitted_total.clone()),
            Box::new(sessions_denied_total.clone()),
            Box::new(routing_evaluations_total.clone()),
            Box::new(media_relay_healthy_instances.clone()),
        ] {
            registry.register(collector).expect("each collector is registered exactly once");
        }

        Self { registry, active_pairs, sessions_admitted_total, sessions_denied_total, routing_evaluations_total, media_relay_healthy_instances }
    }

    pub fn gather_text(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        let _ = encoder.encode(&self.registry.gather(), &mut buffer);
        String::from_utf8_lossy(&buffer).to_string()
    }
}

pub static METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_and_counters_are_mutable_and_gathered() {
        METRICS.active_pairs.set(3);
        METRICS.sessions_admitted_total.inc();
        let text = METRICS.gather_text();
        assert!(text.contains("b2bua_active_pairs"));
        assert!(text.contains("b2bua_sessions_admitted_total"));
    }
}
