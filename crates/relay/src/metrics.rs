use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Relay-side flow metrics.
#[derive(Debug, Default, Clone)]
pub struct RelayMetrics {
    pub flows_opened: Counter,
    pub flows_refused: Counter,
    pub flows_active: Gauge,
    pub bytes_in: Counter,
    pub bytes_out: Counter,
    pub origin_dial_failures: Counter,
}

impl RelayMetrics {
    pub fn new(registry: &mut Registry) -> RelayMetrics {
        let metrics = RelayMetrics::default();
        registry.register("relay_flows_opened", "Flows accepted by the relay", metrics.flows_opened.clone());
        registry.register("relay_flows_refused", "Flows refused at the connection cap", metrics.flows_refused.clone());
        registry.register("relay_flows_active", "Currently live flows", metrics.flows_active.clone());
        registry.register("relay_bytes_in", "Bytes copied origin to client", metrics.bytes_in.clone());
        registry.register("relay_bytes_out", "Bytes copied client to origin", metrics.bytes_out.clone());
        registry.register("relay_origin_dial_failures", "Origin dials that failed or timed out", metrics.origin_dial_failures.clone());
        metrics
    }
}
