use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct IndexMetrics {
    pub(crate) hosts: Gauge,
    pub(crate) drift: Counter,
}

impl IndexMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let hosts = Gauge::default();
        prom.register(
            "hosts",
            "Gauge of the number of hosts with an owner",
            hosts.clone(),
        );

        let drift = Counter::default();
        prom.register(
            "drift",
            "Count of watched host claims that conflicted with an existing owner",
            drift.clone(),
        );

        Self { hosts, drift }
    }
}
