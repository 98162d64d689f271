use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct ReconcileMetrics {
    outcomes: Family<OutcomeLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    kind: String,
    result: String,
}

impl ReconcileMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let outcomes = Family::default();
        prom.register(
            "outcomes",
            "Count of workload reconciles by kind and result",
            outcomes.clone(),
        );
        Self { outcomes }
    }

    pub(crate) fn record(&self, kind: &str, result: &str) {
        self.outcomes
            .get_or_create(&OutcomeLabels {
                kind: kind.to_string(),
                result: result.to_string(),
            })
            .inc();
    }

    #[cfg(test)]
    pub(crate) fn count(&self, kind: &str, result: &str) -> u64 {
        self.outcomes
            .get_or_create(&OutcomeLabels {
                kind: kind.to_string(),
                result: result.to_string(),
            })
            .get()
    }
}
