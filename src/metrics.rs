use prometheus::{IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};

/// Controller metric family. The registry is handed to the bootstrap's
/// exposition endpoint; everything else increments through these handles.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub updates: IntCounter,
    pub reloads: IntCounter,
    pub aws_errors: IntCounterVec,
    pub aws_retries: IntCounterVec,
    pub aws_requests: IntCounterVec,
    pub cache: IntCounterVec,
    pub managed_ingresses: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let updates = IntCounter::with_opts(Opts::new(
            "albingress_updates",
            "Ingress status updates written",
        ))
        .expect("metric opts");
        let reloads = IntCounter::with_opts(Opts::new(
            "albingress_reloads",
            "Reconcile cycles that mutated AWS state",
        ))
        .expect("metric opts");
        let aws_errors = IntCounterVec::new(
            Opts::new("albingress_aws_errors", "AWS API errors"),
            &["service", "operation"],
        )
        .expect("metric opts");
        let aws_retries = IntCounterVec::new(
            Opts::new("albingress_aws_retries", "AWS API calls retried"),
            &["service", "operation"],
        )
        .expect("metric opts");
        let aws_requests = IntCounterVec::new(
            Opts::new("albingress_aws_requests", "AWS API requests issued"),
            &["service", "operation"],
        )
        .expect("metric opts");
        let cache = IntCounterVec::new(
            Opts::new("albingress_cache", "Describe cache lookups"),
            &["cache", "action"],
        )
        .expect("metric opts");
        let managed_ingresses = IntGaugeVec::new(
            Opts::new("albingress_managed_ingresses", "Ingresses under management"),
            &["namespace"],
        )
        .expect("metric opts");

        for collector in [
            Box::new(updates.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(reloads.clone()),
            Box::new(aws_errors.clone()),
            Box::new(aws_retries.clone()),
            Box::new(aws_requests.clone()),
            Box::new(cache.clone()),
            Box::new(managed_ingresses.clone()),
        ] {
            registry.register(collector).expect("metric registration");
        }

        Metrics {
            registry,
            updates,
            reloads,
            aws_errors,
            aws_retries,
            aws_requests,
            cache,
            managed_ingresses,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn aws_request(&self, service: &str, operation: &str) {
        self.aws_requests
            .with_label_values(&[service, operation])
            .inc();
    }

    pub fn aws_error(&self, service: &str, operation: &str) {
        self.aws_errors
            .with_label_values(&[service, operation])
            .inc();
    }

    pub fn aws_retry(&self, service: &str, operation: &str) {
        self.aws_retries
            .with_label_values(&[service, operation])
            .inc();
    }

    pub fn cache_hit(&self, cache: &str) {
        self.cache.with_label_values(&[cache, "hit"]).inc();
    }

    pub fn cache_miss(&self, cache: &str) {
        self.cache.with_label_values(&[cache, "miss"]).inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_register_and_increment() {
        let metrics = Metrics::new();
        metrics.aws_request("elbv2", "DescribeLoadBalancers");
        metrics.aws_request("elbv2", "DescribeLoadBalancers");
        metrics.cache_hit("subnets");
        metrics.cache_miss("subnets");

        let families = metrics.registry().gather();
        let requests = families
            .iter()
            .find(|f| f.get_name() == "albingress_aws_requests")
            .unwrap();
        assert_eq!(requests.get_metric()[0].get_counter().get_value() as u64, 2);
        let cache = families
            .iter()
            .find(|f| f.get_name() == "albingress_cache")
            .unwrap();
        assert_eq!(cache.get_metric().len(), 2);
    }
}
