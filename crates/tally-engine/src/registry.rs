//! Ping store registry: which metric types contribute to which ping.

use std::collections::{BTreeMap, BTreeSet};

use tally_core::{MetricRegistry, MetricType};

/// Static mapping from ping name to the storage engines that may hold data
/// for it. Built once from the metric registry.
#[derive(Debug, Clone)]
pub struct PingRegistry {
    pings: BTreeMap<String, BTreeSet<MetricType>>,
}

impl PingRegistry {
    pub fn from_metrics(registry: &MetricRegistry) -> Self {
        // Error counters may be sent in any known ping.
        let mut pings: BTreeMap<String, BTreeSet<MetricType>> = registry
            .pings()
            .map(|ping| (ping.to_string(), BTreeSet::from([MetricType::Counter])))
            .collect();
        for meta in registry.metrics() {
            for ping in &meta.send_in_pings {
                pings
                    .entry(ping.clone())
                    .or_default()
                    .insert(meta.metric_type);
            }
        }
        Self { pings }
    }

    pub fn is_known(&self, ping: &str) -> bool {
        self.pings.contains_key(ping)
    }

    /// Metric types that may contribute to `ping`, in a fixed order.
    pub fn contributors(&self, ping: &str) -> Option<&BTreeSet<MetricType>> {
        self.pings.get(ping)
    }

    pub fn pings(&self) -> impl Iterator<Item = &str> {
        self.pings.keys().map(String::as_str)
    }
}
