//! Snapshots and their assembly across storage engines.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Map, Value};
use tally_core::{MetricId, MetricType, MetricValue};

use crate::storage::{lock, PingStore, StorageEngine};

/// Immutable point-in-time view of every value destined for one ping,
/// grouped by metric type and keyed by identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    ping: String,
    metrics: BTreeMap<MetricType, BTreeMap<MetricId, MetricValue>>,
}

impl Snapshot {
    fn new(ping: &str) -> Self {
        Self {
            ping: ping.to_string(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn ping(&self) -> &str {
        &self.ping
    }

    pub fn get(&self, metric_type: MetricType, category: &str, name: &str) -> Option<&MetricValue> {
        let id = MetricId {
            category: category.to_string(),
            name: name.to_string(),
        };
        self.metrics.get(&metric_type)?.get(&id)
    }

    /// Every entry, ordered by type then identifier.
    pub fn entries(&self) -> impl Iterator<Item = (MetricType, &MetricId, &MetricValue)> {
        self.metrics
            .iter()
            .flat_map(|(t, values)| values.iter().map(move |(id, v)| (*t, id, v)))
    }

    pub fn len(&self) -> usize {
        self.metrics.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload document: `{"<type>": {"<category>.<name>": value}}`.
    pub fn to_json(&self) -> Value {
        let mut doc = Map::new();
        for (metric_type, values) in &self.metrics {
            let group: Map<String, Value> = values
                .iter()
                .map(|(id, v)| (id.full_name(), v.as_json()))
                .collect();
            doc.insert(metric_type.to_string(), Value::Object(group));
        }
        Value::Object(doc)
    }
}

/// Build the snapshot for `ping` from `engines`.
///
/// Every contributing store is locked (engines in the given order, which
/// callers keep fixed) before anything is read. Values are read from all of
/// them first; only then, and only when `clear` is set, are the
/// `Ping`-lifetime entries dropped. A caller therefore sees either the whole
/// snapshot with its clearing or nothing, and no `record` can land between
/// the read and the clear.
pub(crate) fn assemble(ping: &str, engines: &[&StorageEngine], clear: bool) -> Option<Snapshot> {
    let stores: Vec<(&StorageEngine, Arc<Mutex<PingStore>>)> = engines
        .iter()
        .filter_map(|engine| engine.ping_store(ping).map(|store| (*engine, store)))
        .collect();
    let mut guards: Vec<(&StorageEngine, MutexGuard<'_, PingStore>)> = stores
        .iter()
        .map(|(engine, store)| (*engine, lock(store)))
        .collect();

    let mut snapshot = Snapshot::new(ping);
    for (engine, guard) in &guards {
        let values = guard.values();
        if !values.is_empty() {
            snapshot
                .metrics
                .entry(engine.metric_type())
                .or_default()
                .extend(values);
        }
    }

    if clear {
        for (engine, guard) in &mut guards {
            engine.clear_collected(ping, guard);
        }
    }

    (!snapshot.is_empty()).then_some(snapshot)
}
