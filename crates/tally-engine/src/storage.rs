//! Storage engine: in-memory values of one metric type, per ping.
//!
//! Each ping has its own `Mutex`-guarded store, so collecting one ping never
//! waits on recording into another. A `record` call that targets several
//! pings locks their stores in name order and updates all of them before
//! releasing any, which keeps a multi-ping write atomic with respect to
//! collection. Durable writes are handed to the state writer while the
//! store lock is still held, so the on-disk order matches the in-memory
//! order.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tally_core::{Lifetime, Limits, MetricId, MetricType, MetricValue};
use tally_state::{RecordKey, StoredRecord, WriteOp, WriterHandle};
use tracing::{debug, trace};

use crate::error::RecordError;

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq)]
struct StoredEntry {
    lifetime: Lifetime,
    value: MetricValue,
}

/// Values of one metric type destined for one ping.
#[derive(Debug, Default)]
pub(crate) struct PingStore {
    entries: BTreeMap<MetricId, StoredEntry>,
}

impl PingStore {
    pub(crate) fn values(&self) -> Vec<(MetricId, MetricValue)> {
        self.entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.value.clone()))
            .collect()
    }

    fn remove_lifetime(&mut self, lifetime: Lifetime) -> Vec<MetricId> {
        let removed: Vec<MetricId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.lifetime == lifetime)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &removed {
            self.entries.remove(id);
        }
        removed
    }
}

/// Outcome of a successful `record`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The value was merged into every target ping. `truncated` reports
    /// shortened strings; `dropped` counts list items rejected at a cap
    /// (the largest count over the target pings).
    Recorded { truncated: bool, dropped: usize },
    /// The metric is disabled or uploading is off; nothing was stored.
    Skipped,
}

impl RecordOutcome {
    pub fn overflowed(&self) -> bool {
        matches!(self, RecordOutcome::Recorded { truncated, dropped } if *truncated || *dropped > 0)
    }
}

/// Storage for every metric of one [`MetricType`].
pub struct StorageEngine {
    metric_type: MetricType,
    limits: Limits,
    pings: RwLock<HashMap<String, Arc<Mutex<PingStore>>>>,
    writer: Option<WriterHandle>,
    persist_ping_lifetime: bool,
}

impl StorageEngine {
    pub fn new(
        metric_type: MetricType,
        limits: Limits,
        writer: Option<WriterHandle>,
        persist_ping_lifetime: bool,
    ) -> Self {
        Self {
            metric_type,
            limits,
            pings: RwLock::new(HashMap::new()),
            writer,
            persist_ping_lifetime,
        }
    }

    /// An engine with no durable backing.
    pub fn in_memory(metric_type: MetricType, limits: Limits) -> Self {
        Self::new(metric_type, limits, None, false)
    }

    pub fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    pub(crate) fn ping_store(&self, ping: &str) -> Option<Arc<Mutex<PingStore>>> {
        self.pings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(ping)
            .cloned()
    }

    fn ping_store_or_create(&self, ping: &str) -> Arc<Mutex<PingStore>> {
        if let Some(store) = self.ping_store(ping) {
            return store;
        }
        let mut pings = self.pings.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(pings.entry(ping.to_string()).or_default())
    }

    fn all_ping_stores(&self) -> Vec<(String, Arc<Mutex<PingStore>>)> {
        let pings = self.pings.read().unwrap_or_else(PoisonError::into_inner);
        let mut stores: Vec<_> = pings
            .iter()
            .map(|(ping, store)| (ping.clone(), Arc::clone(store)))
            .collect();
        stores.sort_by(|a, b| a.0.cmp(&b.0));
        stores
    }

    fn persists(&self, lifetime: Lifetime) -> Option<&WriterHandle> {
        match lifetime {
            Lifetime::Ping if !self.persist_ping_lifetime => None,
            _ => self.writer.as_ref(),
        }
    }

    fn persist_put(&self, ping: &str, id: &MetricId, lifetime: Lifetime, value: &MetricValue) {
        if let Some(writer) = self.persists(lifetime) {
            writer.submit(WriteOp::Put(StoredRecord {
                lifetime,
                metric_type: self.metric_type,
                ping: ping.to_string(),
                id: id.clone(),
                value: value.clone(),
            }));
        }
    }

    fn persist_delete(&self, ping: &str, id: MetricId, lifetime: Lifetime) {
        if let Some(writer) = self.persists(lifetime) {
            writer.submit(WriteOp::Delete(RecordKey {
                lifetime,
                metric_type: self.metric_type,
                ping: ping.to_string(),
                id,
            }));
        }
    }

    /// Merge `value` into the stored value of `category.name` in every ping
    /// of `pings`, creating it where absent.
    ///
    /// All validation happens before the first write: on error nothing is
    /// stored in any ping.
    pub fn record(
        &self,
        pings: &[String],
        category: &str,
        name: &str,
        lifetime: Lifetime,
        value: MetricValue,
    ) -> Result<RecordOutcome, RecordError> {
        let id = MetricId::new(category, name)?;
        if value.metric_type() != self.metric_type {
            return Err(RecordError::TypeMismatch {
                full_name: id.full_name(),
                expected: self.metric_type,
                found: value.metric_type(),
            });
        }
        let targets: BTreeSet<&str> = pings.iter().map(String::as_str).collect();
        if targets.is_empty() {
            return Err(RecordError::EmptyPingSet(id.full_name()));
        }
        let sanitized = value.sanitize(&self.limits)?;

        let stores: Vec<(&str, Arc<Mutex<PingStore>>)> = targets
            .iter()
            .map(|ping| (*ping, self.ping_store_or_create(ping)))
            .collect();
        // Name order keeps concurrent multi-ping writers deadlock-free.
        let mut guards: Vec<(&str, MutexGuard<'_, PingStore>)> = stores
            .iter()
            .map(|(ping, store)| (*ping, lock(store)))
            .collect();

        let mut merged = Vec::with_capacity(guards.len());
        for (_, guard) in &guards {
            let current = guard.entries.get(&id);
            if let Some(entry) = current {
                if entry.lifetime != lifetime {
                    return Err(RecordError::LifetimeMismatch {
                        full_name: id.full_name(),
                        stored: entry.lifetime,
                        requested: lifetime,
                    });
                }
            }
            let m = MetricValue::merge(
                current.map(|entry| &entry.value),
                sanitized.value.clone(),
                &self.limits,
            )?;
            merged.push(m);
        }

        let mut dropped = 0;
        for ((ping, guard), m) in guards.iter_mut().zip(merged) {
            dropped = dropped.max(m.dropped);
            self.persist_put(ping, &id, lifetime, &m.value);
            guard.entries.insert(
                id.clone(),
                StoredEntry {
                    lifetime,
                    value: m.value,
                },
            );
        }
        trace!(metric_type = %self.metric_type, metric = %id, ?targets, "recorded");

        Ok(RecordOutcome::Recorded {
            truncated: sanitized.truncated,
            dropped,
        })
    }

    /// Every stored entry for `ping`. `Ping`-lifetime entries are removed
    /// in the same critical section.
    pub fn collect(&self, ping: &str) -> Vec<(MetricId, MetricValue)> {
        match self.ping_store(ping) {
            Some(store) => {
                let mut guard = lock(&store);
                let values = guard.values();
                self.clear_collected(ping, &mut guard);
                values
            }
            None => Vec::new(),
        }
    }

    /// Every stored entry for `ping`, without clearing anything.
    pub fn peek(&self, ping: &str) -> Vec<(MetricId, MetricValue)> {
        self.ping_store(ping)
            .map(|store| lock(&store).values())
            .unwrap_or_default()
    }

    /// Drop the `Ping`-lifetime entries of a store that was just read.
    pub(crate) fn clear_collected(&self, ping: &str, store: &mut PingStore) {
        let removed = store.remove_lifetime(Lifetime::Ping);
        if !removed.is_empty() {
            debug!(metric_type = %self.metric_type, %ping, cleared = removed.len(), "ping lifetime cleared");
        }
        for id in removed {
            self.persist_delete(ping, id, Lifetime::Ping);
        }
    }

    /// Current value of one metric in one ping.
    pub fn value(&self, ping: &str, id: &MetricId) -> Option<MetricValue> {
        let store = self.ping_store(ping)?;
        let guard = lock(&store);
        guard.entries.get(id).map(|entry| entry.value.clone())
    }

    /// Remove one metric from every ping, in memory and on disk.
    pub fn clear(&self, id: &MetricId) {
        for (ping, store) in self.all_ping_stores() {
            let mut guard = lock(&store);
            if let Some(entry) = guard.entries.remove(id) {
                self.persist_delete(&ping, id.clone(), entry.lifetime);
            }
        }
    }

    /// Remove every metric of this type, regardless of lifetime.
    pub fn clear_all(&self) {
        for (ping, store) in self.all_ping_stores() {
            let mut guard = lock(&store);
            for (id, entry) in std::mem::take(&mut guard.entries) {
                self.persist_delete(&ping, id, entry.lifetime);
            }
        }
    }

    /// Remove every metric of one lifetime.
    pub fn clear_lifetime(&self, lifetime: Lifetime) {
        for (ping, store) in self.all_ping_stores() {
            let mut guard = lock(&store);
            for id in guard.remove_lifetime(lifetime) {
                self.persist_delete(&ping, id, lifetime);
            }
        }
    }

    /// Reinstate a value loaded from durable state. Does not write back.
    pub(crate) fn restore(&self, record: StoredRecord) {
        let store = self.ping_store_or_create(&record.ping);
        let mut guard = lock(&store);
        guard.entries.insert(
            record.id,
            StoredEntry {
                lifetime: record.lifetime,
                value: record.value,
            },
        );
    }
}
