//! Tally: the entry point tying storage engines, the ping registry, and the
//! state writer together.
//!
//! ```text
//! Tally
//!   ├── record(meta, value)      ← metric facades, gated, never fails
//!   ├── record_raw(pings, ..)    ← raw path, returns RecordError
//!   ├── collect(ping) → Snapshot ← uploader, clears Ping lifetime
//!   ├── wipe_all()               ← user data deletion
//!   └── shutdown()               ← flushes durable writes
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tally_core::{
    CommonMetricData, ErrorType, Lifetime, MetricId, MetricRegistry, MetricType, MetricValue,
    TallyConfig, ERROR_CATEGORY,
};
use tally_state::{StateStore, StateWriter, StoredRecord, WriteOp, STORE_FILE_NAME};
use tracing::{debug, info, warn};

use crate::error::RecordError;
use crate::error_metrics::{error_metric_name, error_pings, is_reportable};
use crate::registry::PingRegistry;
use crate::snapshot::{assemble, Snapshot};
use crate::storage::{RecordOutcome, StorageEngine};

/// The metrics storage engine.
///
/// `Tally` is `Send + Sync`; share it behind an `Arc` and record from any
/// thread.
pub struct Tally {
    config: TallyConfig,
    registry: MetricRegistry,
    pings: PingRegistry,
    engines: BTreeMap<MetricType, StorageEngine>,
    writer: Option<StateWriter>,
    durable: bool,
    upload_enabled: AtomicBool,
}

impl Tally {
    /// Start the engine: open durable state under `config.data_dir` (if
    /// any), load it, and build one storage engine per metric type.
    ///
    /// Never fails. Storage problems are logged and the affected data is
    /// kept in memory only.
    pub fn init(config: TallyConfig, registry: MetricRegistry) -> Self {
        let limits = config.limits();
        let pings = PingRegistry::from_metrics(&registry);
        let (writer, restored, durable) = match &config.data_dir {
            Some(dir) => open_durable(&config, dir),
            None => (None, Vec::new(), false),
        };

        let handle = writer.as_ref().map(StateWriter::handle);
        let engines = MetricType::ALL
            .into_iter()
            .map(|t| {
                let engine =
                    StorageEngine::new(t, limits, handle.clone(), config.persist_ping_lifetime);
                (t, engine)
            })
            .collect();

        let upload_enabled = AtomicBool::new(config.upload_enabled);
        let tally = Self {
            config,
            registry,
            pings,
            engines,
            writer,
            durable,
            upload_enabled,
        };
        tally.restore(restored);
        if !tally.is_upload_enabled() {
            tally.wipe_all();
        }

        info!(
            metrics = tally.registry.len(),
            pings = tally.pings.pings().count(),
            durable = tally.durable,
            "tally initialized"
        );
        tally
    }

    /// An engine with no durable backing.
    pub fn in_memory(registry: MetricRegistry) -> Self {
        Self::init(TallyConfig::in_memory(), registry)
    }

    pub fn config(&self) -> &TallyConfig {
        &self.config
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    pub fn ping_registry(&self) -> &PingRegistry {
        &self.pings
    }

    /// Storage engine for one metric type.
    pub fn engine(&self, metric_type: MetricType) -> &StorageEngine {
        // Every type gets an engine in `init`.
        &self.engines[&metric_type]
    }

    fn restore(&self, records: Vec<StoredRecord>) {
        let mut restored = 0usize;
        for record in records {
            let contributes = self
                .pings
                .contributors(&record.ping)
                .is_some_and(|types| types.contains(&record.metric_type));
            if contributes {
                self.engine(record.metric_type).restore(record);
                restored += 1;
            } else {
                debug!(
                    ping = %record.ping,
                    metric_type = %record.metric_type,
                    metric = %record.id,
                    "stored value no longer registered, leaving it on disk"
                );
            }
        }
        if restored > 0 {
            info!(restored, "durable metric values restored");
        }
    }

    // ── Gating ─────────────────────────────────────────────────────

    pub fn is_upload_enabled(&self) -> bool {
        self.upload_enabled.load(Ordering::SeqCst)
    }

    /// Turn uploading on or off. Turning it off deletes all stored data.
    pub fn set_upload_enabled(&self, enabled: bool) {
        let was = self.upload_enabled.swap(enabled, Ordering::SeqCst);
        if was && !enabled {
            self.wipe_all();
        }
        if was != enabled {
            info!(enabled, "upload state changed");
        }
    }

    /// Whether a metric should record right now.
    pub fn should_record(&self, meta: &CommonMetricData) -> bool {
        !meta.disabled && self.is_upload_enabled()
    }

    // ── Recording ──────────────────────────────────────────────────

    /// Record `value` for a registered metric.
    ///
    /// Gated by [`should_record`](Self::should_record). Problems are logged
    /// and counted in the error-metric channel; the write is dropped.
    pub fn record(&self, meta: &CommonMetricData, value: MetricValue) {
        if !self.should_record(meta) {
            return;
        }
        if value.metric_type() != meta.metric_type {
            let err = RecordError::TypeMismatch {
                full_name: meta.full_name(),
                expected: meta.metric_type,
                found: value.metric_type(),
            };
            self.report(meta, &err);
            return;
        }
        // Destinations come from the registry, not the caller's copy.
        let pings = match self.registry.get(meta.metric_type, &meta.category, &meta.name) {
            Some(registered) => registered.send_in_pings.clone(),
            None => meta.pings(),
        };
        match self.record_raw(&pings, &meta.category, &meta.name, value) {
            Ok(outcome) if outcome.overflowed() => {
                debug!(metric = %meta.full_name(), ?outcome, "value truncated at limit");
                self.record_error(meta, ErrorType::InvalidOverflow);
            }
            Ok(_) => {}
            Err(err) => self.report(meta, &err),
        }
    }

    /// Record by identifier. The metric type is the value's type; lifetime
    /// and disabled flag come from the registry.
    ///
    /// Every ping in `pings` must be one the metric is registered to send
    /// in; anything else is `UnknownPing`.
    ///
    /// Returns `Skipped` for disabled metrics or when uploading is off.
    pub fn record_raw(
        &self,
        pings: &[String],
        category: &str,
        name: &str,
        value: MetricValue,
    ) -> Result<RecordOutcome, RecordError> {
        let id = MetricId::new(category, name)?;
        let metric_type = value.metric_type();
        let Some(meta) = self.registry.get(metric_type, category, name) else {
            return Err(self.unregistered(metric_type, &id));
        };
        if !self.should_record(meta) {
            return Ok(RecordOutcome::Skipped);
        }
        if let Some(unknown) = pings.iter().find(|ping| !meta.send_in_pings.contains(ping)) {
            return Err(RecordError::UnknownPing(unknown.clone()));
        }
        self.engine(metric_type)
            .record(pings, category, name, meta.lifetime, value)
    }

    fn unregistered(&self, found: MetricType, id: &MetricId) -> RecordError {
        let registered_as = MetricType::ALL
            .into_iter()
            .find(|t| self.registry.get(*t, &id.category, &id.name).is_some());
        match registered_as {
            Some(expected) => RecordError::TypeMismatch {
                full_name: id.full_name(),
                expected,
                found,
            },
            None => RecordError::UnknownMetric {
                metric_type: found,
                full_name: id.full_name(),
            },
        }
    }

    fn report(&self, meta: &CommonMetricData, err: &RecordError) {
        warn!(metric = %meta.full_name(), error = %err, "dropping metric write");
        self.record_error(meta, err.error_type());
    }

    fn record_error(&self, meta: &CommonMetricData, error_type: ErrorType) {
        if !is_reportable(meta) {
            debug!(metric = %meta.full_name(), %error_type, "not counting error about an error metric");
            return;
        }
        if !self.is_upload_enabled() {
            return;
        }
        let pings = error_pings(meta, &self.pings);
        let name = error_metric_name(error_type, meta);
        let result = self.engine(MetricType::Counter).record(
            &pings,
            ERROR_CATEGORY,
            &name,
            Lifetime::Ping,
            MetricValue::Counter(1),
        );
        if let Err(e) = result {
            warn!(error = %e, metric = %name, "failed to count metric error");
        }
    }

    /// Number of `error_type` problems counted for `meta` in `ping` since
    /// the ping was last collected.
    pub fn recorded_errors(&self, meta: &CommonMetricData, error_type: ErrorType, ping: &str) -> i64 {
        let id = MetricId {
            category: ERROR_CATEGORY.to_string(),
            name: error_metric_name(error_type, meta),
        };
        match self.engine(MetricType::Counter).value(ping, &id) {
            Some(MetricValue::Counter(n)) => n,
            _ => 0,
        }
    }

    // ── Collection ─────────────────────────────────────────────────

    /// Snapshot everything destined for `ping` and clear its `Ping`-lifetime
    /// values. `None` when the ping holds no data or is unknown.
    pub fn collect(&self, ping: &str) -> Option<Snapshot> {
        self.snapshot(ping, true)
    }

    /// Like [`collect`](Self::collect) but clears nothing.
    pub fn peek(&self, ping: &str) -> Option<Snapshot> {
        self.snapshot(ping, false)
    }

    fn snapshot(&self, ping: &str, clear: bool) -> Option<Snapshot> {
        let Some(types) = self.pings.contributors(ping) else {
            warn!(%ping, "snapshot requested for unknown ping");
            return None;
        };
        let engines: Vec<&StorageEngine> = types.iter().map(|t| self.engine(*t)).collect();
        let snapshot = assemble(ping, &engines, clear);
        debug!(
            %ping,
            clear,
            metrics = snapshot.as_ref().map_or(0, Snapshot::len),
            "snapshot assembled"
        );
        snapshot
    }

    /// Current value of one metric in one ping.
    pub fn value(&self, meta: &CommonMetricData, ping: &str) -> Option<MetricValue> {
        let id = meta.id().ok()?;
        self.engine(meta.metric_type).value(ping, &id)
    }

    // ── Clearing ───────────────────────────────────────────────────

    /// Remove one metric from every ping, whatever its lifetime.
    pub fn clear_metric(&self, meta: &CommonMetricData) {
        if let Ok(id) = meta.id() {
            self.engine(meta.metric_type).clear(&id);
        }
    }

    /// Remove every value of one lifetime, in memory and on disk.
    ///
    /// The scope wipe is queued before memory is cleared, so a concurrent
    /// record lands on disk after it.
    pub fn clear_lifetime(&self, lifetime: Lifetime) {
        if let Some(writer) = &self.writer {
            writer.submit(WriteOp::Wipe(lifetime));
        }
        for engine in self.engines.values() {
            engine.clear_lifetime(lifetime);
        }
        info!(%lifetime, "lifetime cleared");
    }

    /// Delete all stored data, in memory and on disk.
    pub fn wipe_all(&self) {
        if let Some(writer) = &self.writer {
            for lifetime in Lifetime::ALL {
                writer.submit(WriteOp::Wipe(lifetime));
            }
        }
        for engine in self.engines.values() {
            engine.clear_all();
        }
        info!("all metric data wiped");
    }

    // ── Persistence ────────────────────────────────────────────────

    /// Wait until every durable write queued so far is applied.
    pub fn flush(&self) -> bool {
        self.writer.as_ref().is_none_or(StateWriter::flush)
    }

    /// Flush queued durable writes and stop the writer. Values recorded
    /// afterwards are kept in memory only.
    pub fn shutdown(&self) {
        if let Some(writer) = &self.writer {
            writer.shutdown();
        }
        info!("tally shut down");
    }

    /// Whether `lifetime` data that should reach disk is being kept in
    /// memory only (the store could not be opened, or writes failed).
    pub fn is_persistence_degraded(&self, lifetime: Lifetime) -> bool {
        if self.config.data_dir.is_none() {
            return false;
        }
        match &self.writer {
            Some(writer) => !self.durable || writer.is_degraded(lifetime),
            None => true,
        }
    }
}

fn open_durable(
    config: &TallyConfig,
    dir: &Path,
) -> (Option<StateWriter>, Vec<StoredRecord>, bool) {
    let path = dir.join(STORE_FILE_NAME);
    let store = match StateStore::open_or_recover(&path) {
        Ok(store) => store,
        Err(e) => {
            warn!(?path, error = %e, "no state store available, metrics kept in memory only");
            return (None, Vec::new(), false);
        }
    };

    if config.clear_application_lifetime_on_init {
        if let Err(e) = store.wipe(Lifetime::Application) {
            warn!(error = %e, "failed to clear application lifetime state");
        }
    }
    let records = store.load().unwrap_or_else(|e| {
        warn!(error = %e, "failed to load durable state, starting empty");
        Vec::new()
    });
    // Ping rows left by a run that persisted them are reported once, then
    // dropped, since collection will not delete them from disk.
    if !config.persist_ping_lifetime {
        if let Err(e) = store.wipe(Lifetime::Ping) {
            warn!(error = %e, "failed to clear stale ping lifetime state");
        }
    }
    let durable = !store.is_ephemeral();

    match StateWriter::spawn(store, &config.writer) {
        Ok(writer) => (Some(writer), records, durable),
        Err(e) => {
            warn!(error = %e, "state writer unavailable, metrics kept in memory only");
            (None, records, false)
        }
    }
}
