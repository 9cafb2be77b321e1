//! StateStore: redb-backed persistence for recorded metric values.
//!
//! Provides load/put/delete/wipe over the three lifetime tables. All values
//! are JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends; the in-memory backend is used for
//! tests and as the fallback when the data file cannot be opened.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{
    Database, DatabaseError, ReadableDatabase, ReadableTable, StorageBackend, WriteTransaction,
};
use tally_core::Lifetime;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Map a backend error into the `StateError` variant of the given name.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    ephemeral: bool,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            ephemeral: false,
        };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let store = Self::with_backend(redb::backends::InMemoryBackend::new(), true)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Open a store over any redb storage backend. `ephemeral` records
    /// whether anything written survives the process.
    pub fn with_backend(backend: impl StorageBackend, ephemeral: bool) -> StateResult<Self> {
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            ephemeral,
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Open the store at `path`, recovering from anything short of a failure
    /// to allocate an in-memory store.
    ///
    /// A missing file (first run) is created. A file that cannot be opened
    /// as a database is moved aside to `<path>.corrupt` and replaced by a
    /// fresh one. If the directory is unusable, or the file is held open by
    /// another store, the store runs in memory for this process.
    pub fn open_or_recover(path: &Path) -> StateResult<Self> {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(?path, error = %e, "cannot create data directory, using in-memory state");
                return Self::open_in_memory();
            }
        }

        match Database::create(path) {
            Ok(db) => {
                let store = Self {
                    db: Arc::new(db),
                    ephemeral: false,
                };
                match store.ensure_tables() {
                    Ok(()) => {
                        debug!(?path, "state store opened");
                        return Ok(store);
                    }
                    Err(e) => {
                        warn!(?path, error = %e, "state store tables unusable, using in-memory state");
                        return Self::open_in_memory();
                    }
                }
            }
            Err(DatabaseError::DatabaseAlreadyOpen) => {
                warn!(?path, "state store already open elsewhere, using in-memory state");
                return Self::open_in_memory();
            }
            Err(e) => {
                warn!(?path, error = %e, "state store unreadable, starting with empty state");
            }
        }

        let aside = corrupt_path(path);
        if let Err(e) = std::fs::rename(path, &aside) {
            warn!(?path, error = %e, "cannot move unreadable state store aside, using in-memory state");
            return Self::open_in_memory();
        }
        match Self::open(path) {
            Ok(store) => {
                warn!(?aside, "unreadable state store preserved for inspection");
                Ok(store)
            }
            Err(e) => {
                warn!(?path, error = %e, "cannot recreate state store, using in-memory state");
                Self::open_in_memory()
            }
        }
    }

    /// True when nothing written to this store survives the process.
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for lifetime in Lifetime::ALL {
            txn.open_table(table_for(lifetime)).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert or replace a record.
    pub fn put(&self, record: &StoredRecord) -> StateResult<()> {
        self.apply(std::slice::from_ref(&WriteOp::Put(record.clone())))
    }

    /// Fetch one record.
    pub fn get(&self, key: &RecordKey) -> StateResult<Option<StoredRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn
            .open_table(table_for(key.lifetime))
            .map_err(map_err!(Table))?;
        match table.get(key.table_key().as_str()).map_err(map_err!(Storage))? {
            Some(guard) => Ok(decode(guard.value())),
            None => Ok(None),
        }
    }

    /// Delete one record. Returns true if it existed.
    pub fn delete(&self, key: &RecordKey) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn
                .open_table(table_for(key.lifetime))
                .map_err(map_err!(Table))?;
            existed = table
                .remove(key.table_key().as_str())
                .map_err(map_err!(Storage))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Every decodable record of one scope. Undecodable records are skipped
    /// with a warning.
    pub fn load_scope(&self, lifetime: Lifetime) -> StateResult<Vec<StoredRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn
            .open_table(table_for(lifetime))
            .map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Storage))? {
            let (key, value) = entry.map_err(map_err!(Storage))?;
            match decode(value.value()) {
                Some(record) if record.lifetime == lifetime => results.push(record),
                _ => warn!(
                    key = %key.value().replace('\u{1f}', "/"),
                    %lifetime,
                    "skipping undecodable stored record"
                ),
            }
        }
        Ok(results)
    }

    /// Full durable state, all scopes.
    pub fn load(&self) -> StateResult<Vec<StoredRecord>> {
        let mut results = Vec::new();
        for lifetime in Lifetime::ALL {
            results.extend(self.load_scope(lifetime)?);
        }
        debug!(records = results.len(), "durable state loaded");
        Ok(results)
    }

    /// Remove every record of one scope. Returns the number removed.
    pub fn wipe(&self, lifetime: Lifetime) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = wipe_in(&txn, lifetime)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%lifetime, count, "scope wiped");
        Ok(count)
    }

    /// Remove every record of every scope.
    pub fn wipe_all(&self) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut count = 0;
        for lifetime in Lifetime::ALL {
            count += wipe_in(&txn, lifetime)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count, "all scopes wiped");
        Ok(count)
    }

    /// Apply a batch of operations in one transaction, in order. Either all
    /// of them become durable or none do.
    pub fn apply(&self, ops: &[WriteOp]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for op in ops {
            match op {
                WriteOp::Put(record) => {
                    let value = serde_json::to_vec(record).map_err(map_err!(Encode))?;
                    let key = record.key().table_key();
                    let mut table = txn
                        .open_table(table_for(record.lifetime))
                        .map_err(map_err!(Table))?;
                    table
                        .insert(key.as_str(), value.as_slice())
                        .map_err(map_err!(Storage))?;
                }
                WriteOp::Delete(key) => {
                    let mut table = txn
                        .open_table(table_for(key.lifetime))
                        .map_err(map_err!(Table))?;
                    table
                        .remove(key.table_key().as_str())
                        .map_err(map_err!(Storage))?;
                }
                WriteOp::Wipe(lifetime) => {
                    wipe_in(&txn, *lifetime)?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

fn wipe_in(txn: &WriteTransaction, lifetime: Lifetime) -> StateResult<u32> {
    let mut table = txn
        .open_table(table_for(lifetime))
        .map_err(map_err!(Table))?;
    // Collect keys first; the table cannot be mutated while iterating.
    let mut keys = Vec::new();
    for entry in table.iter().map_err(map_err!(Storage))? {
        let (key, _) = entry.map_err(map_err!(Storage))?;
        keys.push(key.value().to_string());
    }
    for key in &keys {
        table.remove(key.as_str()).map_err(map_err!(Storage))?;
    }
    Ok(keys.len() as u32)
}

fn decode(bytes: &[u8]) -> Option<StoredRecord> {
    serde_json::from_slice::<StoredRecord>(bytes)
        .ok()
        .filter(StoredRecord::is_consistent)
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".corrupt");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tally_core::{MetricId, MetricType, MetricValue};

    fn record(lifetime: Lifetime, ping: &str, name: &str, value: MetricValue) -> StoredRecord {
        StoredRecord {
            lifetime,
            metric_type: value.metric_type(),
            ping: ping.to_string(),
            id: MetricId::new("app", name).unwrap(),
            value,
        }
    }

    #[test]
    fn put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let rec = record(Lifetime::User, "metrics", "launches", MetricValue::Counter(3));

        store.put(&rec).unwrap();
        assert_eq!(store.get(&rec.key()).unwrap(), Some(rec));
    }

    #[test]
    fn get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        let rec = record(Lifetime::Ping, "metrics", "nope", MetricValue::Boolean(true));
        assert!(store.get(&rec.key()).unwrap().is_none());
    }

    #[test]
    fn put_replaces_existing() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put(&record(Lifetime::Ping, "metrics", "launches", MetricValue::Counter(1)))
            .unwrap();
        let latest = record(Lifetime::Ping, "metrics", "launches", MetricValue::Counter(2));
        store.put(&latest).unwrap();

        let all = store.load_scope(Lifetime::Ping).unwrap();
        assert_eq!(all, vec![latest]);
    }

    #[test]
    fn same_id_in_different_pings_and_types_is_distinct() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put(&record(Lifetime::Ping, "metrics", "x", MetricValue::Counter(1)))
            .unwrap();
        store
            .put(&record(Lifetime::Ping, "baseline", "x", MetricValue::Counter(1)))
            .unwrap();
        store
            .put(&record(Lifetime::Ping, "metrics", "x", MetricValue::Boolean(false)))
            .unwrap();
        assert_eq!(store.load_scope(Lifetime::Ping).unwrap().len(), 3);
    }

    #[test]
    fn delete_single() {
        let store = StateStore::open_in_memory().unwrap();
        let rec = record(Lifetime::User, "metrics", "flag", MetricValue::Boolean(true));
        store.put(&rec).unwrap();

        assert!(store.delete(&rec.key()).unwrap());
        assert!(!store.delete(&rec.key()).unwrap());
        assert!(store.get(&rec.key()).unwrap().is_none());
    }

    #[test]
    fn wipe_scope_leaves_others() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put(&record(Lifetime::Ping, "metrics", "a", MetricValue::Counter(1)))
            .unwrap();
        store
            .put(&record(Lifetime::Application, "metrics", "b", MetricValue::Counter(1)))
            .unwrap();
        store
            .put(&record(Lifetime::User, "metrics", "c", MetricValue::Counter(1)))
            .unwrap();

        assert_eq!(store.wipe(Lifetime::Application).unwrap(), 1);
        assert!(store.load_scope(Lifetime::Application).unwrap().is_empty());
        assert_eq!(store.load().unwrap().len(), 2);

        assert_eq!(store.wipe_all().unwrap(), 2);
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn apply_runs_ops_in_order() {
        let store = StateStore::open_in_memory().unwrap();
        let first = record(Lifetime::User, "metrics", "a", MetricValue::Counter(1));
        let second = record(Lifetime::User, "metrics", "b", MetricValue::Counter(2));
        store
            .apply(&[
                WriteOp::Put(first.clone()),
                WriteOp::Wipe(Lifetime::User),
                WriteOp::Put(second.clone()),
                WriteOp::Put(first.clone()),
                WriteOp::Delete(first.key()),
            ])
            .unwrap();
        assert_eq!(store.load().unwrap(), vec![second]);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("state.redb");
        let set = MetricValue::StringSet(BTreeSet::from(["a".to_string(), "b".to_string()]));

        {
            let store = StateStore::open(&db_path).unwrap();
            store
                .put(&record(Lifetime::User, "metrics", "flags", set.clone()))
                .unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].metric_type, MetricType::StringSet);
        assert_eq!(loaded[0].value, set);
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("state.redb");

        let store = StateStore::open_or_recover(&db_path).unwrap();
        assert!(!store.is_ephemeral());
        assert!(store.load().unwrap().is_empty());
        assert!(db_path.exists());
    }

    #[test]
    fn corrupt_file_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("state.redb");
        std::fs::write(&db_path, b"definitely not a redb file, just some garbage bytes").unwrap();

        let store = StateStore::open_or_recover(&db_path).unwrap();
        assert!(!store.is_ephemeral());
        assert!(store.load().unwrap().is_empty());
        let aside = dir.path().join("state.redb.corrupt");
        assert_eq!(
            std::fs::read(&aside).unwrap(),
            b"definitely not a redb file, just some garbage bytes"
        );

        // The fresh store is usable.
        store
            .put(&record(Lifetime::User, "metrics", "a", MetricValue::Counter(1)))
            .unwrap();
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn file_held_open_elsewhere_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("state.redb");
        let holder = StateStore::open(&db_path).unwrap();
        holder
            .put(&record(Lifetime::User, "metrics", "kept", MetricValue::Counter(1)))
            .unwrap();

        let store = StateStore::open_or_recover(&db_path).unwrap();
        assert!(store.is_ephemeral());
        assert!(store.load().unwrap().is_empty());
        assert!(!corrupt_path(&db_path).exists());

        // The held file is left alone.
        assert_eq!(holder.load().unwrap().len(), 1);
    }

    #[test]
    fn unusable_directory_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_dir = dir.path().join("plain-file");
        std::fs::write(&not_a_dir, b"x").unwrap();

        let store = StateStore::open_or_recover(&not_a_dir.join("state.redb")).unwrap();
        assert!(store.is_ephemeral());
        store
            .put(&record(Lifetime::User, "metrics", "a", MetricValue::Counter(1)))
            .unwrap();
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.is_ephemeral());
        assert!(store.load().unwrap().is_empty());
        assert_eq!(store.wipe(Lifetime::User).unwrap(), 0);
        assert_eq!(store.wipe_all().unwrap(), 0);
        store.apply(&[]).unwrap();
    }
}
