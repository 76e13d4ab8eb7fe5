//! Snapshot stores backing the two collector shapes.
//!
//! [`EntityStore`] holds a keyed snapshot map that is swapped wholesale each
//! scrape. Metrics for a key are registered on its first observation and read
//! the live map through a supplier closure, so the registered-meter
//! population only changes with genuine entity churn. Collectors over
//! high-churn entities enable deletion cleanup, which unregisters a key's
//! meters once it leaves the snapshot.
//!
//! [`SnapshotCell`] is the degenerate single-snapshot variant for aggregate
//! collectors.

use crate::metrics::{Supplier, SupplierGauge, supplier};
use anyhow::Result;
use prometheus::Registry;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};
use tracing::{debug, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("entity store lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

fn read_lock<T>(rw: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match rw.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Keyed snapshot map plus the registration bookkeeping for its meters.
pub struct EntityStore<K, V> {
    entities: Arc<RwLock<HashMap<K, V>>>,
    registered: Mutex<HashSet<K>>,
    /// Removal handles per key; maintained only with deletion cleanup on.
    meters: Mutex<HashMap<K, Vec<SupplierGauge>>>,
    remove_deleted: bool,
}

impl<K, V> EntityStore<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    #[must_use]
    pub fn new(remove_deleted: bool) -> Self {
        Self {
            entities: Arc::new(RwLock::new(HashMap::new())),
            registered: Mutex::new(HashSet::new()),
            meters: Mutex::new(HashMap::new()),
            remove_deleted,
        }
    }

    /// Apply a freshly collected snapshot: unregister meters of deleted keys
    /// (when cleanup is on), swap the map, then register meters for keys seen
    /// for the first time.
    ///
    /// `register` is invoked once per new key and returns the meters it
    /// registered, which become the removal handles.
    ///
    /// # Errors
    ///
    /// Returns an error when `register` fails for a new key; previously
    /// registered keys are unaffected.
    pub fn apply<F>(
        &self,
        registry: &Registry,
        new_entities: HashMap<K, V>,
        register: F,
    ) -> Result<()>
    where
        F: Fn(&Registry, &K) -> Result<Vec<SupplierGauge>>,
    {
        self.apply_scoped(registry, new_entities, |_| true, register)
    }

    /// Like [`apply`](Self::apply), but only the keys matching `in_scope` are
    /// replaced. Per-database collectors pass a predicate on the key's
    /// database component so one database's collection leaves the other
    /// databases' snapshots in place.
    ///
    /// # Errors
    ///
    /// Returns an error when `register` fails for a new key.
    pub fn apply_scoped<S, F>(
        &self,
        registry: &Registry,
        new_entities: HashMap<K, V>,
        in_scope: S,
        register: F,
    ) -> Result<()>
    where
        S: Fn(&K) -> bool,
        F: Fn(&Registry, &K) -> Result<Vec<SupplierGauge>>,
    {
        // 1. Deletion cleanup against the previous snapshot.
        if self.remove_deleted {
            let stale: Vec<K> = read_lock(&self.entities)
                .keys()
                .filter(|&k| in_scope(k) && !new_entities.contains_key(k))
                .cloned()
                .collect();

            for key in stale {
                let handles = lock(&self.meters).remove(&key).unwrap_or_default();
                for handle in handles {
                    // One stuck meter must not keep the others registered.
                    if let Err(e) = handle.unregister(registry) {
                        warn!(key = ?key, error = %e, "failed to unregister meter");
                    }
                }
                lock(&self.registered).remove(&key);
                debug!(key = ?key, "removed metrics for deleted entity");
            }
        }

        let new_keys: Vec<K> = new_entities.keys().cloned().collect();

        // 2. Swap the snapshot; suppliers observe old or new, never a mix.
        {
            let mut current = match self.entities.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            current.retain(|k, _| !in_scope(k));
            current.extend(new_entities);
        }

        // 3. Register meters for keys observed for the first time.
        for key in new_keys {
            if lock(&self.registered).contains(&key) {
                continue;
            }
            let handles = register(registry, &key)?;
            lock(&self.registered).insert(key.clone());
            if self.remove_deleted {
                lock(&self.meters).insert(key, handles);
            }
        }

        Ok(())
    }

    /// Supplier reading one value out of the entity under `key`.
    ///
    /// Reads NaN once the key's snapshot has vanished (possible mid-read or
    /// for collectors without deletion cleanup).
    pub fn value_supplier<F>(&self, key: K, read: F) -> Supplier
    where
        F: Fn(&V) -> f64 + Send + Sync + 'static,
    {
        self.value_supplier_or(key, f64::NAN, read)
    }

    /// Supplier with an explicit absence value, for metrics where a missing
    /// entity legitimately reads as zero (counts).
    pub fn value_supplier_or<F>(&self, key: K, missing: f64, read: F) -> Supplier
    where
        F: Fn(&V) -> f64 + Send + Sync + 'static,
    {
        let entities = Arc::clone(&self.entities);
        supplier(move || read_lock(&entities).get(&key).map_or(missing, &read))
    }

    /// Supplier computing a rollup over the whole snapshot (totals, skew).
    pub fn aggregate_supplier<F>(&self, fold: F) -> Supplier
    where
        F: Fn(&HashMap<K, V>) -> f64 + Send + Sync + 'static,
    {
        let entities = Arc::clone(&self.entities);
        supplier(move || fold(&read_lock(&entities)))
    }

    /// Run `f` against the current snapshot.
    pub fn with_snapshot<R>(&self, f: impl FnOnce(&HashMap<K, V>) -> R) -> R {
        f(&read_lock(&self.entities))
    }
}

/// Atomic single-value snapshot for aggregate collectors.
///
/// `store` replaces the snapshot whole; suppliers read NaN until the first
/// store, and keep reading the previous snapshot when a scrape yields
/// nothing.
pub struct SnapshotCell<T> {
    inner: Arc<RwLock<Option<T>>>,
}

impl<T> Clone for SnapshotCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for SnapshotCell<T>
where
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SnapshotCell<T>
where
    T: Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
        }
    }

    pub fn store(&self, value: T) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(value);
    }

    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        read_lock(&self.inner).as_ref().map(f)
    }

    /// Supplier reading one field of the snapshot; NaN before the first store.
    pub fn value_supplier<F>(&self, read: F) -> Supplier
    where
        F: Fn(&T) -> f64 + Send + Sync + 'static,
    {
        self.value_supplier_or(f64::NAN, read)
    }

    pub fn value_supplier_or<F>(&self, missing: f64, read: F) -> Supplier
    where
        F: Fn(&T) -> f64 + Send + Sync + 'static,
    {
        let inner = Arc::clone(&self.inner);
        supplier(move || read_lock(&inner).as_ref().map_or(missing, &read))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp, clippy::cast_precision_loss)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry_names(registry: &Registry) -> Vec<String> {
        registry
            .gather()
            .iter()
            .map(|mf| mf.name().to_string())
            .collect()
    }

    fn label_values(registry: &Registry, family: &str, label: &str) -> Vec<String> {
        registry
            .gather()
            .iter()
            .filter(|mf| mf.name() == family)
            .flat_map(|mf| {
                mf.get_metric()
                    .iter()
                    .flat_map(|m| {
                        m.get_label()
                            .iter()
                            .filter(|l| l.name() == label)
                            .map(|l| l.value().to_string())
                            .collect::<Vec<_>>()
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn register_size_gauge(
        store: &EntityStore<String, i64>,
        registry: &Registry,
        key: &String,
    ) -> Result<Vec<SupplierGauge>> {
        let gauge = SupplierGauge::new(
            "test_entity_value",
            "help",
            &[("key", key.clone())],
            store.value_supplier(key.clone(), |v| *v as f64),
        )?
        .register(registry)?;
        Ok(vec![gauge])
    }

    #[test]
    fn test_registration_happens_once_per_key() {
        let registry = Registry::new();
        let store: EntityStore<String, i64> = EntityStore::new(false);
        let calls = AtomicUsize::new(0);

        for round in 0..3 {
            let snapshot: HashMap<String, i64> =
                [("a".to_string(), round), ("b".to_string(), round)].into();
            store
                .apply(&registry, snapshot, |registry, key| {
                    calls.fetch_add(1, Ordering::Relaxed);
                    register_size_gauge(&store, registry, key)
                })
                .unwrap();
        }

        // Two keys, three scrapes: registration ran exactly twice.
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_supplier_tracks_latest_snapshot() {
        let registry = Registry::new();
        let store: EntityStore<String, i64> = EntityStore::new(false);

        store
            .apply(&registry, [("a".to_string(), 10)].into(), |r, k| {
                register_size_gauge(&store, r, k)
            })
            .unwrap();

        let reader = store.value_supplier("a".to_string(), |v| *v as f64);
        assert_eq!(reader(), 10.0);

        store
            .apply(&registry, [("a".to_string(), 25)].into(), |r, k| {
                register_size_gauge(&store, r, k)
            })
            .unwrap();
        assert_eq!(reader(), 25.0);
    }

    #[test]
    fn test_vanished_key_reads_nan_without_cleanup() {
        let registry = Registry::new();
        let store: EntityStore<String, i64> = EntityStore::new(false);

        store
            .apply(&registry, [("a".to_string(), 1)].into(), |r, k| {
                register_size_gauge(&store, r, k)
            })
            .unwrap();
        store
            .apply(&registry, [("b".to_string(), 2)].into(), |r, k| {
                register_size_gauge(&store, r, k)
            })
            .unwrap();

        let gone = store.value_supplier("a".to_string(), |v| *v as f64);
        assert!(gone().is_nan());

        // Without cleanup, the meter for "a" is still registered.
        let keys = label_values(&registry, "test_entity_value", "key");
        assert!(keys.contains(&"a".to_string()));
        assert!(keys.contains(&"b".to_string()));
    }

    #[test]
    fn test_cleanup_unregisters_deleted_entities() {
        let registry = Registry::new();
        let store: EntityStore<String, i64> = EntityStore::new(true);

        let snapshot: HashMap<String, i64> =
            [("a.100.gpadmin".to_string(), 1), ("a.101.gpadmin".to_string(), 2)].into();
        store
            .apply(&registry, snapshot, |r, k| register_size_gauge(&store, r, k))
            .unwrap();

        store
            .apply(&registry, [("a.102.gpadmin".to_string(), 3)].into(), |r, k| {
                register_size_gauge(&store, r, k)
            })
            .unwrap();

        let keys = label_values(&registry, "test_entity_value", "key");
        assert_eq!(keys, vec!["a.102.gpadmin".to_string()]);
    }

    #[test]
    fn test_cleanup_reregisters_a_returning_key() {
        let registry = Registry::new();
        let store: EntityStore<String, i64> = EntityStore::new(true);

        let reg = |r: &Registry, k: &String| register_size_gauge(&store, r, k);

        store.apply(&registry, [("a".to_string(), 1)].into(), reg).unwrap();
        store.apply(&registry, [("b".to_string(), 2)].into(), reg).unwrap();
        store.apply(&registry, [("a".to_string(), 3)].into(), reg).unwrap();

        let keys = label_values(&registry, "test_entity_value", "key");
        assert_eq!(keys, vec!["a".to_string()]);

        let reader = store.value_supplier("a".to_string(), |v| *v as f64);
        assert_eq!(reader(), 3.0);
    }

    #[test]
    fn test_scoped_apply_preserves_other_scopes() {
        let registry = Registry::new();
        let store: EntityStore<String, i64> = EntityStore::new(false);

        let reg = |r: &Registry, k: &String| register_size_gauge(&store, r, k);

        store
            .apply_scoped(
                &registry,
                [("db1.t1".to_string(), 1)].into(),
                |k| k.starts_with("db1."),
                reg,
            )
            .unwrap();
        store
            .apply_scoped(
                &registry,
                [("db2.t1".to_string(), 2)].into(),
                |k| k.starts_with("db2."),
                reg,
            )
            .unwrap();

        // db2's collection must not wipe db1's snapshot.
        let db1 = store.value_supplier("db1.t1".to_string(), |v| *v as f64);
        assert_eq!(db1(), 1.0);

        // Re-collecting db1 replaces only db1 keys.
        store
            .apply_scoped(
                &registry,
                [("db1.t2".to_string(), 3)].into(),
                |k| k.starts_with("db1."),
                reg,
            )
            .unwrap();
        assert!(db1().is_nan());
        let db2 = store.value_supplier("db2.t1".to_string(), |v| *v as f64);
        assert_eq!(db2(), 2.0);
    }

    #[test]
    fn test_aggregate_supplier_folds_snapshot() {
        let registry = Registry::new();
        let store: EntityStore<String, i64> = EntityStore::new(false);

        let total = store.aggregate_supplier(|m| m.values().map(|v| *v as f64).sum());
        assert_eq!(total(), 0.0);

        store
            .apply(
                &registry,
                [("a".to_string(), 2), ("b".to_string(), 3)].into(),
                |r, k| register_size_gauge(&store, r, k),
            )
            .unwrap();
        assert_eq!(total(), 5.0);
    }

    #[test]
    fn test_snapshot_cell_reads_previous_until_replaced() {
        let cell: SnapshotCell<(f64, f64)> = SnapshotCell::new();
        let first = cell.value_supplier(|t| t.0);

        assert!(first().is_nan());
        cell.store((1.0, 2.0));
        assert_eq!(first(), 1.0);
        cell.store((7.0, 8.0));
        assert_eq!(first(), 7.0);
    }

    #[test]
    fn test_registry_has_no_duplicate_families_after_churn() {
        let registry = Registry::new();
        let store: EntityStore<String, i64> = EntityStore::new(true);
        let reg = |r: &Registry, k: &String| register_size_gauge(&store, r, k);

        for round in 0..5_i64 {
            let key = format!("pid.{round}");
            store.apply(&registry, [(key, round)].into(), reg).unwrap();
        }

        assert_eq!(
            registry_names(&registry),
            vec!["test_entity_value".to_string()]
        );
        assert_eq!(
            label_values(&registry, "test_entity_value", "key"),
            vec!["pid.4".to_string()]
        );
    }
}
