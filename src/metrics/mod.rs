//! Registry adapter: gauges whose values are read through a closure.
//!
//! Registration happens once per meter identity (name plus fully-qualified
//! label set); every scrape of `/metrics` re-reads the supplier. This keeps
//! the registered-meter population stable while the underlying snapshots are
//! swapped wholesale by the collectors.

use anyhow::{Context, Result};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Gauge, Opts, Registry};
use std::collections::HashMap;
use std::sync::Arc;

pub mod exporter;
pub mod process;

/// Value-read callback attached to a registered gauge.
pub type Supplier = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Wrap a closure into a [`Supplier`].
pub fn supplier<F>(f: F) -> Supplier
where
    F: Fn() -> f64 + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A gauge with constant labels whose value comes from a supplier at gather
/// time.
///
/// Cloning is cheap and clones observe the same meter identity, which is what
/// `Registry::unregister` matches on — a clone therefore doubles as the
/// removal handle for deletion cleanup.
#[derive(Clone)]
pub struct SupplierGauge {
    gauge: Gauge,
    supplier: Supplier,
}

impl SupplierGauge {
    /// Create a gauge named `name` with the given constant labels.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid metric name or label set.
    pub fn new(name: &str, help: &str, labels: &[(&str, String)], read: Supplier) -> Result<Self> {
        let const_labels: HashMap<String, String> = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();

        let gauge = Gauge::with_opts(Opts::new(name, help).const_labels(const_labels))
            .with_context(|| format!("invalid gauge {name}"))?;

        Ok(Self {
            gauge,
            supplier: read,
        })
    }

    /// Register with `registry` and return self as the removal handle.
    ///
    /// # Errors
    ///
    /// Returns an error when this meter identity is already registered.
    pub fn register(self, registry: &Registry) -> Result<Self> {
        registry
            .register(Box::new(self.clone()))
            .with_context(|| format!("failed to register {}", self.name()))?;
        Ok(self)
    }

    /// Remove this meter from `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error when the meter was not registered.
    pub fn unregister(&self, registry: &Registry) -> Result<()> {
        registry
            .unregister(Box::new(self.clone()))
            .with_context(|| format!("failed to unregister {}", self.name()))
    }

    /// Current supplier value, as the next gather would observe it.
    #[must_use]
    pub fn read(&self) -> f64 {
        (self.supplier)()
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.gauge
            .desc()
            .first()
            .map(|d| d.fq_name.clone())
            .unwrap_or_default()
    }
}

impl Collector for SupplierGauge {
    fn desc(&self) -> Vec<&Desc> {
        self.gauge.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.gauge.set((self.supplier)());
        self.gauge.collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn gather_value(registry: &Registry, name: &str, label: Option<(&str, &str)>) -> Option<f64> {
        registry
            .gather()
            .iter()
            .find(|mf| mf.name() == name)
            .and_then(|mf| {
                mf.get_metric()
                    .iter()
                    .find(|m| match label {
                        None => true,
                        Some((k, v)) => m
                            .get_label()
                            .iter()
                            .any(|l| l.name() == k && l.value() == v),
                    })
                    .map(|m| m.get_gauge().value())
            })
    }

    #[test]
    fn test_supplier_is_read_at_gather_time() {
        let registry = Registry::new();
        let source = Arc::new(AtomicU64::new(7));
        let reader = source.clone();

        let _g = SupplierGauge::new(
            "test_supplier_gauge",
            "help",
            &[],
            supplier(move || reader.load(Ordering::Relaxed) as f64),
        )
        .unwrap()
        .register(&registry)
        .unwrap();

        assert_eq!(
            gather_value(&registry, "test_supplier_gauge", None),
            Some(7.0)
        );

        source.store(42, Ordering::Relaxed);
        assert_eq!(
            gather_value(&registry, "test_supplier_gauge", None),
            Some(42.0)
        );
    }

    #[test]
    fn test_same_family_different_label_values_coexist() {
        let registry = Registry::new();

        for (host, value) in [("seg1", 1.0), ("seg2", 2.0)] {
            let _g = SupplierGauge::new(
                "test_family",
                "help",
                &[("hostname", host.to_string())],
                supplier(move || value),
            )
            .unwrap()
            .register(&registry)
            .unwrap();
        }

        assert_eq!(
            gather_value(&registry, "test_family", Some(("hostname", "seg1"))),
            Some(1.0)
        );
        assert_eq!(
            gather_value(&registry, "test_family", Some(("hostname", "seg2"))),
            Some(2.0)
        );
    }

    #[test]
    fn test_duplicate_identity_is_rejected() {
        let registry = Registry::new();
        let make = || {
            SupplierGauge::new(
                "test_dup",
                "help",
                &[("k", "v".to_string())],
                supplier(|| 0.0),
            )
            .unwrap()
        };

        let _first = make().register(&registry).unwrap();
        assert!(make().register(&registry).is_err());
    }

    #[test]
    fn test_unregister_removes_the_meter() {
        let registry = Registry::new();
        let g = SupplierGauge::new(
            "test_removed",
            "help",
            &[("k", "v".to_string())],
            supplier(|| 1.0),
        )
        .unwrap()
        .register(&registry)
        .unwrap();

        assert!(gather_value(&registry, "test_removed", None).is_some());
        g.unregister(&registry).unwrap();
        assert!(gather_value(&registry, "test_removed", None).is_none());

        // Identity is free again after removal.
        let _again = SupplierGauge::new(
            "test_removed",
            "help",
            &[("k", "v".to_string())],
            supplier(|| 2.0),
        )
        .unwrap()
        .register(&registry)
        .unwrap();
    }
}
