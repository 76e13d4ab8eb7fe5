use crate::collectors::{Collector, CollectorGroup, CollectorType, all_factories};
use crate::collectors::COLLECTOR_NAMES;
use anyhow::Result;
use std::sync::Arc;

/// The instantiated catalogue for this process, in declaration order.
#[derive(Clone)]
pub struct CollectorRegistry {
    collectors: Vec<CollectorType>,
}

impl CollectorRegistry {
    /// Instantiate the named collectors. Order follows the catalogue, not the
    /// caller's list, so scrapes are deterministic.
    #[must_use]
    pub fn new(enabled: &[String]) -> Self {
        let factories = all_factories();
        let collectors = COLLECTOR_NAMES
            .iter()
            .filter(|name| enabled.iter().any(|e| e == *name))
            .filter_map(|name| factories.get(name).map(|f| f()))
            .collect();

        Self { collectors }
    }

    /// Register every collector's metrics with the prometheus registry.
    ///
    /// # Errors
    ///
    /// Returns the first registration failure.
    pub fn register_metrics(&self, registry: &prometheus::Registry) -> Result<()> {
        for collector in &self.collectors {
            collector.register_metrics(registry)?;
            tracing::debug!(collector = collector.name(), "registered metrics");
        }
        Ok(())
    }

    /// Split into (general, per-database) collector lists, preserving order.
    #[must_use]
    pub fn by_group(
        &self,
    ) -> (
        Vec<Arc<dyn Collector + Send + Sync>>,
        Vec<Arc<dyn Collector + Send + Sync>>,
    ) {
        let mut general: Vec<Arc<dyn Collector + Send + Sync>> = Vec::new();
        let mut per_db: Vec<Arc<dyn Collector + Send + Sync>> = Vec::new();

        for collector in &self.collectors {
            let shared: Arc<dyn Collector + Send + Sync> = Arc::new(collector.clone());
            match collector.group() {
                CollectorGroup::General => general.push(shared),
                CollectorGroup::PerDb => per_db.push(shared),
            }
        }

        (general, per_db)
    }

    #[must_use]
    pub fn collector_names(&self) -> Vec<&'static str> {
        self.collectors.iter().map(Collector::name).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_order_follows_catalogue_not_input() {
        let registry = CollectorRegistry::new(&strings(&["segments", "cluster_state"]));
        assert_eq!(registry.collector_names(), vec!["cluster_state", "segments"]);
    }

    #[test]
    fn test_unknown_names_are_ignored() {
        let registry = CollectorRegistry::new(&strings(&["segments", "bogus"]));
        assert_eq!(registry.collector_names(), vec!["segments"]);
    }

    #[test]
    fn test_empty_input_yields_empty_registry() {
        let registry = CollectorRegistry::new(&[]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_group_split_preserves_order() {
        let registry = CollectorRegistry::new(&strings(&[
            "cluster_state",
            "segments",
            "table_vacuum",
            "db_vacuum",
        ]));
        let (general, per_db) = registry.by_group();

        let names = |list: &[Arc<dyn Collector + Send + Sync>]| {
            list.iter().map(|c| c.name()).collect::<Vec<_>>()
        };
        assert_eq!(names(&general), vec!["cluster_state", "segments"]);
        assert_eq!(names(&per_db), vec!["table_vacuum", "db_vacuum"]);
    }

    #[test]
    fn test_all_collectors_register_against_fresh_registry() {
        let enabled: Vec<String> = COLLECTOR_NAMES.iter().map(|s| (*s).to_string()).collect();
        let collectors = CollectorRegistry::new(&enabled);
        assert_eq!(collectors.collector_names().len(), COLLECTOR_NAMES.len());

        let registry = prometheus::Registry::new();
        collectors.register_metrics(&registry).unwrap();
    }

    #[test]
    fn test_defaults_disable_heavy_collectors() {
        let factories = all_factories();
        for name in ["table_health", "backup_history"] {
            let collector = factories.get(name).map(|f| f()).unwrap();
            assert!(!collector.enabled_by_default(), "{name} should be opt-in");
        }
        let segments = factories.get("segments").map(|f| f()).unwrap();
        assert!(segments.enabled_by_default());
    }
}
