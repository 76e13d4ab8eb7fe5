//! Exporter self-metrics, registered at process start and updated by the
//! orchestrator. These stay meaningful through database outages so operators
//! can dashboard scrape health independently of cluster health.

use crate::metrics::process::ProcessMetrics;
use crate::metrics::{SupplierGauge, supplier};
use anyhow::{Context, Result};
use prometheus::{
    Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
};
use std::time::Instant;

/// Scrape bookkeeping: counters, the `up` gauge, and scrape timings.
#[derive(Clone)]
pub struct ExporterMetrics {
    /// Incremented once per scrape attempt.
    pub total_scraped: IntCounter,
    /// Incremented on any scrape-level error and on each collector error.
    pub total_error: IntCounter,
    /// Per-collector error count.
    pub collector_error: IntCounterVec,
    /// 1 when the last connectivity check passed, else 0.
    pub up: Gauge,
    pub scrape_duration: Histogram,
    pub process: ProcessMetrics,
    started: Instant,
}

impl ExporterMetrics {
    /// # Errors
    ///
    /// Returns an error when a metric cannot be constructed; metric names are
    /// static so this only fires on programming mistakes.
    pub fn new() -> Result<Self> {
        let total_scraped = IntCounter::with_opts(Opts::new(
            "greengage_exporter_total_scraped",
            "Number of scrape attempts since start",
        ))
        .context("greengage_exporter_total_scraped")?;

        let total_error = IntCounter::with_opts(Opts::new(
            "greengage_exporter_total_error",
            "Number of scrape-level and collector errors since start",
        ))
        .context("greengage_exporter_total_error")?;

        let collector_error = IntCounterVec::new(
            Opts::new(
                "greengage_exporter_collector_error",
                "Errors per collector since start",
            ),
            &["collector"],
        )
        .context("greengage_exporter_collector_error")?;

        let up = Gauge::with_opts(Opts::new(
            "up",
            "Whether the database answered the last connectivity check",
        ))
        .context("up")?;

        let scrape_duration = Histogram::with_opts(
            HistogramOpts::new(
                "greengage_exporter_scrape_duration_seconds",
                "End-to-end duration of each scrape in seconds",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )
        .context("greengage_exporter_scrape_duration_seconds")?;

        Ok(Self {
            total_scraped,
            total_error,
            collector_error,
            up,
            scrape_duration,
            process: ProcessMetrics::new()?,
            started: Instant::now(),
        })
    }

    /// Register everything, including the uptime supplier gauge.
    ///
    /// # Errors
    ///
    /// Returns an error when any meter identity is already registered.
    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.total_scraped.clone()))?;
        registry.register(Box::new(self.total_error.clone()))?;
        registry.register(Box::new(self.collector_error.clone()))?;
        registry.register(Box::new(self.up.clone()))?;
        registry.register(Box::new(self.scrape_duration.clone()))?;

        let started = self.started;
        let _uptime = SupplierGauge::new(
            "greengage_exporter_uptime_seconds",
            "Seconds since the exporter process started",
            &[],
            supplier(move || started.elapsed().as_secs_f64()),
        )?
        .register(registry)?;

        self.process.register(registry)?;

        Ok(())
    }

    /// Record a collector failure in both error counters.
    pub fn record_collector_error(&self, collector: &str) {
        self.total_error.inc();
        self.collector_error.with_label_values(&[collector]).inc();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_registers_all_self_metrics() {
        let registry = Registry::new();
        let metrics = ExporterMetrics::new().unwrap();
        metrics.register(&registry).unwrap();

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|mf| mf.name().to_string())
            .collect();

        for expected in [
            "greengage_exporter_total_scraped",
            "greengage_exporter_total_error",
            "up",
            "greengage_exporter_scrape_duration_seconds",
            "greengage_exporter_uptime_seconds",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        let metrics = ExporterMetrics::new().unwrap();
        metrics.register(&registry).unwrap();
        assert!(metrics.register(&registry).is_err());
    }

    #[test]
    fn test_record_collector_error_increments_both_counters() {
        let metrics = ExporterMetrics::new().unwrap();
        metrics.record_collector_error("segments");
        metrics.record_collector_error("segments");
        metrics.record_collector_error("locks");

        assert_eq!(metrics.total_error.get(), 3);
        assert_eq!(
            metrics
                .collector_error
                .with_label_values(&["segments"])
                .get(),
            2
        );
        assert_eq!(
            metrics.collector_error.with_label_values(&["locks"]).get(),
            1
        );
    }

    #[test]
    fn test_uptime_supplier_advances() {
        let registry = Registry::new();
        let metrics = ExporterMetrics::new().unwrap();
        metrics.register(&registry).unwrap();

        let read = || {
            registry
                .gather()
                .iter()
                .find(|mf| mf.name() == "greengage_exporter_uptime_seconds")
                .and_then(|mf| mf.get_metric().first().map(|m| m.get_gauge().value()))
                .unwrap()
        };

        let first = read();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(read() > first);
    }
}
