//! Resource usage of the exporter process itself, read via `sysinfo`.
//!
//! Refreshed once per scrape by the orchestrator rather than on every gather;
//! `/metrics` reads must stay allocation- and syscall-free.

use anyhow::{Context, Result, anyhow};
use prometheus::{Gauge, IntGauge, Opts, Registry};
use std::sync::{Arc, Mutex};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::warn;

#[derive(Clone)]
pub struct ProcessMetrics {
    resident_memory: IntGauge,
    virtual_memory: IntGauge,
    cpu_percent: Gauge,
    start_time: Gauge,
    system: Arc<Mutex<System>>,
    pid: Pid,
}

impl ProcessMetrics {
    /// # Errors
    ///
    /// Returns an error when the current pid cannot be determined or a metric
    /// cannot be constructed.
    pub fn new() -> Result<Self> {
        let pid = sysinfo::get_current_pid().map_err(|e| anyhow!("cannot resolve own pid: {e}"))?;

        let resident_memory = IntGauge::with_opts(Opts::new(
            "greengage_exporter_process_resident_memory_bytes",
            "Resident set size of the exporter process",
        ))
        .context("greengage_exporter_process_resident_memory_bytes")?;

        let virtual_memory = IntGauge::with_opts(Opts::new(
            "greengage_exporter_process_virtual_memory_bytes",
            "Virtual memory size of the exporter process",
        ))
        .context("greengage_exporter_process_virtual_memory_bytes")?;

        let cpu_percent = Gauge::with_opts(Opts::new(
            "greengage_exporter_process_cpu_percent",
            "CPU usage of the exporter process since the previous refresh",
        ))
        .context("greengage_exporter_process_cpu_percent")?;

        let start_time = Gauge::with_opts(Opts::new(
            "greengage_exporter_process_start_time_seconds",
            "Unix timestamp at which the exporter process started",
        ))
        .context("greengage_exporter_process_start_time_seconds")?;

        Ok(Self {
            resident_memory,
            virtual_memory,
            cpu_percent,
            start_time,
            system: Arc::new(Mutex::new(System::new())),
            pid,
        })
    }

    /// # Errors
    ///
    /// Returns an error when any meter identity is already registered.
    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.resident_memory.clone()))?;
        registry.register(Box::new(self.virtual_memory.clone()))?;
        registry.register(Box::new(self.cpu_percent.clone()))?;
        registry.register(Box::new(self.start_time.clone()))?;
        Ok(())
    }

    /// Re-read process stats from the OS. Called once per scrape.
    pub fn refresh(&self) {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("process metrics lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };

        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);

        if let Some(process) = system.process(self.pid) {
            #[allow(clippy::cast_possible_wrap)]
            {
                self.resident_memory.set(process.memory() as i64);
                self.virtual_memory.set(process.virtual_memory() as i64);
            }
            self.cpu_percent.set(f64::from(process.cpu_usage()));
            #[allow(clippy::cast_precision_loss)]
            self.start_time.set(process.start_time() as f64);
        }
    }
}
