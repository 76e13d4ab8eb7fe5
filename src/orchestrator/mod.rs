//! Scrape orchestration.
//!
//! One scrape: verify connectivity (with retries), detect the server version,
//! run the cluster-wide collectors in declaration order against the
//! coordinator, then the per-database collectors database-by-database. A
//! failure budget aborts the scrape once too many collectors have failed;
//! per-database resources are released on every exit path. Concurrent
//! `scrape()` calls coalesce on a non-blocking lock and are served the last
//! cached successful result while it is fresh.

use crate::collectors::Collector;
use crate::config::OrchestratorSettings;
use crate::db::perdb::DatabaseProvider;
use crate::db::{Version, VersionProbe};
use crate::metrics::exporter::ExporterMetrics;
use anyhow::{Result, anyhow, bail};
use sqlx::PgPool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

pub mod scheduler;

const TEST_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one completed (or aborted) scrape.
#[derive(Clone, Debug, PartialEq)]
pub struct ScrapeResult {
    pub started: SystemTime,
    pub success: bool,
    pub error: Option<String>,
}

impl ScrapeResult {
    /// A result older than `max_age` no longer shields coalesced callers.
    #[must_use]
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.started.elapsed().map_or(true, |age| age > max_age)
    }
}

/// What a `scrape()` caller got.
#[derive(Clone, Debug, PartialEq)]
pub enum ScrapeOutcome {
    /// This call ran the scrape to completion (successful or not).
    Completed(ScrapeResult),
    /// Another scrape was in flight; the cached result is still fresh.
    CoalescedFresh(ScrapeResult),
    /// Another scrape was in flight and nothing fresh was cached.
    CoalescedStale,
}

/// Counts collector failures and trips once the threshold is reached.
struct FailureBudget {
    enabled: bool,
    threshold: u32,
    failures: u32,
}

impl FailureBudget {
    const fn new(enabled: bool, threshold: u32) -> Self {
        Self {
            enabled,
            threshold,
            failures: 0,
        }
    }

    fn record_failure(&mut self) -> Result<()> {
        self.failures += 1;
        if self.enabled && self.failures >= self.threshold {
            bail!(
                "circuit breaker tripped after {} collector failures",
                self.failures
            );
        }
        Ok(())
    }
}

fn lock_result(mutex: &Mutex<Option<ScrapeResult>>) -> std::sync::MutexGuard<'_, Option<ScrapeResult>> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct Orchestrator {
    pool: PgPool,
    probe: Arc<VersionProbe>,
    provider: Arc<DatabaseProvider>,
    general: Vec<Arc<dyn Collector + Send + Sync>>,
    per_db: Vec<Arc<dyn Collector + Send + Sync>>,
    metrics: ExporterMetrics,
    settings: OrchestratorSettings,
    scrape_lock: tokio::sync::Mutex<()>,
    last_success: Mutex<Option<ScrapeResult>>,
}

impl Orchestrator {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        probe: Arc<VersionProbe>,
        provider: Arc<DatabaseProvider>,
        general: Vec<Arc<dyn Collector + Send + Sync>>,
        per_db: Vec<Arc<dyn Collector + Send + Sync>>,
        metrics: ExporterMetrics,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            pool,
            probe,
            provider,
            general,
            per_db,
            metrics,
            settings,
            scrape_lock: tokio::sync::Mutex::new(()),
            last_success: Mutex::new(None),
        }
    }

    /// The last successful scrape, if any.
    #[must_use]
    pub fn last_result(&self) -> Option<ScrapeResult> {
        lock_result(&self.last_success).clone()
    }

    /// Run one scrape, or coalesce with the one already in flight.
    ///
    /// Never returns an error: scrape failures are reported through the
    /// result, the `up` gauge and the error counters.
    pub async fn scrape(&self) -> ScrapeOutcome {
        let Ok(_guard) = self.scrape_lock.try_lock() else {
            let cached = lock_result(&self.last_success).clone();
            return match cached {
                Some(result) if !result.is_stale(self.settings.scrape_cache_max_age) => {
                    debug!("scrape in progress, serving cached result");
                    ScrapeOutcome::CoalescedFresh(result)
                }
                _ => {
                    warn!("scrape in progress and no fresh result is cached");
                    ScrapeOutcome::CoalescedStale
                }
            };
        };

        let started = SystemTime::now();
        let timer = Instant::now();
        self.metrics.total_scraped.inc();

        let result = match self.run_scrape().await {
            Ok(()) => ScrapeResult {
                started,
                success: true,
                error: None,
            },
            Err(e) => ScrapeResult {
                started,
                success: false,
                error: Some(e.to_string()),
            },
        };

        self.metrics.process.refresh();
        self.metrics
            .scrape_duration
            .observe(timer.elapsed().as_secs_f64());

        if result.success {
            *lock_result(&self.last_success) = Some(result.clone());
        }

        ScrapeOutcome::Completed(result)
    }

    async fn run_scrape(&self) -> Result<()> {
        let version = match self.verify().await {
            Ok(version) => {
                self.metrics.up.set(1.0);
                version
            }
            Err(e) => {
                self.metrics.up.set(0.0);
                self.metrics.total_error.inc();
                warn!(error = %e, "connectivity verification failed, aborting scrape");
                return Err(e);
            }
        };

        let mut budget = FailureBudget::new(
            self.settings.circuit_breaker_enabled,
            self.settings.failure_threshold,
        );

        self.run_group(&self.general, &self.pool, None, &version, &mut budget)
            .await?;

        if !self.per_db.is_empty() {
            let outcome = self.run_per_db(&version, &mut budget).await;
            // Per-database pools are released on every path, breaker included.
            self.provider.cleanup().await;
            outcome?;
        }

        Ok(())
    }

    /// Connectivity check with linear backoff, then version detection.
    async fn verify(&self) -> Result<Version> {
        let attempts = self.settings.retry_attempts.max(1);

        for attempt in 1..=attempts {
            if test_connection(&self.pool).await {
                match self.probe.version(&self.pool).await {
                    Ok(version) => return Ok(version),
                    Err(e) => warn!(attempt, error = %e, "version detection failed"),
                }
            } else {
                warn!(attempt, "database connectivity check failed");
            }

            if attempt < attempts {
                sleep(self.settings.retry_delay * attempt).await;
            }
        }

        Err(anyhow!("database unreachable after {attempts} attempts"))
    }

    async fn run_group(
        &self,
        collectors: &[Arc<dyn Collector + Send + Sync>],
        pool: &PgPool,
        database: Option<&str>,
        version: &Version,
        budget: &mut FailureBudget,
    ) -> Result<()> {
        for collector in collectors {
            let started = Instant::now();
            match collector.collect(pool, version).await {
                Ok(()) => {
                    debug!(
                        collector = collector.name(),
                        database = database.unwrap_or(""),
                        elapsed = ?started.elapsed(),
                        "collector finished"
                    );
                }
                Err(e) => {
                    warn!(
                        collector = collector.name(),
                        database = database.unwrap_or(""),
                        error = %e,
                        "collector failed"
                    );
                    self.metrics.record_collector_error(collector.name());
                    if collector.fail_on_error() {
                        budget.record_failure()?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Databases outer, collectors inner: all per-database metrics for one
    /// database land before the next database is touched.
    async fn run_per_db(&self, version: &Version, budget: &mut FailureBudget) -> Result<()> {
        let datasources = self.provider.datasources(&self.pool).await;
        if datasources.is_empty() {
            debug!("no per-database datasources, skipping per-database collectors");
            return Ok(());
        }

        for (name, pool) in &datasources {
            debug!(database = %name, "running per-database collectors");
            self.run_group(&self.per_db, pool, Some(name), version, budget)
                .await?;
        }

        Ok(())
    }
}

async fn test_connection(pool: &PgPool) -> bool {
    let ping = sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(pool);
    matches!(timeout(TEST_CONNECTION_TIMEOUT, ping).await, Ok(Ok(1)))
}
