use crate::cli::actions::Action;
use crate::collectors::registry::CollectorRegistry;
use crate::collectors::util::{self, Tunables};
use crate::config::Settings;
use crate::db::datasource;
use crate::db::perdb::DatabaseProvider;
use crate::db::{VersionProbe, version::ProbeConfig};
use crate::exporter;
use crate::metrics::exporter::ExporterMetrics;
use crate::orchestrator::{Orchestrator, scheduler};
use anyhow::{Context, Result, bail};
use prometheus::Registry;
use std::sync::Arc;
use tracing::{info, warn};

/// Bring the exporter up: pools, registry, collectors, scheduler, HTTP.
///
/// # Errors
///
/// Returns an error on startup failure: unreachable coordinator, unsupported
/// server version, metric registration conflicts, or a failed port bind.
pub async fn handle(action: Action) -> Result<()> {
    let Action::Run { settings } = action;
    let settings: Settings = *settings;

    util::set_tunables(Tunables {
        table_vacuum_tuple_threshold: settings.table_vacuum_tuple_threshold,
        backup_history_url: settings.backup_history_url.clone(),
    });

    let pool = datasource::primary_pool(&settings).await?;
    info!("connected to coordinator database");

    let registry = Registry::new();
    let metrics = ExporterMetrics::new()?;
    metrics
        .register(&registry)
        .context("failed to register exporter self-metrics")?;

    // Startup version gate: refuse to run against a known-unsupported major,
    // but start anyway when detection fails (it is retried on every scrape).
    let probe = Arc::new(VersionProbe::new(ProbeConfig::default()));
    match probe.version(&pool).await {
        Ok(version) if !version.is_supported() => {
            bail!("unsupported server version {}", version.short());
        }
        Ok(version) => info!(version = %version.short(), "detected server version"),
        Err(e) => warn!(error = %e, "version detection failed at startup, will retry per scrape"),
    }

    let collectors = CollectorRegistry::new(&settings.collectors);
    if collectors.is_empty() {
        warn!("no collectors enabled, only exporter self-metrics will be served");
    }
    collectors
        .register_metrics(&registry)
        .context("failed to register collector metrics")?;
    info!(collectors = ?collectors.collector_names(), "collectors enabled");

    let (general, per_db) = collectors.by_group();
    let provider = Arc::new(DatabaseProvider::new(
        settings.dsn.clone(),
        settings.per_db.clone(),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        pool.clone(),
        probe,
        provider.clone(),
        general,
        per_db,
        metrics,
        settings.orchestrator.clone(),
    ));
    let scheduler = scheduler::spawn(orchestrator, settings.scrape_interval);

    let served = exporter::serve(
        settings.port,
        settings.listen.clone(),
        pool.clone(),
        registry,
    )
    .await;

    // Orderly teardown whether the server stopped cleanly or not.
    scheduler.abort();
    provider.shutdown().await;
    pool.close().await;
    info!("exporter stopped");

    served
}
