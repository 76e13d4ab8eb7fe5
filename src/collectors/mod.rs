use crate::db::Version;
use anyhow::Result;
use futures::future::BoxFuture;
use prometheus::Registry;
use sqlx::PgPool;
use std::collections::HashMap;

#[macro_use]
mod register_macro;

/// Which connection a collector receives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectorGroup {
    /// Runs once per scrape against the coordinator connection.
    General,
    /// Runs once per allowed database, against a connection bound to it.
    PerDb,
}

pub trait Collector {
    fn name(&self) -> &'static str;

    fn group(&self) -> CollectorGroup {
        CollectorGroup::General
    }

    // register metrics with the prometheus registry
    fn register_metrics(&self, registry: &Registry) -> Result<()>;

    // lifetime 'a is needed to tie the future to the lifetime of self and pool
    fn collect<'a>(&'a self, pool: &'a PgPool, version: &'a Version)
    -> BoxFuture<'a, Result<()>>;

    fn enabled_by_default(&self) -> bool {
        true
    }

    /// When false, this collector's failures are counted but do not feed the
    /// scrape's circuit breaker.
    fn fail_on_error(&self) -> bool {
        true
    }
}

// Shared machinery: snapshot stores, encodings, tunables.
pub mod entity;
pub mod util;

pub mod backup;
pub mod cluster;
pub mod host;
pub mod query;
pub mod replication;
pub mod server;
pub mod table_health;
pub mod vacuum;

pub use backup::BackupHistoryCollector;
pub use cluster::{ClusterStateCollector, SegmentCollector};
pub use host::{DiskSpaceCollector, ResourceGroupCollector, SpillFilesCollector};
pub use query::{ActiveQueryDurationCollector, VacuumRunningCollector};
pub use replication::ReplicationCollector;
pub use server::{
    ConnectionsCollector, DatabaseSizeCollector, ExtendedLocksCollector, LocksCollector,
};
pub use table_health::TableHealthCollector;
pub use vacuum::{DatabaseVacuumCollector, TableVacuumCollector};

// THIS IS THE ONLY PLACE YOU NEED TO ADD NEW COLLECTORS
register_collectors! {
    cluster_state => ClusterStateCollector,
    segments => SegmentCollector,
    connections => ConnectionsCollector,
    locks => LocksCollector,
    extended_locks => ExtendedLocksCollector,
    database_size => DatabaseSizeCollector,
    replication => ReplicationCollector,
    spill_files => SpillFilesCollector,
    disk_space => DiskSpaceCollector,
    resource_groups => ResourceGroupCollector,
    query_duration => ActiveQueryDurationCollector,
    table_vacuum => TableVacuumCollector,
    db_vacuum => DatabaseVacuumCollector,
    vacuum_running => VacuumRunningCollector,
    table_health => TableHealthCollector,
    backup_history => BackupHistoryCollector,
}

// Other modules
pub mod registry;
