//! Typed configuration bag for the exporter.
//!
//! Values are populated by the CLI layer (flags + `GG_EXPORTER_*` env vars)
//! and passed down by reference; nothing here re-reads the environment.

use anyhow::{Result, bail};
use secrecy::SecretString;
use std::str::FromStr;
use std::time::Duration;

/// Which databases the per-database collectors visit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PerDbMode {
    All,
    Include,
    Exclude,
    None,
}

impl FromStr for PerDbMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            // `from_db` is a legacy spelling of `all`
            "all" | "from_db" => Ok(Self::All),
            "include" => Ok(Self::Include),
            "exclude" => Ok(Self::Exclude),
            "none" => Ok(Self::None),
            other => bail!("invalid per-db mode {other:?}, expected all|include|exclude|none"),
        }
    }
}

/// Orchestrator tuning knobs.
#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    pub scrape_cache_max_age: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub failure_threshold: u32,
    pub circuit_breaker_enabled: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            scrape_cache_max_age: Duration::from_secs(30),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            failure_threshold: 3,
            circuit_breaker_enabled: true,
        }
    }
}

/// Sizing for the coordinator connection pool.
#[derive(Clone, Debug)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquisition_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            acquisition_timeout: Duration::from_secs(5),
            max_lifetime: Duration::from_secs(30 * 60),
        }
    }
}

/// Per-database collection policy.
#[derive(Clone, Debug)]
pub struct PerDbSettings {
    pub mode: PerDbMode,
    pub db_list: Vec<String>,
    pub cache_enabled: bool,
}

impl Default for PerDbSettings {
    fn default() -> Self {
        Self {
            mode: PerDbMode::All,
            db_list: vec!["postgres".to_string()],
            cache_enabled: true,
        }
    }
}

/// Everything the run action needs to bring the exporter up.
#[derive(Clone, Debug)]
pub struct Settings {
    pub port: u16,
    pub listen: Option<String>,
    pub dsn: SecretString,
    pub scrape_interval: Duration,
    pub orchestrator: OrchestratorSettings,
    pub pool: PoolSettings,
    pub per_db: PerDbSettings,
    /// Registry names of the collectors to instantiate, in catalogue order.
    pub collectors: Vec<String>,
    pub table_vacuum_tuple_threshold: i64,
    /// SQLite URL (or bare path) of the gpbackup history file.
    pub backup_history_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 8080,
            listen: None,
            dsn: SecretString::from(
                "postgres://gpadmin@localhost:5432/postgres?sslmode=disable".to_string(),
            ),
            scrape_interval: Duration::from_secs(15),
            orchestrator: OrchestratorSettings::default(),
            pool: PoolSettings::default(),
            per_db: PerDbSettings::default(),
            collectors: Vec::new(),
            table_vacuum_tuple_threshold: 1000,
            backup_history_url: None,
        }
    }
}
