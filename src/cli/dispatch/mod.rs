use crate::cli::actions::Action;
use crate::collectors::COLLECTOR_NAMES;
use crate::config::{
    OrchestratorSettings, PerDbMode, PerDbSettings, PoolSettings, Settings,
};
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::time::Duration;

/// Resolve the collector toggle flags into the enabled-collector list, in
/// catalogue order.
#[must_use]
pub fn get_enabled_collectors(matches: &clap::ArgMatches) -> Vec<String> {
    COLLECTOR_NAMES
        .iter()
        .filter(|name| {
            if matches.get_flag(&format!("no-collector.{name}")) {
                false
            } else {
                matches.get_flag(&format!("collector.{name}"))
            }
        })
        .map(|name| (*name).to_string())
        .collect()
}

fn secs(matches: &clap::ArgMatches, id: &str) -> Duration {
    Duration::from_secs(matches.get_one::<u64>(id).copied().unwrap_or_default())
}

/// Turn parsed CLI matches into the typed settings bag.
///
/// # Errors
///
/// Returns an error for an invalid `per-db-mode`.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let mode: PerDbMode = matches
        .get_one::<String>("per-db-mode")
        .map(String::as_str)
        .unwrap_or("all")
        .parse()
        .context("invalid --per-db-mode")?;

    let db_list: Vec<String> = matches
        .get_many::<String>("per-db-list")
        .map(|values| values.map(String::to_string).collect())
        .unwrap_or_default();

    let settings = Settings {
        port: matches.get_one::<u16>("port").copied().unwrap_or(8080),
        listen: matches.get_one::<String>("listen").map(String::to_string),
        dsn: SecretString::from(
            matches
                .get_one::<String>("dsn")
                .map(String::to_string)
                .unwrap_or_default(),
        ),
        scrape_interval: secs(matches, "scrape-interval"),
        orchestrator: OrchestratorSettings {
            scrape_cache_max_age: secs(matches, "scrape-cache-max-age"),
            retry_attempts: matches
                .get_one::<u32>("connection-retry-attempts")
                .copied()
                .unwrap_or(3),
            retry_delay: secs(matches, "connection-retry-delay"),
            failure_threshold: matches
                .get_one::<u32>("collector-failure-threshold")
                .copied()
                .unwrap_or(3),
            circuit_breaker_enabled: !matches.get_flag("no-circuit-breaker"),
        },
        pool: PoolSettings {
            max_connections: matches.get_one::<u32>("pool-max").copied().unwrap_or(5),
            min_connections: matches.get_one::<u32>("pool-min").copied().unwrap_or(1),
            acquisition_timeout: secs(matches, "acquisition-timeout"),
            max_lifetime: secs(matches, "max-lifetime"),
        },
        per_db: PerDbSettings {
            mode,
            db_list,
            cache_enabled: !matches.get_flag("no-per-db-cache"),
        },
        collectors: get_enabled_collectors(matches),
        table_vacuum_tuple_threshold: matches
            .get_one::<i64>("table-vacuum-tuple-threshold")
            .copied()
            .unwrap_or(1000),
        backup_history_url: matches
            .get_one::<String>("backup-history-url")
            .map(String::to_string),
    };

    Ok(Action::Run {
        settings: Box::new(settings),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cli::commands;
    use crate::config::PerDbMode;

    fn parse(args: &[&str]) -> Settings {
        let matches = commands::new().get_matches_from(args.iter().copied());
        let Action::Run { settings } = handler(&matches).unwrap();
        *settings
    }

    #[test]
    fn test_handler_defaults() {
        temp_env::with_vars_unset(
            ["GG_EXPORTER_DSN", "GG_EXPORTER_PER_DB_MODE", "GG_EXPORTER_PORT"],
            || {
                let settings = parse(&["greengage_exporter"]);

                assert_eq!(settings.port, 8080);
                assert_eq!(settings.scrape_interval, Duration::from_secs(15));
                assert_eq!(
                    settings.orchestrator.scrape_cache_max_age,
                    Duration::from_secs(30)
                );
                assert!(settings.orchestrator.circuit_breaker_enabled);
                assert_eq!(settings.per_db.mode, PerDbMode::All);
                assert!(settings.per_db.cache_enabled);
                assert_eq!(settings.table_vacuum_tuple_threshold, 1000);

                // Opt-in collectors stay off without their flags.
                assert!(!settings.collectors.contains(&"table_health".to_string()));
                assert!(!settings.collectors.contains(&"backup_history".to_string()));
                assert!(settings.collectors.contains(&"segments".to_string()));
            },
        );
    }

    #[test]
    fn test_handler_flags() {
        let settings = parse(&[
            "greengage_exporter",
            "--port",
            "9297",
            "--per-db-mode",
            "exclude",
            "--per-db-list",
            "mydb",
            "--no-per-db-cache",
            "--no-circuit-breaker",
            "--connection-retry-delay",
            "2",
        ]);

        assert_eq!(settings.port, 9297);
        assert_eq!(settings.per_db.mode, PerDbMode::Exclude);
        assert_eq!(settings.per_db.db_list, vec!["mydb".to_string()]);
        assert!(!settings.per_db.cache_enabled);
        assert!(!settings.orchestrator.circuit_breaker_enabled);
        assert_eq!(settings.orchestrator.retry_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_handler_accepts_from_db_synonym() {
        let settings = parse(&["greengage_exporter", "--per-db-mode", "from_db"]);
        assert_eq!(settings.per_db.mode, PerDbMode::All);
    }

    #[test]
    fn test_handler_rejects_unknown_mode() {
        let matches =
            commands::new().get_matches_from(["greengage_exporter", "--per-db-mode", "sometimes"]);
        assert!(handler(&matches).is_err());
    }
}
