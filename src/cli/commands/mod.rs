use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

mod collectors;

pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let cmd = Command::new("greengage_exporter")
        .about("Greengage Database metric exporter for Prometheus")
        .version(env!("CARGO_PKG_VERSION"))
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("8080")
                .env("GG_EXPORTER_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("listen")
                .long("listen")
                .help("Address to bind, defaults to all interfaces")
                .env("GG_EXPORTER_LISTEN")
                .value_name("ADDR"),
        )
        .arg(
            Arg::new("dsn")
                .long("dsn")
                .help("Coordinator connection string; the database path is rewritten per database")
                .default_value("postgres://gpadmin@localhost:5432/postgres?sslmode=disable")
                .env("GG_EXPORTER_DSN")
                .value_name("DSN"),
        )
        .arg(
            Arg::new("scrape-interval")
                .long("scrape-interval")
                .help("Seconds between scheduled scrapes")
                .default_value("15")
                .env("GG_EXPORTER_SCRAPE_INTERVAL")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("scrape-cache-max-age")
                .long("scrape-cache-max-age")
                .help("Seconds a cached scrape result shields coalesced callers")
                .default_value("30")
                .env("GG_EXPORTER_SCRAPE_CACHE_MAX_AGE")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("connection-retry-attempts")
                .long("connection-retry-attempts")
                .help("Connectivity checks per scrape before giving up")
                .default_value("3")
                .env("GG_EXPORTER_CONNECTION_RETRY_ATTEMPTS")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("connection-retry-delay")
                .long("connection-retry-delay")
                .help("Base retry delay in seconds; attempt n waits n times this")
                .default_value("1")
                .env("GG_EXPORTER_CONNECTION_RETRY_DELAY")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("collector-failure-threshold")
                .long("collector-failure-threshold")
                .help("Collector failures at which a scrape is aborted")
                .default_value("3")
                .env("GG_EXPORTER_COLLECTOR_FAILURE_THRESHOLD")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("no-circuit-breaker")
                .long("no-circuit-breaker")
                .help("Run every collector even when most of them are failing")
                .env("GG_EXPORTER_NO_CIRCUIT_BREAKER")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("pool-max")
                .long("pool-max")
                .help("Maximum connections in the coordinator pool")
                .default_value("5")
                .env("GG_EXPORTER_POOL_MAX")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("pool-min")
                .long("pool-min")
                .help("Idle connections kept in the coordinator pool")
                .default_value("1")
                .env("GG_EXPORTER_POOL_MIN")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("acquisition-timeout")
                .long("acquisition-timeout")
                .help("Seconds to wait for a pooled connection")
                .default_value("5")
                .env("GG_EXPORTER_ACQUISITION_TIMEOUT")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("max-lifetime")
                .long("max-lifetime")
                .help("Seconds a pooled coordinator connection may live")
                .default_value("1800")
                .env("GG_EXPORTER_MAX_LIFETIME")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("per-db-mode")
                .long("per-db-mode")
                .help("Databases visited by per-database collectors: all, include, exclude or none")
                .default_value("all")
                .env("GG_EXPORTER_PER_DB_MODE")
                .value_name("MODE"),
        )
        .arg(
            Arg::new("per-db-list")
                .long("per-db-list")
                .help("Comma-separated database list for include/exclude modes")
                .default_value("postgres")
                .env("GG_EXPORTER_PER_DB_LIST")
                .value_name("db1,db2,...")
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("no-per-db-cache")
                .long("no-per-db-cache")
                .help("Open per-database connections per scrape instead of caching them")
                .env("GG_EXPORTER_NO_PER_DB_CACHE")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("table-vacuum-tuple-threshold")
                .long("table-vacuum-tuple-threshold")
                .help("Minimum live tuples for a table to appear in vacuum statistics")
                .default_value("1000")
                .env("GG_EXPORTER_TABLE_VACUUM_TUPLE_THRESHOLD")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("backup-history-url")
                .long("backup-history-url")
                .help("SQLite URL or path of the gpbackup history file")
                .env("GG_EXPORTER_BACKUP_HISTORY_URL")
                .value_name("URL"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Increase verbosity, -vv for trace")
                .action(ArgAction::Count),
        );

    collectors::add_collectors_args(cmd)
}
