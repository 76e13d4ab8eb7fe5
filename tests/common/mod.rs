#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(dead_code)]

use sqlx::PgPool;
use std::env;
use std::net::TcpListener as StdTcpListener;
use std::time::Duration;

/// A pool pointed at a port nothing listens on; queries fail fast, and code
/// paths that never touch the database run cleanly against it.
pub fn unreachable_pool() -> PgPool {
    sqlx::postgres::PgPoolOptions::new()
        .acquire_timeout(Duration::from_millis(200))
        .connect_lazy("postgres://nobody@127.0.0.1:1/none")
        .unwrap()
}

/// Ask the OS for a free port.
pub fn get_available_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .unwrap()
}

/// Poll until something accepts on the port, up to `attempts` x 100ms.
pub async fn wait_for_server(port: u16, attempts: u32) -> bool {
    for _ in 0..attempts {
        if tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

pub fn get_test_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}")
}

/// DSN of a live test cluster, when the environment provides one. Scenario
/// tests return early without it.
pub fn live_test_dsn() -> Option<String> {
    env::var("GG_EXPORTER_TEST_DSN").ok()
}
