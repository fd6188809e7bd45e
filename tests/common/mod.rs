#![allow(dead_code)]

use std::time::Duration;

use framelink::{setup_local_tracing, ClientConfig, NetworkConfig};
use rstest::fixture;
use tokio::time;

#[fixture]
#[once]
pub fn setup() {
    setup_local_tracing().expect("failed to setup tracing");
}

pub fn network_config(port: u16, max_connection: usize) -> NetworkConfig {
    NetworkConfig {
        port,
        max_connection,
        ..NetworkConfig::default()
    }
}

pub fn client_config(port: u16) -> ClientConfig {
    ClientConfig {
        server_port: port,
        connect_wait_ms: 2000,
        retry_interval_ms: 200,
        ..ClientConfig::default()
    }
}

/// Polls `condition` every 10ms, panicking after 5 seconds.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    time::timeout(Duration::from_secs(5), async {
        while !condition() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
