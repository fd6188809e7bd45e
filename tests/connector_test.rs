mod common;

use std::time::Duration;

use common::{client_config, network_config, setup, wait_until};
use framelink::{AppResult, ClientConfig, Connector, ConnectorState, Listener};
use rstest::rstest;
use tokio::net::TcpListener;
use tokio::time;

/// A loopback port with nothing listening on it.
async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_without_server_reports_disconnected(_setup: ()) -> AppResult<()> {
    let connector = Connector::new(client_config(unused_port().await));
    assert!(!connector.start().await);
    assert_eq!(connector.state(), ConnectorState::Disconnected);

    // sends are dropped while disconnected
    connector.send(b"lost").await?;
    connector.send_async(b"lost")?;

    // the supervisor keeps retrying at the configured interval
    wait_until(|| connector.connect_attempts() >= 3).await;
    connector.shutdown();
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_side_close_disconnects_client(_setup: ()) -> AppResult<()> {
    let listener = Listener::bind(&network_config(0, 4)).await?;
    let handle = listener.handle();
    tokio::spawn(listener.run());

    // long retry interval so the disconnected state is observable
    let config = ClientConfig {
        retry_interval_ms: 60_000,
        ..client_config(handle.local_addr().port())
    };
    let connector = Connector::new(config);
    assert!(connector.start().await);
    wait_until(|| handle.connection_count() == 1).await;
    let id = handle.live_ids()[0];

    let mut state_rx = connector.subscribe();
    assert!(handle.close_connection(id));
    time::timeout(
        Duration::from_secs(5),
        state_rx.wait_for(|state| *state == ConnectorState::Disconnected),
    )
    .await
    .expect("client did not notice the close")
    .expect("connector dropped");

    wait_until(|| handle.free_ids().contains(&id)).await;
    assert_eq!(handle.connection_count(), 0);
    assert!(!connector.is_connected());

    connector.shutdown();
    handle.shutdown();
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_reconnects_after_server_restart(_setup: ()) -> AppResult<()> {
    let listener = Listener::bind(&network_config(0, 4)).await?;
    let port = listener.local_addr().port();
    let handle = listener.handle();
    let server = tokio::spawn(listener.run());

    let connector = Connector::new(client_config(port));
    assert!(connector.start().await);
    wait_until(|| handle.connection_count() == 1).await;

    // stop the server, the client loses its connection
    handle.shutdown();
    server.await.expect("listener task panicked")?;
    wait_until(|| !connector.is_connected()).await;

    // retries keep failing while nothing listens
    let attempts = connector.connect_attempts();
    wait_until(|| connector.connect_attempts() >= attempts + 2).await;
    assert!(!connector.is_connected());

    // restart on the same port
    let listener = Listener::bind(&network_config(port, 4)).await?;
    let handle = listener.handle();
    tokio::spawn(listener.run());

    let mut state_rx = connector.subscribe();
    time::timeout(
        Duration::from_secs(2),
        state_rx.wait_for(|state| *state == ConnectorState::Connected),
    )
    .await
    .expect("client did not reconnect")
    .expect("connector dropped");
    wait_until(|| handle.connection_count() == 1).await;

    connector.send(b"back again").await?;

    connector.shutdown();
    handle.shutdown();
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_stops_reconnecting(_setup: ()) -> AppResult<()> {
    let connector = Connector::new(client_config(unused_port().await));
    assert!(!connector.start().await);
    connector.shutdown();

    let attempts = connector.connect_attempts();
    time::sleep(Duration::from_millis(600)).await;
    assert_eq!(connector.connect_attempts(), attempts);
    assert!(!connector.start().await);
    Ok(())
}
