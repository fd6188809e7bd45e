use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::{runtime, signal};
use tracing::{error, info, warn};

use crate::network::InboundFrame;
use crate::service::{Connector, LinkConfig, Listener};
use crate::AppResult;

/// Logs every frame arriving on `inbound_rx` until all senders are gone.
fn spawn_inbound_logger(inbound_rx: async_channel::Receiver<InboundFrame>) {
    tokio::spawn(async move {
        while let Ok(inbound) = inbound_rx.recv().await {
            info!(
                "[{}] {}",
                inbound.connection_id,
                String::from_utf8_lossy(inbound.frame.body())
            );
        }
    });
}

pub struct ServerNode {
    config: LinkConfig,
}

impl ServerNode {
    pub fn new(config: LinkConfig) -> Self {
        ServerNode { config }
    }

    pub fn start(&self, rt: &runtime::Runtime) -> AppResult<()> {
        rt.block_on(self.run_tcp_server())?;
        info!("server shutdown complete");
        Ok(())
    }

    async fn run_tcp_server(&self) -> AppResult<()> {
        let network_conf = &self.config.network;
        let (inbound_tx, inbound_rx) = async_channel::bounded(network_conf.inbound_channel_capacity);
        let listener = Listener::bind(network_conf).await?.with_inbound(inbound_tx);
        let handle = listener.handle();
        spawn_inbound_logger(inbound_rx);

        tokio::select! {
            res = listener.run() => {
                if let Err(err) = res {
                    error!(cause = %err, "failed to accept");
                }
            }
            _ = signal::ctrl_c() => {
                info!("get shutdown signal");
            }
        }
        handle.shutdown();
        Ok(())
    }
}

pub struct ClientNode {
    config: LinkConfig,
}

impl ClientNode {
    pub fn new(config: LinkConfig) -> Self {
        ClientNode { config }
    }

    /// Connects, then sends every stdin line as one frame until stdin closes or ctrl-c.
    pub fn start(&self, rt: &runtime::Runtime) -> AppResult<()> {
        rt.block_on(self.run_client())?;
        info!("client shutdown complete");
        Ok(())
    }

    async fn run_client(&self) -> AppResult<()> {
        let client_conf = &self.config.client;
        let (inbound_tx, inbound_rx) = async_channel::bounded(client_conf.inbound_channel_capacity);
        let connector = Connector::with_inbound(client_conf.clone(), inbound_tx);
        spawn_inbound_logger(inbound_rx);

        if !connector.start().await {
            warn!(
                "not connected to {} yet, input is dropped until the connection is up",
                client_conf.server_address()
            );
        }

        tokio::select! {
            res = forward_stdin(connector.clone()) => res?,
            _ = signal::ctrl_c() => {
                info!("get shutdown signal");
            }
        }
        connector.shutdown();
        Ok(())
    }
}

async fn forward_stdin(connector: Arc<Connector>) -> AppResult<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if let Err(err) = connector.send(line.as_bytes()).await {
            error!("send failed: {}", err);
        }
    }
    info!("stdin closed");
    Ok(())
}
