use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::network::{ConnectionHandler, ConnectionId, InboundFrame};
use crate::utils::IdentityPool;
use crate::{AppError, AppResult};

use super::config::{AcceptErrorPolicy, NetworkConfig};
use super::registry::ConnectionRegistry;
use super::Shutdown;

const MAX_ACCEPT_BACKOFF_SECS: u64 = 64;

/// Server side of the link: accepts connections, gives each one an id from the
/// identity pool and keeps it in the registry until its handler fails.
#[derive(Debug)]
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: NetworkConfig,
    pool: Arc<IdentityPool>,
    registry: Arc<ConnectionRegistry>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown: Shutdown,
    inbound_tx: Option<async_channel::Sender<InboundFrame>>,
}

impl Listener {
    pub async fn bind(config: &NetworkConfig) -> AppResult<Listener> {
        config.validate()?;
        let listen_address = config.listen_address();
        let listener = TcpListener::bind(&listen_address).await.map_err(|err| {
            let error_msg = format!(
                "Failed to bind server to address: {} - Error: {}",
                listen_address, err
            );
            error!(error_msg);
            AppError::IllegalStateError(error_msg)
        })?;
        let local_addr = listener.local_addr()?;
        info!("tcp server binding to {} for listening", local_addr);

        let (notify_shutdown, _) = broadcast::channel(1);
        // subscribe before anyone can hold a handle, so an early shutdown is not lost
        let shutdown = Shutdown::new(notify_shutdown.subscribe());
        Ok(Listener {
            listener,
            local_addr,
            config: config.clone(),
            pool: Arc::new(IdentityPool::new(config.max_connection)),
            registry: Arc::new(ConnectionRegistry::new()),
            notify_shutdown,
            shutdown,
            inbound_tx: None,
        })
    }

    /// Received frames of every connection are forwarded to `inbound_tx`.
    pub fn with_inbound(mut self, inbound_tx: async_channel::Sender<InboundFrame>) -> Self {
        self.inbound_tx = Some(inbound_tx);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            local_addr: self.local_addr,
            pool: self.pool.clone(),
            registry: self.registry.clone(),
            notify_shutdown: self.notify_shutdown.clone(),
        }
    }

    /// Runs the accept loop until shutdown.
    ///
    /// Each round takes the next free id first, so once every id is in use the loop
    /// waits for a connection to be recycled before accepting again. A failed accept
    /// returns its id to the pool and is then handled per `accept_error_policy`:
    /// `halt` stops accepting and returns the error, live connections keep running;
    /// `continue` backs off (1s doubling up to 64s) and accepts again.
    ///
    /// On shutdown every live connection is closed.
    #[tracing::instrument(skip(self))]
    pub async fn run(mut self) -> AppResult<()> {
        info!("start accepting connections on {}", self.local_addr);
        let mut backoff = AcceptBackoff::default();

        loop {
            let id = tokio::select! {
                id = self.pool.acquire() => id?,
                _ = self.shutdown.recv() => break,
            };

            debug!("accept new connection with id {}", id);
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = self.shutdown.recv() => {
                    self.pool.release(id);
                    break;
                }
            };

            match accepted {
                Ok((socket, peer_addr)) => {
                    backoff.reset();
                    self.register(id, socket, peer_addr);
                }
                Err(err) => {
                    let delay = recover_from_accept_error(
                        self.config.accept_error_policy,
                        &self.pool,
                        id,
                        &err,
                        &mut backoff,
                    )?;
                    tokio::select! {
                        _ = time::sleep(delay) => {}
                        _ = self.shutdown.recv() => break,
                    }
                }
            }
        }

        debug!("listener received shutdown signal, closing live connections");
        self.registry.close_all();
        Ok(())
    }

    fn register(&self, id: ConnectionId, socket: TcpStream, peer_addr: SocketAddr) {
        let handler = ConnectionHandler::new(
            socket,
            self.config.conn_read_buffer_size,
            self.inbound_tx.clone(),
        );
        handler.set_id(id);
        let registry = Arc::downgrade(&self.registry);
        let pool = self.pool.clone();
        handler.set_error_callback(move |id| recycle(&registry, &pool, id));

        self.registry.insert(id, handler.clone());
        info!(
            monotonic_counter.accepted_connections = 1_u64,
            counter.live_connections = 1_i64,
            "accepted connection {} from {}, current connect count: {}",
            id,
            peer_addr,
            self.registry.len()
        );

        if let Err(err) = handler.start_receive_loop() {
            error!("failed to start reading connection {}: {}", id, err);
            handler.close();
            self.recycle(id);
        }
    }

    /// Drops `id` from the registry and puts it back at the end of the pool.
    pub fn recycle(&self, id: ConnectionId) {
        recycle(&Arc::downgrade(&self.registry), &self.pool, id);
    }
}

fn recycle(registry: &Weak<ConnectionRegistry>, pool: &IdentityPool, id: ConnectionId) {
    if let Some(registry) = registry.upgrade() {
        if registry.remove(id).is_some() {
            info!(
                counter.live_connections = -1_i64,
                "connection {} recycled, current connect count: {}",
                id,
                registry.len()
            );
        }
    }
    pool.release(id);
}

/// Doubling delay between accept retries, from 1s up to 64s.
#[derive(Debug)]
struct AcceptBackoff {
    secs: u64,
}

impl Default for AcceptBackoff {
    fn default() -> Self {
        AcceptBackoff { secs: 1 }
    }
}

impl AcceptBackoff {
    fn next_delay(&mut self) -> Duration {
        let delay = Duration::from_secs(self.secs);
        self.secs = (self.secs * 2).min(MAX_ACCEPT_BACKOFF_SECS);
        delay
    }

    fn reset(&mut self) {
        self.secs = 1;
    }
}

/// Returns the id taken for the failed accept to the pool, then either stops the
/// accept loop with [`AppError::Accept`] or yields how long to wait before retrying.
fn recover_from_accept_error(
    policy: AcceptErrorPolicy,
    pool: &IdentityPool,
    id: ConnectionId,
    err: &std::io::Error,
    backoff: &mut AcceptBackoff,
) -> AppResult<Duration> {
    pool.release(id);
    error!("accept tcp connection error: {}", err);
    match policy {
        AcceptErrorPolicy::Halt => Err(AppError::Accept(err.to_string())),
        AcceptErrorPolicy::Continue => {
            let delay = backoff.next_delay();
            warn!("retry accepting in {} seconds", delay.as_secs());
            Ok(delay)
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        debug!("tcp listener on {} dropped", self.local_addr);
    }
}

/// Cloneable view of a running [`Listener`].
#[derive(Debug, Clone)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    pool: Arc<IdentityPool>,
    registry: Arc<ConnectionRegistry>,
    notify_shutdown: broadcast::Sender<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn live_ids(&self) -> Vec<ConnectionId> {
        self.registry.ids()
    }

    pub fn free_ids(&self) -> Vec<ConnectionId> {
        self.pool.free_ids()
    }

    pub fn peer_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.registry.get(id).and_then(|handler| handler.peer_addr())
    }

    /// Forcibly closes one connection. Returns `false` if `id` is not live.
    pub fn close_connection(&self, id: ConnectionId) -> bool {
        match self.registry.get(id) {
            Some(handler) => {
                handler.close();
                true
            }
            None => false,
        }
    }

    pub async fn send_to(&self, id: ConnectionId, body: &[u8]) -> AppResult<()> {
        let handler = self
            .registry
            .get(id)
            .ok_or(AppError::ConnectionClosed(id))?;
        handler.send(body).await
    }

    /// Stops the accept loop and closes every live connection.
    pub fn shutdown(&self) {
        let _ = self.notify_shutdown.send(());
        self.registry.close_all();
    }
}
