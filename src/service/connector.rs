use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::network::{ConnectionHandler, ConnectionId, InboundFrame};
use crate::{AppError, AppResult};

use super::config::ClientConfig;
use super::Shutdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
}

/// Client side of the link: one outbound connection plus a reconnect supervisor.
///
/// The state is only ever written through a `watch` channel, so the supervisor and any
/// other observer see transitions without sharing a bare flag. Every successful connect
/// gets a fresh [`ConnectionHandler`]; a closed handler is never reused.
pub struct Connector {
    config: ClientConfig,
    state_tx: watch::Sender<ConnectorState>,
    handler: RwLock<Option<Arc<ConnectionHandler>>>,
    attempts: AtomicU32,
    supervisor_started: AtomicBool,
    shut_down: AtomicBool,
    notify_shutdown: broadcast::Sender<()>,
    inbound_tx: Option<async_channel::Sender<InboundFrame>>,
}

impl Connector {
    pub fn new(config: ClientConfig) -> Arc<Connector> {
        Self::build(config, None)
    }

    /// Like [`Connector::new`], forwarding frames received from the server to `inbound_tx`.
    pub fn with_inbound(
        config: ClientConfig,
        inbound_tx: async_channel::Sender<InboundFrame>,
    ) -> Arc<Connector> {
        Self::build(config, Some(inbound_tx))
    }

    fn build(
        config: ClientConfig,
        inbound_tx: Option<async_channel::Sender<InboundFrame>>,
    ) -> Arc<Connector> {
        let (state_tx, _) = watch::channel(ConnectorState::Disconnected);
        let (notify_shutdown, _) = broadcast::channel(1);
        Arc::new(Connector {
            config,
            state_tx,
            handler: RwLock::new(None),
            attempts: AtomicU32::new(0),
            supervisor_started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            notify_shutdown,
            inbound_tx,
        })
    }

    pub fn state(&self) -> ConnectorState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectorState::Connected
    }

    /// Number of connects issued so far, including the failed ones.
    pub fn connect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Receiver observing every state transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectorState> {
        self.state_tx.subscribe()
    }

    /// Starts connecting if disconnected, then waits up to `connect_wait_ms` for the
    /// outcome and reports whether the connector is connected.
    ///
    /// A connect slower than the wait window reports `false` here and flips the state to
    /// `Connected` later; watch [`subscribe`] for the final outcome.
    ///
    /// [`subscribe`]: Connector::subscribe
    pub async fn start(self: &Arc<Self>) -> bool {
        if self.is_shut_down() {
            return false;
        }
        let mut state_rx = self.state_tx.subscribe();
        let began = self.state_tx.send_if_modified(|state| {
            if *state == ConnectorState::Disconnected {
                *state = ConnectorState::Connecting;
                true
            } else {
                false
            }
        });
        if began {
            let connector = self.clone();
            tokio::spawn(async move { connector.connect().await });
        }

        let outcome = async {
            state_rx
                .wait_for(|state| *state != ConnectorState::Connecting)
                .await
                .map(|_| ())
        };
        if time::timeout(self.config.connect_wait(), outcome).await.is_err() {
            debug!("connect to {} still pending", self.config.server_address());
        }
        self.is_connected()
    }

    async fn connect(self: Arc<Self>) {
        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        let server_address = self.config.server_address();
        info!(
            monotonic_counter.connect_attempts = 1_u64,
            "connecting to {} (attempt {})", server_address, attempt
        );
        match TcpStream::connect(&server_address).await {
            Ok(socket) => {
                if let Err(err) = self.attach(socket, attempt) {
                    self.handle_connect_error(&err);
                }
            }
            Err(err) => self.handle_connect_error(&err.into()),
        }
    }

    fn attach(self: &Arc<Self>, socket: TcpStream, id: ConnectionId) -> AppResult<()> {
        let handler =
            ConnectionHandler::new(socket, self.config.conn_read_buffer_size, self.inbound_tx.clone());
        handler.set_id(id);
        let connector = Arc::downgrade(self);
        handler.set_error_callback(move |id| {
            if let Some(connector) = connector.upgrade() {
                connector.handle_rw_error(id);
            }
        });
        self.install(&handler)?;
        info!("connect to {} ok", self.config.server_address());
        handler.start_receive_loop()
    }

    /// Makes `handler` the current connection and publishes `Connected`.
    ///
    /// The shut down flag is checked under the handler lock, which `shutdown` also takes
    /// after setting the flag, so a handler is never installed after shutdown.
    fn install(&self, handler: &Arc<ConnectionHandler>) -> AppResult<()> {
        let mut current = self.handler.write();
        if self.is_shut_down() {
            drop(current);
            handler.close();
            return Err(AppError::IllegalStateError("connector is shut down".to_string()));
        }
        *current = Some(handler.clone());
        self.state_tx.send_replace(ConnectorState::Connected);
        Ok(())
    }

    fn handle_connect_error(self: &Arc<Self>, err: &AppError) {
        error!("connect to {} failed: {}", self.config.server_address(), err);
        if let Some(handler) = self.handler.write().take() {
            handler.close();
        }
        self.state_tx.send_replace(ConnectorState::Disconnected);
        self.ensure_supervisor();
    }

    fn handle_rw_error(self: &Arc<Self>, id: ConnectionId) {
        {
            let mut current = self.handler.write();
            match current.as_ref() {
                Some(handler) if handler.id() == id => {
                    current.take();
                }
                // a stale handler from an earlier connection
                _ => return,
            }
        }
        warn!("connection {} to {} lost", id, self.config.server_address());
        self.state_tx.send_replace(ConnectorState::Disconnected);
        self.ensure_supervisor();
    }

    /// Spawns the reconnect supervisor unless it is already running.
    ///
    /// The supervisor waits for `Disconnected`, sleeps `retry_interval_ms` and calls
    /// [`start`](Connector::start) again, for as long as the connector lives. There is no
    /// backoff growth and no retry cap, a dead server is retried forever.
    fn ensure_supervisor(self: &Arc<Self>) {
        if self.is_shut_down() || self.supervisor_started.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("starting reconnect supervisor for {}", self.config.server_address());
        let connector = Arc::downgrade(self);
        let state_rx = self.state_tx.subscribe();
        let shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        let retry_interval = self.config.retry_interval();
        tokio::spawn(supervise(connector, state_rx, shutdown, retry_interval));
    }

    pub async fn send(&self, body: &[u8]) -> AppResult<()> {
        match self.current_handler() {
            Some(handler) => handler.send(body).await,
            None => {
                debug!("not connected, dropping {} bytes", body.len());
                Ok(())
            }
        }
    }

    pub fn send_async(&self, body: &[u8]) -> AppResult<()> {
        match self.current_handler() {
            Some(handler) => handler.send_async(body),
            None => {
                debug!("not connected, dropping {} bytes", body.len());
                Ok(())
            }
        }
    }

    fn current_handler(&self) -> Option<Arc<ConnectionHandler>> {
        if !self.is_connected() {
            return None;
        }
        self.handler.read().clone()
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stops the supervisor and closes the current connection.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.notify_shutdown.send(());
        if let Some(handler) = self.handler.write().take() {
            handler.close();
        }
        self.state_tx.send_replace(ConnectorState::Disconnected);
        info!("connector to {} shut down", self.config.server_address());
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("server", &self.config.server_address())
            .field("state", &self.state())
            .finish()
    }
}

async fn supervise(
    connector: Weak<Connector>,
    mut state_rx: watch::Receiver<ConnectorState>,
    mut shutdown: Shutdown,
    retry_interval: Duration,
) {
    loop {
        let disconnected = async {
            state_rx
                .wait_for(|state| *state == ConnectorState::Disconnected)
                .await
                .map(|_| ())
        };
        tokio::select! {
            res = disconnected => {
                if res.is_err() {
                    break;
                }
            }
            _ = shutdown.recv() => break,
        }
        tokio::select! {
            _ = time::sleep(retry_interval) => {}
            _ = shutdown.recv() => break,
        }

        let Some(connector) = connector.upgrade() else {
            break;
        };
        if connector.is_shut_down() {
            break;
        }
        if !connector.is_connected() {
            warn!(
                monotonic_counter.reconnect_attempts = 1_u64,
                "reconnecting to {}",
                connector.config.server_address()
            );
            connector.start().await;
        }
    }
    debug!("reconnect supervisor exited");
}
