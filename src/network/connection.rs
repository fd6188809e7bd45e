use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_util::codec::{Encoder, FramedRead};
use tracing::{debug, error, info, trace};

use crate::network::{Frame, FrameCodec};
use crate::service::Shutdown;
use crate::{AppError, AppResult};

pub type ConnectionId = u32;

/// Invoked once with the connection id after the handler has been torn down.
pub type ErrorCallback = Box<dyn FnOnce(ConnectionId) + Send + 'static>;

/// A frame received on a connection, handed to the application side.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub connection_id: ConnectionId,
    pub frame: Frame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Idle,
    Reading,
    Closed,
}

struct Outbound {
    bytes: Bytes,
    ack: Option<oneshot::Sender<AppResult<()>>>,
}

/// Owns one TCP socket and drives its read and write sides.
///
/// The read half lives in a dedicated read task once [`start_receive_loop`] is called,
/// the write half lives in a writer task fed through a queue. Every fault on either side
/// goes through one error path which closes the socket and fires the error callback at
/// most once. A closed handler is never reused.
///
/// [`start_receive_loop`]: ConnectionHandler::start_receive_loop
pub struct ConnectionHandler {
    id: AtomicU32,
    peer_addr: Option<SocketAddr>,
    state: Mutex<HandlerState>,
    reader: Mutex<Option<OwnedReadHalf>>,
    read_buffer_size: usize,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    notify_close: broadcast::Sender<()>,
    error_callback: Mutex<Option<ErrorCallback>>,
    inbound_tx: Option<async_channel::Sender<InboundFrame>>,
}

impl ConnectionHandler {
    /// Takes ownership of `socket` and spawns its writer task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        socket: TcpStream,
        read_buffer_size: usize,
        inbound_tx: Option<async_channel::Sender<InboundFrame>>,
    ) -> Arc<ConnectionHandler> {
        let peer_addr = socket.peer_addr().ok();
        let (reader, writer) = socket.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (notify_close, _) = broadcast::channel(1);
        let writer_shutdown = Shutdown::new(notify_close.subscribe());

        let handler = Arc::new(ConnectionHandler {
            id: AtomicU32::new(0),
            peer_addr,
            state: Mutex::new(HandlerState::Idle),
            reader: Mutex::new(Some(reader)),
            read_buffer_size,
            outbound_tx,
            notify_close,
            error_callback: Mutex::new(None),
            inbound_tx,
        });

        tokio::spawn(write_loop(
            Arc::downgrade(&handler),
            BufWriter::new(writer),
            outbound_rx,
            writer_shutdown,
        ));
        handler
    }

    pub fn id(&self) -> ConnectionId {
        self.id.load(Ordering::Acquire)
    }

    pub fn set_id(&self, id: ConnectionId) {
        self.id.store(id, Ordering::Release);
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn state(&self) -> HandlerState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == HandlerState::Closed
    }

    pub fn set_error_callback<F>(&self, callback: F)
    where
        F: FnOnce(ConnectionId) + Send + 'static,
    {
        *self.error_callback.lock() = Some(Box::new(callback));
    }

    /// Starts the continuous read loop: `Idle -> Reading`.
    ///
    /// Every complete frame is logged and forwarded to the inbound channel. The loop ends
    /// on the first transport or framing error, on peer close, or on [`close`], and the
    /// handler is terminal afterwards.
    ///
    /// [`close`]: ConnectionHandler::close
    pub fn start_receive_loop(self: &Arc<Self>) -> AppResult<()> {
        let (reader, shutdown) = {
            let mut state = self.state.lock();
            if *state != HandlerState::Idle {
                return Err(AppError::IllegalStateError(format!(
                    "connection {} cannot start reading in state {:?}",
                    self.id(),
                    *state
                )));
            }
            let reader = self.reader.lock().take().ok_or_else(|| {
                AppError::IllegalStateError(format!("connection {} has no read half", self.id()))
            })?;
            // subscribe under the state lock so a concurrent close() cannot be missed
            let shutdown = Shutdown::new(self.notify_close.subscribe());
            *state = HandlerState::Reading;
            (reader, shutdown)
        };

        let handler = self.clone();
        tokio::spawn(async move { handler.read_loop(reader, shutdown).await });
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, reader: OwnedReadHalf, mut shutdown: Shutdown) {
        let mut frames = FramedRead::with_capacity(reader, FrameCodec, self.read_buffer_size);
        loop {
            let next = tokio::select! {
                next = frames.next() => next,
                _ = shutdown.recv() => {
                    debug!("connection {} read loop stopped after local close", self.id());
                    self.fire_error_callback();
                    return;
                }
            };

            match next {
                Some(Ok(frame)) => {
                    if !self.dispatch(frame, &mut shutdown).await {
                        debug!("connection {} closed while delivering a frame", self.id());
                        self.fire_error_callback();
                        return;
                    }
                }
                Some(Err(err)) => {
                    self.handle_error(&err);
                    return;
                }
                None => {
                    self.handle_error(&AppError::ConnectionClosed(self.id()));
                    return;
                }
            }
        }
    }

    /// Logs `frame` and hands it to the inbound channel. Returns `false` if the handler
    /// was closed while waiting for room in a full channel.
    async fn dispatch(&self, frame: Frame, shutdown: &mut Shutdown) -> bool {
        let connection_id = self.id();
        info!(
            monotonic_counter.frames_received = 1_u64,
            "connection {} received {} bytes: {}",
            connection_id,
            frame.body_length(),
            String::from_utf8_lossy(frame.body())
        );
        let Some(inbound_tx) = &self.inbound_tx else {
            return true;
        };
        let inbound = InboundFrame {
            connection_id,
            frame,
        };
        tokio::select! {
            sent = inbound_tx.send(inbound) => {
                if sent.is_err() {
                    trace!("inbound receiver dropped, frame on connection {} discarded", connection_id);
                }
                true
            }
            _ = shutdown.recv() => false,
        }
    }

    /// Queues `body` as one frame and waits until it has been written and flushed.
    ///
    /// A write failure tears the connection down through the error path and is also
    /// returned to the caller.
    pub async fn send(&self, body: &[u8]) -> AppResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.enqueue(body, Some(ack_tx))?;
        ack_rx
            .await
            .map_err(|_| AppError::ConnectionClosed(self.id()))?
    }

    /// Queues `body` as one frame without waiting for the write to complete.
    pub fn send_async(&self, body: &[u8]) -> AppResult<()> {
        self.enqueue(body, None)
    }

    fn enqueue(&self, body: &[u8], ack: Option<oneshot::Sender<AppResult<()>>>) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppError::ConnectionClosed(self.id()));
        }
        let mut buffer = BytesMut::new();
        FrameCodec.encode(body, &mut buffer)?;
        self.outbound_tx
            .send(Outbound {
                bytes: buffer.freeze(),
                ack,
            })
            .map_err(|_| AppError::ConnectionClosed(self.id()))
    }

    /// Moves the handler to `Closed` and tells both socket tasks to stop.
    ///
    /// The writer task shuts down the send direction before dropping its half. Calling
    /// this more than once has no further effect.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == HandlerState::Closed {
                return;
            }
            *state = HandlerState::Closed;
        }
        debug!("closing connection {}", self.id());
        // an idle handler still holds its read half
        drop(self.reader.lock().take());
        let _ = self.notify_close.send(());
    }

    fn handle_error(&self, err: &AppError) {
        match err {
            AppError::ConnectionClosed(_) => info!("connection {} closed by peer", self.id()),
            _ => error!("connection {} error: {}", self.id(), err),
        }
        self.close();
        self.fire_error_callback();
    }

    fn fire_error_callback(&self) {
        let callback = self.error_callback.lock().take();
        if let Some(callback) = callback {
            callback(self.id());
        }
    }
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("id", &self.id())
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        debug!("connection handler {} dropped", self.id());
    }
}

async fn write_loop(
    handler: Weak<ConnectionHandler>,
    mut writer: BufWriter<OwnedWriteHalf>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    mut shutdown: Shutdown,
) {
    loop {
        let outbound = tokio::select! {
            outbound = outbound_rx.recv() => match outbound {
                Some(outbound) => outbound,
                // handler dropped
                None => break,
            },
            _ = shutdown.recv() => break,
        };

        let result = match writer.write_all(&outbound.bytes).await {
            Ok(()) => writer.flush().await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                trace!("wrote {} bytes", outbound.bytes.len());
                if let Some(ack) = outbound.ack {
                    let _ = ack.send(Ok(()));
                }
            }
            Err(err) => {
                let message = format!("write error: {}", err);
                if let Some(ack) = outbound.ack {
                    let _ = ack.send(Err(AppError::DetailedIoError(message.clone())));
                }
                if let Some(handler) = handler.upgrade() {
                    handler.handle_error(&AppError::DetailedIoError(message));
                }
                break;
            }
        }
    }
    // shut down the send direction, the socket closes once both halves are dropped
    if let Err(err) = writer.shutdown().await {
        trace!("shutdown of write half failed: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::time;

    use super::*;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        time::timeout(Duration::from_secs(5), async {
            while !condition() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn frames_reach_inbound_channel() {
        let (client, server) = socket_pair().await;
        let (inbound_tx, inbound_rx) = async_channel::unbounded();
        let handler = ConnectionHandler::new(server, 1024, Some(inbound_tx));
        handler.set_id(7);
        handler.start_receive_loop().unwrap();
        assert_eq!(handler.state(), HandlerState::Reading);

        let peer = ConnectionHandler::new(client, 1024, None);
        peer.send(b"ping").await.unwrap();
        peer.send_async(b"pong").unwrap();

        let first = inbound_rx.recv().await.unwrap();
        assert_eq!(first.connection_id, 7);
        assert_eq!(first.frame.body(), b"ping");
        let second = inbound_rx.recv().await.unwrap();
        assert_eq!(second.frame.body(), b"pong");
    }

    #[tokio::test]
    async fn peer_close_fires_callback_once() {
        let (client, server) = socket_pair().await;
        let handler = ConnectionHandler::new(server, 1024, None);
        handler.set_id(3);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        handler.set_error_callback(move |id| {
            assert_eq!(id, 3);
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        handler.start_receive_loop().unwrap();

        drop(client);
        wait_until(|| fired.load(Ordering::SeqCst) == 1).await;
        assert_eq!(handler.state(), HandlerState::Closed);

        // later faults and closes do not fire again
        handler.close();
        assert!(handler.send(b"late").await.is_err());
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn local_close_is_idempotent_and_closes_socket() {
        let (mut client, server) = socket_pair().await;
        let handler = ConnectionHandler::new(server, 1024, None);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        handler.set_error_callback(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        handler.start_receive_loop().unwrap();

        handler.close();
        handler.close();
        wait_until(|| fired.load(Ordering::SeqCst) == 1).await;

        // the peer observes end of stream
        let mut buf = [0u8; 8];
        let read = time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);
        assert!(handler.start_receive_loop().is_err());
    }

    #[tokio::test]
    async fn malformed_header_closes_connection() {
        let (mut client, server) = socket_pair().await;
        let handler = ConnectionHandler::new(server, 1024, None);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        handler.set_error_callback(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        handler.start_receive_loop().unwrap();

        client.write_all(b"9999junk").await.unwrap();
        wait_until(|| fired.load(Ordering::SeqCst) == 1).await;
        assert!(handler.is_closed());
    }

    #[tokio::test]
    async fn close_while_inbound_channel_full_fires_callback() {
        let (mut client, server) = socket_pair().await;
        // capacity 1 and never drained: the second frame blocks delivery
        let (inbound_tx, inbound_rx) = async_channel::bounded(1);
        let handler = ConnectionHandler::new(server, 1024, Some(inbound_tx));
        handler.set_id(5);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        handler.set_error_callback(move |id| {
            assert_eq!(id, 5);
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        handler.start_receive_loop().unwrap();

        client.write_all(b"   1a   1b   1c").await.unwrap();
        wait_until(|| inbound_rx.is_full()).await;
        time::sleep(Duration::from_millis(50)).await;

        handler.close();
        wait_until(|| fired.load(Ordering::SeqCst) == 1).await;
        assert_eq!(inbound_rx.len(), 1);
    }
}
