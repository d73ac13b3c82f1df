//! Reconnecting websocket transport for control messages.
//!
//! One logical connection at a time: a sender loop pairs the latest known
//! socket with the next buffered outbound frame, while a reconnect loop
//! recreates the socket after it becomes absent, rate limited to one
//! attempt per configured window. Socket-level failures surface as state
//! transitions; only cancellation ends the channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::SignalingConfig;
use crate::error::{Error, Result};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type SharedSink = Arc<Mutex<WsSink>>;

/// Signaling transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Reconnecting,
    /// The channel was cancelled or torn down and will not reconnect.
    Down,
}

/// Reconnecting duplex byte-stream connection to the signaling server.
pub struct SignalingChannel {
    config: SignalingConfig,
    state_tx: watch::Sender<ConnectionState>,
    socket_tx: watch::Sender<Option<SharedSink>>,
    inbound_tx: broadcast::Sender<Bytes>,
    sockets_created: AtomicU64,
}

impl SignalingChannel {
    pub fn new(config: SignalingConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (socket_tx, _) = watch::channel(None);
        let (inbound_tx, _) = broadcast::channel(config.inbound_buffer);
        Self {
            config,
            state_tx,
            socket_tx,
            inbound_tx,
            sockets_created: AtomicU64::new(0),
        }
    }

    /// Observable connection state.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to inbound frames. The buffer keeps the newest frames and
    /// drops the oldest on overflow; a lagging subscriber observes the gap
    /// as a `Lagged` error and continues.
    pub fn inbound(&self) -> broadcast::Receiver<Bytes> {
        self.inbound_tx.subscribe()
    }

    /// Number of underlying sockets created so far.
    pub fn sockets_created(&self) -> u64 {
        self.sockets_created.load(Ordering::Relaxed)
    }

    /// Open the duplex connection and run until cancelled or until the
    /// outbound queue closes. Either inner loop ending takes the other
    /// down with it and leaves the channel in the `Down` state.
    pub async fn run(&self, url: String, outbound: mpsc::UnboundedReceiver<Bytes>) -> Result<()> {
        let result = tokio::select! {
            r = self.sender_loop(outbound) => r,
            r = self.reconnect_loop(&url) => r,
        };
        self.shutdown();
        result
    }

    /// Drop the current socket and mark the channel permanently down.
    /// Called by `run` on the way out and by owners whose scope unwinds
    /// without the run loop observing its own cancellation.
    pub fn shutdown(&self) {
        self.socket_tx.send_replace(None);
        self.state_tx.send_replace(ConnectionState::Down);
        info!("signaling channel is down");
    }

    /// Send one frame, waiting up to the configured timeout for a usable
    /// socket.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        let sink = tokio::time::timeout(self.config.send_timeout, self.current_socket())
            .await
            .map_err(|_| Error::Timeout("signaling socket"))??;
        let result = sink
            .lock()
            .await
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| Error::Signaling(e.to_string()));
        result
    }

    /// Drain the outbound queue in order, always against the latest known
    /// socket. A failed send is retried on the next socket so enqueue
    /// order is preserved.
    async fn sender_loop(&self, mut outbound: mpsc::UnboundedReceiver<Bytes>) -> Result<()> {
        while let Some(frame) = outbound.recv().await {
            loop {
                let mut socket_rx = self.socket_tx.subscribe();
                let sink = self.current_socket().await?;
                let sent = sink
                    .lock()
                    .await
                    .send(Message::Binary(frame.to_vec()))
                    .await;
                match sent {
                    Ok(()) => break,
                    Err(e) => {
                        warn!("send failed on current socket, waiting for the next one: {}", e);
                        // the reconnect loop replaces the socket; block
                        // until it changes rather than spinning
                        if socket_rx.changed().await.is_err() {
                            return Err(Error::Signaling("socket stream closed".to_string()));
                        }
                    }
                }
            }
        }
        debug!("outbound queue closed, sender loop ending");
        Ok(())
    }

    /// Create the initial socket immediately, then recreate one only after
    /// the current socket became absent and the rate-limit window elapsed.
    async fn reconnect_loop(&self, url: &str) -> Result<()> {
        loop {
            self.sockets_created.fetch_add(1, Ordering::Relaxed);
            match connect_async(url).await {
                Ok((socket, _response)) => {
                    info!("signaling socket opened");
                    let (sink, mut stream) = socket.split();
                    self.socket_tx.send_replace(Some(Arc::new(Mutex::new(sink))));
                    self.state_tx.send_replace(ConnectionState::Connected);

                    while let Some(message) = stream.next().await {
                        match message {
                            Ok(Message::Binary(data)) => {
                                let _ = self.inbound_tx.send(Bytes::from(data));
                            }
                            Ok(Message::Text(text)) => {
                                let _ = self.inbound_tx.send(Bytes::from(text.into_bytes()));
                            }
                            Ok(Message::Close(frame)) => {
                                debug!("signaling socket closed by server: {:?}", frame);
                                break;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!("signaling socket error: {}", e);
                                break;
                            }
                        }
                    }

                    self.socket_tx.send_replace(None);
                    self.state_tx.send_replace(ConnectionState::Reconnecting);
                    info!("signaling socket is gone, reconnecting");
                }
                Err(e) => {
                    warn!("failed to open signaling socket: {}", e);
                    self.state_tx.send_replace(ConnectionState::Reconnecting);
                }
            }

            tokio::time::sleep(self.config.reconnect_window).await;
        }
    }

    /// Latest known socket, waiting while none is current.
    async fn current_socket(&self) -> Result<SharedSink> {
        let mut socket_rx = self.socket_tx.subscribe();
        loop {
            if let Some(sink) = socket_rx.borrow_and_update().clone() {
                return Ok(sink);
            }
            socket_rx
                .changed()
                .await
                .map_err(|_| Error::Signaling("socket stream closed".to_string()))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Accepts websocket connections, counts them, and behaves per
    /// `hold_open`: either drops the socket right after the handshake or
    /// echoes frames back.
    async fn spawn_server(accepts: Arc<AtomicUsize>, hold_open: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let accepts = Arc::clone(&accepts);
                tokio::spawn(async move {
                    if let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await {
                        accepts.fetch_add(1, Ordering::SeqCst);
                        if hold_open {
                            while let Some(Ok(msg)) = socket.next().await {
                                if msg.is_binary() || msg.is_text() {
                                    let _ = socket.send(msg).await;
                                }
                            }
                        }
                    }
                });
            }
        });
        format!("ws://{}", addr)
    }

    fn test_config(window_ms: u64) -> SignalingConfig {
        SignalingConfig {
            reconnect_window: Duration::from_millis(window_ms),
            ..SignalingConfig::default()
        }
    }

    #[tokio::test]
    async fn test_reconnect_respects_rate_limit() {
        let accepts = Arc::new(AtomicUsize::new(0));
        let url = spawn_server(Arc::clone(&accepts), false).await;

        let channel = Arc::new(SignalingChannel::new(test_config(400)));
        let (_outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let runner = Arc::clone(&channel);
        let run = tokio::spawn(async move { runner.run(url, outbound_rx).await });

        // initial socket is created immediately and dropped by the server
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(accepts.load(Ordering::SeqCst), 1);

        // exactly one new socket once the window elapses
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(accepts.load(Ordering::SeqCst), 2);

        run.abort();
    }

    #[tokio::test]
    async fn test_round_trip_and_connection_state() {
        let accepts = Arc::new(AtomicUsize::new(0));
        let url = spawn_server(Arc::clone(&accepts), true).await;

        let channel = Arc::new(SignalingChannel::new(test_config(5_000)));
        let mut state = channel.connection_state();
        let mut inbound = channel.inbound();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let runner = Arc::clone(&channel);
        let run = tokio::spawn(async move { runner.run(url, outbound_rx).await });

        // wait for connected
        while *state.borrow_and_update() != ConnectionState::Connected {
            state.changed().await.unwrap();
        }

        outbound_tx.send(Bytes::from_static(b"hello")).unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .expect("echo before timeout")
            .unwrap();
        assert_eq!(echoed.as_ref(), b"hello");

        // closing the outbound queue ends the channel and drives it down
        drop(outbound_tx);
        let _ = tokio::time::timeout(Duration::from_secs(5), run).await;
        assert_eq!(*channel.connection_state().borrow(), ConnectionState::Down);
    }
}
