//! Ledger server and verifier link over WebSocket
//!
//! Servers run LedgerServer, verifiers connect with PeerLink. Every protocol
//! message travels as one binary frame holding its borsh encoding.

use crate::session::Session;
use crate::types::Message;
use crate::CHANNEL_CAPACITY;
use futures_util::{SinkExt, StreamExt};
use ledger_forest::{Forest, NodeStore};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message as Frame};

/// Serves one forest to any number of verifiers, one session per connection
pub struct LedgerServer<S: NodeStore> {
    forest: Arc<Forest<S>>,
    /// Currently open connections
    connections: Arc<AtomicUsize>,
}

impl<S: NodeStore + 'static> LedgerServer<S> {
    pub fn new(forest: Arc<Forest<S>>) -> Self {
        Self {
            forest,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of connected verifiers
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Bind and accept connections in the background, returning the bound address
    pub async fn start(&self, addr: &str) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tracing::info!("Ledger server listening on {}", local);

        tokio::spawn(accept_loop(listener, self.forest.clone(), self.connections.clone()));
        Ok(local)
    }

    /// Bind and accept connections until the listener fails
    pub async fn run(&self, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Ledger server listening on {}", listener.local_addr()?);

        accept_loop(listener, self.forest.clone(), self.connections.clone()).await;
        Ok(())
    }
}

async fn accept_loop<S: NodeStore + 'static>(
    listener: TcpListener,
    forest: Arc<Forest<S>>,
    connections: Arc<AtomicUsize>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                tracing::info!("Verifier connected from {}", peer_addr);
                let forest = forest.clone();
                let connections = connections.clone();

                tokio::spawn(async move {
                    connections.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = handle_connection(stream, forest).await {
                        tracing::warn!("Connection error from {}: {}", peer_addr, e);
                    }
                    connections.fetch_sub(1, Ordering::Relaxed);
                    tracing::info!("Verifier {} disconnected", peer_addr);
                });
            }
            Err(e) => {
                tracing::error!("Accept error: {}", e);
            }
        }
    }
}

async fn handle_connection<S: NodeStore + 'static>(
    stream: TcpStream,
    forest: Arc<Forest<S>>,
) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (inbound_tx, inbound_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);
    let session = tokio::spawn(Session::new(forest, inbound_rx, outbound_tx).run());

    // Forward session replies to the verifier
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if ws_sender.send(Frame::Binary(msg.to_bytes())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Frame::Binary(data)) => match Message::from_bytes(&data) {
                Ok(msg) => {
                    if inbound_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("Dropping undecodable frame: {}", e),
            },
            Ok(Frame::Close(_)) => break,
            Err(e) => {
                tracing::warn!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    // Closing the inbound channel ends the session, which ends the sender
    drop(inbound_tx);
    match session.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Session failed: {}", e),
        Err(e) => tracing::error!("Session task failed: {}", e),
    }
    let _ = send_task.await;
    Ok(())
}

/// Verifier-side connection to a ledger server
pub struct PeerLink {
    /// Messages to the remote session
    to: mpsc::Sender<Message>,
    /// Messages from the remote session
    from: mpsc::Receiver<Message>,
}

impl PeerLink {
    /// Connect to a ledger server
    pub async fn connect(addr: &str) -> anyhow::Result<Self> {
        let url = format!("ws://{}", addr);
        let (ws_stream, _) = connect_async(&url).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        tracing::info!("Connected to ledger server at {}", addr);

        let (from_tx, from) = mpsc::channel::<Message>(CHANNEL_CAPACITY);
        let (to, mut to_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);

        // Spawn receiver task
        let server = addr.to_string();
        tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                match frame {
                    Ok(Frame::Binary(data)) => match Message::from_bytes(&data) {
                        Ok(msg) => {
                            if from_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            // Closing the channel makes the verifier score this peer as disconnected
                            tracing::warn!("Undecodable frame from {}, closing link: {}", server, e);
                            break;
                        }
                    },
                    Ok(Frame::Close(_)) => {
                        tracing::debug!("Ledger server {} closed the connection", server);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("WebSocket error from {}: {}", server, e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        // Spawn sender task
        tokio::spawn(async move {
            while let Some(msg) = to_rx.recv().await {
                if ws_sender.send(Frame::Binary(msg.to_bytes())).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        Ok(Self { to, from })
    }

    /// Channel ends to hand to a `Verifier`
    pub fn split(self) -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
        (self.to, self.from)
    }
}
