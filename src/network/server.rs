//! Harmony Server
//!
//! Accepts client connections and serves each one with its own task. All
//! tasks share one session handler behind a mutex, so requests are applied
//! to the registry one at a time.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use super::connection::{Connection, ConnectionError};
use super::NetworkConfig;
use crate::session::{ConnId, SearchStrategy, SessionEvent, SessionHandler};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Server started
    Started { bind_addr: SocketAddr },
    /// A new connection was accepted
    ClientConnected { addr: SocketAddr, conn: ConnId },
    /// A connection ended
    ClientDisconnected {
        addr: SocketAddr,
        conn: ConnId,
        reason: String,
    },
    /// Session lifecycle change caused by a connection
    Session { addr: SocketAddr, event: SessionEvent },
    /// Server stopped
    Stopped,
    /// Error occurred
    Error { message: String },
}

/// Harmony Server
pub struct Server {
    /// Server configuration
    config: NetworkConfig,
    /// Registry and strategy shared by every connection task
    handler: Arc<Mutex<SessionHandler>>,
    /// Event sender
    event_tx: mpsc::Sender<ServerEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    /// Shutdown signal for the accept loop and connection tasks
    shutdown_tx: Option<watch::Sender<bool>>,
    /// Whether the server is running
    running: Arc<RwLock<bool>>,
    /// Address actually bound
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Create a new server
    pub fn new(config: NetworkConfig, strategy: Box<dyn SearchStrategy>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let handler = SessionHandler::new(config.max_clients, strategy);

        Self {
            config,
            handler: Arc::new(Mutex::new(handler)),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
            local_addr: None,
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Start the server and return the bound address
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let bind_addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);
        tracing::info!("Server listening on {}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        publish(&self.event_tx, ServerEvent::Started { bind_addr: local_addr });

        let handler = self.handler.clone();
        let event_tx = self.event_tx.clone();
        let running = self.running.clone();
        let max_frame_size = self.config.max_frame_size;
        let next_conn = Arc::new(AtomicU64::new(1));

        // Spawn the accept loop
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let conn = ConnId(next_conn.fetch_add(1, Ordering::Relaxed));
                                tracing::info!("New connection from {} ({})", addr, conn);

                                let handler = handler.clone();
                                let event_tx = event_tx.clone();
                                let shutdown_rx = shutdown_rx.clone();

                                tokio::spawn(async move {
                                    handle_client(
                                        stream,
                                        addr,
                                        conn,
                                        handler,
                                        event_tx,
                                        shutdown_rx,
                                        max_frame_size,
                                    ).await;
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                                publish(&event_tx, ServerEvent::Error { message: e.to_string() });
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                }
            }

            let mut running = running.write().await;
            *running = false;

            publish(&event_tx, ServerEvent::Stopped);
        });

        Ok(local_addr)
    }

    /// Stop the server and every connection task
    pub async fn stop(&mut self) -> ServerResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(ServerError::NotRunning);
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }

        let mut running = self.running.write().await;
        *running = false;

        Ok(())
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of currently registered clients
    pub async fn client_count(&self) -> usize {
        self.handler.lock().await.registry().client_count()
    }

    /// Check if the server is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

/// Events are best effort; a slow or absent consumer never stalls a session.
fn publish(event_tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) {
    if let Err(e) = event_tx.try_send(event) {
        tracing::trace!("Dropped server event: {}", e);
    }
}

/// Serve one connection until it closes, fails, or the client unregisters
async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    conn_id: ConnId,
    handler: Arc<Mutex<SessionHandler>>,
    event_tx: mpsc::Sender<ServerEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
    max_frame_size: usize,
) {
    let mut conn = Connection::new(stream, addr).with_max_frame_size(max_frame_size);

    publish(&event_tx, ServerEvent::ClientConnected { addr, conn: conn_id });

    // Strict request/response: read one message, answer it, repeat.
    let disconnect_reason = loop {
        let result = tokio::select! {
            result = conn.recv() => result,
            _ = shutdown_rx.changed() => break "Server shutting down".to_string(),
        };

        let outcome = match result {
            Ok(message) => handler.lock().await.handle(conn_id, message),
            Err(ConnectionError::Protocol(e)) => handler.lock().await.reject(conn_id, &e),
            Err(ConnectionError::Closed) => break "Connection closed".to_string(),
            Err(e) => break format!("Error: {}", e),
        };

        for event in outcome.events {
            publish(&event_tx, ServerEvent::Session { addr, event });
        }

        if let Err(e) = conn.send(&outcome.response).await {
            break format!("Send error: {}", e);
        }

        if outcome.close {
            break "Client unregistered".to_string();
        }
    };

    // Clean up
    if let Some(event) = handler.lock().await.disconnect(conn_id) {
        publish(&event_tx, ServerEvent::Session { addr, event });
    }

    let stats = conn.stats();
    tracing::info!(
        "{} ({}) disconnected: {} ({} requests, {} responses)",
        addr,
        conn_id,
        disconnect_reason,
        stats.messages_received,
        stats.messages_sent
    );
    publish(
        &event_tx,
        ServerEvent::ClientDisconnected {
            addr,
            conn: conn_id,
            reason: disconnect_reason,
        },
    );

    let _ = conn.close().await;
}
