//! Lobby TCP Server
//!
//! Accepts client connections and gives each one a [`Session`] with its own
//! send and receive tasks. All sessions share one [`LobbyHandler`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::network::handlers::LobbyHandler;
use crate::network::session::{run_recv_loop, run_send_loop, Session, SessionId};
use crate::network::transport::tcp_transport;

/// Lobby server errors.
#[derive(Debug, thiserror::Error)]
pub enum LobbyServerError {
    /// Failed to bind or accept.
    #[error("Failed to bind: {0}")]
    Bind(#[from] std::io::Error),

    /// Configuration rejected.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// The lobby server.
pub struct LobbyServer {
    config: ServerConfig,
    handler: Arc<LobbyHandler>,
    sessions: Arc<DashMap<SessionId, Arc<Session>>>,
    next_session_id: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl LobbyServer {
    /// Create a server; nothing is bound until [`run`](Self::run).
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            handler: Arc::new(LobbyHandler::new(&config)),
            config,
            sessions: Arc::new(DashMap::new()),
            next_session_id: AtomicU64::new(1),
            shutdown_tx,
        }
    }

    /// Shared lobby state.
    pub fn handler(&self) -> &Arc<LobbyHandler> {
        &self.handler
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), LobbyServerError> {
        self.config.validate()?;
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    #[instrument(skip(self, listener), fields(addr = ?listener.local_addr().ok()))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), LobbyServerError> {
        info!("Lobby server listening");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.sessions.len() >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        // Each receive loop finishes its current handler, then departs.
        for entry in self.sessions.iter() {
            entry.value().close();
        }
        Ok(())
    }

    /// Spawn the send and receive tasks for a new connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        if let Err(e) = stream.set_nodelay(true) {
            debug!(session = %id, "Failed to set TCP_NODELAY: {}", e);
        }

        let (session, queue) = Session::new(id, &self.config);
        let (sink, source) = tcp_transport(stream);
        self.sessions.insert(id, Arc::clone(&session));
        info!(session = %id, "New connection from {}", addr);

        tokio::spawn(run_send_loop(
            Arc::clone(&session),
            queue,
            sink,
            self.config.send_tick(),
        ));

        let handler = Arc::clone(&self.handler);
        let sessions = Arc::clone(&self.sessions);
        let recv_tick = self.config.recv_tick();

        tokio::spawn(async move {
            run_recv_loop(Arc::clone(&session), source, handler, recv_tick).await;
            sessions.remove(&session.id());
            debug!(session = %session.id(), "Session removed");
        });
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Live connection count.
    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }
}
