//! TCP server dispatching replication requests to registered handlers.

use crate::error::{Error, NetworkError, Result};
use crate::network::rpc::{read_frame, write_frame, Message};
use crate::types::NodeId;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Handler for incoming messages.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle an incoming message and optionally return a response.
    async fn handle(&self, msg: Message) -> Option<Message>;
}

/// Routes requests to handlers by action name.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<&'static str, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `action`, replacing any previous binding.
    pub fn register(&self, action: &'static str, handler: Arc<dyn MessageHandler>) {
        if self.handlers.insert(action, handler).is_some() {
            warn!(action, "Replaced request handler");
        } else {
            debug!(action, "Registered request handler");
        }
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// Registered action names, sorted.
    pub fn actions(&self) -> Vec<&'static str> {
        let mut actions: Vec<_> = self.handlers.iter().map(|e| *e.key()).collect();
        actions.sort_unstable();
        actions
    }
}

#[async_trait::async_trait]
impl MessageHandler for HandlerRegistry {
    async fn handle(&self, msg: Message) -> Option<Message> {
        let request_id = msg.request_id();
        let Some(action) = msg.action() else {
            debug!(kind = msg.kind(), "Dropping response received as request");
            return None;
        };

        // Clone out of the map so the shard lock is not held across the await.
        let handler = self.handlers.get(action).map(|h| h.value().clone());
        match handler {
            Some(handler) => handler.handle(msg).await,
            None => Some(Message::error(
                request_id,
                &Error::Internal(format!("no handler registered for {}", action)),
            )),
        }
    }
}

/// TCP server for the replication transport.
pub struct NetworkServer {
    /// Listener bound at construction.
    listener: TcpListener,

    /// This node's ID.
    node_id: NodeId,

    /// Message handler.
    handler: Arc<dyn MessageHandler>,

    max_frame_bytes: usize,

    /// Shutdown signal receiver.
    shutdown_rx: mpsc::Receiver<()>,
}

impl NetworkServer {
    /// Bind a new network server.
    pub async fn bind(
        bind_addr: SocketAddr,
        node_id: NodeId,
        handler: Arc<dyn MessageHandler>,
        max_frame_bytes: usize,
    ) -> Result<(Self, mpsc::Sender<()>)> {
        let listener = TcpListener::bind(bind_addr).await.map_err(NetworkError::Io)?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let server = Self {
            listener,
            node_id,
            handler,
            max_frame_bytes,
            shutdown_rx,
        };

        Ok((server, shutdown_tx))
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(NetworkError::Io)?)
    }

    /// Run the server.
    pub async fn run(mut self) -> Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), node_id = self.node_id, "Network server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let handler = self.handler.clone();
                            let max_frame_bytes = self.max_frame_bytes;
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler, max_frame_bytes).await {
                                    debug!(error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Network server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        mut stream: TcpStream,
        handler: Arc<dyn MessageHandler>,
        max_frame_bytes: usize,
    ) -> Result<()> {
        stream.set_nodelay(true).map_err(NetworkError::Io)?;
        while let Some(msg) = read_frame(&mut stream, max_frame_bytes).await? {
            if let Some(response) = handler.handle(msg).await {
                write_frame(&mut stream, &response).await?;
            }
        }
        Ok(())
    }
}
