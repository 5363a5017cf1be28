//! Request/response client for the replication transport.

use crate::config::NetworkConfig;
use crate::error::{Error, NetworkError, Result};
use crate::network::rpc::{read_frame, write_frame, Message};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Idle connections kept per peer.
const MAX_IDLE_PER_PEER: usize = 8;

/// Sends requests and waits for the matching response.
///
/// A connection carries one exchange at a time. Connections are returned to
/// a small per-peer pool after a clean exchange and discarded on any error.
#[derive(Debug)]
pub struct RpcClient {
    config: NetworkConfig,
    idle: DashMap<SocketAddr, Vec<TcpStream>>,
    next_request_id: AtomicU64,
}

impl RpcClient {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            idle: DashMap::new(),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Allocate a request id.
    pub fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send `msg` to `addr` using the configured request timeout.
    pub async fn request(&self, addr: SocketAddr, msg: Message) -> Result<Message> {
        self.request_with_timeout(addr, msg, self.config.request_timeout)
            .await
    }

    /// Send `msg` to `addr` and wait at most `timeout` for the response.
    ///
    /// A remote [`Message::Error`] is returned as [`Error::RemoteError`].
    pub async fn request_with_timeout(
        &self,
        addr: SocketAddr,
        msg: Message,
        timeout: Duration,
    ) -> Result<Message> {
        let request_id = msg.request_id();
        let kind = msg.kind();
        let mut stream = self.checkout(addr).await?;

        let exchange = async {
            write_frame(&mut stream, &msg).await?;
            read_frame(&mut stream, self.config.max_frame_bytes)
                .await?
                .ok_or(Error::Network(NetworkError::ConnectionClosed))
        };
        let response = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                debug!(%addr, request_id, kind, "Request timed out");
                return Err(Error::Timeout);
            }
        };

        if response.request_id() != request_id {
            return Err(NetworkError::ReceiveFailed(format!(
                "response id {} does not match request {}",
                response.request_id(),
                request_id
            ))
            .into());
        }

        self.checkin(addr, stream);
        trace!(%addr, request_id, kind, response = response.kind(), "Request complete");

        match response {
            Message::Error(e) => Err(e.into()),
            other => Ok(other),
        }
    }

    /// Drop pooled connections to `addr`.
    pub fn disconnect(&self, addr: &SocketAddr) {
        self.idle.remove(addr);
    }

    async fn checkout(&self, addr: SocketAddr) -> Result<TcpStream> {
        if let Some(stream) = self.idle.get_mut(&addr).and_then(|mut pool| pool.pop()) {
            return Ok(stream);
        }

        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: "connect timed out".to_string(),
            })?
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true).map_err(NetworkError::Io)?;
        debug!(%addr, "Opened connection");
        Ok(stream)
    }

    fn checkin(&self, addr: SocketAddr, stream: TcpStream) {
        let mut pool = self.idle.entry(addr).or_default();
        if pool.len() < MAX_IDLE_PER_PEER {
            pool.push(stream);
        }
    }
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new(NetworkConfig::default())
    }
}
