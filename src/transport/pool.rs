//! Outbound connection pool.
//!
//! Idle TCP connections are kept per `(host, port)` and checked out
//! exclusively. Before a pooled connection is handed out it is probed with a
//! non-blocking read: a live idle socket has nothing to read, while a socket
//! the peer has closed reports EOF. Entries idle longer than the idle timeout
//! are swept lazily on the next acquire for that peer.

use crate::utils::{MessengerConfig, NetworkError, Result};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

type PeerKey = (String, u16);

/// A checked-out TCP connection
#[derive(Debug)]
pub struct PooledConnection {
    stream: TcpStream,
    last_used: Instant,
    reused: bool,
}

impl PooledConnection {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            last_used: Instant::now(),
            reused: false,
        }
    }

    /// The underlying stream
    pub fn stream(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Whether this connection came out of the pool rather than a fresh connect
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    fn is_alive(&self) -> bool {
        let mut probe = [0u8; 1];
        match self.stream.try_read(&mut probe) {
            Err(e) if e.kind() == ErrorKind::WouldBlock => true,
            // EOF, unsolicited bytes or a socket error
            _ => false,
        }
    }
}

/// Per-peer pool of idle outbound connections
pub struct ConnectionPool {
    peers: Mutex<HashMap<PeerKey, Arc<Mutex<Vec<PooledConnection>>>>>,
    max_per_peer: usize,
    idle_timeout: Duration,
    connect_timeout: Duration,
}

impl ConnectionPool {
    /// Create a pool
    pub fn new(max_per_peer: usize, idle_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            max_per_peer,
            idle_timeout,
            connect_timeout,
        }
    }

    /// Create a pool from the `pool` and `network` config sections
    pub fn from_config(config: &MessengerConfig) -> Self {
        Self::new(
            config.pool.max_connections_per_peer,
            config.pool.idle_timeout(),
            config.network.connect_timeout(),
        )
    }

    /// Check out a live connection to `host:port`, connecting if none is pooled
    pub async fn acquire(&self, host: &str, port: u16) -> Result<PooledConnection> {
        if let Some(conn) = self.checkout(host, port) {
            log::debug!("Reusing pooled connection to {}:{}", host, port);
            return Ok(conn);
        }
        self.acquire_fresh(host, port).await
    }

    /// Always open a new connection, bypassing the pool
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::Timeout` if the connect exceeds the connect
    /// timeout and `NetworkError::ConnectionFailed` if it is refused.
    pub async fn acquire_fresh(&self, host: &str, port: u16) -> Result<PooledConnection> {
        let address = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| NetworkError::Timeout {
                operation: format!("connect to {}", address),
            })?
            .map_err(|e| NetworkError::ConnectionFailed {
                peer: address.clone(),
                reason: e.to_string(),
            })?;

        stream.set_nodelay(true).map_err(|e| NetworkError::Transport {
            reason: e.to_string(),
        })?;

        log::debug!("Opened connection to {}", address);
        Ok(PooledConnection::new(stream))
    }

    /// Return a connection after use
    ///
    /// Healthy connections are kept while the peer's pool has room; anything
    /// else is closed.
    pub fn release(&self, host: &str, port: u16, mut conn: PooledConnection, healthy: bool) {
        if !healthy {
            return;
        }
        let slot = self.slot(host, port);
        let mut idle = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_per_peer {
            conn.last_used = Instant::now();
            conn.reused = false;
            idle.push(conn);
        }
    }

    /// Number of idle connections held for `host:port`
    pub fn pooled_count(&self, host: &str, port: u16) -> usize {
        let peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        peers
            .get(&(host.to_string(), port))
            .map(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).len())
            .unwrap_or(0)
    }

    /// Close every pooled connection
    pub fn close_all(&self) {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        let closed: usize = peers
            .drain()
            .map(|(_, slot)| slot.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum();
        log::debug!("Closed {} pooled connections", closed);
    }

    fn slot(&self, host: &str, port: u16) -> Arc<Mutex<Vec<PooledConnection>>> {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(peers.entry((host.to_string(), port)).or_default())
    }

    fn checkout(&self, host: &str, port: u16) -> Option<PooledConnection> {
        let slot = self.slot(host, port);
        let mut idle = slot.lock().unwrap_or_else(PoisonError::into_inner);

        let before = idle.len();
        idle.retain(|conn| conn.last_used.elapsed() < self.idle_timeout);
        if idle.len() < before {
            log::debug!("Swept {} idle connections to {}:{}", before - idle.len(), host, port);
        }

        // Freshest last
        while let Some(mut conn) = idle.pop() {
            if conn.is_alive() {
                conn.reused = true;
                return Some(conn);
            }
            log::debug!("Dropping dead pooled connection to {}:{}", host, port);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::MessengerError;
    use tokio::net::TcpListener;

    /// Accept connections and hold them open until the listener task is aborted
    async fn holding_server() -> (u16, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        (port, handle)
    }

    fn pool() -> ConnectionPool {
        ConnectionPool::new(3, Duration::from_secs(30), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_pool_bound_per_peer() {
        let (port, server) = holding_server().await;
        let pool = pool();

        let mut conns = Vec::new();
        for _ in 0..5 {
            conns.push(pool.acquire("127.0.0.1", port).await.unwrap());
        }
        for conn in conns {
            pool.release("127.0.0.1", port, conn, true);
        }
        assert_eq!(pool.pooled_count("127.0.0.1", port), 3);

        let conn = pool.acquire("127.0.0.1", port).await.unwrap();
        assert!(conn.is_reused());
        assert_eq!(pool.pooled_count("127.0.0.1", port), 2);

        pool.release("127.0.0.1", port, conn, false);
        assert_eq!(pool.pooled_count("127.0.0.1", port), 2);

        pool.close_all();
        assert_eq!(pool.pooled_count("127.0.0.1", port), 0);
        server.abort();
    }

    #[tokio::test]
    async fn test_dead_connection_not_reused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let pool = pool();

        let conn = pool.acquire("127.0.0.1", port).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        pool.release("127.0.0.1", port, conn, true);

        drop(accepted);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let conn = pool.acquire("127.0.0.1", port).await.unwrap();
        assert!(!conn.is_reused());
    }

    #[tokio::test]
    async fn test_idle_connections_swept() {
        let (port, server) = holding_server().await;
        let pool = ConnectionPool::new(3, Duration::ZERO, Duration::from_secs(2));

        let conn = pool.acquire("127.0.0.1", port).await.unwrap();
        pool.release("127.0.0.1", port, conn, true);
        assert_eq!(pool.pooled_count("127.0.0.1", port), 1);

        let conn = pool.acquire("127.0.0.1", port).await.unwrap();
        assert!(!conn.is_reused());
        assert_eq!(pool.pooled_count("127.0.0.1", port), 0);
        server.abort();
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let err = pool().acquire("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, MessengerError::Network(NetworkError::ConnectionFailed { .. })));
        assert!(err.is_recoverable());
    }
}
