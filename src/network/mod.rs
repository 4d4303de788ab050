//! Network module - Handles TCP communication between clients and the server
//!
//! Provides:
//! - Server for accepting client connections and serving sessions
//! - Tuning client for registering and exchanging variables
//! - Length-prefixed message framing shared by both sides

mod client;
mod connection;
mod server;

pub use client::*;
pub use connection::*;
pub use server::*;

use std::net::SocketAddr;
use std::time::Duration;

/// Largest frame accepted by default (1 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Port to listen on or connect to
    pub port: u16,
    /// Address the server binds to
    pub bind_address: String,
    /// Size of the client id pool
    pub max_clients: u32,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Client read timeout in milliseconds (0 waits forever)
    pub read_timeout_ms: u64,
    /// Maximum frame size
    pub max_frame_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: crate::protocol::DEFAULT_PORT,
            bind_address: "0.0.0.0".to_string(),
            max_clients: 1024,
            connect_timeout_ms: 5000,
            read_timeout_ms: 30_000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl NetworkConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    pub fn with_max_clients(mut self, max_clients: u32) -> Self {
        self.max_clients = max_clients;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_timeout_zero_disables() {
        let mut config = NetworkConfig::default();
        assert_eq!(config.read_timeout(), Some(Duration::from_secs(30)));
        config.read_timeout_ms = 0;
        assert_eq!(config.read_timeout(), None);
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addr = resolve_host("127.0.0.1", 1977).await.unwrap();
        assert_eq!(addr.port(), 1977);
    }
}
