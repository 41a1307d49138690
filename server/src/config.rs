//! Server runtime configuration.
//!
//! All knobs live in one struct so binaries can fill it from command-line
//! arguments and tests can tweak only the fields they care about, starting
//! from [`ServerConfig::default`].

use std::time::Duration;

use engine::protocol::Protocol;
use engine::rate_limiter::RateLimiterConfig;
use engine::tls::ServerTlsConfig;

/// Complete configuration for one server instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind to.
    pub bind_addr: String,
    /// Port to listen on. Port 0 asks the OS for a free one; the bound
    /// address is then available through `Server::local_addr`.
    pub port: u16,
    /// Transport to accept. TLS only applies to [`Protocol::Tcp`].
    pub protocol: Protocol,
    /// Certificate source; `None` means plaintext.
    pub tls: Option<ServerTlsConfig>,
    /// How often the heartbeat supervisor scans for silent connections.
    pub heartbeat_interval: Duration,
    /// How long a connection may stay silent before it is evicted.
    pub heartbeat_timeout: Duration,
    /// Per-source-address throttling of connection attempts (TCP) and
    /// datagrams (UDP). `None` admits all traffic.
    pub rate_limiter: Option<RateLimiterConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 8080,
            protocol: Protocol::Tcp,
            tls: None,
            heartbeat_interval: Duration::from_secs(2),
            heartbeat_timeout: Duration::from_secs(10),
            rate_limiter: None,
        }
    }
}

impl ServerConfig {
    /// The `host:port` string handed to the socket bind call.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.protocol, Protocol::Tcp);
        assert!(config.tls.is_none());
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(10));
        assert!(config.rate_limiter.is_none());
    }

    #[test]
    fn test_bind_address_format() {
        let config = ServerConfig {
            bind_addr: "0.0.0.0".to_string(),
            port: 9000,
            ..ServerConfig::default()
        };
        assert_eq!(config.bind_address(), "0.0.0.0:9000");
    }
}
