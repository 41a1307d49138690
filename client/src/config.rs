//! Client runtime configuration.

use std::time::Duration;

use engine::protocol::Protocol;
use engine::tls::ClientTlsConfig;

/// Complete configuration for one client instance.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server hostname or address. Also used as the TLS server name.
    pub server_addr: String,
    /// Server port.
    pub port: u16,
    /// Transport to use. TLS only applies to [`Protocol::Tcp`].
    pub protocol: Protocol,
    /// Trust settings; `None` means plaintext.
    pub tls: Option<ClientTlsConfig>,
    /// How often a heartbeat is sent while connected.
    pub heartbeat_interval: Duration,
    /// Fixed pause between reconnect attempts after a lost connection.
    pub reconnect_backoff: Duration,
    /// Timeout for each TCP connect attempt.
    pub connect_timeout: Duration,
    /// Reconnect automatically when an established connection drops.
    /// The first connect never retries; its errors go to the caller.
    pub auto_reconnect: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1".to_string(),
            port: 8080,
            protocol: Protocol::Tcp,
            tls: None,
            heartbeat_interval: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            auto_reconnect: true,
        }
    }
}

impl ClientConfig {
    /// The `host:port` string the client dials.
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server_addr, self.port)
    }
}
