//! Wire-level vocabulary shared by the server and client crates.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Liveness probe payload.
pub const HEARTBEAT: &[u8] = b"HEARTBEAT";
/// Probe acknowledgment payload.
pub const HEARTBEAT_ACK: &[u8] = b"PONG";
/// Application payload that requests a graceful server stop.
pub const SHUTDOWN_SENTINEL: &[u8] = b"shutdown";

/// Size of a single socket read. Each successful read is treated as one
/// logical message. That holds only while peers send small, non-coalesced
/// writes; anything larger or batched needs application-level framing on top
/// of this engine.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Integer handle for one tracked connection. TCP connections count up from
/// 1; [`UDP_CONNECTION_ID`] marks datagram traffic, which carries no
/// per-peer state.
pub type ConnectionId = u64;

pub const UDP_CONNECTION_ID: ConnectionId = 0;

/// Callback receiving every non-control payload a server decodes.
pub type MessageHook = Arc<dyn Fn(ConnectionId, Vec<u8>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol '{}', expected tcp or udp", other)),
        }
    }
}

/// Reserved payloads that the engine consumes instead of surfacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Heartbeat,
    HeartbeatAck,
}

pub fn classify_control(payload: &[u8]) -> Option<ControlMessage> {
    if payload == HEARTBEAT {
        Some(ControlMessage::Heartbeat)
    } else if payload == HEARTBEAT_ACK {
        Some(ControlMessage::HeartbeatAck)
    } else {
        None
    }
}

pub fn is_shutdown_sentinel(payload: &[u8]) -> bool {
    payload == SHUTDOWN_SENTINEL
}

/// A decoded payload paired with the connection that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub connection: ConnectionId,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(connection: ConnectionId, payload: Vec<u8>) -> Self {
        Self {
            connection,
            payload,
        }
    }

    /// Lossy text view of the payload, for logging.
    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}
