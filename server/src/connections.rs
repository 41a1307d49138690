//! Connection tracking for the server
//!
//! This module owns the server-side view of every established connection:
//! - Connection lifecycle (accept, writer attachment, close)
//! - Heartbeat bookkeeping and silent-connection detection
//! - Writer lookup for directed sends and broadcasts
//!
//! The table never blocks on sockets itself; closing a connection here
//! shuts the socket down so the reader thread that owns it unblocks and
//! finishes its own cleanup.

use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use log::info;

use engine::protocol::ConnectionId;
use engine::transport::ConnectionWriter;

/// One established TCP or TLS connection.
///
/// The reader thread owns the read half; this entry keeps the cloneable
/// write half plus a raw stream clone used to tear the socket down from
/// other threads.
pub struct Connection {
    /// Identifier assigned at accept time, unique for the server's lifetime.
    pub id: ConnectionId,
    /// Peer address, kept for logging and throttling.
    pub peer: SocketAddr,
    /// Raw stream clone for shutdown; the reader thread holds the original.
    pub stream: TcpStream,
    /// Write half, attached once the transport (and TLS handshake, if any)
    /// is established.
    pub writer: Option<ConnectionWriter>,
    /// Last time a control payload arrived from this peer.
    pub last_heartbeat: Instant,
}

impl Connection {
    pub fn new(id: ConnectionId, peer: SocketAddr, stream: TcpStream) -> Self {
        Self {
            id,
            peer,
            stream,
            writer: None,
            last_heartbeat: Instant::now(),
        }
    }

    /// True if no heartbeat arrived within `timeout`.
    pub fn is_silent(&self, timeout: Duration) -> bool {
        self.last_heartbeat.elapsed() > timeout
    }

    /// Shuts the connection down. The TLS close-notify (when applicable)
    /// goes out first, then the raw socket is closed in both directions so
    /// a blocked reader thread wakes up.
    pub fn close(&self) {
        if let Some(writer) = &self.writer {
            writer.close();
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// All live connections, indexed by id.
///
/// Shared behind a mutex between the accept loop, the per-connection
/// reader threads, the heartbeat supervisor, and whoever calls the send
/// operations. Ids start at 1; id 0 is reserved for datagram traffic.
pub struct ConnectionTable {
    connections: HashMap<ConnectionId, Connection>,
    next_id: ConnectionId,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            next_id: 1,
        }
    }

    /// Registers a freshly accepted connection and returns its id.
    pub fn insert(&mut self, peer: SocketAddr, stream: TcpStream) -> ConnectionId {
        let id = self.next_id;
        self.next_id += 1;
        info!("Connection {} accepted from {}", id, peer);
        self.connections.insert(id, Connection::new(id, peer, stream));
        id
    }

    /// Attaches the write half once the transport is established. Returns
    /// false if the connection was already removed.
    pub fn set_writer(&mut self, id: ConnectionId, writer: ConnectionWriter) -> bool {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.writer = Some(writer);
            true
        } else {
            false
        }
    }

    /// Refreshes the heartbeat timestamp for a connection.
    pub fn touch(&mut self, id: ConnectionId) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.last_heartbeat = Instant::now();
        }
    }

    /// Removes a connection, returning it so the caller can close it.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let removed = self.connections.remove(&id);
        if let Some(conn) = &removed {
            info!("Connection {} from {} removed", conn.id, conn.peer);
        }
        removed
    }

    /// Ids of connections that have been silent longer than `timeout`.
    pub fn silent_connections(&self, timeout: Duration) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|(_, conn)| conn.is_silent(timeout))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Write half of one connection, if it is established.
    pub fn writer(&self, id: ConnectionId) -> Option<ConnectionWriter> {
        self.connections.get(&id).and_then(|conn| conn.writer.clone())
    }

    /// Write halves of every established connection, for broadcasts.
    pub fn writers(&self) -> Vec<(ConnectionId, ConnectionWriter)> {
        self.connections
            .iter()
            .filter_map(|(id, conn)| conn.writer.clone().map(|w| (*id, w)))
            .collect()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    /// Removes and returns every connection, for shutdown.
    pub fn drain(&mut self) -> Vec<Connection> {
        self.connections.drain().map(|(_, conn)| conn).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::transport::tcp_split;
    use std::net::TcpListener;

    /// A connected loopback socket pair.
    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    #[test]
    fn test_insert_assigns_sequential_ids() {
        let mut table = ConnectionTable::new();
        let (a, _keep_a) = socket_pair();
        let (b, _keep_b) = socket_pair();

        let peer_a = a.peer_addr().unwrap();
        let peer_b = b.peer_addr().unwrap();
        let id1 = table.insert(peer_a, a);
        let id2 = table.insert(peer_b, b);

        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove_connection() {
        let mut table = ConnectionTable::new();
        let (stream, _keep) = socket_pair();
        let peer = stream.peer_addr().unwrap();

        let id = table.insert(peer, stream);
        assert!(table.remove(id).is_some());
        assert!(table.remove(id).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_writer_attachment() {
        let mut table = ConnectionTable::new();
        let (stream, _keep) = socket_pair();
        let peer = stream.peer_addr().unwrap();
        let id = table.insert(peer, stream.try_clone().unwrap());

        assert!(table.writer(id).is_none());
        let (_reader, writer) = tcp_split(stream).unwrap();
        assert!(table.set_writer(id, writer));
        assert!(table.writer(id).is_some());
        assert_eq!(table.writers().len(), 1);
    }

    #[test]
    fn test_set_writer_on_removed_connection() {
        let mut table = ConnectionTable::new();
        let (stream, _keep) = socket_pair();
        let peer = stream.peer_addr().unwrap();
        let id = table.insert(peer, stream.try_clone().unwrap());
        table.remove(id);

        let (_reader, writer) = tcp_split(stream).unwrap();
        assert!(!table.set_writer(id, writer));
    }

    #[test]
    fn test_silent_connection_detection() {
        let mut table = ConnectionTable::new();
        let (stream, _keep) = socket_pair();
        let peer = stream.peer_addr().unwrap();
        let id = table.insert(peer, stream);

        assert!(table.silent_connections(Duration::from_secs(1)).is_empty());

        table.get_mut(id).unwrap().last_heartbeat = Instant::now() - Duration::from_secs(2);
        assert_eq!(table.silent_connections(Duration::from_secs(1)), vec![id]);

        table.touch(id);
        assert!(table.silent_connections(Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_drain_empties_table() {
        let mut table = ConnectionTable::new();
        let (a, _keep_a) = socket_pair();
        let (b, _keep_b) = socket_pair();
        table.insert(a.peer_addr().unwrap(), a);
        table.insert(b.peer_addr().unwrap(), b);

        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert!(table.is_empty());
    }
}
