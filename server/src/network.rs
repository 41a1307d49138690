//! Server network layer: socket loops, connection lifecycle, and message
//! dispatch
//!
//! The server owns one listening socket plus a small set of named service
//! threads:
//! - an accept loop (TCP/TLS) or a datagram loop (UDP)
//! - one reader thread per established connection
//! - a heartbeat supervisor that evicts silent connections
//!
//! Payload handling never happens on those threads. Every received message
//! is pushed onto the shared dispatcher pool, which classifies it and either
//! answers control traffic or hands it to the application through a message
//! hook or the bounded inbound queue.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use engine::dispatcher::Dispatcher;
use engine::message_queue::MessageQueue;
use engine::protocol::{
    classify_control, is_shutdown_sentinel, ConnectionId, ControlMessage, InboundMessage,
    MessageHook, Protocol, HEARTBEAT_ACK, READ_BUFFER_SIZE, UDP_CONNECTION_ID,
};
use engine::rate_limiter::RateLimiter;
use engine::signal::ShutdownSignal;
use engine::tls::{TlsAcceptor, TlsError};
use engine::transport::{tcp_split, ConnectionReader, ConnectionWriter};

use crate::config::ServerConfig;
use crate::connections::ConnectionTable;

/// Poll cadence of the non-blocking accept loop.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Read timeout on the UDP socket so the loop notices shutdown.
const UDP_READ_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("tls setup failed: {0}")]
    Tls(#[from] TlsError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("no such connection: {0}")]
    UnknownConnection(ConnectionId),
    #[error("server already stopped")]
    Stopped,
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// State shared between the public handle and the service threads.
struct Shared {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    connections: Mutex<ConnectionTable>,
    inbound: Arc<MessageQueue<InboundMessage>>,
    hook: Mutex<Option<MessageHook>>,
    tls: Option<Arc<TlsAcceptor>>,
    limiter: Option<RateLimiter>,
    running: AtomicBool,
    stopping: AtomicBool,
    stop_signal: ShutdownSignal,
    stopped_signal: ShutdownSignal,
    local_addr: Mutex<Option<SocketAddr>>,
    service_threads: Mutex<Vec<JoinHandle<()>>>,
    reader_threads: Mutex<Vec<JoinHandle<()>>>,
}

/// A network server for one listening address.
///
/// Created idle; `start` binds the socket and spawns the service threads,
/// `stop` tears everything down and joins them. A stopped server stays
/// stopped: create a new instance to listen again.
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    /// Creates an idle server around an injected inbound queue. The
    /// dispatcher is shared infrastructure: the server uses it for payload
    /// handling but never starts or stops it.
    ///
    /// Configuration problems surface here: TLS over UDP is rejected, and
    /// the TLS context (certificate load or self-signed generation) is
    /// built once before any socket exists.
    pub fn new(
        config: ServerConfig,
        dispatcher: Arc<Dispatcher>,
        inbound: Arc<MessageQueue<InboundMessage>>,
    ) -> Result<Self, ServerError> {
        if config.tls.is_some() && config.protocol == Protocol::Udp {
            return Err(ServerError::Config(
                "tls is not supported over udp".to_string(),
            ));
        }
        let tls = match &config.tls {
            Some(tls_config) => Some(Arc::new(TlsAcceptor::new(tls_config)?)),
            None => None,
        };
        let limiter = config.rate_limiter.clone().map(RateLimiter::new);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                dispatcher,
                connections: Mutex::new(ConnectionTable::new()),
                inbound,
                hook: Mutex::new(None),
                tls,
                limiter,
                running: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                stop_signal: ShutdownSignal::new(),
                stopped_signal: ShutdownSignal::new(),
                local_addr: Mutex::new(None),
                service_threads: Mutex::new(Vec::new()),
                reader_threads: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Binds the configured address and spawns the service threads.
    ///
    /// Fails on bind errors and after `stop`. Calling `start` on a server
    /// that is already running logs a warning and returns `Ok`.
    pub fn start(&self) -> Result<(), ServerError> {
        let shared = &self.shared;
        if shared.stopping.load(Ordering::SeqCst) {
            return Err(ServerError::Stopped);
        }
        if shared.running.swap(true, Ordering::SeqCst) {
            warn!("Server is already running");
            return Ok(());
        }

        let result = self.start_threads();
        if result.is_err() {
            shared.running.store(false, Ordering::SeqCst);
        }
        result
    }

    fn start_threads(&self) -> Result<(), ServerError> {
        let shared = &self.shared;
        let bind_addr = shared.config.bind_address();

        match shared.config.protocol {
            Protocol::Tcp => {
                let listener = TcpListener::bind(&bind_addr).map_err(|source| ServerError::Bind {
                    addr: bind_addr.clone(),
                    source,
                })?;
                listener.set_nonblocking(true)?;
                let local = listener.local_addr()?;
                *shared.local_addr.lock() = Some(local);
                info!(
                    "Server listening on {} ({})",
                    local,
                    if shared.tls.is_some() { "tls" } else { "tcp" }
                );

                let accept_shared = Arc::clone(shared);
                let handle = thread::Builder::new()
                    .name("srv-accept".to_string())
                    .spawn(move || Shared::accept_loop(accept_shared, listener))?;
                shared.service_threads.lock().push(handle);

                let hb_shared = Arc::clone(shared);
                let handle = thread::Builder::new()
                    .name("srv-heartbeat".to_string())
                    .spawn(move || Shared::heartbeat_loop(hb_shared))?;
                shared.service_threads.lock().push(handle);
            }
            Protocol::Udp => {
                let socket = UdpSocket::bind(&bind_addr).map_err(|source| ServerError::Bind {
                    addr: bind_addr.clone(),
                    source,
                })?;
                socket.set_read_timeout(Some(UDP_READ_TIMEOUT))?;
                let local = socket.local_addr()?;
                *shared.local_addr.lock() = Some(local);
                info!("Server listening on {} (udp)", local);

                let udp_shared = Arc::clone(shared);
                let handle = thread::Builder::new()
                    .name("srv-udp".to_string())
                    .spawn(move || Shared::udp_loop(udp_shared, socket))?;
                shared.service_threads.lock().push(handle);
            }
        }
        Ok(())
    }

    /// Stops the server: wakes every service thread, closes every
    /// connection, and joins all of them. Idempotent.
    pub fn stop(&self) {
        Shared::stop(&self.shared);
    }

    /// Blocks until the server has fully stopped, whether through `stop`,
    /// drop, or a shutdown request received over the network.
    pub fn wait(&self) {
        self.shared.stopped_signal.wait();
    }

    /// Sends a payload to one connection.
    pub fn send_to(&self, id: ConnectionId, payload: &[u8]) -> Result<(), ServerError> {
        let writer = self
            .shared
            .connections
            .lock()
            .writer(id)
            .ok_or(ServerError::UnknownConnection(id))?;
        writer.write_all(payload)?;
        Ok(())
    }

    /// Sends a payload to every established connection. Returns how many
    /// writes succeeded; failures are logged and skipped.
    pub fn broadcast(&self, payload: &[u8]) -> usize {
        let writers = self.shared.connections.lock().writers();
        let mut delivered = 0;
        for (id, writer) in writers {
            match writer.write_all(payload) {
                Ok(()) => delivered += 1,
                Err(err) => debug!("Broadcast to connection {} failed: {}", id, err),
            }
        }
        delivered
    }

    /// Closes one connection. Returns false if it was already gone.
    pub fn close_connection(&self, id: ConnectionId) -> bool {
        // Taken out of the table before closing; close-notify on a stalled
        // peer must not block the table lock.
        let removed = self.shared.connections.lock().remove(id);
        match removed {
            Some(conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    /// Routes received application payloads to `hook` instead of the
    /// inbound queue. Control traffic is still handled internally.
    pub fn set_message_hook(&self, hook: MessageHook) {
        *self.shared.hook.lock() = Some(hook);
    }

    /// The bounded queue that receives application payloads when no
    /// message hook is installed. Consumers block on `pop`; the queue is
    /// closed when the server stops.
    pub fn inbound(&self) -> Arc<MessageQueue<InboundMessage>> {
        Arc::clone(&self.shared.inbound)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.shared.connections.lock().ids()
    }

    /// The bound address, once `start` has succeeded. With port 0 in the
    /// config this is where the OS-assigned port shows up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        Shared::stop(&self.shared);
    }
}

impl Shared {
    /// Accepts connections until shutdown. The listener is non-blocking so
    /// the loop can notice the stop signal between attempts.
    fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
        while shared.running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if !Shared::admit(&shared, &peer) {
                        warn!("Throttled connection attempt from {}", peer);
                        continue;
                    }
                    Shared::register_connection(&shared, stream, peer);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if shared.stop_signal.wait_timeout(ACCEPT_POLL_INTERVAL) {
                        break;
                    }
                }
                Err(err) => {
                    if shared.running.load(Ordering::SeqCst) {
                        error!("Error accepting connection: {}", err);
                    }
                    if shared.stop_signal.wait_timeout(ACCEPT_POLL_INTERVAL) {
                        break;
                    }
                }
            }
        }
        debug!("Accept loop finished");
    }

    /// Checks the admission limiter, keyed by the peer's source address
    /// regardless of its port.
    fn admit(shared: &Arc<Shared>, peer: &SocketAddr) -> bool {
        match &shared.limiter {
            Some(limiter) => limiter.allow(&peer.ip().to_string()),
            None => true,
        }
    }

    /// Registers an accepted stream and spawns its reader thread.
    fn register_connection(shared: &Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
        // Accepted sockets must not inherit the listener's non-blocking mode.
        if let Err(err) = stream.set_nonblocking(false) {
            warn!("Failed to configure socket from {}: {}", peer, err);
            return;
        }
        let teardown = match stream.try_clone() {
            Ok(clone) => clone,
            Err(err) => {
                warn!("Failed to clone socket from {}: {}", peer, err);
                return;
            }
        };
        let id = shared.connections.lock().insert(peer, teardown);

        let conn_shared = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name(format!("srv-conn-{}", id))
            .spawn(move || Shared::connection_loop(conn_shared, id, stream));
        match spawned {
            Ok(handle) => shared.reader_threads.lock().push(handle),
            Err(err) => {
                error!("Failed to spawn reader for connection {}: {}", id, err);
                let removed = shared.connections.lock().remove(id);
                if let Some(conn) = removed {
                    conn.close();
                }
            }
        }
    }

    /// Per-connection reader thread: establishes the transport (running the
    /// TLS handshake when configured), then reads payloads until the peer
    /// disconnects or the server stops.
    fn connection_loop(shared: Arc<Shared>, id: ConnectionId, stream: TcpStream) {
        let established = match &shared.tls {
            Some(acceptor) => match acceptor.accept(stream) {
                Ok((reader, writer)) => {
                    Some((ConnectionReader::Tls(reader), ConnectionWriter::Tls(writer)))
                }
                Err(err) => {
                    warn!("TLS handshake failed on connection {}: {}", id, err);
                    None
                }
            },
            None => match tcp_split(stream) {
                Ok(pair) => Some(pair),
                Err(err) => {
                    warn!("Failed to split socket for connection {}: {}", id, err);
                    None
                }
            },
        };

        if let Some((mut reader, writer)) = established {
            shared.connections.lock().set_writer(id, writer.clone());
            debug!("Connection {} established over {}", id, reader.kind());

            let mut buffer = [0u8; READ_BUFFER_SIZE];
            while shared.running.load(Ordering::SeqCst) {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        debug!("Connection {} closed by peer", id);
                        break;
                    }
                    Ok(len) => {
                        let payload = buffer[..len].to_vec();
                        Shared::dispatch_payload(&shared, id, payload, Some(writer.clone()));
                    }
                    Err(err) => {
                        if shared.running.load(Ordering::SeqCst) {
                            debug!("Read error on connection {}: {}", id, err);
                        }
                        break;
                    }
                }
            }
        }

        let removed = shared.connections.lock().remove(id);
        if let Some(conn) = removed {
            conn.close();
        }
    }

    /// Receives datagrams until shutdown. Datagram traffic carries the
    /// reserved connection id and has no write half.
    fn udp_loop(shared: Arc<Shared>, socket: UdpSocket) {
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        while shared.running.load(Ordering::SeqCst) {
            match socket.recv_from(&mut buffer) {
                Ok((len, from)) => {
                    if !Shared::admit(&shared, &from) {
                        warn!("Throttled datagram from {}", from);
                        continue;
                    }
                    let payload = buffer[..len].to_vec();
                    Shared::dispatch_payload(&shared, UDP_CONNECTION_ID, payload, None);
                }
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(err) => {
                    if shared.running.load(Ordering::SeqCst) {
                        error!("Error receiving datagram: {}", err);
                    }
                }
            }
        }
        debug!("Datagram loop finished");
    }

    /// Evicts connections that stayed silent past the heartbeat timeout.
    fn heartbeat_loop(shared: Arc<Shared>) {
        let interval = shared.config.heartbeat_interval;
        let timeout = shared.config.heartbeat_timeout;
        loop {
            if shared.stop_signal.wait_timeout(interval) {
                break;
            }
            // Evicted entries are closed with the table unlocked, so one
            // stalled peer cannot hold up sends to the others.
            let evicted = {
                let mut connections = shared.connections.lock();
                let silent = connections.silent_connections(timeout);
                silent
                    .into_iter()
                    .filter_map(|id| connections.remove(id))
                    .collect::<Vec<_>>()
            };
            for conn in evicted {
                warn!("Connection {} missed heartbeats, closing", conn.id);
                conn.close();
            }
        }
        debug!("Heartbeat supervisor finished");
    }

    /// Hands a received payload to the dispatcher pool.
    fn dispatch_payload(
        shared: &Arc<Shared>,
        id: ConnectionId,
        payload: Vec<u8>,
        writer: Option<ConnectionWriter>,
    ) {
        let task_shared = Arc::clone(shared);
        shared.dispatcher.dispatch(
            Box::new(move || Shared::process_payload(&task_shared, id, payload, writer)),
            false,
        );
    }

    /// Runs on a dispatcher worker: answers control traffic, honors the
    /// shutdown request, and delivers everything else to the application.
    fn process_payload(
        shared: &Arc<Shared>,
        id: ConnectionId,
        payload: Vec<u8>,
        writer: Option<ConnectionWriter>,
    ) {
        if let Some(control) = classify_control(&payload) {
            shared.connections.lock().touch(id);
            match control {
                ControlMessage::Heartbeat => {
                    debug!("Heartbeat from connection {}", id);
                    if let Some(writer) = writer {
                        if let Err(err) = writer.write_all(HEARTBEAT_ACK) {
                            debug!("Heartbeat ack to connection {} failed: {}", id, err);
                        }
                    }
                }
                ControlMessage::HeartbeatAck => {
                    debug!("Heartbeat acknowledged by connection {}", id);
                }
            }
            return;
        }

        if is_shutdown_sentinel(&payload) {
            info!("Shutdown requested by connection {}", id);
            // Stopping joins the reader threads, so it must not run inline
            // on a thread the teardown will wait for.
            let stop_shared = Arc::clone(shared);
            let spawned = thread::Builder::new()
                .name("srv-shutdown".to_string())
                .spawn(move || Shared::stop(&stop_shared));
            if let Err(err) = spawned {
                error!("Failed to spawn shutdown thread: {}", err);
            }
            return;
        }

        let hook = shared.hook.lock().clone();
        match hook {
            Some(hook) => hook(id, payload),
            None => {
                if !shared.inbound.push(InboundMessage::new(id, payload)) {
                    debug!(
                        "Inbound queue closed, dropping message from connection {}",
                        id
                    );
                }
            }
        }
    }

    /// Tears the server down exactly once: wakes and joins the service
    /// threads, closes and joins every connection, then closes the inbound
    /// queue so consumers drain and finish.
    fn stop(shared: &Arc<Shared>) {
        if shared.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        if !shared.running.swap(false, Ordering::SeqCst) {
            shared.stopped_signal.trigger();
            return;
        }
        info!("Server shutting down");
        shared.stop_signal.trigger();

        let service: Vec<_> = shared.service_threads.lock().drain(..).collect();
        for handle in service {
            if handle.join().is_err() {
                error!("Server service thread terminated abnormally");
            }
        }

        let dropped = shared.connections.lock().drain();
        for conn in dropped {
            conn.close();
        }

        let readers: Vec<_> = shared.reader_threads.lock().drain(..).collect();
        for handle in readers {
            if handle.join().is_err() {
                error!("Connection reader thread terminated abnormally");
            }
        }

        shared.inbound.close();
        shared.stopped_signal.trigger();
        info!("Server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Instant;

    fn test_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.port = 0;
        config
    }

    fn test_dispatcher() -> Arc<Dispatcher> {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.start(2);
        dispatcher
    }

    fn test_queue() -> Arc<MessageQueue<InboundMessage>> {
        Arc::new(MessageQueue::new(64))
    }

    fn wait_for_message(
        queue: &MessageQueue<InboundMessage>,
        deadline: Duration,
    ) -> Option<InboundMessage> {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if let Some(message) = queue.try_pop() {
                return Some(message);
            }
            thread::sleep(Duration::from_millis(10));
        }
        None
    }

    #[test]
    fn test_tls_over_udp_is_rejected_at_construction() {
        let mut config = test_config();
        config.protocol = Protocol::Udp;
        config.tls = Some(engine::tls::ServerTlsConfig::SelfSigned {
            hostnames: vec!["localhost".to_string()],
        });
        let result = Server::new(config, test_dispatcher(), test_queue());
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[test]
    fn test_accepts_and_delivers_payload() {
        let dispatcher = test_dispatcher();
        let inbound = test_queue();
        let server =
            Server::new(test_config(), Arc::clone(&dispatcher), Arc::clone(&inbound)).unwrap();
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"hello").unwrap();

        let message = wait_for_message(&inbound, Duration::from_secs(2)).expect("no message");
        assert_eq!(message.connection, 1);
        assert_eq!(message.payload, b"hello".to_vec());

        server.stop();
        dispatcher.stop();
    }

    #[test]
    fn test_default_config_admits_every_datagram() {
        let dispatcher = test_dispatcher();
        let inbound = test_queue();
        let mut config = test_config();
        config.protocol = Protocol::Udp;
        let server = Server::new(config, Arc::clone(&dispatcher), Arc::clone(&inbound)).unwrap();
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        for n in 0..6 {
            sender.send_to(format!("msg-{}", n).as_bytes(), addr).unwrap();
        }

        let mut received = Vec::new();
        while received.len() < 6 {
            match wait_for_message(&inbound, Duration::from_secs(2)) {
                Some(message) => received.push(message.payload_text().into_owned()),
                None => break,
            }
        }
        received.sort();
        let expected: Vec<String> = (0..6).map(|n| format!("msg-{}", n)).collect();
        assert_eq!(received, expected);

        server.stop();
        dispatcher.stop();
    }

    #[test]
    fn test_send_to_unknown_connection() {
        let dispatcher = test_dispatcher();
        let server = Server::new(test_config(), Arc::clone(&dispatcher), test_queue()).unwrap();
        server.start().unwrap();

        let result = server.send_to(42, b"nobody home");
        assert!(matches!(result, Err(ServerError::UnknownConnection(42))));

        server.stop();
        dispatcher.stop();
    }

    #[test]
    fn test_stop_is_idempotent_and_final() {
        let dispatcher = test_dispatcher();
        let server = Server::new(test_config(), Arc::clone(&dispatcher), test_queue()).unwrap();
        server.start().unwrap();
        assert!(server.is_running());

        server.stop();
        server.stop();
        assert!(!server.is_running());
        assert!(matches!(server.start(), Err(ServerError::Stopped)));

        dispatcher.stop();
    }

    #[test]
    fn test_wait_returns_after_stop() {
        let dispatcher = test_dispatcher();
        let server = Arc::new(
            Server::new(test_config(), Arc::clone(&dispatcher), test_queue()).unwrap(),
        );
        server.start().unwrap();

        let waiter = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.wait())
        };
        thread::sleep(Duration::from_millis(50));
        server.stop();
        waiter.join().unwrap();

        dispatcher.stop();
    }
}
