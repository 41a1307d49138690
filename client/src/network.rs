//! Client network layer: connection establishment, reconnection, and
//! heartbeats
//!
//! A connected client runs two named threads: a session thread that owns
//! the read half and re-establishes the connection when it drops, and a
//! heartbeat thread that keeps the server's silence detector fed. Received
//! payloads are classified on the shared dispatcher pool and delivered to
//! an application callback; sends also go through the pool so callers never
//! block on a slow socket.

use std::io::{self, ErrorKind};
use std::net::{Shutdown, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use engine::dispatcher::Dispatcher;
use engine::protocol::{classify_control, Protocol, HEARTBEAT, HEARTBEAT_ACK, READ_BUFFER_SIZE};
use engine::signal::ShutdownSignal;
use engine::tls::{TlsConnector, TlsError};
use engine::transport::{tcp_split, ConnectionReader, ConnectionWriter};

use crate::config::ClientConfig;

/// Application callback invoked with each received payload. Control
/// traffic is filtered out before this is called.
pub type MessageCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },
    #[error("tls setup failed: {0}")]
    Tls(#[from] TlsError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("client already stopped")]
    Stopped,
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),
}

/// One live transport session.
struct Session {
    writer: ConnectionWriter,
    /// Raw stream clone for teardown; `None` for datagram sessions.
    stream: Option<TcpStream>,
}

impl Session {
    fn close(&self) {
        self.writer.close();
        if let Some(stream) = &self.stream {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// State shared between the public handle and the client threads.
struct ClientShared {
    config: ClientConfig,
    dispatcher: Arc<Dispatcher>,
    session: Mutex<Option<Session>>,
    callback: Mutex<Option<MessageCallback>>,
    connected: AtomicBool,
    running: AtomicBool,
    stopping: AtomicBool,
    stop_signal: ShutdownSignal,
}

/// A network client for one server address.
///
/// Created idle; `connect` establishes the first session synchronously so
/// configuration and connectivity problems surface to the caller. Once
/// connected, lost connections are re-established in the background with a
/// fixed backoff until `disconnect`. A disconnected client stays stopped.
pub struct Client {
    shared: Arc<ClientShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Creates an idle client. The dispatcher is shared infrastructure:
    /// the client uses it for payload handling but never starts or stops it.
    ///
    /// Configuration problems surface here: TLS over UDP is rejected before
    /// any connection attempt.
    pub fn new(config: ClientConfig, dispatcher: Arc<Dispatcher>) -> Result<Self, ClientError> {
        if config.tls.is_some() && config.protocol == Protocol::Udp {
            return Err(ClientError::Config(
                "tls is not supported over udp".to_string(),
            ));
        }
        Ok(Self {
            shared: Arc::new(ClientShared {
                config,
                dispatcher,
                session: Mutex::new(None),
                callback: Mutex::new(None),
                connected: AtomicBool::new(false),
                running: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                stop_signal: ShutdownSignal::new(),
            }),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Connects to the configured server and spawns the client threads.
    ///
    /// The first connection attempt does not retry; errors from it are
    /// returned here. Later drops reconnect in the background when
    /// `auto_reconnect` is enabled.
    pub fn connect(&self) -> Result<(), ClientError> {
        let shared = &self.shared;
        if shared.stopping.load(Ordering::SeqCst) {
            return Err(ClientError::Stopped);
        }
        if shared.running.swap(true, Ordering::SeqCst) {
            warn!("Client is already running");
            return Ok(());
        }

        let result = self.spawn_session();
        if result.is_err() {
            shared.running.store(false, Ordering::SeqCst);
        }
        result
    }

    fn spawn_session(&self) -> Result<(), ClientError> {
        let shared = &self.shared;
        let connector = match &shared.config.tls {
            Some(tls_config) => Some(Arc::new(TlsConnector::new(tls_config)?)),
            None => None,
        };

        info!("Connecting to {}...", shared.config.server_address());
        let reader = ClientShared::establish(shared, connector.as_deref())?;
        info!("Connected to {}", shared.config.server_address());

        if let Some(reader) = reader {
            let session_shared = Arc::clone(shared);
            let session_connector = connector.clone();
            let handle = thread::Builder::new()
                .name("cli-session".to_string())
                .spawn(move || {
                    ClientShared::session_loop(session_shared, reader, session_connector)
                })?;
            self.threads.lock().push(handle);
        }

        let hb_shared = Arc::clone(shared);
        let handle = thread::Builder::new()
            .name("cli-heartbeat".to_string())
            .spawn(move || ClientShared::heartbeat_loop(hb_shared))?;
        self.threads.lock().push(handle);

        Ok(())
    }

    /// Queues a payload for sending. Never blocks the caller: the write
    /// runs on the dispatcher pool, and without an established session the
    /// payload is dropped with a log line, including during a reconnect
    /// window.
    pub fn send(&self, payload: &[u8]) -> Result<(), ClientError> {
        let writer = self
            .shared
            .session
            .lock()
            .as_ref()
            .map(|session| session.writer.clone());
        let writer = match writer {
            Some(writer) => writer,
            None => {
                debug!("Not connected, dropping {} byte payload", payload.len());
                return Ok(());
            }
        };
        let payload = payload.to_vec();
        self.shared.dispatcher.dispatch(
            Box::new(move || {
                if let Err(err) = writer.write_all(&payload) {
                    warn!("Send of {} bytes failed: {}", payload.len(), err);
                }
            }),
            false,
        );
        Ok(())
    }

    /// Disconnects and joins the client threads. Idempotent; the client
    /// cannot be connected again afterwards.
    pub fn disconnect(&self) {
        let shared = &self.shared;
        if shared.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        if !shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Disconnecting");
        shared.stop_signal.trigger();
        shared.connected.store(false, Ordering::SeqCst);
        // Taken out of the slot before closing; close-notify must not
        // block the session lock.
        let session = shared.session.lock().take();
        if let Some(session) = session {
            session.close();
        }
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                error!("Client thread terminated abnormally");
            }
        }
        info!("Disconnected");
    }

    /// Installs the callback that receives application payloads.
    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.shared.callback.lock() = Some(callback);
    }

    /// True while a transport session is established.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// True from a successful `connect` until `disconnect`, including
    /// while a reconnect is in progress.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl ClientShared {
    /// Establishes a transport session and stores its write half. Returns
    /// the read half, or `None` for datagram sessions, which are send-only.
    fn establish(
        shared: &Arc<ClientShared>,
        connector: Option<&TlsConnector>,
    ) -> Result<Option<ConnectionReader>, ClientError> {
        let addr = shared.config.server_address();
        match shared.config.protocol {
            Protocol::Tcp => {
                let socket_addr = addr
                    .to_socket_addrs()
                    .map_err(|source| ClientError::Connect {
                        addr: addr.clone(),
                        source,
                    })?
                    .next()
                    .ok_or_else(|| ClientError::Connect {
                        addr: addr.clone(),
                        source: io::Error::new(
                            ErrorKind::AddrNotAvailable,
                            "address did not resolve",
                        ),
                    })?;
                let stream =
                    TcpStream::connect_timeout(&socket_addr, shared.config.connect_timeout)
                        .map_err(|source| ClientError::Connect {
                            addr: addr.clone(),
                            source,
                        })?;
                let teardown = stream.try_clone()?;
                let (reader, writer) = match connector {
                    Some(connector) => {
                        let (r, w) = connector.connect(&shared.config.server_addr, stream)?;
                        (ConnectionReader::Tls(r), ConnectionWriter::Tls(w))
                    }
                    None => tcp_split(stream)?,
                };
                *shared.session.lock() = Some(Session {
                    writer,
                    stream: Some(teardown),
                });
                shared.connected.store(true, Ordering::SeqCst);
                Ok(Some(reader))
            }
            Protocol::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0")?;
                socket
                    .connect(&addr)
                    .map_err(|source| ClientError::Connect { addr, source })?;
                *shared.session.lock() = Some(Session {
                    writer: ConnectionWriter::Udp(Arc::new(socket)),
                    stream: None,
                });
                shared.connected.store(true, Ordering::SeqCst);
                Ok(None)
            }
        }
    }

    /// Session thread: reads until the connection drops, then keeps
    /// reconnecting with a fixed backoff until it succeeds or the client
    /// stops.
    fn session_loop(
        shared: Arc<ClientShared>,
        mut reader: ConnectionReader,
        connector: Option<Arc<TlsConnector>>,
    ) {
        'session: loop {
            ClientShared::read_session(&shared, &mut reader);
            shared.connected.store(false, Ordering::SeqCst);
            let session = shared.session.lock().take();
            if let Some(session) = session {
                session.close();
            }

            if !shared.running.load(Ordering::SeqCst) || !shared.config.auto_reconnect {
                break;
            }

            loop {
                info!(
                    "Connection lost, retrying in {:?}",
                    shared.config.reconnect_backoff
                );
                if shared.stop_signal.wait_timeout(shared.config.reconnect_backoff) {
                    break 'session;
                }
                match ClientShared::establish(&shared, connector.as_deref()) {
                    Ok(Some(next_reader)) => {
                        info!("Reconnected to {}", shared.config.server_address());
                        reader = next_reader;
                        break;
                    }
                    Ok(None) => break 'session,
                    Err(err) => warn!("Reconnect attempt failed: {}", err),
                }
            }
        }
        debug!("Session thread finished");
    }

    /// Reads payloads from one session until it ends. Heartbeat probes are
    /// answered inline; everything else is classified on the pool.
    fn read_session(shared: &Arc<ClientShared>, reader: &mut ConnectionReader) {
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        while shared.running.load(Ordering::SeqCst) {
            match reader.read(&mut buffer) {
                Ok(0) => {
                    info!("Server closed the connection");
                    break;
                }
                Ok(len) => {
                    if &buffer[..len] == HEARTBEAT {
                        ClientShared::answer_probe(shared);
                        continue;
                    }
                    ClientShared::dispatch_payload(shared, buffer[..len].to_vec());
                }
                Err(err) => {
                    if shared.running.load(Ordering::SeqCst) {
                        debug!("Read error: {}", err);
                    }
                    break;
                }
            }
        }
    }

    /// Replies to a server liveness probe from the session thread.
    fn answer_probe(shared: &Arc<ClientShared>) {
        let writer = shared
            .session
            .lock()
            .as_ref()
            .map(|session| session.writer.clone());
        if let Some(writer) = writer {
            if let Err(err) = writer.write_all(HEARTBEAT_ACK) {
                debug!("Heartbeat reply failed: {}", err);
            }
        }
    }

    /// Classifies one received payload on the dispatcher pool and hands
    /// application traffic to the callback.
    fn dispatch_payload(shared: &Arc<ClientShared>, payload: Vec<u8>) {
        let task_shared = Arc::clone(shared);
        shared.dispatcher.dispatch(
            Box::new(move || {
                if let Some(control) = classify_control(&payload) {
                    debug!("Control message from server: {:?}", control);
                    return;
                }
                let callback = task_shared.callback.lock().clone();
                match callback {
                    Some(callback) => callback(payload),
                    None => debug!(
                        "Received {} bytes with no message callback installed",
                        payload.len()
                    ),
                }
            }),
            false,
        );
    }

    /// Sends a heartbeat every interval while a session is established.
    fn heartbeat_loop(shared: Arc<ClientShared>) {
        let interval = shared.config.heartbeat_interval;
        loop {
            if shared.stop_signal.wait_timeout(interval) {
                break;
            }
            if !shared.connected.load(Ordering::SeqCst) {
                continue;
            }
            let writer = shared
                .session
                .lock()
                .as_ref()
                .map(|session| session.writer.clone());
            if let Some(writer) = writer {
                match writer.write_all(HEARTBEAT) {
                    Ok(()) => debug!("Heartbeat sent"),
                    Err(err) => debug!("Heartbeat failed: {}", err),
                }
            }
        }
        debug!("Heartbeat thread finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::time::Duration;

    fn test_dispatcher() -> Arc<Dispatcher> {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.start(2);
        dispatcher
    }

    /// A port that was just free; connecting to it should be refused.
    fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_initial_connect_error_surfaces() {
        let config = ClientConfig {
            port: unused_port(),
            connect_timeout: Duration::from_millis(500),
            ..ClientConfig::default()
        };
        let client = Client::new(config, test_dispatcher()).unwrap();
        assert!(matches!(
            client.connect(),
            Err(ClientError::Connect { .. })
        ));
        assert!(!client.is_running());
    }

    #[test]
    fn test_tls_over_udp_is_rejected_at_construction() {
        let config = ClientConfig {
            protocol: Protocol::Udp,
            tls: Some(engine::tls::ClientTlsConfig {
                ca_file: None,
                accept_invalid_certs: true,
            }),
            ..ClientConfig::default()
        };
        let result = Client::new(config, test_dispatcher());
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[test]
    fn test_send_without_session_drops_quietly() {
        let client = Client::new(ClientConfig::default(), test_dispatcher()).unwrap();
        assert!(client.send(b"anyone there").is_ok());
    }

    #[test]
    fn test_connect_exchange_and_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).unwrap();
            stream.write_all(b"welcome").unwrap();
            buf[..n].to_vec()
        });

        let dispatcher = test_dispatcher();
        let config = ClientConfig {
            port: addr.port(),
            auto_reconnect: false,
            ..ClientConfig::default()
        };
        let client = Client::new(config, Arc::clone(&dispatcher)).unwrap();

        let (tx, rx) = mpsc::channel();
        client.set_message_callback(Arc::new(move |payload| {
            let _ = tx.send(payload);
        }));

        client.connect().unwrap();
        assert!(client.is_connected());

        client.send(b"hello there").unwrap();
        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received, b"welcome".to_vec());
        assert_eq!(server.join().unwrap(), b"hello there".to_vec());

        client.disconnect();
        assert!(!client.is_connected());
        assert!(!client.is_running());

        // A stopped client stays stopped.
        assert!(matches!(client.connect(), Err(ClientError::Stopped)));
        dispatcher.stop();
    }

    #[test]
    fn test_heartbeat_probe_answered_with_pong() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(HEARTBEAT).unwrap();
            let mut buf = [0u8; 16];
            let n = stream.read(&mut buf).unwrap();
            buf[..n].to_vec()
        });

        let dispatcher = test_dispatcher();
        let config = ClientConfig {
            port: addr.port(),
            auto_reconnect: false,
            ..ClientConfig::default()
        };
        let client = Client::new(config, Arc::clone(&dispatcher)).unwrap();
        client.connect().unwrap();

        assert_eq!(server.join().unwrap(), HEARTBEAT_ACK.to_vec());

        client.disconnect();
        dispatcher.stop();
    }

    #[test]
    fn test_udp_client_sends_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let dispatcher = test_dispatcher();
        let config = ClientConfig {
            port,
            protocol: Protocol::Udp,
            ..ClientConfig::default()
        };
        let client = Client::new(config, Arc::clone(&dispatcher)).unwrap();
        client.connect().unwrap();
        client.send(b"state report").unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"state report");

        client.disconnect();
        dispatcher.stop();
    }
}
