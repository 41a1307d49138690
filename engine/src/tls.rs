//! TLS sessions over blocking TCP streams.
//!
//! A handshaken session splits into a [`TlsReader`] (owned by the
//! connection's reader thread) and a cloneable [`TlsWriter`] (handed to
//! whoever sends). Both halves share one `rustls` state machine behind a
//! mutex, but that lock is never held across the socket: the reader pulls
//! ciphertext before feeding the session, and writers drain encrypted
//! records into a buffer first, then write the socket under a separate
//! gate that keeps records in encryption order.
//!
//! Certificate material comes from PEM files or from an ephemeral
//! self-signed pair generated at startup, which is what test rigs and
//! single-host game deployments actually use.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime,
};
use rustls::{DigitallySignedStruct, SignatureScheme};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("tls i/o failure: {0}")]
    Io(#[from] io::Error),
    #[error("tls protocol failure: {0}")]
    Protocol(#[from] rustls::Error),
    #[error("invalid tls server name '{0}'")]
    InvalidServerName(String),
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("client tls needs a ca_file or accept_invalid_certs")]
    NoTrustAnchors,
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),
}

/// Where the server's certificate and key come from.
#[derive(Debug, Clone)]
pub enum ServerTlsConfig {
    /// PEM certificate chain and PEM private key on disk.
    Files { cert: PathBuf, key: PathBuf },
    /// Ephemeral self-signed pair generated in memory for the given
    /// subject-alt names.
    SelfSigned { hostnames: Vec<String> },
}

/// How the client decides to trust the server.
#[derive(Debug, Clone, Default)]
pub struct ClientTlsConfig {
    /// PEM bundle of trusted root certificates.
    pub ca_file: Option<PathBuf>,
    /// Skip server certificate validation. For self-signed deployments
    /// where no CA bundle is distributed; the connection is still encrypted
    /// but the peer is unauthenticated.
    pub accept_invalid_certs: bool,
}

/// Server-side TLS context, built once per server.
pub struct TlsAcceptor {
    config: Arc<rustls::ServerConfig>,
}

impl TlsAcceptor {
    pub fn new(config: &ServerTlsConfig) -> Result<Self, TlsError> {
        let (certs, key) = match config {
            ServerTlsConfig::Files { cert, key } => load_key_material(cert, key)?,
            ServerTlsConfig::SelfSigned { hostnames } => self_signed_key_material(hostnames)?,
        };
        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Self {
            config: Arc::new(server_config),
        })
    }

    /// Runs the server-side handshake on an accepted stream.
    pub fn accept(&self, stream: TcpStream) -> Result<(TlsReader, TlsWriter), TlsError> {
        let conn = rustls::ServerConnection::new(Arc::clone(&self.config))?;
        complete_handshake(rustls::Connection::Server(conn), stream)
    }
}

/// Client-side TLS context, built once per client.
pub struct TlsConnector {
    config: Arc<rustls::ClientConfig>,
}

impl TlsConnector {
    pub fn new(config: &ClientTlsConfig) -> Result<Self, TlsError> {
        let client_config = if let Some(ca_file) = &config.ca_file {
            let mut roots = rustls::RootCertStore::empty();
            let mut reader = BufReader::new(File::open(ca_file)?);
            for cert in rustls_pemfile::certs(&mut reader) {
                roots.add(cert?)?;
            }
            if roots.is_empty() {
                return Err(TlsError::NoCertificates(ca_file.clone()));
            }
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else if config.accept_invalid_certs {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
                .with_no_client_auth()
        } else {
            return Err(TlsError::NoTrustAnchors);
        };
        Ok(Self {
            config: Arc::new(client_config),
        })
    }

    /// Runs the client-side handshake against `server_name`.
    pub fn connect(
        &self,
        server_name: &str,
        stream: TcpStream,
    ) -> Result<(TlsReader, TlsWriter), TlsError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::InvalidServerName(server_name.to_string()))?;
        let conn = rustls::ClientConnection::new(Arc::clone(&self.config), name)?;
        complete_handshake(rustls::Connection::Client(conn), stream)
    }
}

fn complete_handshake(
    mut conn: rustls::Connection,
    stream: TcpStream,
) -> Result<(TlsReader, TlsWriter), TlsError> {
    let mut io = stream.try_clone()?;
    while conn.is_handshaking() {
        conn.complete_io(&mut io)?;
    }
    trace!("tls handshake complete with {:?}", stream.peer_addr());
    let session = Arc::new(Mutex::new(conn));
    let stream = Arc::new(stream);
    let write_gate = Arc::new(Mutex::new(()));
    Ok((
        TlsReader {
            session: Arc::clone(&session),
            stream: Arc::clone(&stream),
            write_gate: Arc::clone(&write_gate),
        },
        TlsWriter {
            session,
            stream,
            write_gate,
        },
    ))
}

/// Drains whatever ciphertext the session has queued and writes it out.
///
/// Lock order is gate first, then session; the session lock is released
/// before the socket write, and the gate keeps records on the wire in the
/// order they were encrypted.
fn flush_ciphertext(
    write_gate: &Mutex<()>,
    session: &Mutex<rustls::Connection>,
    stream: &TcpStream,
) -> io::Result<()> {
    let _gate = write_gate.lock();
    let mut ciphertext = Vec::new();
    {
        let mut session = session.lock();
        while session.wants_write() {
            session.write_tls(&mut ciphertext)?;
        }
    }
    if ciphertext.is_empty() {
        return Ok(());
    }
    let mut sock = stream;
    sock.write_all(&ciphertext)
}

/// Read half of a TLS session. One per connection, owned by its reader
/// thread.
pub struct TlsReader {
    session: Arc<Mutex<rustls::Connection>>,
    stream: Arc<TcpStream>,
    write_gate: Arc<Mutex<()>>,
}

impl TlsReader {
    /// Reads one chunk of decrypted plaintext.
    ///
    /// Blocks on the underlying socket until plaintext is available. Returns
    /// `Ok(0)` when the peer closed, with or without a TLS close-notify.
    /// Unblocked by `shutdown(2)` on the socket from another thread.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut ciphertext = [0u8; 4096];
        loop {
            {
                let mut session = self.session.lock();
                match session.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => return Err(err),
                }
            }
            // No plaintext buffered; pull ciphertext without holding the
            // session lock.
            let n = self.stream.as_ref().read(&mut ciphertext)?;
            if n == 0 {
                return Ok(0);
            }
            let respond = {
                let mut session = self.session.lock();
                let mut pending = &ciphertext[..n];
                while !pending.is_empty() {
                    let consumed = session.read_tls(&mut pending)?;
                    if consumed == 0 {
                        break;
                    }
                    session
                        .process_new_packets()
                        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                }
                session.wants_write()
            };
            // Handshake-layer responses (tickets, key updates) may be due.
            if respond {
                flush_ciphertext(&self.write_gate, &self.session, &self.stream)?;
            }
        }
    }
}

/// Write half of a TLS session. Cloneable; concurrent writes serialize on
/// the write gate, not on the session lock, so a peer that stops reading
/// cannot stall the read half of the session.
#[derive(Clone)]
pub struct TlsWriter {
    session: Arc<Mutex<rustls::Connection>>,
    stream: Arc<TcpStream>,
    write_gate: Arc<Mutex<()>>,
}

impl TlsWriter {
    pub fn write_all(&self, payload: &[u8]) -> io::Result<()> {
        self.session.lock().writer().write_all(payload)?;
        flush_ciphertext(&self.write_gate, &self.session, &self.stream)
    }

    /// Best-effort close-notify so the peer sees an orderly TLS close.
    pub fn send_close_notify(&self) {
        self.session.lock().send_close_notify();
        let _ = flush_ciphertext(&self.write_gate, &self.session, &self.stream);
    }
}

fn load_key_material(
    cert: &Path,
    key: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
    let mut cert_reader = BufReader::new(File::open(cert)?);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(cert.to_path_buf()));
    }
    let mut key_reader = BufReader::new(File::open(key)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| TlsError::NoPrivateKey(key.to_path_buf()))?;
    Ok((certs, key))
}

fn self_signed_key_material(
    hostnames: &[String],
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(hostnames.to_vec())
        .map_err(|err| TlsError::CertificateGeneration(err.to_string()))?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((vec![cert.der().clone()], key))
}

/// Generates a self-signed certificate and key as PEM strings, for writing
/// out to disk (demo setups, tests of the file-loading path).
pub fn self_signed_pem(hostnames: &[String]) -> Result<(String, String), TlsError> {
    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(hostnames.to_vec())
        .map_err(|err| TlsError::CertificateGeneration(err.to_string()))?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
