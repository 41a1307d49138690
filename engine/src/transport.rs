//! Blocking read/write halves over the supported transports.
//!
//! Every established connection splits into a [`ConnectionReader`], owned
//! by that connection's reader thread, and a cloneable [`ConnectionWriter`]
//! shared with anything that sends. Plain TCP and TLS go through the same
//! pair of types so the connection handling above does not care which one
//! it got.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, UdpSocket};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::tls::{TlsReader, TlsWriter};

/// Read half of one connection.
pub enum ConnectionReader {
    Tcp(TcpStream),
    Tls(TlsReader),
}

impl ConnectionReader {
    /// Reads one chunk of payload bytes. `Ok(0)` means the peer closed.
    ///
    /// Blocks until data arrives; a `shutdown(2)` on the socket from another
    /// thread unblocks it with `Ok(0)` or a connection-reset error.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ConnectionReader::Tcp(stream) => stream.read(buf),
            ConnectionReader::Tls(reader) => reader.read(buf),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionReader::Tcp(_) => "tcp",
            ConnectionReader::Tls(_) => "tls",
        }
    }
}

/// Write half of one connection. Clones share the same underlying stream;
/// each `write_all` call sends one complete message.
#[derive(Clone)]
pub enum ConnectionWriter {
    Tcp(Arc<Mutex<TcpStream>>),
    Tls(TlsWriter),
    /// Connected UDP socket; every write is one datagram.
    Udp(Arc<UdpSocket>),
}

impl ConnectionWriter {
    pub fn write_all(&self, payload: &[u8]) -> io::Result<()> {
        match self {
            ConnectionWriter::Tcp(stream) => {
                let mut stream = stream.lock();
                stream.write_all(payload)?;
                stream.flush()
            }
            ConnectionWriter::Tls(writer) => writer.write_all(payload),
            ConnectionWriter::Udp(socket) => {
                socket.send(payload)?;
                Ok(())
            }
        }
    }

    /// Starts an orderly close: TLS close-notify, TCP shutdown. The raw
    /// socket teardown that unblocks a reader thread stays with whoever
    /// holds the stream clone.
    pub fn close(&self) {
        match self {
            ConnectionWriter::Tcp(stream) => {
                let _ = stream.lock().shutdown(Shutdown::Both);
            }
            ConnectionWriter::Tls(writer) => writer.send_close_notify(),
            ConnectionWriter::Udp(_) => {}
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionWriter::Tcp(_) => "tcp",
            ConnectionWriter::Tls(_) => "tls",
            ConnectionWriter::Udp(_) => "udp",
        }
    }
}

/// Splits a plain TCP stream into its two halves.
pub fn tcp_split(stream: TcpStream) -> io::Result<(ConnectionReader, ConnectionWriter)> {
    let writer = ConnectionWriter::Tcp(Arc::new(Mutex::new(stream.try_clone()?)));
    Ok((ConnectionReader::Tcp(stream), writer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_tcp_split_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let (mut reader, writer) = tcp_split(stream).unwrap();
            let mut buf = [0u8; 64];
            let n = reader.read(&mut buf).unwrap();
            writer.write_all(&buf[..n]).unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        let (mut reader, writer) = tcp_split(stream).unwrap();
        writer.write_all(b"ping").unwrap();
        let mut buf = [0u8; 64];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        handle.join().unwrap();
    }

    #[test]
    fn test_writer_close_unblocks_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let (mut reader, _writer) = tcp_split(stream).unwrap();
            let mut buf = [0u8; 64];
            // Blocks until the peer shuts the connection down.
            reader.read(&mut buf).unwrap_or(0)
        });

        let stream = TcpStream::connect(addr).unwrap();
        let (_reader, writer) = tcp_split(stream).unwrap();
        thread::sleep(std::time::Duration::from_millis(50));
        writer.close();
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn test_udp_writer_sends_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.connect(receiver.local_addr().unwrap()).unwrap();

        let writer = ConnectionWriter::Udp(Arc::new(sender));
        writer.write_all(b"state update").unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"state update");
        assert_eq!(writer.kind(), "udp");
    }
}
