use clap::Parser;
use log::{debug, info};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use engine::dispatcher::Dispatcher;
use engine::message_queue::MessageQueue;
use engine::protocol::Protocol;
use engine::tls::ServerTlsConfig;
use server::config::ServerConfig;
use server::network::Server;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Interface to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Transport protocol: tcp or udp
    #[arg(short = 't', long, default_value = "tcp")]
    protocol: String,

    /// PEM certificate chain enabling TLS
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// PEM private key for the certificate
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Serve TLS with an ephemeral self-signed certificate
    #[arg(long, conflicts_with_all = ["cert", "key"])]
    self_signed: bool,

    /// Worker threads in the dispatch pool
    #[arg(short = 'w', long, default_value = "4")]
    workers: usize,

    /// Capacity of the inbound message queue
    #[arg(short = 'q', long, default_value = "256")]
    queue_capacity: usize,

    /// Seconds a connection may stay silent before eviction
    #[arg(long, default_value = "10")]
    heartbeat_timeout: u64,
}

/// Runs the server until a client sends the shutdown request, echoing
/// every received payload back to its sender.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let protocol = Protocol::from_str(&args.protocol)?;

    let tls = if args.self_signed {
        Some(ServerTlsConfig::SelfSigned {
            hostnames: vec!["localhost".to_string(), args.host.clone()],
        })
    } else {
        match (args.cert, args.key) {
            (Some(cert), Some(key)) => Some(ServerTlsConfig::Files { cert, key }),
            _ => None,
        }
    };

    let config = ServerConfig {
        bind_addr: args.host,
        port: args.port,
        protocol,
        tls,
        heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout),
        ..ServerConfig::default()
    };

    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.start(args.workers);

    let inbound = Arc::new(MessageQueue::new(args.queue_capacity));
    let server = Arc::new(Server::new(
        config,
        Arc::clone(&dispatcher),
        Arc::clone(&inbound),
    )?);
    server.start()?;

    info!("Starting server...");
    info!("Send \"shutdown\" from any client to stop");

    let consumer = {
        let server = Arc::clone(&server);
        thread::spawn(move || {
            while let Some(message) = inbound.pop() {
                info!(
                    "Message from connection {}: {}",
                    message.connection,
                    message.payload_text()
                );
                if let Err(err) = server.send_to(message.connection, &message.payload) {
                    debug!("Echo to connection {} failed: {}", message.connection, err);
                }
            }
        })
    };

    server.wait();
    let _ = consumer.join();
    dispatcher.stop();
    info!("Server exited");

    Ok(())
}
