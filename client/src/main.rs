use clap::Parser;
use log::{error, info};
use std::io::BufRead;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use client::config::ClientConfig;
use client::network::Client;
use engine::dispatcher::Dispatcher;
use engine::protocol::Protocol;
use engine::tls::ClientTlsConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server hostname or address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1")]
    server: String,

    /// Server port
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Transport protocol: tcp or udp
    #[arg(short = 't', long, default_value = "tcp")]
    protocol: String,

    /// Connect with TLS, trusting the given PEM CA bundle
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Connect with TLS but skip certificate validation
    #[arg(long)]
    insecure: bool,

    /// Seconds between heartbeats
    #[arg(long, default_value = "5")]
    heartbeat_interval: u64,

    /// Worker threads in the dispatch pool
    #[arg(short = 'w', long, default_value = "2")]
    workers: usize,
}

/// Reads lines from stdin and sends each one to the server; `quit` exits.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let protocol = Protocol::from_str(&args.protocol)?;

    let tls = if args.ca.is_some() || args.insecure {
        Some(ClientTlsConfig {
            ca_file: args.ca,
            accept_invalid_certs: args.insecure,
        })
    } else {
        None
    };

    let config = ClientConfig {
        server_addr: args.server,
        port: args.port,
        protocol,
        tls,
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval),
        ..ClientConfig::default()
    };

    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.start(args.workers);

    let client = Client::new(config, Arc::clone(&dispatcher))?;
    client.set_message_callback(Arc::new(|payload| {
        println!("< {}", String::from_utf8_lossy(&payload));
    }));
    client.connect()?;

    info!("Type a message and press enter to send it");
    info!("Type \"quit\" to exit");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "quit" {
            break;
        }
        if let Err(err) = client.send(trimmed.as_bytes()) {
            error!("Send failed: {}", err);
        }
    }

    client.disconnect();
    dispatcher.stop();

    Ok(())
}
