//! # Game Network Server Library
//!
//! This library provides the listening side of the networked game stack. It
//! accepts TCP, TLS, or UDP traffic, keeps every established connection
//! healthy through heartbeats, and hands received payloads to the
//! application without ever blocking a socket thread on application code.
//!
//! ## Core Responsibilities
//!
//! ### Connection Lifecycle
//! Handles the complete lifecycle of client connections including:
//! - Accepting sockets and assigning connection ids
//! - Running the TLS handshake when certificates are configured
//! - Evicting connections whose heartbeats stop arriving
//! - Orderly teardown of every socket and thread on shutdown
//!
//! ### Message Delivery
//! Received payloads are classified on the shared dispatcher pool. Control
//! traffic (heartbeats, the shutdown request) is answered internally;
//! application payloads flow to a registered message hook or, by default,
//! into a bounded inbound queue the application consumes at its own pace.
//! The queue's capacity bound is what pushes backpressure onto producers
//! instead of growing memory under load.
//!
//! ### Abuse Protection
//! With a rate limiter configured, connection attempts and datagrams are
//! throttled per source address before any resources are committed to
//! them. The default configuration admits all traffic.
//!
//! ## Module Organization
//!
//! ### Config Module (`config`)
//! Runtime configuration with defaults suitable for local play:
//! - Bind address, port, and transport selection
//! - TLS certificate source (files or self-signed)
//! - Heartbeat cadence and eviction timeout
//!
//! ### Connections Module (`connections`)
//! The table of established connections:
//! - Id assignment and writer attachment
//! - Heartbeat bookkeeping and silent-connection detection
//! - Socket teardown that unblocks reader threads
//!
//! ### Network Module (`network`)
//! The server itself:
//! - Accept and datagram loops with cooperative shutdown
//! - Per-connection reader threads
//! - Directed sends, broadcasts, and the inbound queue
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use engine::dispatcher::Dispatcher;
//! use engine::message_queue::MessageQueue;
//! use server::config::ServerConfig;
//! use server::network::Server;
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dispatcher = Arc::new(Dispatcher::new());
//!     dispatcher.start(4);
//!
//!     let inbound = Arc::new(MessageQueue::new(256));
//!     let server = Server::new(
//!         ServerConfig::default(),
//!         Arc::clone(&dispatcher),
//!         Arc::clone(&inbound),
//!     )?;
//!     server.start()?;
//!
//!     // Consume inbound messages until the server stops.
//!     while let Some(message) = inbound.pop() {
//!         println!(
//!             "connection {} says {}",
//!             message.connection,
//!             message.payload_text()
//!         );
//!     }
//!
//!     server.stop();
//!     dispatcher.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Threading Model
//!
//! Socket threads only move bytes. Everything that inspects a payload runs
//! on the dispatcher pool, so one slow handler cannot stall the accept loop
//! or another connection's reads. Shutdown can come from the owner calling
//! `stop`, from dropping the server, or from a connection sending the
//! shutdown request; all three converge on the same teardown path and
//! `wait` unblocks once it finishes.

pub mod config;
pub mod connections;
pub mod network;
