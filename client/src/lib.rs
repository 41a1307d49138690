//! # Game Network Client Library
//!
//! This library provides the connecting side of the networked game stack.
//! It dials a server over TCP, TLS, or UDP, keeps the connection alive with
//! heartbeats, and survives server restarts by reconnecting in the
//! background while the application keeps its handle.
//!
//! ## Architecture Overview
//!
//! The client separates the application from the socket completely. Sends
//! are queued onto the shared dispatcher pool, received payloads arrive
//! through a callback, and connection management happens on dedicated
//! threads the application never sees:
//!
//! ### Session Thread
//! Owns the read half of the connection. When a read fails or the server
//! closes, it tears the session down and, with `auto_reconnect` enabled,
//! re-establishes it with a fixed backoff until the client is disconnected.
//! Only the first connect reports errors to the caller; everything after
//! that is the session thread's job.
//!
//! ### Heartbeat Thread
//! Sends a heartbeat payload at a fixed interval while a session is
//! established, so the server's silence detector never evicts a healthy
//! client. Server acknowledgements are consumed internally and never reach
//! the application callback.
//!
//! ### Transports
//! Plain TCP and TLS behave identically above the handshake. Datagram
//! sessions are send-only: the client can push state reports to a
//! datagram server but receives nothing back.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::config::ClientConfig;
//! use client::network::Client;
//! use engine::dispatcher::Dispatcher;
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dispatcher = Arc::new(Dispatcher::new());
//!     dispatcher.start(2);
//!
//!     let client = Client::new(ClientConfig::default(), Arc::clone(&dispatcher))?;
//!     client.set_message_callback(Arc::new(|payload| {
//!         println!("{}", String::from_utf8_lossy(&payload));
//!     }));
//!     client.connect()?;
//!
//!     client.send(b"hello")?;
//!
//!     client.disconnect();
//!     dispatcher.stop();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod network;
