//! # Relay Server Library
//!
//! This library implements the server end of the UDP session protocol. It
//! hands out client ids, keeps track of who is still alive, relays DATA
//! between clients, and queues everything it receives for the embedding
//! application.
//!
//! ## Module Organization
//!
//! ### Client Manager Module (`client_manager`)
//! The registry of connected clients:
//! - Id assignment from 255 slots, lowest free id first
//! - Endpoint and id lookups
//! - Liveness timestamps and timeout sweeps
//!
//! ### Network Module (`network`)
//! The [`Server`] itself, with its receive loop, liveness checker, and
//! targeted or broadcast sends.
//!
//! ### Bandwidth Module (`bandwidth`)
//! Byte counters fed by the socket and the sampler that turns them into
//! kB/s once per window.
//!
//! ### Listener Module (`listener`)
//! [`ServerListener`], the callback surface for lifecycle events.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::{Server, ServerConfig};
//! use std::net::{IpAddr, Ipv4Addr};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default().with_client_timeout(Duration::from_secs(5));
//!     let server = Server::new(config);
//!     let addr = server.start(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080).await?;
//!     println!("listening on {}", addr);
//!
//!     // Packets arrive on the channel; poll it from the application loop
//!     let channel = server.channel();
//!     while let Some(packet) = channel.read() {
//!         println!("client {} sent data {}", packet.source_client_id(), packet.data_id());
//!     }
//!
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

pub mod bandwidth;
pub mod client_manager;
pub mod config;
pub mod error;
pub mod listener;
pub mod network;

pub use bandwidth::BandwidthMeter;
pub use client_manager::{ClientData, ClientRegistry, MAX_CLIENTS};
pub use config::ServerConfig;
pub use error::ServerError;
pub use listener::ServerListener;
pub use network::{InfoSupplier, Server};
