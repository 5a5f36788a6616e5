//! # Relay Client Library
//!
//! The peer side of the UDP session protocol. A [`Client`] connects to a
//! relay server, keeps its session alive, and exposes what the server sends:
//!
//! - DATA relayed from other peers and DIRECT messages from the server,
//!   queued on a [`shared::Channel`] for the application to poll
//! - The set of other connected peers and the names they announced
//! - Round-trip latency measured with PING
//!
//! [`discover`] asks a server for its info blob without connecting.
//!
//! ## Module Organization
//!
//! - `network`: [`Client`], its receive and keep-alive tasks, and [`discover`]
//! - `config`: [`ClientConfig`] with keep-alive and handshake timing
//! - `error`: [`ClientError`]
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::{Client, ClientConfig};
//! use shared::PayloadBuilder;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::connect("127.0.0.1:8080".parse()?, ClientConfig::default()).await?;
//!     client.set_name("alice").await?;
//!
//!     let payload = PayloadBuilder::new().string("hello").build();
//!     client.send_data(1, payload).await?;
//!
//!     while let Some(mut packet) = client.channel().read() {
//!         println!("{}: {}", packet.source_client_id(), packet.read_string()?);
//!     }
//!
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod network;

pub use config::ClientConfig;
pub use error::ClientError;
pub use network::{discover, Client};
