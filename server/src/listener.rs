//! Lifecycle notifications for code embedding a [`crate::network::Server`]

use std::net::SocketAddr;

/// Receives server lifecycle events
///
/// Callbacks run on the server's network tasks and should return quickly.
/// Every method has an empty default so implementors only override what
/// they need.
pub trait ServerListener: Send + Sync {
    fn server_started(&self, _addr: SocketAddr) {}

    fn server_stopped(&self) {}

    fn client_connected(&self, _addr: SocketAddr, _client_id: u8) {}

    fn client_disconnected(&self, _addr: SocketAddr, _client_id: u8) {}

    fn client_named(&self, _client_id: u8, _name: &str) {}
}
