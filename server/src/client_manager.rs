//! Client registry for the relay server
//!
//! This module tracks every connected peer:
//! - Client id assignment from a fixed table of 255 slots
//! - Endpoint to id lookups in both directions
//! - Liveness timestamps and timeout detection
//!
//! Id 0 belongs to the server, so slot `n` holds client id `n + 1`. The
//! lowest free slot is always handed out first, which makes ids of departed
//! clients available again immediately.

use log::info;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Number of client ids available to peers
pub const MAX_CLIENTS: usize = 255;

/// A connected peer
#[derive(Debug, Clone)]
pub struct ClientData {
    /// Id assigned by the server at connect time
    pub id: u8,
    /// Address and port the peer sends from
    pub addr: SocketAddr,
    /// Last time any message from this peer was accepted
    pub last_alive_at: Instant,
    /// Name announced through NAME_SET, if any
    pub name: Option<String>,
}

impl ClientData {
    pub fn new(id: u8, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_alive_at: Instant::now(),
            name: None,
        }
    }

    /// Marks the client alive now. Never moves the timestamp backwards.
    pub fn touch(&mut self) {
        self.last_alive_at = self.last_alive_at.max(Instant::now());
    }

    /// Returns true if nothing has been heard from the client for longer
    /// than `timeout`.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_alive_at.elapsed() > timeout
    }
}

/// Directory of connected clients
///
/// The registry is not synchronised itself; the server wraps it in a lock so
/// the receive loop and the liveness checker observe atomic updates.
#[derive(Debug)]
pub struct ClientRegistry {
    slots: Vec<Option<ClientData>>,
    by_addr: HashMap<SocketAddr, u8>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            slots: vec![None; MAX_CLIENTS],
            by_addr: HashMap::new(),
        }
    }

    /// Registers a new endpoint and returns its client id.
    ///
    /// An endpoint that is already registered keeps its id. Returns `None`
    /// when every id is taken, leaving the registry unchanged.
    pub fn register(&mut self, addr: SocketAddr) -> Option<u8> {
        if let Some(&id) = self.by_addr.get(&addr) {
            return Some(id);
        }

        let slot = self.slots.iter().position(Option::is_none)?;
        let id = (slot + 1) as u8;

        self.slots[slot] = Some(ClientData::new(id, addr));
        self.by_addr.insert(addr, id);
        info!("Client {} registered from {}", id, addr);

        Some(id)
    }

    /// Refreshes the liveness timestamp. Returns false for unknown endpoints.
    pub fn touch(&mut self, addr: SocketAddr) -> bool {
        match self.by_addr.get(&addr).copied() {
            Some(id) => {
                if let Some(client) = self.slot_mut(id) {
                    client.touch();
                }
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, addr: SocketAddr) -> Option<ClientData> {
        let id = self.by_addr.remove(&addr)?;
        let client = self.slot_mut_entry(id)?.take();
        if let Some(client) = &client {
            info!("Client {} removed ({})", client.id, client.addr);
        }
        client
    }

    pub fn remove_by_id(&mut self, id: u8) -> Option<ClientData> {
        let addr = self.get(id)?.addr;
        self.remove(addr)
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<u8> {
        self.by_addr.get(&addr).copied()
    }

    pub fn get(&self, id: u8) -> Option<&ClientData> {
        if id == 0 {
            return None;
        }
        self.slots.get(id as usize - 1)?.as_ref()
    }

    pub fn addr_of(&self, id: u8) -> Option<SocketAddr> {
        self.get(id).map(|client| client.addr)
    }

    /// Stores a client's name. Returns false if the id is not registered.
    pub fn set_name(&mut self, id: u8, name: String) -> bool {
        match self.slot_mut(id) {
            Some(client) => {
                client.name = Some(name);
                true
            }
            None => false,
        }
    }

    /// Ids of every connected client, ascending
    pub fn ids(&self) -> Vec<u8> {
        self.clients().map(|client| client.id).collect()
    }

    /// Ids and addresses of every connected client, ascending by id
    pub fn client_addrs(&self) -> Vec<(u8, SocketAddr)> {
        self.clients().map(|client| (client.id, client.addr)).collect()
    }

    pub fn clients(&self) -> impl Iterator<Item = &ClientData> {
        self.slots.iter().flatten()
    }

    /// Removes and returns every client silent for longer than `timeout`.
    ///
    /// Expired clients are collected before any is removed.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<ClientData> {
        let timed_out: Vec<SocketAddr> = self
            .clients()
            .filter(|client| client.is_timed_out(timeout))
            .map(|client| client.addr)
            .collect();

        timed_out
            .into_iter()
            .filter_map(|addr| self.remove(addr))
            .collect()
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.by_addr.clear();
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    fn slot_mut_entry(&mut self, id: u8) -> Option<&mut Option<ClientData>> {
        if id == 0 {
            return None;
        }
        self.slots.get_mut(id as usize - 1)
    }

    fn slot_mut(&mut self, id: u8) -> Option<&mut ClientData> {
        self.slot_mut_entry(id)?.as_mut()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
