//! Hand-off queue between the network receive task and the application

use crate::packet::Packet;
use log::warn;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

/// Unbounded FIFO of decoded packets
///
/// The network side calls [`Channel::write`], the application polls
/// [`Channel::read`] from its own update loop. Neither call blocks.
#[derive(Debug)]
pub struct Channel {
    sender: mpsc::UnboundedSender<Packet>,
    receiver: Mutex<mpsc::UnboundedReceiver<Packet>>,
}

impl Channel {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    pub fn write(&self, packet: Packet) {
        // The receiver lives as long as `self`, so this only fails while dropping
        if let Err(e) = self.sender.send(packet) {
            warn!("Dropping packet from client {}: channel closed", e.0.client_id());
        }
    }

    /// Returns the oldest packet, or `None` when the queue is empty.
    pub fn read(&self) -> Option<Packet> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_recv()
            .ok()
    }

    /// Takes every packet currently queued.
    pub fn drain(&self) -> Vec<Packet> {
        let mut receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut packets = Vec::new();
        while let Ok(packet) = receiver.try_recv() {
            packets.push(packet);
        }
        packets
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}
