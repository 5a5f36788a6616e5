//! Server network layer handling UDP communications and client relaying

use crate::bandwidth::{self, BandwidthMeter};
use crate::client_manager::{ClientData, ClientRegistry};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::listener::ServerListener;
use log::{debug, error, info, warn};
use shared::codec::{self, BUFFER_SIZE, MAX_LISTED_CLIENTS};
use shared::{Channel, DecodedMessage, Message, Packet, ProtocolError, SERVER_ID};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Produces the blob returned to INFO discovery probes
pub type InfoSupplier = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;

const MIN_SCAN_INTERVAL: Duration = Duration::from_millis(1);

/// The bound socket shared by every network task
///
/// Writes go through one lock so concurrent senders never interleave, and
/// every byte written is counted for the bandwidth sampler.
struct Transport {
    socket: UdpSocket,
    write_lock: Mutex<()>,
    meter: Arc<BandwidthMeter>,
}

impl Transport {
    async fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> io::Result<()> {
        let _guard = self.write_lock.lock().await;
        let sent = self.socket.send_to(datagram, addr).await?;
        self.meter.record_sent(sent);
        Ok(())
    }
}

/// Handles owned by a started server
struct Running {
    transport: Arc<Transport>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// State reachable from the network tasks
struct Shared {
    config: ServerConfig,
    registry: RwLock<ClientRegistry>,
    channel: Arc<Channel>,
    meter: Arc<BandwidthMeter>,
    listeners: StdRwLock<Vec<Arc<dyn ServerListener>>>,
    info_supplier: StdRwLock<Option<InfoSupplier>>,
}

/// UDP relay server
///
/// Once started, three tasks run until [`Server::stop`]:
/// - **Receiver**: decodes datagrams and dispatches them by message type
/// - **Liveness checker**: evicts clients that stay silent past the timeout
/// - **Bandwidth sampler**: publishes up/down throughput once per window
///
/// DATA messages are pushed to the [`Channel`] and relayed to every other
/// client. DIRECT messages only reach the channel.
pub struct Server {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                registry: RwLock::new(ClientRegistry::new()),
                channel: Arc::new(Channel::new()),
                meter: Arc::new(BandwidthMeter::new()),
                listeners: StdRwLock::new(Vec::new()),
                info_supplier: StdRwLock::new(None),
            }),
            running: Mutex::new(None),
        }
    }

    /// Queue of packets received from clients
    pub fn channel(&self) -> Arc<Channel> {
        Arc::clone(&self.shared.channel)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn add_listener(&self, listener: Arc<dyn ServerListener>) {
        self.shared
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Sets the blob returned to INFO probes. Without a supplier the reply
    /// carries an empty blob.
    pub fn set_info_supplier<F>(&self, supplier: F)
    where
        F: Fn() -> Vec<u8> + Send + Sync + 'static,
    {
        *self
            .shared
            .info_supplier
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(supplier));
    }

    /// Binds the socket and spawns the network tasks.
    ///
    /// Returns the bound address, which differs from `port` when 0 was
    /// requested. Calling this on a running server does nothing and returns
    /// the current address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Transport`] if the socket cannot be bound.
    pub async fn start(&self, ip: IpAddr, port: u16) -> Result<SocketAddr, ServerError> {
        let addr = {
            let mut running = self.running.lock().await;
            if let Some(current) = running.as_ref() {
                debug!("Server already running");
                return Ok(current.transport.socket.local_addr()?);
            }

            let socket = UdpSocket::bind(SocketAddr::new(ip, port)).await?;
            let addr = socket.local_addr()?;

            self.shared.meter.reset();
            let transport = Arc::new(Transport {
                socket,
                write_lock: Mutex::new(()),
                meter: Arc::clone(&self.shared.meter),
            });

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let tasks = vec![
                spawn_receiver(
                    Arc::clone(&self.shared),
                    Arc::clone(&transport),
                    shutdown_rx.clone(),
                ),
                spawn_liveness_checker(
                    Arc::clone(&self.shared),
                    Arc::clone(&transport),
                    shutdown_rx.clone(),
                ),
                bandwidth::spawn_sampler(
                    Arc::clone(&self.shared.meter),
                    self.shared.config.bandwidth_interval.max(MIN_SCAN_INTERVAL),
                    shutdown_rx,
                ),
            ];

            *running = Some(Running {
                transport,
                shutdown: shutdown_tx,
                tasks,
            });
            addr
        };

        info!("Server listening on {}", addr);
        self.shared.notify(|listener| listener.server_started(addr));
        Ok(addr)
    }

    /// Notifies clients, stops every network task, and releases the socket.
    ///
    /// Returns once all tasks have finished. Does nothing if the server is
    /// not running.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(Running {
            transport,
            shutdown,
            tasks,
        }) = running.take()
        else {
            debug!("Server not running, nothing to stop");
            return;
        };

        let clients = self.shared.registry.read().await.client_addrs();
        let notice = Message::Disconnected {
            client_id: SERVER_ID,
        };
        for (client_id, addr) in clients {
            self.shared
                .send_logged(&transport, &notice, client_id, addr)
                .await;
        }

        // Every task also stops if the sender is gone, so the result is irrelevant
        let _ = shutdown.send(true);
        for task in tasks {
            if let Err(e) = task.await {
                error!("Network task panicked: {}", e);
            }
        }

        self.shared.registry.write().await.clear();
        drop(transport);
        drop(running);

        info!("Server stopped");
        self.shared.notify(|listener| listener.server_stopped());
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let running = self.running.lock().await;
        running
            .as_ref()
            .and_then(|current| current.transport.socket.local_addr().ok())
    }

    async fn transport(&self) -> Result<Arc<Transport>, ServerError> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|current| Arc::clone(&current.transport))
            .ok_or(ServerError::NotRunning)
    }

    /// Sends `message` to every connected client.
    ///
    /// # Errors
    ///
    /// Fails with [`ServerError::NotRunning`] before `start`, or on the first
    /// encode or socket error.
    pub async fn send(&self, message: &Message) -> Result<(), ServerError> {
        let transport = self.transport().await?;
        let clients = self.shared.registry.read().await.client_addrs();

        for (client_id, addr) in clients {
            let datagram = message.encode(client_id)?;
            transport.send_to(&datagram, addr).await?;
        }
        Ok(())
    }

    /// Sends `message` to one client.
    ///
    /// # Errors
    ///
    /// Fails with [`ServerError::NoSuchClient`] if `client_id` is not
    /// connected; nothing is written in that case.
    pub async fn send_to_client(
        &self,
        message: &Message,
        client_id: u8,
    ) -> Result<(), ServerError> {
        let addr = self
            .shared
            .registry
            .read()
            .await
            .addr_of(client_id)
            .ok_or(ServerError::NoSuchClient(client_id))?;

        let transport = self.transport().await?;
        let datagram = message.encode(client_id)?;
        transport.send_to(&datagram, addr).await?;
        Ok(())
    }

    /// Renames a client and announces the new name to every client.
    pub async fn set_client_name(&self, client_id: u8, name: &str) -> Result<(), ServerError> {
        if !self
            .shared
            .registry
            .write()
            .await
            .set_name(client_id, name.to_string())
        {
            return Err(ServerError::NoSuchClient(client_id));
        }

        self.shared
            .notify(|listener| listener.client_named(client_id, name));

        let transport = self.transport().await?;
        let announcement = Message::NameSet {
            client_id,
            name: name.to_string(),
        }
        .encode(SERVER_ID)?;

        let clients = self.shared.registry.read().await.client_addrs();
        for (_, addr) in clients {
            transport.send_to(&announcement, addr).await?;
        }
        Ok(())
    }

    /// Number of connected clients
    pub async fn clients(&self) -> usize {
        self.shared.registry.read().await.len()
    }

    pub async fn client_ids(&self) -> Vec<u8> {
        self.shared.registry.read().await.ids()
    }

    pub async fn client_name(&self, client_id: u8) -> Option<String> {
        self.shared
            .registry
            .read()
            .await
            .get(client_id)
            .and_then(|client| client.name.clone())
    }

    /// Upload rate of the last completed window in kB/s, negative before the
    /// first window completes
    pub fn bandwidth_up(&self) -> f64 {
        self.shared.meter.up()
    }

    /// Download rate of the last completed window in kB/s, negative before
    /// the first window completes
    pub fn bandwidth_down(&self) -> f64 {
        self.shared.meter.down()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Tasks hold their own references, so signal them to exit
        if let Ok(mut running) = self.running.try_lock() {
            if let Some(current) = running.take() {
                let _ = current.shutdown.send(true);
            }
        }
    }
}

/// Spawns task that continuously receives and dispatches datagrams
fn spawn_receiver(
    shared: Arc<Shared>,
    transport: Arc<Transport>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer = [0u8; BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = transport.socket.recv_from(&mut buffer) => match result {
                    Ok((len, addr)) => {
                        shared.meter.record_received(len);
                        if let Err(e) = shared
                            .handle_datagram(&transport, &buffer[..len], addr)
                            .await
                        {
                            warn!("Dropped message from {}: {}", addr, e);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }

        debug!("Receiver stopped");
    })
}

/// Spawns task that evicts clients silent for longer than the timeout
fn spawn_liveness_checker(
    shared: Arc<Shared>,
    transport: Arc<Transport>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let timeout = shared.config.client_timeout;
        let mut ticker = interval(timeout.max(MIN_SCAN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Skip the first tick since it fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let evicted = shared.registry.write().await.check_timeouts(timeout);
                    for client in evicted {
                        info!("Client {} timed out ({})", client.id, client.addr);
                        shared.client_left(&transport, &client).await;
                    }
                }
            }
        }

        debug!("Liveness checker stopped");
    })
}

impl Shared {
    fn notify(&self, event: impl Fn(&dyn ServerListener)) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for listener in &listeners {
            event(listener.as_ref());
        }
    }

    /// Encodes and sends one message, logging instead of failing
    async fn send_logged(
        &self,
        transport: &Transport,
        message: &Message,
        client_id: u8,
        addr: SocketAddr,
    ) {
        let datagram = match message.encode(client_id) {
            Ok(datagram) => datagram,
            Err(e) => {
                error!("Failed to encode {:?}: {}", message.message_type(), e);
                return;
            }
        };

        if let Err(e) = transport.send_to(&datagram, addr).await {
            warn!("Failed to send to client {} at {}: {}", client_id, addr, e);
        }
    }

    /// Processes one datagram from `addr`
    async fn handle_datagram(
        &self,
        transport: &Transport,
        datagram: &[u8],
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let message = codec::decode(datagram)?;
        debug!("Received {:?} from {}", message.message_type(), addr);

        match message {
            DecodedMessage::Connect { .. } => return self.handle_connect(transport, addr).await,
            DecodedMessage::InfoRequest => return self.handle_info(transport, addr).await,
            _ => {}
        }

        let client_id = {
            let mut registry = self.registry.write().await;
            let client_id = registry
                .find_by_addr(addr)
                .ok_or(ServerError::UnknownClient(addr))?;
            message.expect_client(client_id)?;
            registry.touch(addr);
            client_id
        };

        match message {
            DecodedMessage::Alive { .. } => Ok(()),
            DecodedMessage::Ping { .. } => {
                self.send_logged(transport, &Message::Ping, client_id, addr)
                    .await;
                Ok(())
            }
            DecodedMessage::Direct(packet) => {
                self.channel.write(packet.with_source(client_id));
                Ok(())
            }
            DecodedMessage::Data(packet) => {
                self.channel.write(packet.with_source(client_id));
                self.relay(transport, datagram, client_id).await;
                Ok(())
            }
            DecodedMessage::Disconnect {
                disconnected_id, ..
            } => {
                self.handle_disconnect(transport, addr, client_id, disconnected_id)
                    .await
            }
            DecodedMessage::NameSet {
                client_id: target,
                name,
                ..
            } => self.handle_name_set(transport, client_id, target, name).await,
            other => {
                warn!(
                    "Ignoring unexpected {:?} from client {}",
                    other.message_type(),
                    client_id
                );
                Ok(())
            }
        }
    }

    async fn handle_connect(
        &self,
        transport: &Transport,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let client_id = {
            let mut registry = self.registry.write().await;
            if let Some(existing) = registry.find_by_addr(addr) {
                warn!("Client {} at {} is already connected", existing, addr);
                return Ok(());
            }
            registry.register(addr)
        };

        let Some(client_id) = client_id else {
            let refusal = Message::Disconnected {
                client_id: SERVER_ID,
            };
            self.send_logged(transport, &refusal, SERVER_ID, addr).await;
            return Err(ServerError::CapacityExhausted);
        };

        self.send_logged(transport, &Message::Connected, client_id, addr)
            .await;
        info!("Client {} connected from {}", client_id, addr);
        self.notify(|listener| listener.client_connected(addr, client_id));

        self.broadcast_clients_list(transport).await;
        Ok(())
    }

    /// Sends every client the ids of all other connected clients
    async fn broadcast_clients_list(&self, transport: &Transport) {
        let clients = self.registry.read().await.client_addrs();

        for (client_id, addr) in &clients {
            let mut others: Vec<u8> = clients
                .iter()
                .map(|(other, _)| *other)
                .filter(|other| other != client_id)
                .collect();

            if others.len() > MAX_LISTED_CLIENTS {
                warn!(
                    "Truncating clients list for client {} to {} entries",
                    client_id, MAX_LISTED_CLIENTS
                );
                others.truncate(MAX_LISTED_CLIENTS);
            }

            let message = Message::ClientsList { client_ids: others };
            self.send_logged(transport, &message, *client_id, *addr)
                .await;
        }
    }

    async fn handle_info(
        &self,
        transport: &Transport,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let supplier = self
            .info_supplier
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let blob = supplier.map(|supply| supply()).unwrap_or_default();

        let reply = Message::Info { blob }.encode(SERVER_ID)?;
        transport.send_to(&reply, addr).await?;
        Ok(())
    }

    async fn handle_disconnect(
        &self,
        transport: &Transport,
        addr: SocketAddr,
        client_id: u8,
        disconnected_id: u8,
    ) -> Result<(), ServerError> {
        if disconnected_id != client_id {
            return Err(ProtocolError::ClientIdMismatch {
                expected: client_id,
                actual: disconnected_id,
            }
            .into());
        }

        // The liveness checker may have evicted the client in the meantime
        let Some(client) = self.registry.write().await.remove(addr) else {
            return Ok(());
        };

        info!("Client {} disconnected", client.id);
        self.client_left(transport, &client).await;
        Ok(())
    }

    /// Tells the remaining clients and the application that `client` left
    async fn client_left(&self, transport: &Transport, client: &ClientData) {
        let clients = self.registry.read().await.client_addrs();
        let notice = Message::Disconnected {
            client_id: client.id,
        };
        for (client_id, addr) in clients {
            self.send_logged(transport, &notice, client_id, addr).await;
        }

        self.channel.write(Packet::disconnect(client.id));
        self.notify(|listener| listener.client_disconnected(client.addr, client.id));
    }

    async fn handle_name_set(
        &self,
        transport: &Transport,
        client_id: u8,
        target: u8,
        name: String,
    ) -> Result<(), ServerError> {
        if target != client_id {
            return Err(ProtocolError::ClientIdMismatch {
                expected: client_id,
                actual: target,
            }
            .into());
        }

        self.registry
            .write()
            .await
            .set_name(client_id, name.clone());
        info!("Client {} is now named {:?}", client_id, name);
        self.notify(|listener| listener.client_named(client_id, &name));

        let announcement = Message::NameSet { client_id, name };
        let clients = self.registry.read().await.client_addrs();
        for (other, addr) in clients.into_iter().filter(|(other, _)| *other != client_id) {
            debug!("Announcing name of client {} to client {}", client_id, other);
            self.send_logged(transport, &announcement, SERVER_ID, addr)
                .await;
        }
        Ok(())
    }

    /// Forwards a DATA datagram to every client except its sender
    ///
    /// The datagram is copied once and readdressed in place per recipient.
    async fn relay(&self, transport: &Transport, datagram: &[u8], source: u8) {
        let recipients = self.registry.read().await.client_addrs();
        let mut relayed = datagram.to_vec();

        for (client_id, addr) in recipients.into_iter().filter(|(id, _)| *id != source) {
            if let Err(e) = codec::rewrite_relay(&mut relayed, client_id, source) {
                error!("Cannot relay message from client {}: {}", source, e);
                return;
            }

            if let Err(e) = transport.send_to(&relayed, addr).await {
                warn!("Failed to relay to client {} at {}: {}", client_id, addr, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{MessageType, PacketMode, PayloadBuilder};
    use std::net::Ipv4Addr;
    use std::sync::Mutex as StdMutex;
    use tokio::time::{sleep, timeout, Instant};
    use tokio_test::{assert_err, assert_ok};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Started,
        Stopped,
        Connected(u8),
        Disconnected(u8),
        Named(u8, String),
    }

    #[derive(Default)]
    struct RecordingListener {
        events: StdMutex<Vec<Event>>,
    }

    impl RecordingListener {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn count(&self, event: &Event) -> usize {
            self.events().iter().filter(|e| *e == event).count()
        }
    }

    impl ServerListener for RecordingListener {
        fn server_started(&self, _addr: SocketAddr) {
            self.events.lock().unwrap().push(Event::Started);
        }

        fn server_stopped(&self) {
            self.events.lock().unwrap().push(Event::Stopped);
        }

        fn client_connected(&self, _addr: SocketAddr, client_id: u8) {
            self.events.lock().unwrap().push(Event::Connected(client_id));
        }

        fn client_disconnected(&self, _addr: SocketAddr, client_id: u8) {
            self.events
                .lock()
                .unwrap()
                .push(Event::Disconnected(client_id));
        }

        fn client_named(&self, client_id: u8, name: &str) {
            self.events
                .lock()
                .unwrap()
                .push(Event::Named(client_id, name.to_string()));
        }
    }

    /// A raw protocol peer on a loopback socket
    struct Peer {
        socket: UdpSocket,
        server: SocketAddr,
        id: u8,
    }

    impl Peer {
        async fn new(server: SocketAddr) -> Self {
            let socket = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
            Self {
                socket,
                server,
                id: 0,
            }
        }

        async fn connect(server: SocketAddr) -> Self {
            let mut peer = Self::new(server).await;
            peer.send(&Message::Connected).await;
            match peer.recv_type(MessageType::Connect).await {
                DecodedMessage::Connect { client_id } => peer.id = client_id,
                other => panic!("Unexpected message: {:?}", other),
            }
            peer
        }

        async fn send(&self, message: &Message) {
            let bytes = message.encode(self.id).unwrap();
            self.send_raw(&bytes).await;
        }

        async fn send_raw(&self, bytes: &[u8]) {
            self.socket.send_to(bytes, self.server).await.unwrap();
        }

        async fn try_recv(&self, wait: Duration) -> Option<DecodedMessage> {
            let mut buf = [0u8; BUFFER_SIZE];
            let (len, _) = timeout(wait, self.socket.recv_from(&mut buf))
                .await
                .ok()?
                .unwrap();
            Some(codec::decode(&buf[..len]).unwrap())
        }

        /// Receives until a message of `message_type` arrives
        async fn recv_type(&self, message_type: MessageType) -> DecodedMessage {
            let deadline = Instant::now() + Duration::from_secs(2);
            while Instant::now() < deadline {
                if let Some(message) = self.try_recv(Duration::from_millis(200)).await {
                    if message.message_type() == message_type {
                        return message;
                    }
                }
            }
            panic!("No {:?} received", message_type);
        }

        /// Fails if a message of `message_type` arrives within `wait`
        async fn assert_no(&self, message_type: MessageType, wait: Duration) {
            let deadline = Instant::now() + wait;
            while Instant::now() < deadline {
                if let Some(message) = self.try_recv(Duration::from_millis(20)).await {
                    assert_ne!(message.message_type(), message_type, "{:?}", message);
                }
            }
        }
    }

    async fn eventually(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            sleep(Duration::from_millis(10)).await;
        }
    }

    async fn next_packet(channel: &Channel) -> Packet {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(packet) = channel.read() {
                return packet;
            }
            assert!(Instant::now() < deadline, "no packet on channel");
            sleep(Duration::from_millis(10)).await;
        }
    }

    async fn started_server(config: ServerConfig) -> (Server, SocketAddr, Arc<RecordingListener>) {
        let server = Server::new(config);
        let listener = Arc::new(RecordingListener::default());
        server.add_listener(listener.clone());
        let addr = server.start(LOCALHOST, 0).await.unwrap();
        (server, addr, listener)
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (server, addr, listener) = started_server(ServerConfig::default()).await;

        assert!(server.is_running().await);
        assert_ne!(addr.port(), 0);
        assert_eq!(server.start(LOCALHOST, 0).await.unwrap(), addr);
        assert_eq!(listener.count(&Event::Started), 1);

        server.stop().await;
        assert!(!server.is_running().await);
        assert_eq!(server.local_addr().await, None);
        assert_eq!(listener.events(), vec![Event::Started, Event::Stopped]);
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let server = Server::default();
        server.stop().await;
        assert!(!server.is_running().await);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let (server, _, _) = started_server(ServerConfig::default()).await;
        server.stop().await;

        let addr = assert_ok!(server.start(LOCALHOST, 0).await);
        let peer = Peer::connect(addr).await;
        assert_eq!(peer.id, 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let (first, addr, _) = started_server(ServerConfig::default()).await;
        let second = Server::default();

        let result = second.start(LOCALHOST, addr.port()).await;
        assert!(matches!(result, Err(ServerError::Transport(_))));
        assert!(!second.is_running().await);

        first.stop().await;
    }

    #[tokio::test]
    async fn test_connect_assigns_id_and_fires_event() {
        let (server, addr, listener) = started_server(ServerConfig::default()).await;

        let peer = Peer::connect(addr).await;
        assert_eq!(peer.id, 1);

        eventually(|| listener.count(&Event::Connected(1)) == 1).await;
        assert_eq!(server.clients().await, 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_connect_is_ignored() {
        let (server, addr, listener) = started_server(ServerConfig::default()).await;

        let peer = Peer::connect(addr).await;
        peer.send(&Message::Connected).await;
        peer.assert_no(MessageType::Connect, Duration::from_millis(150))
            .await;

        assert_eq!(server.clients().await, 1);
        assert_eq!(server.client_ids().await, vec![1]);
        assert_eq!(listener.count(&Event::Connected(1)), 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_clients_list_excludes_recipient() {
        let (server, addr, _) = started_server(ServerConfig::default()).await;

        let a = Peer::connect(addr).await;
        let b = Peer::connect(addr).await;
        let c = Peer::connect(addr).await;

        let latest_list = |message: DecodedMessage| match message {
            DecodedMessage::ClientsList { client_ids, .. } => client_ids,
            other => panic!("Unexpected message: {:?}", other),
        };

        // C joined last, so the newest list each peer holds names the other two
        let mut a_list = latest_list(a.recv_type(MessageType::ClientsList).await);
        while a_list.len() < 2 {
            a_list = latest_list(a.recv_type(MessageType::ClientsList).await);
        }
        let mut b_list = latest_list(b.recv_type(MessageType::ClientsList).await);
        while b_list.len() < 2 {
            b_list = latest_list(b.recv_type(MessageType::ClientsList).await);
        }
        let c_list = latest_list(c.recv_type(MessageType::ClientsList).await);

        assert_eq!(a_list, vec![b.id, c.id]);
        assert_eq!(b_list, vec![a.id, c.id]);
        assert_eq!(c_list, vec![a.id, b.id]);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_ping_is_echoed() {
        let (server, addr, _) = started_server(ServerConfig::default()).await;

        let peer = Peer::connect(addr).await;
        peer.send(&Message::Ping).await;

        assert_eq!(
            peer.recv_type(MessageType::Ping).await,
            DecodedMessage::Ping { client_id: peer.id }
        );
        server.stop().await;
    }

    #[tokio::test]
    async fn test_message_from_unknown_endpoint_is_dropped() {
        let (server, addr, _) = started_server(ServerConfig::default()).await;

        let stranger = Peer::new(addr).await;
        stranger
            .send(&Message::Data {
                forward: true,
                source_id: 0,
                data_id: 1,
                payload: Vec::new(),
            })
            .await;
        stranger.send(&Message::Ping).await;
        stranger
            .assert_no(MessageType::Ping, Duration::from_millis(150))
            .await;

        assert_eq!(server.clients().await, 0);
        assert!(server.channel().read().is_none());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_datagrams_are_dropped() {
        let (server, addr, _) = started_server(ServerConfig::default()).await;
        let peer = Peer::connect(addr).await;

        // Bad magic on a CONNECT from a fresh endpoint
        let stranger = Peer::new(addr).await;
        let mut connect = Message::Connected.encode(0).unwrap();
        connect[0] = 0x00;
        stranger.send_raw(&connect).await;

        // Size byte disagreeing with the datagram
        let mut data = Message::Direct {
            source_id: peer.id,
            data_id: 1,
            payload: vec![1, 2, 3],
        }
        .encode(peer.id)
        .unwrap();
        data[2] += 1;
        peer.send_raw(&data).await;

        // Wrong client id byte
        let spoofed = Message::Direct {
            source_id: 9,
            data_id: 1,
            payload: Vec::new(),
        }
        .encode(9)
        .unwrap();
        peer.send_raw(&spoofed).await;

        // The loop is still alive afterwards
        peer.send(&Message::Ping).await;
        peer.recv_type(MessageType::Ping).await;

        assert_eq!(server.clients().await, 1);
        assert!(server.channel().read().is_none());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_direct_reaches_channel_only() {
        let (server, addr, _) = started_server(ServerConfig::default()).await;
        let a = Peer::connect(addr).await;
        let b = Peer::connect(addr).await;

        a.send(&Message::Direct {
            source_id: a.id,
            data_id: 11,
            payload: PayloadBuilder::new().i32(5).build(),
        })
        .await;

        let mut packet = next_packet(&server.channel()).await;
        assert_eq!(packet.mode(), PacketMode::Direct);
        assert_eq!(packet.client_id(), a.id);
        assert_eq!(packet.source_client_id(), a.id);
        assert_eq!(packet.data_id(), 11);
        assert_eq!(packet.read_i32().unwrap(), 5);

        b.assert_no(MessageType::Direct, Duration::from_millis(150))
            .await;
        assert!(server.channel().read().is_none());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_data_is_relayed_with_rewritten_ids() {
        let (server, addr, _) = started_server(ServerConfig::default()).await;
        let a = Peer::connect(addr).await;
        let b = Peer::connect(addr).await;
        let c = Peer::connect(addr).await;

        // The source byte is claimed wrongly; the server attributes it to A
        a.send(&Message::Data {
            forward: true,
            source_id: 77,
            data_id: 3,
            payload: PayloadBuilder::new().string("hey").build(),
        })
        .await;

        for peer in [&b, &c] {
            match peer.recv_type(MessageType::Data).await {
                DecodedMessage::Data(mut packet) => {
                    assert_eq!(packet.client_id(), peer.id);
                    assert_eq!(packet.source_client_id(), a.id);
                    assert_eq!(packet.data_id(), 3);
                    assert_eq!(packet.read_string().unwrap(), "hey");
                }
                other => panic!("Unexpected message: {:?}", other),
            }
        }
        a.assert_no(MessageType::Data, Duration::from_millis(100))
            .await;

        let packet = next_packet(&server.channel()).await;
        assert_eq!(packet.source_client_id(), a.id);
        assert!(server.channel().read().is_none());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_notifies_remaining_clients() {
        let (server, addr, listener) = started_server(ServerConfig::default()).await;
        let a = Peer::connect(addr).await;
        let b = Peer::connect(addr).await;

        a.send(&Message::Disconnected { client_id: a.id }).await;

        assert_eq!(
            b.recv_type(MessageType::Disconnect).await,
            DecodedMessage::Disconnect {
                client_id: b.id,
                mode: PacketMode::Disconnect,
                disconnected_id: a.id,
            }
        );

        let packet = next_packet(&server.channel()).await;
        assert_eq!(packet.mode(), PacketMode::Disconnect);
        assert_eq!(packet.client_id(), a.id);

        eventually(|| listener.count(&Event::Disconnected(a.id)) == 1).await;
        assert_eq!(server.client_ids().await, vec![b.id]);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_for_other_id_is_rejected() {
        let (server, addr, _) = started_server(ServerConfig::default()).await;
        let a = Peer::connect(addr).await;
        let b = Peer::connect(addr).await;

        a.send(&Message::Disconnected { client_id: b.id }).await;
        a.send(&Message::Ping).await;
        a.recv_type(MessageType::Ping).await;

        assert_eq!(server.clients().await, 2);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_silent_client_is_evicted_once() {
        let config = ServerConfig::default().with_client_timeout(Duration::from_millis(200));
        let (server, addr, listener) = started_server(config).await;

        let silent = Peer::connect(addr).await;
        let chatty = Peer::connect(addr).await;

        let deadline = Instant::now() + Duration::from_millis(900);
        while Instant::now() < deadline {
            chatty.send(&Message::Alive).await;
            sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(server.client_ids().await, vec![chatty.id]);
        assert_eq!(listener.count(&Event::Disconnected(silent.id)), 1);
        assert_eq!(listener.count(&Event::Disconnected(chatty.id)), 0);

        // The evicted client is never contacted about its own eviction
        silent
            .assert_no(MessageType::Disconnect, Duration::from_millis(50))
            .await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_client() {
        let (server, _, _) = started_server(ServerConfig::default()).await;

        let result = server.send_to_client(&Message::Alive, 42).await;
        assert!(matches!(result, Err(ServerError::NoSuchClient(42))));
        assert_eq!(server.clients().await, 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_send_before_start() {
        let server = Server::default();
        assert!(matches!(
            server.send(&Message::Alive).await,
            Err(ServerError::NotRunning)
        ));
        assert_err!(server.send_to_client(&Message::Alive, 1).await);
    }

    #[tokio::test]
    async fn test_targeted_and_broadcast_send() {
        let (server, addr, _) = started_server(ServerConfig::default()).await;
        let a = Peer::connect(addr).await;
        let b = Peer::connect(addr).await;

        let direct = Message::Direct {
            source_id: SERVER_ID,
            data_id: 8,
            payload: Vec::new(),
        };
        assert_ok!(server.send_to_client(&direct, b.id).await);
        match b.recv_type(MessageType::Direct).await {
            DecodedMessage::Direct(packet) => {
                assert_eq!(packet.client_id(), b.id);
                assert_eq!(packet.source_client_id(), SERVER_ID);
            }
            other => panic!("Unexpected message: {:?}", other),
        }
        a.assert_no(MessageType::Direct, Duration::from_millis(100))
            .await;

        assert_ok!(server.send(&Message::Alive).await);
        assert_eq!(
            a.recv_type(MessageType::Alive).await,
            DecodedMessage::Alive { client_id: a.id }
        );
        assert_eq!(
            b.recv_type(MessageType::Alive).await,
            DecodedMessage::Alive { client_id: b.id }
        );
        server.stop().await;
    }

    #[tokio::test]
    async fn test_info_probe() {
        let (server, addr, _) = started_server(ServerConfig::default()).await;
        server.set_info_supplier(|| b"relay".to_vec());

        let stranger = Peer::new(addr).await;
        stranger.send_raw(&codec::encode_info_request()).await;

        assert_eq!(
            stranger.recv_type(MessageType::Info).await,
            DecodedMessage::Info {
                blob: b"relay".to_vec()
            }
        );
        assert_eq!(server.clients().await, 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_name_set_is_announced_by_server() {
        let (server, addr, listener) = started_server(ServerConfig::default()).await;
        let a = Peer::connect(addr).await;
        let b = Peer::connect(addr).await;

        a.send(&Message::NameSet {
            client_id: a.id,
            name: "alice".to_string(),
        })
        .await;

        assert_eq!(
            b.recv_type(MessageType::NameSet).await,
            DecodedMessage::NameSet {
                sender_id: SERVER_ID,
                client_id: a.id,
                name: "alice".to_string(),
            }
        );
        eventually(|| listener.count(&Event::Named(a.id, "alice".to_string())) == 1).await;
        assert_eq!(server.client_name(a.id).await.as_deref(), Some("alice"));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_server_rename() {
        let (server, addr, _) = started_server(ServerConfig::default()).await;
        let a = Peer::connect(addr).await;

        assert_ok!(server.set_client_name(a.id, "host").await);
        assert_eq!(
            a.recv_type(MessageType::NameSet).await,
            DecodedMessage::NameSet {
                sender_id: SERVER_ID,
                client_id: a.id,
                name: "host".to_string(),
            }
        );
        assert!(matches!(
            server.set_client_name(99, "ghost").await,
            Err(ServerError::NoSuchClient(99))
        ));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_notifies_clients() {
        let (server, addr, _) = started_server(ServerConfig::default()).await;
        let a = Peer::connect(addr).await;

        server.stop().await;

        assert_eq!(
            a.recv_type(MessageType::Disconnect).await,
            DecodedMessage::Disconnect {
                client_id: a.id,
                mode: PacketMode::Disconnect,
                disconnected_id: SERVER_ID,
            }
        );
        assert_eq!(server.clients().await, 0);
    }

    #[tokio::test]
    async fn test_bandwidth_sampling() {
        let config = ServerConfig::default().with_bandwidth_interval(Duration::from_millis(50));
        let server = Server::new(config);
        assert!(server.bandwidth_up() < 0.0);
        assert!(server.bandwidth_down() < 0.0);

        let addr = server.start(LOCALHOST, 0).await.unwrap();
        let peer = Peer::connect(addr).await;
        peer.send(&Message::Ping).await;
        peer.recv_type(MessageType::Ping).await;

        eventually(|| server.bandwidth_up() >= 0.0 && server.bandwidth_down() >= 0.0).await;
        server.stop().await;
    }
}
