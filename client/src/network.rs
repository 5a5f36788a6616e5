//! Client network layer: handshake, background tasks, and sends

use crate::config::ClientConfig;
use crate::error::ClientError;
use log::{debug, error, info, warn};
use shared::codec::{self, BUFFER_SIZE};
use shared::{Channel, DecodedMessage, Message, Packet, SERVER_ID};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// State shared with the background tasks
struct Session {
    socket: UdpSocket,
    write_lock: Mutex<()>,
    client_id: u8,
    connected: AtomicBool,
    channel: Arc<Channel>,
    /// Other clients and the names they announced
    peers: StdRwLock<BTreeMap<u8, Option<String>>>,
    ping_sent_at: StdMutex<Option<Instant>>,
    latency: StdMutex<Option<Duration>>,
}

/// A connected peer of a relay server
///
/// After [`Client::connect`] returns, two tasks run until
/// [`Client::disconnect`]:
/// - **Receiver**: tracks peers, queues DATA/DIRECT packets on the channel,
///   and measures ping latency
/// - **Keep-alive**: sends ALIVE every `alive_interval`
pub struct Client {
    session: Arc<Session>,
    server_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn unspecified_for(addr: SocketAddr) -> SocketAddr {
    if addr.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    }
}

impl Client {
    /// Connects to the server at `server_addr`.
    ///
    /// CONNECT is retried `connect_attempts` times, waiting `connect_timeout`
    /// for the acknowledgment each time.
    ///
    /// # Errors
    ///
    /// [`ClientError::Refused`] if the server answers with a disconnect,
    /// [`ClientError::Timeout`] if no attempt is acknowledged.
    pub async fn connect(
        server_addr: SocketAddr,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        info!("Connecting to {}", server_addr);

        let (socket, client_id) = handshake(server_addr, &config).await?;
        info!("Connected! Client ID: {}", client_id);

        let session = Arc::new(Session {
            socket,
            write_lock: Mutex::new(()),
            client_id,
            connected: AtomicBool::new(true),
            channel: Arc::new(Channel::new()),
            peers: StdRwLock::new(BTreeMap::new()),
            ping_sent_at: StdMutex::new(None),
            latency: StdMutex::new(None),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            spawn_receiver(Arc::clone(&session), shutdown_rx.clone()),
            spawn_keep_alive(Arc::clone(&session), config.alive_interval, shutdown_rx),
        ];

        Ok(Self {
            session,
            server_addr,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn client_id(&self) -> u8 {
        self.session.client_id
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// False after [`Client::disconnect`] or once the server shut down
    pub fn is_connected(&self) -> bool {
        self.session.connected.load(Ordering::Acquire)
    }

    /// Queue of DATA, DIRECT, and peer-departure packets
    pub fn channel(&self) -> Arc<Channel> {
        Arc::clone(&self.session.channel)
    }

    /// Ids of the other connected clients, ascending
    pub fn peers(&self) -> Vec<u8> {
        self.session
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub fn peer_name(&self, client_id: u8) -> Option<String> {
        self.session
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&client_id)
            .cloned()
            .flatten()
    }

    /// Round trip of the last answered [`Client::ping`]
    pub fn latency(&self) -> Option<Duration> {
        *self
            .session
            .latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends DATA, which the server queues and relays to every other client.
    pub async fn send_data(&self, data_id: u32, payload: Vec<u8>) -> Result<(), ClientError> {
        self.send(&Message::Data {
            forward: true,
            source_id: self.session.client_id,
            data_id,
            payload,
        })
        .await
    }

    /// Sends DIRECT, which only the server sees.
    pub async fn send_direct(&self, data_id: u32, payload: Vec<u8>) -> Result<(), ClientError> {
        self.send(&Message::Direct {
            source_id: self.session.client_id,
            data_id,
            payload,
        })
        .await
    }

    /// Sends PING; the echo updates [`Client::latency`].
    pub async fn ping(&self) -> Result<(), ClientError> {
        *self
            .session
            .ping_sent_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        self.send(&Message::Ping).await
    }

    /// Announces a display name to the server and, through it, to every peer.
    pub async fn set_name(&self, name: &str) -> Result<(), ClientError> {
        self.send(&Message::NameSet {
            client_id: self.session.client_id,
            name: name.to_string(),
        })
        .await
    }

    /// Leaves the session and stops the background tasks.
    ///
    /// Safe to call more than once.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let result = if self.session.connected.load(Ordering::Acquire) {
            let notice = Message::Disconnected {
                client_id: self.session.client_id,
            };
            let result = self.session.send(&notice).await;
            self.session.connected.store(false, Ordering::Release);
            info!("Disconnected from {}", self.server_addr);
            result
        } else {
            Ok(())
        };

        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Client task panicked: {}", e);
            }
        }

        result
    }

    async fn send(&self, message: &Message) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.session.send(message).await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl Session {
    async fn send(&self, message: &Message) -> Result<(), ClientError> {
        let datagram = message.encode(self.client_id)?;
        let _guard = self.write_lock.lock().await;
        self.socket.send(&datagram).await?;
        Ok(())
    }

    fn handle_message(&self, message: DecodedMessage) {
        match message {
            DecodedMessage::Connect { .. } => debug!("Duplicate connect acknowledgment"),
            DecodedMessage::ClientsList { client_ids, .. } => {
                let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
                let previous = std::mem::take(&mut *peers);
                for id in client_ids {
                    let name = previous.get(&id).cloned().flatten();
                    peers.insert(id, name);
                }
                debug!("Peers: {:?}", peers.keys().collect::<Vec<_>>());
            }
            DecodedMessage::Data(packet) | DecodedMessage::Direct(packet) => {
                self.channel.write(packet);
            }
            DecodedMessage::Disconnect {
                disconnected_id, ..
            } => {
                if disconnected_id == SERVER_ID {
                    warn!("Server closed the session");
                    self.connected.store(false, Ordering::Release);
                    self.peers
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clear();
                } else {
                    info!("Client {} left", disconnected_id);
                    self.peers
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&disconnected_id);
                }
                self.channel.write(Packet::disconnect(disconnected_id));
            }
            DecodedMessage::Ping { .. } => {
                let sent_at = self
                    .ping_sent_at
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(sent_at) = sent_at {
                    let rtt = sent_at.elapsed();
                    debug!("Ping: {:?}", rtt);
                    *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = Some(rtt);
                }
            }
            DecodedMessage::NameSet { client_id, name, .. } => {
                info!("Client {} is now called {}", client_id, name);
                if client_id != self.client_id {
                    self.peers
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(client_id, Some(name));
                }
            }
            other => debug!("Ignoring {:?}", other.message_type()),
        }
    }
}

/// Sends CONNECT until the server assigns an id.
///
/// The server ignores a repeated CONNECT from an endpoint it already
/// registered, so every attempt sends from a fresh socket. Returns the socket
/// whose request was acknowledged.
async fn handshake(
    server_addr: SocketAddr,
    config: &ClientConfig,
) -> Result<(UdpSocket, u8), ClientError> {
    let request = Message::Connected.encode(SERVER_ID)?;
    let mut buffer = [0u8; BUFFER_SIZE];

    for attempt in 1..=config.connect_attempts.max(1) {
        let socket = UdpSocket::bind(unspecified_for(server_addr)).await?;
        socket.connect(server_addr).await?;
        debug!("Connect attempt {} from {}", attempt, socket.local_addr()?);
        socket.send(&request).await?;

        let deadline = tokio::time::Instant::now() + config.connect_timeout;
        loop {
            let len = match tokio::time::timeout_at(deadline, socket.recv(&mut buffer)).await {
                Ok(Ok(len)) => len,
                Ok(Err(e)) => {
                    warn!("Connect attempt {} failed: {}", attempt, e);
                    break;
                }
                Err(_) => break,
            };

            match codec::decode(&buffer[..len]) {
                Ok(DecodedMessage::Connect { client_id }) if client_id != SERVER_ID => {
                    return Ok((socket, client_id))
                }
                Ok(DecodedMessage::Disconnect {
                    disconnected_id: SERVER_ID,
                    ..
                }) => return Err(ClientError::Refused),
                Ok(other) => debug!("Ignoring {:?} during handshake", other.message_type()),
                Err(e) => warn!("Dropped malformed reply: {}", e),
            }
        }
    }

    Err(ClientError::Timeout(config.connect_timeout))
}

/// Spawns task that receives and handles messages from the server
fn spawn_receiver(session: Arc<Session>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer = [0u8; BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = session.socket.recv(&mut buffer) => match result {
                    Ok(len) => {
                        let message = match codec::decode(&buffer[..len]) {
                            Ok(message) => message,
                            Err(e) => {
                                warn!("Dropped malformed packet: {}", e);
                                continue;
                            }
                        };

                        // Name announcements carry the server id as sender
                        if !matches!(message, DecodedMessage::NameSet { .. }) {
                            if let Err(e) = message.expect_client(session.client_id) {
                                warn!("Dropped packet: {}", e);
                                continue;
                            }
                        }

                        session.handle_message(message);
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

/// Spawns task that keeps the session alive on the server
fn spawn_keep_alive(
    session: Arc<Session>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if !session.connected.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(e) = session.send(&Message::Alive).await {
                        warn!("Failed to send keep-alive: {}", e);
                    }
                }
            }
        }

        debug!("Keep-alive stopped");
    })
}

/// Asks the server at `addr` for its info blob without connecting.
///
/// # Errors
///
/// [`ClientError::Timeout`] if nothing answers within `wait`.
pub async fn discover(addr: SocketAddr, wait: Duration) -> Result<Vec<u8>, ClientError> {
    let socket = UdpSocket::bind(unspecified_for(addr)).await?;
    socket.send_to(&codec::encode_info_request(), addr).await?;

    let mut buffer = [0u8; BUFFER_SIZE];
    let deadline = tokio::time::Instant::now() + wait;

    loop {
        let (len, from) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buffer))
            .await
            .map_err(|_| ClientError::Timeout(wait))??;

        if from != addr {
            debug!("Ignoring datagram from {}", from);
            continue;
        }

        match codec::decode(&buffer[..len]) {
            Ok(DecodedMessage::Info { blob }) => return Ok(blob),
            // An empty reply has the same framing as the probe
            Ok(DecodedMessage::InfoRequest) => return Ok(Vec::new()),
            Ok(other) => debug!("Ignoring {:?} while discovering", other.message_type()),
            Err(e) => warn!("Dropped malformed reply: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{MessageType, PacketMode, PayloadBuilder};
    use tokio::time::timeout;
    use tokio_test::{assert_err, assert_ok};

    /// A hand-driven server socket on loopback
    struct FakeServer {
        socket: UdpSocket,
    }

    impl FakeServer {
        async fn new() -> Self {
            Self {
                socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            }
        }

        fn addr(&self) -> SocketAddr {
            self.socket.local_addr().unwrap()
        }

        async fn recv(&self) -> (DecodedMessage, SocketAddr) {
            let mut buf = [0u8; BUFFER_SIZE];
            let (len, from) = timeout(Duration::from_secs(2), self.socket.recv_from(&mut buf))
                .await
                .expect("no datagram from client")
                .unwrap();
            (codec::decode(&buf[..len]).unwrap(), from)
        }

        async fn recv_type(&self, message_type: MessageType) -> (DecodedMessage, SocketAddr) {
            loop {
                let (message, from) = self.recv().await;
                if message.message_type() == message_type {
                    return (message, from);
                }
            }
        }

        async fn send(&self, message: &Message, client_id: u8, to: SocketAddr) {
            let bytes = message.encode(client_id).unwrap();
            self.socket.send_to(&bytes, to).await.unwrap();
        }

        /// Accepts one CONNECT, assigning `client_id`
        async fn accept(&self, client_id: u8) -> SocketAddr {
            let (message, from) = self.recv_type(MessageType::Connect).await;
            assert_eq!(message, DecodedMessage::Connect { client_id: 0 });
            self.send(&Message::Connected, client_id, from).await;
            from
        }
    }

    fn fast_config() -> ClientConfig {
        ClientConfig::default()
            .with_connect_timeout(Duration::from_millis(200))
            .with_connect_attempts(2)
    }

    async fn connected_pair(client_id: u8) -> (FakeServer, Client, SocketAddr) {
        let server = FakeServer::new().await;
        let (client, peer) = tokio::join!(
            Client::connect(server.addr(), fast_config()),
            server.accept(client_id)
        );
        (server, client.unwrap(), peer)
    }

    async fn eventually(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn next_packet(channel: &Channel) -> Packet {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(packet) = channel.read() {
                return packet;
            }
            assert!(Instant::now() < deadline, "no packet on channel");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_connect_handshake() {
        let (_server, client, _) = connected_pair(5).await;

        assert_eq!(client.client_id(), 5);
        assert!(client.is_connected());
        assert!(client.peers().is_empty());
        assert!(client.latency().is_none());
    }

    #[tokio::test]
    async fn test_connect_retries_then_times_out() {
        let server = FakeServer::new().await;

        let result = Client::connect(server.addr(), fast_config()).await;
        assert!(matches!(result, Err(ClientError::Timeout(_))));

        // One request per attempt, each from its own endpoint
        let (_, first) = server.recv_type(MessageType::Connect).await;
        let (_, second) = server.recv_type(MessageType::Connect).await;
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_connect_recovers_from_lost_acknowledgment() {
        let server = FakeServer::new().await;

        // The first request is registered but its acknowledgment never arrives
        let answer_retry = async {
            let (_, lost) = server.recv_type(MessageType::Connect).await;
            let (_, retry) = server.recv_type(MessageType::Connect).await;
            assert_ne!(lost, retry);
            server.send(&Message::Connected, 2, retry).await;
            retry
        };
        let (client, retry) = tokio::join!(
            Client::connect(server.addr(), fast_config()),
            answer_retry
        );
        let client = client.unwrap();
        assert_eq!(client.client_id(), 2);

        assert_ok!(client.ping().await);
        let (message, from) = server.recv_type(MessageType::Ping).await;
        assert_eq!(message, DecodedMessage::Ping { client_id: 2 });
        assert_eq!(from, retry);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let server = FakeServer::new().await;

        let refuse = async {
            let (_, from) = server.recv_type(MessageType::Connect).await;
            server
                .send(&Message::Disconnected { client_id: SERVER_ID }, SERVER_ID, from)
                .await;
        };
        let (result, _) = tokio::join!(Client::connect(server.addr(), fast_config()), refuse);

        assert!(matches!(result, Err(ClientError::Refused)));
    }

    #[tokio::test]
    async fn test_peers_follow_clients_list_and_disconnects() {
        let (server, client, peer) = connected_pair(1).await;

        server
            .send(&Message::ClientsList { client_ids: vec![2, 3] }, 1, peer)
            .await;
        eventually(|| client.peers() == vec![2, 3]).await;

        server
            .send(&Message::Disconnected { client_id: 2 }, 1, peer)
            .await;
        eventually(|| client.peers() == vec![3]).await;

        let departed = next_packet(&client.channel()).await;
        assert_eq!(departed.mode(), PacketMode::Disconnect);
        assert_eq!(departed.client_id(), 2);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_relayed_data_reaches_channel() {
        let (server, client, peer) = connected_pair(1).await;

        let relayed = Message::Data {
            forward: true,
            source_id: 4,
            data_id: 7,
            payload: PayloadBuilder::new().string("hi").build(),
        };
        server.send(&relayed, 1, peer).await;

        let mut packet = next_packet(&client.channel()).await;
        assert_eq!(packet.mode(), PacketMode::Data);
        assert_eq!(packet.source_client_id(), 4);
        assert_eq!(packet.data_id(), 7);
        assert_eq!(packet.read_string().unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_packets_for_other_ids_are_dropped() {
        let (server, client, peer) = connected_pair(1).await;

        let misaddressed = Message::Direct {
            source_id: SERVER_ID,
            data_id: 1,
            payload: Vec::new(),
        };
        server.send(&misaddressed, 9, peer).await;
        server.send(&Message::Ping, 1, peer).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(client.channel().read().is_none());
    }

    #[tokio::test]
    async fn test_sends_carry_assigned_id() {
        let (server, client, _) = connected_pair(3).await;

        assert_ok!(client.send_data(10, vec![1, 2]).await);
        match server.recv_type(MessageType::Data).await.0 {
            DecodedMessage::Data(packet) => {
                assert_eq!(packet.client_id(), 3);
                assert_eq!(packet.source_client_id(), 3);
                assert_eq!(packet.data_id(), 10);
                assert_eq!(packet.payload(), &[1, 2]);
            }
            other => panic!("Unexpected message: {:?}", other),
        }

        assert_ok!(client.send_direct(11, Vec::new()).await);
        match server.recv_type(MessageType::Direct).await.0 {
            DecodedMessage::Direct(packet) => assert_eq!(packet.data_id(), 11),
            other => panic!("Unexpected message: {:?}", other),
        }

        assert_ok!(client.set_name("carol").await);
        assert_eq!(
            server.recv_type(MessageType::NameSet).await.0,
            DecodedMessage::NameSet {
                sender_id: 3,
                client_id: 3,
                name: "carol".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_ping_measures_latency() {
        let (server, client, peer) = connected_pair(1).await;

        assert_ok!(client.ping().await);
        server.recv_type(MessageType::Ping).await;
        server.send(&Message::Ping, 1, peer).await;

        eventually(|| client.latency().is_some()).await;
    }

    #[tokio::test]
    async fn test_peer_names() {
        let (server, client, peer) = connected_pair(1).await;

        server
            .send(&Message::ClientsList { client_ids: vec![2] }, 1, peer)
            .await;
        server
            .send(
                &Message::NameSet {
                    client_id: 2,
                    name: "bob".to_string(),
                },
                SERVER_ID,
                peer,
            )
            .await;
        eventually(|| client.peer_name(2).as_deref() == Some("bob")).await;

        // Names survive a refreshed list
        server
            .send(&Message::ClientsList { client_ids: vec![2, 5] }, 1, peer)
            .await;
        eventually(|| client.peers() == vec![2, 5]).await;
        assert_eq!(client.peer_name(2).as_deref(), Some("bob"));
        assert_eq!(client.peer_name(5), None);
    }

    #[tokio::test]
    async fn test_keep_alive() {
        let server = FakeServer::new().await;
        let config = fast_config().with_alive_interval(Duration::from_millis(30));
        let (client, _) = tokio::join!(Client::connect(server.addr(), config), server.accept(1));
        let _client = client.unwrap();

        assert_eq!(
            server.recv_type(MessageType::Alive).await.0,
            DecodedMessage::Alive { client_id: 1 }
        );
    }

    #[tokio::test]
    async fn test_disconnect() {
        let (server, client, _) = connected_pair(2).await;

        assert_ok!(client.disconnect().await);
        assert!(!client.is_connected());
        assert_eq!(
            server.recv_type(MessageType::Disconnect).await.0,
            DecodedMessage::Disconnect {
                client_id: 2,
                mode: PacketMode::Disconnect,
                disconnected_id: 2,
            }
        );

        assert_ok!(client.disconnect().await);
        assert!(matches!(
            client.send_data(1, Vec::new()).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_server_shutdown_notice() {
        let (server, client, peer) = connected_pair(1).await;

        server
            .send(&Message::Disconnected { client_id: SERVER_ID }, 1, peer)
            .await;
        eventually(|| !client.is_connected()).await;
        assert_err!(client.ping().await);
    }

    #[tokio::test]
    async fn test_discover() {
        let server = FakeServer::new().await;

        let reply = async {
            let (message, from) = server.recv().await;
            assert_eq!(message, DecodedMessage::InfoRequest);
            server
                .send(&Message::Info { blob: vec![9, 8, 7] }, SERVER_ID, from)
                .await;
        };
        let (blob, _) = tokio::join!(discover(server.addr(), Duration::from_secs(1)), reply);

        assert_eq!(blob.unwrap(), vec![9, 8, 7]);
    }

    #[tokio::test]
    async fn test_discover_timeout() {
        let server = FakeServer::new().await;

        let result = discover(server.addr(), Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ClientError::Timeout(_))));
    }
}
