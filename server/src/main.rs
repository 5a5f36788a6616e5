use clap::Parser;
use log::{error, info, warn};
use server::{Server, ServerConfig, ServerListener};
use shared::{PacketMode, ServerInfo};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};

const PROTOCOL_VERSION: u32 = 1;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Silence in milliseconds before a client is dropped
    #[arg(short, long, default_value = "12000")]
    timeout_ms: u64,

    /// Name reported to discovery probes
    #[arg(short, long, default_value = "relay")]
    name: String,
}

/// Logs lifecycle events and keeps the client count for discovery replies
#[derive(Default)]
struct ConsoleListener {
    clients: AtomicU32,
}

impl ServerListener for ConsoleListener {
    fn server_started(&self, addr: SocketAddr) {
        info!("Server started on {}", addr);
    }

    fn server_stopped(&self) {
        info!("Server stopped");
    }

    fn client_connected(&self, addr: SocketAddr, client_id: u8) {
        self.clients.fetch_add(1, Ordering::Relaxed);
        info!("Client {} joined from {}", client_id, addr);
    }

    fn client_disconnected(&self, addr: SocketAddr, client_id: u8) {
        self.clients.fetch_sub(1, Ordering::Relaxed);
        info!("Client {} at {} left", client_id, addr);
    }

    fn client_named(&self, client_id: u8, name: &str) {
        info!("Client {} is called {}", client_id, name);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config =
        ServerConfig::default().with_client_timeout(Duration::from_millis(args.timeout_ms));
    let server = Server::new(config);

    let listener = Arc::new(ConsoleListener::default());
    server.add_listener(listener.clone());

    {
        let listener = Arc::clone(&listener);
        let name = args.name.clone();
        server.set_info_supplier(move || {
            let info = ServerInfo {
                name: name.clone(),
                version: PROTOCOL_VERSION,
                clients: listener.clients.load(Ordering::Relaxed),
            };
            info.to_bytes().unwrap_or_else(|e| {
                error!("Failed to encode server info: {}", e);
                Vec::new()
            })
        });
    }

    server.start(args.host, args.port).await?;

    let channel = server.channel();
    let mut ticker = interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for packet in channel.drain() {
                    match packet.mode() {
                        PacketMode::Disconnect => {
                            info!("Client {} disconnected", packet.client_id())
                        }
                        mode => info!(
                            "{:?} {} from client {} ({} bytes)",
                            mode,
                            packet.data_id(),
                            packet.source_client_id(),
                            packet.payload().len()
                        ),
                    }
                }

                let (up, down) = (server.bandwidth_up(), server.bandwidth_down());
                if up >= 0.0 && down >= 0.0 {
                    info!(
                        "{} clients, up {:.2} kB/s, down {:.2} kB/s",
                        server.clients().await,
                        up,
                        down
                    );
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                }
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
        }
    }

    server.stop().await;
    Ok(())
}
