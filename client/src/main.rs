use clap::Parser;
use client::{discover, Client, ClientConfig};
use log::{info, warn};
use shared::{Packet, PacketMode, PayloadBuilder, ServerInfo};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, Duration};

/// Data id used for chat lines
const CHAT_DATA_ID: u32 = 1;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: SocketAddr,

    /// Name announced to the other peers
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Keep-alive period in milliseconds
    #[arg(short = 'a', long, default_value = "4000")]
    alive_ms: u64,

    /// Query the server's info and exit without connecting
    #[arg(short = 'd', long)]
    discover: bool,
}

fn print_packet(client: &Client, mut packet: Packet) {
    let sender = client
        .peer_name(packet.source_client_id())
        .unwrap_or_else(|| format!("client {}", packet.source_client_id()));

    match packet.mode() {
        PacketMode::Disconnect if packet.client_id() == shared::SERVER_ID => {
            println!("* server closed the session")
        }
        PacketMode::Disconnect => println!("* client {} left", packet.client_id()),
        PacketMode::Data | PacketMode::Direct => match packet.read_string() {
            Ok(text) => println!("<{}> {}", sender, text),
            Err(e) => warn!("Unreadable message from {}: {}", sender, e),
        },
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    if args.discover {
        let blob = discover(args.server, Duration::from_secs(2)).await?;
        match ServerInfo::from_bytes(&blob) {
            Ok(info) => println!(
                "{} (protocol {}) with {} clients",
                info.name, info.version, info.clients
            ),
            Err(_) => println!("{} byte info blob: {:?}", blob.len(), blob),
        }
        return Ok(());
    }

    let config =
        ClientConfig::default().with_alive_interval(Duration::from_millis(args.alive_ms));
    let client = Client::connect(args.server, config).await?;
    info!("Connected as client {}", client.client_id());

    if let Some(name) = &args.name {
        client.set_name(name).await?;
    }

    println!("Type a message and press Enter. Commands: /ping /peers /quit");

    let channel = client.channel();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = interval(Duration::from_millis(100));
    let mut last_latency = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/ping" => client.ping().await?,
                    "/peers" => {
                        for id in client.peers() {
                            let name = client.peer_name(id).unwrap_or_default();
                            println!("  {} {}", id, name);
                        }
                    }
                    text => {
                        let payload = PayloadBuilder::new().string(text).build();
                        client.send_data(CHAT_DATA_ID, payload).await?;
                    }
                }
            }
            _ = ticker.tick() => {
                for packet in channel.drain() {
                    print_packet(&client, packet);
                }
                let latency = client.latency();
                if latency != last_latency {
                    if let Some(latency) = latency {
                        println!("* ping {:?}", latency);
                    }
                    last_latency = latency;
                }
                if !client.is_connected() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.disconnect().await?;
    Ok(())
}
