//! Load generator: connects a number of raw protocol clients to a server and
//! has each of them send DATA messages at random intervals.

use clap::Parser;
use log::{info, warn};
use rand::Rng;
use shared::codec::{self, BUFFER_SIZE};
use shared::{DecodedMessage, Message, PayloadBuilder};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    server: SocketAddr,

    /// Number of simulated clients
    #[arg(short, long, default_value = "4")]
    clients: usize,

    /// DATA messages sent by each client
    #[arg(short, long, default_value = "20")]
    messages: u32,
}

#[derive(Debug, Default)]
struct Report {
    client_id: u8,
    sent: u32,
    relayed: u32,
}

async fn run_client(
    server: SocketAddr,
    messages: u32,
) -> Result<Report, Box<dyn std::error::Error + Send + Sync>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let mut buf = [0u8; BUFFER_SIZE];

    socket.send_to(&Message::Connected.encode(0)?, server).await?;

    let client_id = loop {
        let (len, _) = timeout(Duration::from_secs(3), socket.recv_from(&mut buf)).await??;
        match codec::decode(&buf[..len]) {
            Ok(DecodedMessage::Connect { client_id }) => break client_id,
            Ok(DecodedMessage::Disconnect { .. }) => return Err("server is full".into()),
            Ok(_) => continue,
            Err(e) => warn!("Ignoring malformed reply: {}", e),
        }
    };
    info!("Connected as client {}", client_id);

    let mut report = Report {
        client_id,
        ..Report::default()
    };

    for data_id in 0..messages {
        let (delay, payload) = {
            let mut rng = rand::thread_rng();
            let delay = Duration::from_millis(rng.gen_range(10..100));
            let payload = PayloadBuilder::new()
                .i32(rng.gen())
                .f32(rng.gen_range(-100.0..100.0))
                .string("load")
                .build();
            (delay, payload)
        };

        let message = Message::Data {
            forward: true,
            source_id: client_id,
            data_id,
            payload,
        };
        socket.send_to(&message.encode(client_id)?, server).await?;
        report.sent += 1;

        // Count relays from other clients until the next send is due
        let deadline = Instant::now() + delay;
        while let Ok(result) = timeout(
            deadline.saturating_duration_since(Instant::now()),
            socket.recv_from(&mut buf),
        )
        .await
        {
            let (len, _) = result?;
            if let Ok(DecodedMessage::Data(_)) = codec::decode(&buf[..len]) {
                report.relayed += 1;
            }
        }
    }

    socket
        .send_to(&Message::Disconnected { client_id }.encode(client_id)?, server)
        .await?;

    Ok(report)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    info!(
        "Starting {} clients against {}, {} messages each",
        args.clients, args.server, args.messages
    );

    let started = Instant::now();
    let handles: Vec<_> = (0..args.clients)
        .map(|_| tokio::spawn(run_client(args.server, args.messages)))
        .collect();

    let mut total_sent = 0;
    let mut total_relayed = 0;
    for handle in handles {
        match handle.await? {
            Ok(report) => {
                println!(
                    "client {:3}: sent {:4}, received {:5} relayed",
                    report.client_id, report.sent, report.relayed
                );
                total_sent += report.sent;
                total_relayed += report.relayed;
            }
            Err(e) => println!("client failed: {}", e),
        }
    }

    println!(
        "Done in {:.2}s: {} sent, {} relayed",
        started.elapsed().as_secs_f64(),
        total_sent,
        total_relayed
    );
    Ok(())
}
