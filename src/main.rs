//! Weft - peer-to-peer messaging node.
//!
//! Wires the pieces together: the persistent message log, the signaling
//! hub, and the layered transport manager, plus a minimal line-based chat
//! loop on stdin.

#![allow(dead_code)]

mod wlt_lan;
mod wlt_manager;
mod wlt_media;
mod wlt_netinfo;
mod wlt_polling;
mod wlt_signaling;
mod wlt_storage;
mod wlt_stream;
mod wlt_transport;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use wlt_manager::TransportManager;
use wlt_netinfo::NetworkType;
use wlt_signaling::SignalHub;
use wlt_storage::MessageStore;
use wlt_transport::{TransportConfig, KIND_CHAT};

#[derive(Parser, Debug)]
#[command(name = "weft", about = "Peer-to-peer messaging node with a layered transport stack")]
struct Args {
    /// Peer id announced to other nodes; random when omitted
    #[arg(long)]
    peer_id: Option<String>,

    /// Address the embedded signaling hub listens on
    #[arg(long, default_value = "0.0.0.0:9090")]
    signal_bind: String,

    /// External signaling hub to use instead of the embedded one
    #[arg(long)]
    signaling_url: Option<String>,

    /// SQLite message log path
    #[arg(long, default_value = "weft.db")]
    db: PathBuf,

    /// Peers to dial at startup, as `<peer_id>` or `<peer_id>@<ip>`
    #[arg(long)]
    connect: Vec<String>,

    /// Network placement hint: lan, wifi or internet
    #[arg(long)]
    network: Option<String>,

    /// UDP port the LAN transport listens on
    #[arg(long, default_value_t = 9998)]
    lan_listen_port: u16,

    /// UDP port the LAN transport broadcasts to
    #[arg(long, default_value_t = 9999)]
    lan_broadcast_port: u16,
}

#[tokio::main]
async fn main() {
    // RUST_LOG controls verbosity, e.g. RUST_LOG=debug or RUST_LOG=weft=debug.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        log::error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let peer_id = args
        .peer_id
        .clone()
        .unwrap_or_else(|| format!("peer-{:08x}", rand::random::<u32>()));
    log::info!("weft node starting as {peer_id}");

    let store = MessageStore::open(&args.db).await?;
    store.touch_peer(&peer_id).await?;

    // The hub serves media bootstrap for us and for anyone pointed at us.
    let hub_listener = TcpListener::bind(&args.signal_bind).await?;
    let hub_addr = hub_listener.local_addr()?;
    let hub_cancel = CancellationToken::new();
    tokio::spawn(SignalHub::new(Some(store.clone())).serve(hub_listener, hub_cancel.clone()));

    let config = TransportConfig {
        signaling_url: Some(
            args.signaling_url
                .clone()
                .unwrap_or_else(|| format!("ws://127.0.0.1:{}", hub_addr.port())),
        ),
        lan_listen_port: args.lan_listen_port,
        lan_broadcast_port: args.lan_broadcast_port,
        ..Default::default()
    };

    let transport = Arc::new(TransportManager::new(&peer_id, config).await);
    transport
        .set_message_handler(Arc::new(|msg| {
            if msg.kind == KIND_CHAT {
                println!("[{}] {}", msg.from, String::from_utf8_lossy(&msg.payload));
            }
        }))
        .await;
    transport
        .set_connection_handler(Arc::new(|peer, conn| {
            log::info!("connected to {peer} via {}", conn.kind());
        }))
        .await;
    transport
        .set_disconnect_handler(Arc::new(|peer, kind| {
            log::warn!("lost {peer} (was using {kind})");
        }))
        .await;

    let network_type = args.network.as_deref().map(parse_network_type);
    for target in &args.connect {
        let (peer, ip) = match target.split_once('@') {
            Some((peer, ip)) => (peer, Some(ip)),
            None => (target.as_str(), None),
        };
        let info = transport.create_network_info(ip, None, network_type).await;
        log::info!("dialing {peer} with {info:?}");
        if let Err(e) = transport.connect_to_peer(peer, info).await {
            log::warn!("connect to {peer} failed: {e}");
        }
    }

    chat_loop(&transport).await;

    transport.close().await;
    hub_cancel.cancel();
    Ok(())
}

/// Reads `<peer_id> <text>` lines from stdin and sends them as chat
/// messages. `/quit` exits.
async fn chat_loop(transport: &TransportManager) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => break,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        let Some((peer, text)) = line.split_once(' ') else {
            println!("usage: <peer_id> <message> (or /quit)");
            continue;
        };
        match transport
            .send_message(peer, KIND_CHAT, text.as_bytes().to_vec())
            .await
        {
            Ok(()) => {}
            Err(e) => println!("send to {peer} failed: {e}"),
        }
    }
}

fn parse_network_type(value: &str) -> NetworkType {
    match value {
        "lan" => NetworkType::Lan,
        "wifi" => NetworkType::Wifi,
        "internet" => NetworkType::Internet,
        _ => NetworkType::Unknown,
    }
}
