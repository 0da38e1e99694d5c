use std::{net::SocketAddrV4, str::FromStr, sync::mpsc::channel, time::Instant};

use lbry_dht::{Dht, Id};

use clap::Parser;

use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Local address to listen on
    #[arg(long, default_value = "0.0.0.0:4444")]
    address: SocketAddrV4,
    /// Bootstrapping nodes, defaults to the public LBRY nodes
    #[arg(long)]
    bootstrap: Vec<String>,
    /// Hex encoded node Id, random if missing
    #[arg(long)]
    node_id: Option<String>,
    /// Hex encoded blob hash to announce after joining
    #[arg(long)]
    announce: Option<String>,
    /// Port announced to other nodes
    #[arg(long)]
    peer_port: Option<u16>,
}

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cli = Cli::parse();

    let mut builder = Dht::builder();
    builder.address(cli.address);

    if !cli.bootstrap.is_empty() {
        builder.bootstrap(&cli.bootstrap);
    }
    if let Some(node_id) = cli.node_id {
        builder.id(Id::from_str(&node_id).expect("invalid node id"));
    }
    if let Some(port) = cli.peer_port {
        builder.peer_port(port);
    }

    let dht = builder.build().expect("failed to bind");

    let start = Instant::now();
    let bootstrapped = dht.bootstrapped().unwrap();

    println!(
        "Bootstrapped: {} in {:?} seconds",
        bootstrapped,
        start.elapsed().as_secs_f32()
    );
    println!("{:?}", dht.info().unwrap());

    if let Some(key) = cli.announce {
        let key = Id::from_str(&key).expect("invalid blob hash");

        let start = Instant::now();
        let stored = dht.announce(key).unwrap();

        println!(
            "Announced {} to {} nodes in {:?} seconds",
            key,
            stored,
            start.elapsed().as_secs_f32()
        );
    }

    let (tx_interrupted, rx_interrupted) = channel();

    ctrlc::set_handler(move || {
        println!();
        println!("Received Ctrl+C! Shutting down...");
        let _ = tx_interrupted.send(());
    })
    .expect("Error setting Ctrl-C handler");

    println!("Press CTRL+C to stop the node");

    let _ = rx_interrupted.recv();

    dht.shutdown();
}
