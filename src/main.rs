use clap::Parser;
use fileswarm::{CommonConfig, Node, Roster};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A peer-to-peer file distribution engine with swarm piece exchange"
)]
struct Args {
    /// This process's peer ID; must appear in the roster
    peer_id: u32,

    /// Path to the common settings file
    #[arg(long, default_value = "Common.cfg")]
    common: PathBuf,

    /// Path to the peer roster file
    #[arg(long, default_value = "PeerInfo.cfg")]
    peers: PathBuf,

    /// Directory holding the per-peer working directories
    #[arg(long, default_value = ".")]
    workdir: PathBuf,
}

/// Log to stdout and append to this peer's lifecycle log file.
fn init_logging(peer_id: u32) -> std::io::Result<()> {
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(format!("log_peer_{peer_id}.log"))?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(log_file)),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(error) = init_logging(args.peer_id) {
        eprintln!("Error: could not open log file: {error}");
        std::process::exit(1);
    }

    let common = match CommonConfig::load(&args.common) {
        Ok(common) => common,
        Err(error) => {
            eprintln!("Error: could not read {}: {error}", args.common.display());
            std::process::exit(1);
        }
    };
    let roster = match Roster::load(&args.peers) {
        Ok(roster) => roster,
        Err(error) => {
            eprintln!("Error: could not read {}: {error}", args.peers.display());
            std::process::exit(1);
        }
    };

    let node = match Node::new(common, roster, args.peer_id, args.workdir).await {
        Ok(node) => node,
        Err(error) => {
            eprintln!("Error: could not start peer {}: {error}", args.peer_id);
            std::process::exit(1);
        }
    };

    if let Err(error) = node.run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}
