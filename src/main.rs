use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use nodeboot::seeds::{self, BootstrapPeer};
use nodeboot::{BootstrapPolicy, NodeOptions};

/// A `.../p2p/<peer-id>` multiaddress given on the command line.
#[derive(Clone, Debug)]
struct PeerArg(BootstrapPeer);

impl FromStr for PeerArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let peer = seeds::parse_bootstrap_addr(s)
            .context("bootstrap peer must be a multiaddress ending in /p2p/<peer-id>")?;
        Ok(PeerArg(peer))
    }
}

#[derive(Parser, Debug)]
#[command(name = "nodeboot")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Repository directory (created and initialized if missing).
    #[arg(short, long, value_name = "PATH")]
    repo: Option<PathBuf>,

    /// Extra bootstrap peer, merged with the config's list for this run.
    #[arg(short = 'B', long = "bootstrap", value_name = "MULTIADDR")]
    bootstrap: Vec<PeerArg>,

    /// Live connections required before the node counts as bootstrapped.
    #[arg(long, default_value = "2")]
    min_peers: usize,

    /// Seconds between status lines.
    #[arg(short, long, default_value = "60")]
    status_interval: u64,
}

fn default_repo() -> Result<PathBuf> {
    let home = dirs::home_dir().context("cannot determine home directory; pass --repo")?;
    Ok(home.join(".nodeboot"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let root = match args.repo {
        Some(root) => root,
        None => default_repo()?,
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal, exiting gracefully");
            }
            cancel.cancel();
        });
    }

    let options = NodeOptions::new(&root)
        .with_extra_peers(args.bootstrap.into_iter().map(|p| p.0).collect())
        .with_policy(BootstrapPolicy::default().with_min_peer_threshold(args.min_peers));

    let node = nodeboot::create_with(&cancel, options)
        .await
        .with_context(|| format!("failed to start node from {}", root.display()))?;

    info!("Node peer id: {}", node.peer_id());
    for addr in node.host().listen_addrs().await? {
        info!("Listening on {}/p2p/{}", addr, node.peer_id());
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval.max(1)));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let connected = node.host().connected_peers().await;
                let nat = node.host().nat_status().await;
                let routing = node.routing().size().await;
                match (connected, nat, routing) {
                    (Ok(connected), Ok(nat), Ok(routing)) => info!(
                        connected = connected.len(),
                        routing_table = routing,
                        nat = ?nat,
                        "status"
                    ),
                    _ => {
                        warn!("host stopped unexpectedly");
                        break;
                    }
                }
            }
        }
    }

    node.close().await;
    Ok(())
}
