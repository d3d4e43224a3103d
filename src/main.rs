use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use kadnode::{DhtService, DhtSettings};

#[derive(Parser, Debug)]
#[command(name = "kadnode")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:6881")]
    bind: SocketAddr,

    /// Router node used to join the network (repeatable).
    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<SocketAddr>,

    #[arg(short, long, default_value = "300")]
    status_interval: u64,

    /// Nodes per routing bucket and replication factor.
    #[arg(long)]
    bucket_size: Option<usize>,

    /// Concurrent requests per lookup.
    #[arg(long)]
    search_branching: Option<usize>,

    /// Capacity of each item table.
    #[arg(long)]
    max_items: Option<usize>,
}

impl Args {
    fn settings(&self) -> DhtSettings {
        let mut settings = DhtSettings::default();
        if let Some(k) = self.bucket_size {
            settings.bucket_size = k.max(1);
        }
        if let Some(alpha) = self.search_branching {
            settings.search_branching = alpha.max(1);
        }
        if let Some(n) = self.max_items {
            settings.max_dht_items = n.max(1);
        }
        settings
    }
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

    let service = DhtService::bind(args.bind, args.settings()).await?;
    let node = service.node().clone();
    info!(id = %node.own_id(), addr = %service.local_addr(), "node started");

    if !args.bootstrap.is_empty() {
        info!(routers = args.bootstrap.len(), "bootstrapping");
        node.bootstrap(&args.bootstrap, |nodes| {
            info!(found = nodes.len(), "bootstrap complete");
        });
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let status = node.status();
                info!(
                    nodes = status.nodes,
                    replacements = status.replacements,
                    global_nodes = status.global_nodes,
                    torrents = status.torrents,
                    peers = status.peers,
                    items = status.immutable_items + status.mutable_items + status.signed_items,
                    traversals = status.running_traversals,
                    rpcs = status.outstanding_rpcs,
                    "status snapshot"
                );
            }
        }
    }

    service.shutdown().await;
    Ok(())
}
