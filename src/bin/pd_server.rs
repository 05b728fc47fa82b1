//! Placement driver development cluster
//!
//! Runs `--nodes` placement driver nodes in one process. They share an
//! in-process consensus substrate and talk to each other over their real
//! HTTP endpoints. Node 1 bootstraps the PD group; the others join through it.

use clap::Parser;
use pdkv::common::PdConfig;
use pdkv::{HttpPeerClient, LocalNetwork, PdServer, PlacementDriver};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pd-server")]
#[command(about = "pdkv placement driver development cluster")]
#[command(version)]
struct Cli {
    /// Config file (TOML); PDKV_* environment variables apply on top
    #[arg(long)]
    config: Option<PathBuf>,

    /// Nodes to run
    #[arg(long, default_value = "3")]
    nodes: u64,

    /// Host part of every node address
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Raft address port of node 1; node N uses port + N - 1
    #[arg(long, default_value = "12001")]
    raft_port: u16,

    /// HTTP port of node 1; node N uses port + N - 1
    #[arg(long, default_value = "11001")]
    service_port: u16,

    /// Replicas per region
    #[arg(long)]
    replication_factor: Option<usize>,

    /// Applied entries between replica snapshots (0 disables)
    #[arg(long)]
    snapshot_entries: Option<u64>,
}

fn node_config(base: &PdConfig, cli: &Cli, node_id: u64) -> anyhow::Result<PdConfig> {
    let offset = u16::try_from(node_id - 1)?;
    let port = |first: u16| {
        first
            .checked_add(offset)
            .ok_or_else(|| anyhow::anyhow!("port {} + {} is out of range", first, offset))
    };
    let service = |port: u16| format!("{}:{}", cli.host, port);
    let mut cfg = base.clone();
    cfg.node_id = node_id;
    cfg.raft_addr = service(port(cli.raft_port)?);
    cfg.service_addr = service(port(cli.service_port)?);
    cfg.bootstrap = node_id == 1;
    cfg.seed_service_addr = (node_id != 1).then(|| service(cli.service_port));
    cfg.validate()?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut base = PdConfig::read_sources(cli.config.as_deref())?;
    if let Some(rf) = cli.replication_factor {
        base.replication_factor = rf;
    }
    if let Some(n) = cli.snapshot_entries {
        base.snapshot_entries = n;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| base.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.nodes == 0 {
        anyhow::bail!("--nodes must be at least 1");
    }

    let network = LocalNetwork::with_snapshot_entries(base.snapshot_entries);
    let shutdown = CancellationToken::new();
    let mut servers = Vec::new();

    for node_id in 1..=cli.nodes {
        let cfg = node_config(&base, &cli, node_id)?;
        let host = network.host(cfg.raft_addr.clone())?;
        let peers = HttpPeerClient::new(cfg.region_operation_timeout())?;
        let driver = PlacementDriver::new(cfg, Arc::new(host), Arc::new(peers));
        let server = PdServer::new(driver);
        let token = shutdown.clone();
        servers.push(tokio::spawn(async move {
            let node_id = server.driver().node_id();
            if let Err(e) = server.serve(token).await {
                tracing::error!("Node {} stopped with error: {}", node_id, e);
            }
        }));
    }

    tracing::info!("Dev cluster of {} nodes started, Ctrl-C to stop", cli.nodes);
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    shutdown.cancel();
    for server in servers {
        let _ = server.await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("pd-server").chain(args.iter().copied()))
    }

    #[test]
    fn test_node_ports_follow_node_id() {
        let cfg = node_config(&PdConfig::default(), &parse(&[]), 3).unwrap();
        assert_eq!(cfg.raft_addr, "127.0.0.1:12003");
        assert_eq!(cfg.service_addr, "127.0.0.1:11003");
        assert_eq!(cfg.seed_service_addr.as_deref(), Some("127.0.0.1:11001"));
        assert!(!cfg.bootstrap);
    }

    #[test]
    fn test_port_overflow_is_an_error() {
        let base = PdConfig::default();
        let cli = parse(&["--service-port", "65535"]);
        assert!(node_config(&base, &cli, 1).is_ok());
        assert!(node_config(&base, &cli, 2).is_err());

        let cli = parse(&["--raft-port", "65534"]);
        assert!(node_config(&base, &cli, 2).is_ok());
        assert!(node_config(&base, &cli, 3).is_err());
    }
}
