//! CLI for placement driver operations

use clap::{Parser, Subcommand};
use pdkv::common::parse_duration;

#[derive(Parser)]
#[command(name = "pdctl")]
#[command(about = "pdkv placement driver CLI")]
#[command(version)]
struct Cli {
    /// Service address of any placement driver node
    #[arg(long, default_value = "127.0.0.1:11001")]
    server: String,

    /// Request timeout (e.g. 500ms, 5s)
    #[arg(long, default_value = "10s")]
    timeout: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a node to the PD group
    Join {
        /// Node ID
        nid: u64,

        /// Raft address of the node
        addr: String,
    },

    /// Remove a node from the PD group
    Leave {
        /// Node ID
        nid: u64,
    },

    /// Create a region
    Create,

    /// Start a replica of a region on the target node (join mode)
    Start {
        /// Region ID
        rid: u64,

        /// Replica ID
        nid: u64,
    },

    /// Show the live membership of a region
    Members {
        /// Region ID
        rid: u64,
    },

    /// Show the routing table
    List,

    /// Find the region holding a key
    Locate {
        /// Key
        key: String,
    },

    /// Show node health and alerts
    Health,

    /// Dump Prometheus metrics
    Metrics,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = reqwest::Client::builder()
        .timeout(parse_duration(&cli.timeout)?)
        .build()?;
    let base = format!("http://{}", cli.server);

    let request = match &cli.command {
        Commands::Join { nid, addr } => client
            .post(format!("{}/pd/join", base))
            .form(&[("nid", nid.to_string()), ("addr", addr.clone())]),
        Commands::Leave { nid } => client
            .post(format!("{}/pd/leave", base))
            .form(&[("nid", nid.to_string())]),
        Commands::Create => client.post(format!("{}/region/create", base)),
        Commands::Start { rid, nid } => client
            .post(format!("{}/region/start", base))
            .form(&[("rid", rid.to_string()), ("nid", nid.to_string())]),
        Commands::Members { rid } => client
            .get(format!("{}/region/members", base))
            .query(&[("rid", rid.to_string())]),
        Commands::List => client.get(format!("{}/region/list", base)),
        Commands::Locate { key } => client
            .get(format!("{}/key/locate", base))
            .query(&[("key", key.as_str())]),
        Commands::Health => client.get(format!("{}/health", base)),
        Commands::Metrics => client.get(format!("{}/metrics", base)),
    };

    let resp = request.send().await?;
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        anyhow::bail!("{}: {}", status, body);
    }

    match &cli.command {
        Commands::Create => println!("✓ Created region {}", body),
        Commands::Locate { key } => println!("{} → region {}", key, body),
        _ => match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
            Err(_) => println!("{}", body),
        },
    }

    Ok(())
}
