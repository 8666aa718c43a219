//! `shardgate` binary: runs the gateway or talks to a running one.
//!
//! ```bash
//! # Serve with a config file
//! shardgate serve --config gateway.toml
//!
//! # Serve two SQLite shards without a config file
//! shardgate serve --shard shardA=/var/lib/a.db --shard shardB=/var/lib/b.db
//!
//! # Admin and data calls against a running gateway
//! shardgate register tenant1 shardA
//! shardgate query tenant1 "SELECT * FROM orders"
//! shardgate migrate tenant1 shardB
//! shardgate metrics
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use shardgate::{Gateway, GatewayClient, GatewayConfig, ShardConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "shardgate")]
#[command(about = "Sharding gateway that routes keyed SQL traffic and migrates keys live")]
struct Cli {
    /// Log filter, in `RUST_LOG` syntax.
    #[arg(long, global = true, env = "SHARDGATE_LOG", default_value = "shardgate=info")]
    log_filter: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway.
    Serve(ServeArgs),
    /// Route a key to a shard.
    Register {
        #[command(flatten)]
        target: Target,
        key: String,
        shard: String,
    },
    /// Drop a key's route.
    Remove {
        #[command(flatten)]
        target: Target,
        key: String,
    },
    /// Move a key's data to another shard and route it there.
    Migrate {
        #[command(flatten)]
        target: Target,
        key: String,
        to_shard: String,
    },
    /// Run a row-returning statement for a key.
    Query {
        #[command(flatten)]
        target: Target,
        key: String,
        sql: String,
    },
    /// Run a modifying statement for a key.
    Exec {
        #[command(flatten)]
        target: Target,
        key: String,
        sql: String,
    },
    /// Check that a gateway is answering.
    Ping {
        #[command(flatten)]
        target: Target,
    },
    /// Print a gateway's metrics in Prometheus text format.
    Metrics {
        #[command(flatten)]
        target: Target,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// TOML configuration file.
    #[arg(long, short = 'c', env = "SHARDGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen address.
    #[arg(long, short = 'l')]
    listen: Option<SocketAddr>,

    /// Add a SQLite shard as NAME=PATH. May be repeated.
    #[arg(long = "shard", value_parser = parse_shard)]
    shards: Vec<ShardConfig>,
}

#[derive(Args)]
struct Target {
    /// Gateway address.
    #[arg(long, short = 'a', env = "SHARDGATE_ADDR", default_value = "127.0.0.1:15501")]
    addr: SocketAddr,
}

fn parse_shard(s: &str) -> std::result::Result<ShardConfig, String> {
    let (name, path) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PATH, got {:?}", s))?;
    if name.is_empty() || path.is_empty() {
        return Err(format!("expected NAME=PATH, got {:?}", s));
    }
    Ok(ShardConfig::sqlite(name, path))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&cli.log_filter)
                .context("invalid log filter")?,
        )
        .init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Register { target, key, shard } => {
            let mut client = connect(&target).await?;
            let result = client.register_key(key, shard).await?;
            println!("{}", result.message);
            Ok(())
        }
        Command::Remove { target, key } => {
            let mut client = connect(&target).await?;
            let result = client.remove_key(key).await?;
            println!("{}", result.message);
            Ok(())
        }
        Command::Migrate {
            target,
            key,
            to_shard,
        } => {
            let mut client = connect(&target).await?;
            let result = client.migrate_shard(key, to_shard).await?;
            println!("{}", result.message);
            Ok(())
        }
        Command::Query { target, key, sql } => {
            let mut client = connect(&target).await?;
            let rows = client.query(key, sql).await?;
            println!("{}", rows.columns.join("\t"));
            for row in &rows.rows {
                let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
                println!("{}", cells.join("\t"));
            }
            Ok(())
        }
        Command::Exec { target, key, sql } => {
            let mut client = connect(&target).await?;
            let result = client.exec(key, sql).await?;
            println!(
                "rows_affected={} last_insert_id={}",
                result.rows_affected, result.last_insert_id
            );
            Ok(())
        }
        Command::Ping { target } => {
            let mut client = connect(&target).await?;
            client.ping().await?;
            println!("pong");
            Ok(())
        }
        Command::Metrics { target } => {
            let mut client = connect(&target).await?;
            print!("{}", client.metrics().await?);
            Ok(())
        }
    }
}

async fn connect(target: &Target) -> Result<GatewayClient> {
    GatewayClient::connect(target.addr)
        .await
        .with_context(|| format!("failed to connect to gateway at {}", target.addr))
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => GatewayConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    config.shards.extend(args.shards);
    if config.shards.is_empty() {
        bail!("no shards configured; pass --config or --shard NAME=PATH");
    }

    let gateway = Arc::new(Gateway::new(config)?);

    let on_signal = Arc::clone(&gateway);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt");
            on_signal.shutdown();
        }
    });

    match gateway.run().await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!(error = %e, "Gateway stopped with a fatal error");
            Err(e.into())
        }
    }
}
