//! onionp2p node binary
//!
//! Runs a relay (optionally exit-capable) and, when configured, a local
//! HTTP CONNECT proxy that tunnels browser traffic through fresh circuits.

mod config;

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use onionp2p_database::{Database, DatabaseConfig};
use onionp2p_keystore::load_or_generate_identity;
use onionp2p_logging::LogLevel;
use onionp2p_network::{
    build_host, parse_bootstrap_nodes, HostConfig, DEFAULT_BOOTSTRAP_NODES,
};
use onionp2p_onion::{Onion, OnionConfig, PROTOCOL_ID};
use onionp2p_proxy::{Proxy, ProxyConfig};

use crate::config::Config;

/// Interval the proxy's peer database refreshes at.
const PEER_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// onionp2p - anonymity overlay node
#[derive(Parser)]
#[command(name = "onionp2p-node")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node from a configuration file
    Run {
        /// Configuration YAML file to load
        #[arg(long, default_value = "config.yaml")]
        config: PathBuf,
    },

    /// Print the peer ID of an identity file (generating it if missing)
    Identity {
        /// Identity keyfile location
        #[arg(long)]
        keyfile: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    onionp2p_logging::init(LogLevel::from_verbosity(cli.verbose));

    match cli.command {
        Commands::Run { config } => run(&config).await,
        Commands::Identity { keyfile } => {
            let keypair = load_or_generate_identity(&keyfile)?;
            println!("{}", keypair.public().to_peer_id());
            Ok(())
        }
    }
}

async fn run(config_path: &std::path::Path) -> Result<()> {
    let config = Config::load(config_path)?;

    let keypair =
        load_or_generate_identity(&config.identity_location).context("failed to load identity")?;
    info!("node identity: {}", keypair.public().to_peer_id());

    let host_config = HostConfig {
        listen_addrs: if config.hidden_mode {
            Vec::new()
        } else {
            config.listen_multiaddrs()?
        },
        advertise_addrs: config.advertise_multiaddrs()?,
        server_mode: !config.hidden_mode,
        ..HostConfig::default()
    };

    let (network, incoming) = build_host(keypair.clone(), PROTOCOL_ID, host_config)
        .context("failed to prepare host")?;

    // Seed the routing table before the overlay starts bootstrapping.
    let mut bootstrap_wait = false;
    if let Some(bootstrap) = &config.bootstrap {
        bootstrap_wait = bootstrap.wait;

        let mut hosts = bootstrap.hosts.clone();
        if bootstrap.defaults {
            info!("using default bootstrap hosts");
            hosts.extend(DEFAULT_BOOTSTRAP_NODES.iter().map(|s| s.to_string()));
        }
        for (peer, addr) in parse_bootstrap_nodes(&hosts) {
            info!("bootstrap host: {peer} at {addr}");
            network.add_address(peer, addr.clone()).await.ok();
            if let Err(e) = network.dial(peer).await {
                warn!("failed to reach bootstrap host {peer}: {e}");
            }
        }
    }

    info!("preparing overlay service");
    let onion = Onion::new(
        OnionConfig::new(network.clone(), incoming, keypair)
            .with_exit_node(config.exit_node)
            .with_hidden_mode(config.hidden_mode)
            .with_bootstrap(bootstrap_wait)
            .with_ttl(config.ttl),
    )
    .await
    .context("failed to prepare overlay service")?;

    for addr in network.listeners().await.unwrap_or_default() {
        info!("listening at {addr}/p2p/{}", onion.local_peer_id());
    }

    if let Some(proxy_config) = &config.proxy {
        info!("preparing proxy");
        let database = Database::new(DatabaseConfig {
            onion: onion.clone(),
            refresh_interval: PEER_REFRESH_INTERVAL,
            blacklist: HashSet::new(),
        })
        .await
        .context("failed to prepare peer database")?;

        let proxy = Proxy::new(
            onion.clone(),
            database,
            ProxyConfig {
                listen_addr: proxy_config.proxy_address,
                circuit_length: proxy_config.circuit_length,
                allow_private: false,
            },
        );
        tokio::spawn(async move {
            if let Err(e) = proxy.serve().await {
                warn!("proxy stopped: {e}");
            }
        });
    } else {
        info!("proxy disabled");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    info!("shutting down");
    onion.shutdown();
    Ok(())
}
