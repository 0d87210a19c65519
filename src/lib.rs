//! Test harness: spin up a localhost overlay network
//!
//! Builds `n` interconnected nodes, each with its own host, DHT and overlay
//! service, the way the integration tests want them: every node knows every
//! earlier node's address and dials it, so the routing tables fill without
//! external bootstrap infrastructure.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use libp2p::identity::Keypair;
use libp2p::{Multiaddr, PeerId};

use onionp2p_network::{build_host, HostConfig, NetworkHandle};
use onionp2p_onion::{Onion, OnionConfig, PROTOCOL_ID};

/// Re-advertisement interval used by test nodes; short, so provider
/// records show up quickly.
pub const TEST_TTL: Duration = Duration::from_secs(2);

pub struct TestNode {
    pub onion: Arc<Onion>,
    pub network: NetworkHandle,
    pub peer_id: PeerId,
    pub addr: Multiaddr,
}

pub struct TestNet {
    pub nodes: Vec<TestNode>,
}

impl TestNet {
    /// Spawn `count` relay nodes, optionally all exit-capable.
    pub async fn spawn(count: usize, exit_node: bool) -> Result<TestNet> {
        let _ = onionp2p_logging::try_init(onionp2p_logging::LogLevel::Warn);

        let mut net = TestNet { nodes: Vec::new() };
        for index in 0..count {
            let node = spawn_node(&net.nodes, exit_node, false, index != 0).await?;
            net.nodes.push(node);
        }
        Ok(net)
    }

    /// Spawn an additional relay wired into the existing network.
    pub async fn add_node(&mut self, exit_node: bool) -> Result<&TestNode> {
        let node = spawn_node(&self.nodes, exit_node, false, true).await?;
        self.nodes.push(node);
        Ok(self.nodes.last().expect("just pushed"))
    }

    /// Spawn a client node: connected to everyone, never advertised.
    pub async fn spawn_client(&self) -> Result<TestNode> {
        spawn_node(&self.nodes, false, true, true).await
    }

    /// Relay peer IDs in spawn order.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.nodes.iter().map(|n| n.peer_id).collect()
    }
}

async fn spawn_node(
    existing: &[TestNode],
    exit_node: bool,
    hidden_mode: bool,
    bootstrap: bool,
) -> Result<TestNode> {
    let keypair = Keypair::generate_ed25519();
    let peer_id = keypair.public().to_peer_id();

    let (network, incoming) = build_host(
        keypair.clone(),
        PROTOCOL_ID,
        HostConfig {
            listen_addrs: vec!["/ip4/127.0.0.1/tcp/0".parse().expect("valid multiaddr")],
            advertise_addrs: Vec::new(),
            server_mode: true,
            idle_timeout: Duration::from_secs(120),
        },
    )
    .context("failed to build host")?;

    let addr = wait_for_listener(&network).await?;

    for other in existing {
        network.add_address(other.peer_id, other.addr.clone()).await?;
        other.network.add_address(peer_id, addr.clone()).await?;
        network
            .dial(other.peer_id)
            .await
            .with_context(|| format!("failed to dial {}", other.peer_id))?;
    }

    let onion = Onion::new(
        OnionConfig::new(network.clone(), incoming, keypair)
            .with_exit_node(exit_node)
            .with_hidden_mode(hidden_mode)
            .with_bootstrap(bootstrap && !existing.is_empty())
            .with_ttl(TEST_TTL),
    )
    .await
    .context("failed to prepare overlay service")?;

    Ok(TestNode {
        onion,
        network,
        peer_id,
        addr,
    })
}

async fn wait_for_listener(network: &NetworkHandle) -> Result<Multiaddr> {
    for _ in 0..100 {
        if let Some(addr) = network.listeners().await?.into_iter().next() {
            return Ok(addr);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("listener never came up")
}

/// Poll until `predicate` holds or `deadline` elapses.
pub async fn eventually<F, Fut>(deadline: Duration, mut predicate: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = std::time::Instant::now();
    loop {
        if predicate().await {
            return Ok(());
        }
        if started.elapsed() >= deadline {
            bail!("condition not met within {deadline:?}");
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}
