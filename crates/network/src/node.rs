//! Host construction
//!
//! Builds the tokio TCP+QUIC swarm, registers the overlay stream protocol,
//! and spawns the driver task. Callers get back a cloneable handle plus the
//! stream of inbound overlay sessions.

use std::time::Duration;

use libp2p::{identity::Keypair, kad, noise, tcp, yamux, Multiaddr, StreamProtocol, SwarmBuilder};
use tokio::sync::mpsc;
use tracing::info;

use crate::behaviour::OnionBehaviour;
use crate::driver::Driver;
use crate::handle::NetworkHandle;
use crate::NetworkError;

/// Host configuration
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Addresses to listen on. Empty means the node accepts no inbound
    /// connections (hidden mode).
    pub listen_addrs: Vec<Multiaddr>,
    /// Addresses advertised to other peers instead of the observed ones.
    pub advertise_addrs: Vec<Multiaddr>,
    /// Run Kademlia in server mode (answer queries, store records).
    pub server_mode: bool,
    /// How long to keep idle connections around.
    pub idle_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec!["/ip4/0.0.0.0/tcp/0"
                .parse()
                .expect("valid hardcoded multiaddr")],
            advertise_addrs: Vec::new(),
            server_mode: true,
            idle_timeout: Duration::from_secs(120),
        }
    }
}

const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Build a host and register `protocol` for inbound streams.
///
/// The stream protocol must be registered before any connections exist:
/// connection handlers capture the supported-protocol set at creation time,
/// so a late registration would silently drop inbound streams.
pub fn build_host(
    keypair: Keypair,
    protocol: StreamProtocol,
    config: HostConfig,
) -> Result<(NetworkHandle, libp2p_stream::IncomingStreams), NetworkError> {
    let local_peer_id = keypair.public().to_peer_id();

    let mut swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| NetworkError::SwarmBuild(e.to_string()))?
        .with_quic()
        .with_dns()
        .map_err(|e| NetworkError::SwarmBuild(e.to_string()))?
        .with_behaviour(|key| OnionBehaviour::new(key))
        .map_err(|e| NetworkError::SwarmBuild(e.to_string()))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(config.idle_timeout))
        .build();

    if config.server_mode {
        swarm
            .behaviour_mut()
            .kademlia
            .set_mode(Some(kad::Mode::Server));
    } else {
        swarm
            .behaviour_mut()
            .kademlia
            .set_mode(Some(kad::Mode::Client));
    }

    for addr in &config.listen_addrs {
        swarm
            .listen_on(addr.clone())
            .map_err(|e| NetworkError::Listen(e.to_string()))?;
    }

    for addr in &config.advertise_addrs {
        swarm.add_external_address(addr.clone());
    }

    let mut control = swarm.behaviour().stream.new_control();
    let incoming = control
        .accept(protocol)
        .map_err(|e| NetworkError::SwarmBuild(e.to_string()))?;

    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    tokio::spawn(Driver::new(swarm, cmd_rx).run());

    info!("host built with peer ID {local_peer_id}");
    Ok((NetworkHandle::new(local_peer_id, cmd_tx, control), incoming))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HostConfig::default();
        assert!(!config.listen_addrs.is_empty());
        assert!(config.server_mode);
    }

    #[tokio::test]
    async fn test_build_host() {
        let keypair = Keypair::generate_ed25519();
        let expected = keypair.public().to_peer_id();
        let protocol = StreamProtocol::new("/test/0.0.1");

        let (handle, _incoming) = build_host(keypair, protocol, HostConfig::default()).unwrap();
        assert_eq!(handle.local_peer_id(), expected);
    }

    #[tokio::test]
    async fn test_listeners_reported() {
        let keypair = Keypair::generate_ed25519();
        let protocol = StreamProtocol::new("/test/0.0.1");
        let config = HostConfig {
            listen_addrs: vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()],
            ..HostConfig::default()
        };

        let (handle, _incoming) = build_host(keypair, protocol, config).unwrap();

        // The listener address shows up once the swarm has bound the socket.
        let mut addrs = Vec::new();
        for _ in 0..50 {
            addrs = handle.listeners().await.unwrap();
            if !addrs.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!addrs.is_empty());
    }
}
