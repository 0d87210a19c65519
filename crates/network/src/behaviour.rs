//! Network behaviour for onionp2p nodes
//!
//! Combines Kademlia (provider records and peer routing), Identify (address
//! exchange feeding Kademlia) and the raw stream protocol the overlay runs
//! its sessions on.

use std::time::Duration;

use libp2p::{identify, kad, swarm::NetworkBehaviour, StreamProtocol};

/// Kademlia protocol name
pub const KADEMLIA_PROTOCOL: StreamProtocol = StreamProtocol::new("/onionp2p/kad/1.0.0");

/// Identify protocol version string
pub const IDENTIFY_PROTOCOL: &str = "/onionp2p/id/1.0.0";

/// Kademlia query timeout
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Combined behaviour for onionp2p nodes
#[derive(NetworkBehaviour)]
pub struct OnionBehaviour {
    /// Kademlia DHT for capability discovery and hidden-address providers
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    /// Identify protocol so peers learn each other's listen addresses
    pub identify: identify::Behaviour,
    /// Raw stream protocol carrier for overlay sessions
    pub stream: libp2p_stream::Behaviour,
}

impl OnionBehaviour {
    pub fn new(keypair: &libp2p::identity::Keypair) -> Self {
        let local_peer_id = keypair.public().to_peer_id();

        let mut kad_config = kad::Config::new(KADEMLIA_PROTOCOL);
        kad_config.set_query_timeout(QUERY_TIMEOUT);

        let store = kad::store::MemoryStore::new(local_peer_id);
        let kademlia = kad::Behaviour::with_config(local_peer_id, store, kad_config);

        let identify_config = identify::Config::new(IDENTIFY_PROTOCOL.to_string(), keypair.public())
            .with_agent_version(format!("onionp2p/{}", env!("CARGO_PKG_VERSION")));
        let identify = identify::Behaviour::new(identify_config);

        let stream = libp2p_stream::Behaviour::new();

        Self {
            kademlia,
            identify,
            stream,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;

    #[test]
    fn test_kademlia_protocol() {
        assert_eq!(KADEMLIA_PROTOCOL.as_ref(), "/onionp2p/kad/1.0.0");
    }

    #[test]
    fn test_behaviour_creation() {
        let keypair = Keypair::generate_ed25519();
        let behaviour = OnionBehaviour::new(&keypair);

        let _ = &behaviour.kademlia;
        let _ = &behaviour.identify;
        let _ = &behaviour.stream;
    }
}
