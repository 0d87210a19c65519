//! Overlay service configuration

use std::time::Duration;

use libp2p::identity::Keypair;

use onionp2p_network::{IncomingStreams, NetworkHandle};

/// Default re-advertisement interval.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Configuration for [`crate::Onion::new`].
///
/// The host and its stream acceptor are built by `onionp2p-network` and
/// handed in here; the overlay never constructs its own substrate.
pub struct OnionConfig {
    /// Handle to the running host and DHT.
    pub network: NetworkHandle,
    /// Inbound overlay streams, registered for the protocol ID.
    pub incoming: IncomingStreams,
    /// Long-lived host identity; relays authenticate with it.
    pub keypair: Keypair,
    /// Terminate circuits at clearnet endpoints, like an exit node.
    pub exit_node: bool,
    /// Do not advertise this node into the network.
    pub hidden_mode: bool,
    /// Bootstrap the DHT and wait until the routing table is non-empty.
    pub bootstrap: bool,
    /// Re-advertisement interval.
    pub ttl: Duration,
}

impl OnionConfig {
    pub fn new(network: NetworkHandle, incoming: IncomingStreams, keypair: Keypair) -> Self {
        Self {
            network,
            incoming,
            keypair,
            exit_node: false,
            hidden_mode: false,
            bootstrap: true,
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_exit_node(mut self, exit_node: bool) -> Self {
        self.exit_node = exit_node;
        self
    }

    pub fn with_hidden_mode(mut self, hidden_mode: bool) -> Self {
        self.hidden_mode = hidden_mode;
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: bool) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}
