//! onionp2p network substrate
//!
//! libp2p wiring for the overlay: a swarm combining Kademlia, Identify and
//! the raw stream protocol, driven by a background task and exposed through
//! a cloneable async handle.
//!
//! The overlay protocol itself lives in `onionp2p-onion`; this crate only
//! provides peer identity, dialing, provider records and raw streams.

mod behaviour;
mod bootstrap;
mod driver;
mod handle;
mod node;

use libp2p::PeerId;
use thiserror::Error;

pub use behaviour::{OnionBehaviour, IDENTIFY_PROTOCOL, KADEMLIA_PROTOCOL, QUERY_TIMEOUT};
pub use bootstrap::{parse_bootstrap_addr, parse_bootstrap_nodes, DEFAULT_BOOTSTRAP_NODES};
pub use handle::{NetworkHandle, PeerRecord};
pub use node::{build_host, HostConfig};

// Re-export commonly used substrate types
pub use libp2p::{Multiaddr, StreamProtocol};
pub use libp2p_stream::IncomingStreams;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("swarm build error: {0}")]
    SwarmBuild(String),

    #[error("listen error: {0}")]
    Listen(String),

    #[error("dial error: {0}")]
    Dial(String),

    #[error("stream open error: {0}")]
    OpenStream(String),

    #[error("record store error: {0}")]
    Store(String),

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("bootstrap error: no known peers")]
    NoKnownPeers,

    #[error("network driver channel closed")]
    ChannelClosed,
}
