//! Async facade over the swarm driver
//!
//! A [`NetworkHandle`] is cheap to clone and safe to use from any task. Raw
//! stream opens go straight through the stream-protocol control; everything
//! touching the DHT or the dialer is a command round-trip to the driver.

use libp2p::{Multiaddr, PeerId, StreamProtocol};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::driver::Command;
use crate::NetworkError;

/// A peer and the addresses it is known to be reachable at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

#[derive(Clone)]
pub struct NetworkHandle {
    local_peer_id: PeerId,
    cmd_tx: mpsc::Sender<Command>,
    control: libp2p_stream::Control,
}

impl NetworkHandle {
    pub(crate) fn new(
        local_peer_id: PeerId,
        cmd_tx: mpsc::Sender<Command>,
        control: libp2p_stream::Control,
    ) -> Self {
        Self {
            local_peer_id,
            cmd_tx,
            control,
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Open a raw stream to `peer` on `protocol`.
    ///
    /// The stream control dials on demand, but only if the swarm already
    /// knows an address for the peer. On failure the peer is resolved
    /// through the DHT once and the open retried.
    pub async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<libp2p::Stream, NetworkError> {
        let mut control = self.control.clone();
        match control.open_stream(peer, protocol.clone()).await {
            Ok(stream) => Ok(stream),
            Err(first) => {
                debug!("stream open to {peer} failed ({first}), resolving through DHT");
                self.find_peer(peer).await?;
                self.dial(peer).await?;
                control
                    .open_stream(peer, protocol)
                    .await
                    .map_err(|e| NetworkError::OpenStream(e.to_string()))
            }
        }
    }

    /// Announce this node as a provider of `key`.
    pub async fn provide(&self, key: Vec<u8>) -> Result<(), NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Provide { key, reply }).await?;
        rx.await.map_err(|_| NetworkError::ChannelClosed)?
    }

    /// Query the DHT for providers of `key`.
    pub async fn find_providers(&self, key: Vec<u8>) -> Result<Vec<PeerRecord>, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::FindProviders { key, reply }).await?;
        rx.await.map_err(|_| NetworkError::ChannelClosed)?
    }

    /// Resolve a peer's addresses through the DHT.
    pub async fn find_peer(&self, peer: PeerId) -> Result<Vec<Multiaddr>, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::FindPeer { peer, reply }).await?;
        rx.await.map_err(|_| NetworkError::ChannelClosed)?
    }

    /// Insert a provider record into the local store, along with its
    /// addresses, without touching the network.
    pub async fn add_provider(
        &self,
        key: Vec<u8>,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
    ) -> Result<(), NetworkError> {
        self.send(Command::AddProvider { key, peer, addrs }).await
    }

    /// Teach the routing table an address for a peer.
    pub async fn add_address(&self, peer: PeerId, addr: Multiaddr) -> Result<(), NetworkError> {
        self.send(Command::AddAddress { peer, addr }).await
    }

    /// Establish a connection to a peer using known addresses.
    pub async fn dial(&self, peer: PeerId) -> Result<(), NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Dial { peer, reply }).await?;
        rx.await.map_err(|_| NetworkError::ChannelClosed)?
    }

    /// Kick off a Kademlia bootstrap round.
    pub async fn bootstrap(&self) -> Result<(), NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Bootstrap { reply }).await?;
        rx.await.map_err(|_| NetworkError::ChannelClosed)?
    }

    /// Number of peers in the routing table.
    pub async fn routing_table_size(&self) -> Result<usize, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RoutingTableSize { reply }).await?;
        rx.await.map_err(|_| NetworkError::ChannelClosed)
    }

    /// Addresses the local node is listening on.
    pub async fn listeners(&self) -> Result<Vec<Multiaddr>, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Listeners { reply }).await?;
        rx.await.map_err(|_| NetworkError::ChannelClosed)
    }

    async fn send(&self, cmd: Command) -> Result<(), NetworkError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| NetworkError::ChannelClosed)
    }
}
