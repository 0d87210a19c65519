//! Client-side circuit builder
//!
//! A circuit is built one hop at a time. Every hop gets a fresh ephemeral
//! identity, so only the first relay ever sees the client's long-lived
//! peer ID; later relays authenticate a keypair that lives exactly as long
//! as the hop's handshake. After each extension the new tail's secured
//! channel nests inside all previous ones and becomes the active conduit.

use std::collections::HashMap;
use std::sync::Arc;

use cid::Cid;
use libp2p::identity::Keypair;
use libp2p::{Multiaddr, PeerId};
use tokio::time::timeout;
use tracing::debug;

use onionp2p_network::PeerRecord;

use crate::conduit::{boxed, BoxConduit};
use crate::error::{OnionError, Result};
use crate::hidden::{HiddenConnection, HiddenListener};
use crate::message::{
    Bind, Body, Dial, Extend, External, HiddenDht, Message, NoiseHello, Settings, Variant,
};
use crate::mux::{Mode, MuxSession};
use crate::noise::NoiseUpgrader;
use crate::peers;
use crate::service::Onion;
use crate::{DEFAULT_DEADLINE, PROTOCOL_ID};

/// An established (possibly still growing) chain of relays.
pub struct Circuit {
    onion: Arc<Onion>,
    ordered: Vec<PeerId>,
    settings: HashMap<PeerId, Settings>,
    active: Option<BoxConduit>,
}

impl Circuit {
    pub(crate) fn new(onion: Arc<Onion>) -> Self {
        Self {
            onion,
            ordered: Vec::new(),
            settings: HashMap::new(),
            active: None,
        }
    }

    /// Peers in hop order; the last entry is the tail.
    pub fn hops(&self) -> &[PeerId] {
        &self.ordered
    }

    pub fn tail(&self) -> Option<PeerId> {
        self.ordered.last().copied()
    }

    /// Settings the given hop advertised during extension.
    pub fn settings_for(&self, peer: PeerId) -> Option<Settings> {
        self.settings.get(&peer).copied()
    }

    /// Extend the circuit by one hop.
    ///
    /// The first hop is a raw stream; every further hop is reached by
    /// telling the current tail to splice toward the new peer, after which
    /// our bytes pass through it verbatim and the new hop answers us
    /// directly through the tunnel.
    pub async fn extend(&mut self, id: PeerId) -> Result<()> {
        let ephemeral = Keypair::generate_ed25519();
        let public_key = ephemeral.public().encode_protobuf();

        let mut conduit = match self.active.take() {
            None => {
                let stream = timeout(
                    DEFAULT_DEADLINE,
                    self.onion.network().open_stream(id, PROTOCOL_ID),
                )
                .await??;
                boxed(stream)
            }
            Some(mut active) => {
                let tail = self.tail().ok_or_else(|| {
                    OnionError::ProtocolViolation("active conduit without a tail".to_string())
                })?;
                let tail_settings = self.settings.get(&tail).copied().ok_or_else(|| {
                    OnionError::ProtocolViolation("no settings for current tail".to_string())
                })?;

                Message::send(
                    &mut active,
                    Body::extend(Extend::new(id)),
                    &tail_settings,
                    DEFAULT_DEADLINE,
                )
                .await?;
                active
            }
        };

        // The new tail speaks first; its settings message is priced at the
        // default difficulty because we never advertised one.
        let message = timeout(
            DEFAULT_DEADLINE,
            Message::recv(&mut conduit, &Settings::default()),
        )
        .await??;
        let settings = match message.body.variant()? {
            Variant::Settings(settings) => *settings,
            _ => {
                return Err(OnionError::ProtocolViolation(
                    "expected settings from new hop".to_string(),
                ))
            }
        };
        self.settings.insert(id, settings);

        Message::send(
            &mut conduit,
            Body::noise(NoiseHello { public_key }),
            &settings,
            DEFAULT_DEADLINE,
        )
        .await?;

        let noise = NoiseUpgrader::new(&ephemeral)?;
        let secured = timeout(DEFAULT_DEADLINE, noise.secure_outbound(conduit, id)).await??;

        self.active = Some(secured);
        self.ordered.push(id);
        debug!("circuit extended to {id} ({} hops)", self.ordered.len());
        Ok(())
    }

    /// Ask the tail to splice us to a clearnet endpoint. The returned
    /// conduit carries the remote's bytes end to end.
    pub async fn external(mut self, addr: &Multiaddr) -> Result<BoxConduit> {
        let settings = self.tail_settings()?;
        let mut active = self.take_active()?;

        Message::send(
            &mut active,
            Body::external(External::new(addr)),
            &settings,
            DEFAULT_DEADLINE,
        )
        .await?;
        Ok(active)
    }

    /// Publish a hidden service through the tail and start accepting
    /// connections on the returned listener.
    pub async fn bind(mut self, keypair: &Keypair) -> Result<HiddenListener> {
        let settings = self.tail_settings()?;

        let address = peers::hidden_address_from_keypair(keypair);
        let signature = keypair
            .sign(&address.to_bytes())
            .map_err(|e| OnionError::Upstream(format!("sign hidden address: {e}")))?;
        let public_key = keypair.public().encode_protobuf();

        let mut active = self.take_active()?;
        Message::send(
            &mut active,
            Body::bind(Bind {
                public_key,
                signature,
            }),
            &settings,
            DEFAULT_DEADLINE,
        )
        .await?;

        // The relay opens one stream per dialer; we accept.
        let session = Arc::new(MuxSession::new(active, Mode::Server));
        HiddenListener::new(keypair, session)
    }

    /// Connect to a hidden service the tail is hosting.
    pub async fn dial(mut self, address: Cid) -> Result<HiddenConnection> {
        let settings = self.tail_settings()?;
        let mut active = self.take_active()?;

        Message::send(
            &mut active,
            Body::dial(Dial::new(&address)),
            &settings,
            DEFAULT_DEADLINE,
        )
        .await?;

        // We open streams; the relay mirrors them onto the service.
        let session = Arc::new(MuxSession::new(active, Mode::Client));
        Ok(HiddenConnection::new(address, session))
    }

    /// Query DHT providers through the tail so the lookup never leaves the
    /// tunnel attributable to us. Discovered providers are fed into the
    /// local provider cache so a follow-up extension can reach them.
    pub async fn hidden_dht(&mut self, cid: Cid) -> Result<Vec<PeerRecord>> {
        let settings = self.tail_settings()?;
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| OnionError::ProtocolViolation("circuit already consumed".to_string()))?;

        Message::send(
            active,
            Body::hidden_dht(HiddenDht::new(&cid)),
            &settings,
            DEFAULT_DEADLINE,
        )
        .await?;

        let message = timeout(DEFAULT_DEADLINE, Message::recv(active, &Settings::default())).await??;
        let response = match message.body.variant()? {
            Variant::HiddenDhtResponse(response) => response.clone(),
            _ => {
                return Err(OnionError::ProtocolViolation(
                    "expected hidden dht response".to_string(),
                ))
            }
        };

        let mut records = Vec::with_capacity(response.peers.len());
        for peer in &response.peers {
            let peer_id = peer.peer_id()?;
            let addrs = peer.addrs();
            self.onion
                .network()
                .add_provider(cid.to_bytes(), peer_id, addrs.clone())
                .await?;
            records.push(PeerRecord { peer_id, addrs });
        }
        Ok(records)
    }

    /// Tear the circuit down. Dropping the active conduit closes every
    /// nested layer and the root stream with it.
    pub fn close(self) {}

    fn tail_settings(&self) -> Result<Settings> {
        let tail = self
            .tail()
            .ok_or_else(|| OnionError::ProtocolViolation("empty circuit".to_string()))?;
        self.settings
            .get(&tail)
            .copied()
            .ok_or_else(|| OnionError::ProtocolViolation("no settings for tail".to_string()))
    }

    fn take_active(&mut self) -> Result<BoxConduit> {
        self.active
            .take()
            .ok_or_else(|| OnionError::ProtocolViolation("circuit already consumed".to_string()))
    }
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit").field("hops", &self.ordered).finish()
    }
}
