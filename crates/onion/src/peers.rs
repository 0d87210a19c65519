//! Peer capabilities and hidden addresses
//!
//! Two fixed CIDs name the overlay and its exit mode; a peer advertises
//! `basic` iff it relays, and additionally `exit` iff it terminates
//! circuits at clearnet endpoints. Hidden services are addressed by the
//! peer ID of their keypair lifted into a CID.

use std::collections::HashSet;

use cid::Cid;
use libp2p::identity::{Keypair, PublicKey};
use libp2p::PeerId;
use multihash::Multihash;
use sha2::{Digest, Sha256};

use onionp2p_network::{NetworkHandle, PeerRecord};

use crate::error::{OnionError, Result};

pub const BASE_STRING: &str = "onionp2p";
pub const BASIC_NODE_STRING: &str = "onionp2p-basic";
pub const EXIT_NODE_STRING: &str = "onionp2p-exitnode";

/// Suffix hidden addresses carry in user-facing contexts.
pub const HIDDEN_DNS_SUFFIX: &str = ".libonion";

const CODEC_DAG_CBOR: u64 = 0x71;
const CODEC_LIBP2P_KEY: u64 = 0x72;
const MULTIHASH_SHA2_256: u64 = 0x12;

/// Deterministic capability CID for a well-known string.
pub fn capability_cid(data: &str) -> Cid {
    let digest = Sha256::digest(data.as_bytes());
    let hash = Multihash::<64>::wrap(MULTIHASH_SHA2_256, &digest)
        .expect("sha2-256 digest fits a 64-byte multihash");
    Cid::new_v1(CODEC_DAG_CBOR, hash)
}

/// CID every relay advertises.
pub fn basic_cid() -> Cid {
    capability_cid(BASIC_NODE_STRING)
}

/// CID exit-capable relays additionally advertise.
pub fn exit_cid() -> Cid {
    capability_cid(EXIT_NODE_STRING)
}

/// Lift a peer ID into the CID space so the DHT's provider index becomes a
/// key→peer-set map.
pub fn peer_id_to_cid(peer: PeerId) -> Cid {
    let hash =
        Multihash::<64>::from_bytes(&peer.to_bytes()).expect("peer id is a valid multihash");
    Cid::new_v1(CODEC_LIBP2P_KEY, hash)
}

/// Recover the peer ID a hidden address wraps.
pub fn peer_id_from_cid(address: &Cid) -> Result<PeerId> {
    PeerId::from_bytes(&address.hash().to_bytes())
        .map_err(|e| OnionError::ProtocolViolation(format!("cid does not wrap a peer id: {e}")))
}

/// Hidden address of a service public key.
pub fn hidden_address_from_public_key(public: &PublicKey) -> Cid {
    peer_id_to_cid(public.to_peer_id())
}

/// Hidden address of a service keypair.
pub fn hidden_address_from_keypair(keypair: &Keypair) -> Cid {
    hidden_address_from_public_key(&keypair.public())
}

/// `<peerid>.libonion` rendering of a hidden address.
pub fn format_hidden_address(address: &Cid) -> Result<String> {
    let peer = peer_id_from_cid(address)?;
    Ok(format!("{peer}{HIDDEN_DNS_SUFFIX}"))
}

/// A discovered overlay peer and the capability CIDs it claims.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub info: PeerRecord,
    pub modes: HashSet<Cid>,
}

impl PeerEntry {
    pub fn peer_id(&self) -> PeerId {
        self.info.peer_id
    }

    pub fn is_exit(&self) -> bool {
        self.modes.contains(&exit_cid())
    }
}

/// Union of the DHT provider sets for both capability CIDs.
///
/// A peer announcing only the exit capability without the basic one is not
/// a usable relay and is filtered out.
pub async fn list_peers(network: &NetworkHandle) -> Result<Vec<PeerEntry>> {
    let basic = network.find_providers(basic_cid().to_bytes()).await?;

    let mut entries: Vec<PeerEntry> = basic
        .into_iter()
        .map(|info| PeerEntry {
            info,
            modes: HashSet::from([basic_cid()]),
        })
        .collect();

    let exits = network.find_providers(exit_cid().to_bytes()).await?;
    for record in exits {
        if let Some(entry) = entries.iter_mut().find(|e| e.peer_id() == record.peer_id) {
            entry.modes.insert(exit_cid());
        }
    }

    Ok(entries)
}
