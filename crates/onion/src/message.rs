//! Overlay control messages
//!
//! A message is a tagged record with exactly one payload variant set plus a
//! hashcash token minted over the serialized payload. Substrate types
//! (peer IDs, multiaddrs, CIDs) cross the wire as raw bytes; typed
//! accessors validate them on the way out.

use std::time::Duration;

use cid::Cid;
use futures::io::{AsyncRead, AsyncWrite};
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};

use onionp2p_hashcash::{self as hashcash, HashcashError};

use crate::error::{OnionError, Result};
use crate::frame;

/// Per-connection parameters a relay advertises to its counterparty.
///
/// The defaults (difficulty zero, no exit) price the messages a relay sends
/// back to its client: the client never advertised a difficulty of its own.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Settings {
    pub exit_node: bool,
    pub pow_difficulty: u64,
}

/// Request to upgrade the conduit to a noise channel under an ephemeral
/// identity. Carries the protobuf-encoded public key.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NoiseHello {
    pub public_key: Vec<u8>,
}

/// Request that the relay splice this conduit to a fresh stream toward the
/// named peer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Extend {
    pub peer_id: Vec<u8>,
}

impl Extend {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer_id: peer.to_bytes(),
        }
    }

    pub fn peer_id(&self) -> Result<PeerId> {
        PeerId::from_bytes(&self.peer_id)
            .map_err(|e| OnionError::ProtocolViolation(format!("bad peer id: {e}")))
    }
}

/// Request that the relay splice this conduit to a clearnet endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct External {
    pub address: Vec<u8>,
}

impl External {
    pub fn new(addr: &Multiaddr) -> Self {
        Self {
            address: addr.to_vec(),
        }
    }

    pub fn address(&self) -> Result<Multiaddr> {
        Multiaddr::try_from(self.address.clone())
            .map_err(|e| OnionError::ProtocolViolation(format!("bad multiaddr: {e}")))
    }
}

/// Publication of a hidden service: the service public key and its
/// signature over the derived hidden address.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Request to connect to a hidden service hosted by this relay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Dial {
    pub address: Vec<u8>,
}

impl Dial {
    pub fn new(address: &Cid) -> Self {
        Self {
            address: address.to_bytes(),
        }
    }

    pub fn address(&self) -> Result<Cid> {
        Cid::try_from(self.address.as_slice())
            .map_err(|e| OnionError::ProtocolViolation(format!("bad cid: {e}")))
    }
}

/// Anonymous DHT provider lookup executed by the circuit tail.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HiddenDht {
    pub cid: Vec<u8>,
}

impl HiddenDht {
    pub fn new(cid: &Cid) -> Self {
        Self {
            cid: cid.to_bytes(),
        }
    }

    pub fn cid(&self) -> Result<Cid> {
        Cid::try_from(self.cid.as_slice())
            .map_err(|e| OnionError::ProtocolViolation(format!("bad cid: {e}")))
    }
}

/// One provider in a [`HiddenDhtResponse`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HiddenDhtPeer {
    pub peer_id: Vec<u8>,
    pub addrs: Vec<Vec<u8>>,
}

impl HiddenDhtPeer {
    pub fn new(peer: PeerId, addrs: &[Multiaddr]) -> Self {
        Self {
            peer_id: peer.to_bytes(),
            addrs: addrs.iter().map(|a| a.to_vec()).collect(),
        }
    }

    pub fn peer_id(&self) -> Result<PeerId> {
        PeerId::from_bytes(&self.peer_id)
            .map_err(|e| OnionError::ProtocolViolation(format!("bad peer id: {e}")))
    }

    /// Known addresses, silently dropping any that fail to parse.
    pub fn addrs(&self) -> Vec<Multiaddr> {
        self.addrs
            .iter()
            .filter_map(|a| Multiaddr::try_from(a.clone()).ok())
            .collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HiddenDhtResponse {
    pub peers: Vec<HiddenDhtPeer>,
}

/// Message body: exactly one variant must be set.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Body {
    pub settings: Option<Settings>,
    pub noise: Option<NoiseHello>,
    pub extend: Option<Extend>,
    pub external: Option<External>,
    pub bind: Option<Bind>,
    pub dial: Option<Dial>,
    pub hidden_dht: Option<HiddenDht>,
    pub hidden_dht_response: Option<HiddenDhtResponse>,
}

/// Borrowed view of the single variant a body carries.
#[derive(Debug)]
pub enum Variant<'a> {
    Settings(&'a Settings),
    Noise(&'a NoiseHello),
    Extend(&'a Extend),
    External(&'a External),
    Bind(&'a Bind),
    Dial(&'a Dial),
    HiddenDht(&'a HiddenDht),
    HiddenDhtResponse(&'a HiddenDhtResponse),
}

impl Body {
    pub fn settings(settings: Settings) -> Self {
        Self {
            settings: Some(settings),
            ..Self::default()
        }
    }

    pub fn noise(hello: NoiseHello) -> Self {
        Self {
            noise: Some(hello),
            ..Self::default()
        }
    }

    pub fn extend(extend: Extend) -> Self {
        Self {
            extend: Some(extend),
            ..Self::default()
        }
    }

    pub fn external(external: External) -> Self {
        Self {
            external: Some(external),
            ..Self::default()
        }
    }

    pub fn bind(bind: Bind) -> Self {
        Self {
            bind: Some(bind),
            ..Self::default()
        }
    }

    pub fn dial(dial: Dial) -> Self {
        Self {
            dial: Some(dial),
            ..Self::default()
        }
    }

    pub fn hidden_dht(query: HiddenDht) -> Self {
        Self {
            hidden_dht: Some(query),
            ..Self::default()
        }
    }

    pub fn hidden_dht_response(response: HiddenDhtResponse) -> Self {
        Self {
            hidden_dht_response: Some(response),
            ..Self::default()
        }
    }

    /// The variant this body carries. A body with zero or more than one
    /// variant set is a protocol violation.
    pub fn variant(&self) -> Result<Variant<'_>> {
        let mut found = None;
        let mut count = 0usize;

        if let Some(v) = &self.settings {
            found = Some(Variant::Settings(v));
            count += 1;
        }
        if let Some(v) = &self.noise {
            found = Some(Variant::Noise(v));
            count += 1;
        }
        if let Some(v) = &self.extend {
            found = Some(Variant::Extend(v));
            count += 1;
        }
        if let Some(v) = &self.external {
            found = Some(Variant::External(v));
            count += 1;
        }
        if let Some(v) = &self.bind {
            found = Some(Variant::Bind(v));
            count += 1;
        }
        if let Some(v) = &self.dial {
            found = Some(Variant::Dial(v));
            count += 1;
        }
        if let Some(v) = &self.hidden_dht {
            found = Some(Variant::HiddenDht(v));
            count += 1;
        }
        if let Some(v) = &self.hidden_dht_response {
            found = Some(Variant::HiddenDhtResponse(v));
            count += 1;
        }

        match (found, count) {
            (Some(v), 1) => Ok(v),
            (_, n) => Err(OnionError::ProtocolViolation(format!(
                "message must carry exactly one variant, got {n}"
            ))),
        }
    }
}

/// A framed overlay message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub hashcash: String,
    pub body: Body,
}

impl Message {
    /// Mint a token at the counterparty's advertised difficulty and send
    /// the message as one frame. The token search honors `deadline`.
    pub async fn send<W: AsyncWrite + Unpin>(
        io: &mut W,
        body: Body,
        settings: &Settings,
        deadline: Duration,
    ) -> Result<()> {
        let payload = encode(&body)?;
        let token = hashcash::mint(settings.pow_difficulty, &payload, deadline)
            .await
            .map_err(|e| match e {
                HashcashError::Canceled => OnionError::Canceled,
                other => OnionError::PowInvalid(other),
            })?;

        let message = Message {
            hashcash: token,
            body,
        };
        let bytes = encode(&message)?;
        frame::write_frame(io, &bytes).await
    }

    /// Read one frame and verify its token against our advertised
    /// difficulty and our own re-serialization of the payload.
    pub async fn recv<R: AsyncRead + Unpin>(io: &mut R, settings: &Settings) -> Result<Message> {
        let bytes = frame::read_frame(io).await?;
        let message: Message = bincode::deserialize(&bytes)
            .map_err(|e| OnionError::ProtocolViolation(format!("decode: {e}")))?;

        let payload = encode(&message.body)?;
        hashcash::verify_with_difficulty_and_payload(
            &message.hashcash,
            settings.pow_difficulty,
            &payload,
        )?;
        Ok(message)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| OnionError::ProtocolViolation(format!("encode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEADLINE: Duration = Duration::from_secs(60);

    fn free() -> Settings {
        Settings::default()
    }

    #[tokio::test]
    async fn test_roundtrip_all_variants() {
        let peer = PeerId::random();
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/8080".parse().unwrap();
        let cid = crate::peers::basic_cid();

        let bodies = vec![
            Body::settings(Settings {
                exit_node: true,
                pow_difficulty: 7,
            }),
            Body::noise(NoiseHello {
                public_key: vec![1, 2, 3],
            }),
            Body::extend(Extend::new(peer)),
            Body::external(External::new(&addr)),
            Body::bind(Bind {
                public_key: vec![4, 5],
                signature: vec![6, 7],
            }),
            Body::dial(Dial::new(&cid)),
            Body::hidden_dht(HiddenDht::new(&cid)),
            Body::hidden_dht_response(HiddenDhtResponse {
                peers: vec![HiddenDhtPeer::new(peer, std::slice::from_ref(&addr))],
            }),
        ];

        for body in bodies {
            let mut buffer = Vec::new();
            Message::send(&mut buffer, body.clone(), &free(), DEADLINE)
                .await
                .unwrap();

            let mut cursor = futures::io::Cursor::new(buffer);
            let decoded = Message::recv(&mut cursor, &free()).await.unwrap();
            assert_eq!(decoded.body, body);
            decoded.body.variant().unwrap();
        }
    }

    #[tokio::test]
    async fn test_recv_enforces_difficulty() {
        let mut buffer = Vec::new();
        Message::send(
            &mut buffer,
            Body::hidden_dht(HiddenDht::new(&crate::peers::basic_cid())),
            &free(),
            DEADLINE,
        )
        .await
        .unwrap();

        let pricey = Settings {
            exit_node: false,
            pow_difficulty: 20,
        };
        let mut cursor = futures::io::Cursor::new(buffer);
        let err = Message::recv(&mut cursor, &pricey).await.unwrap_err();
        assert!(matches!(err, OnionError::PowInvalid(_)));
    }

    #[tokio::test]
    async fn test_recv_detects_tampered_body() {
        let peer = PeerId::random();
        let mut buffer = Vec::new();
        Message::send(&mut buffer, Body::extend(Extend::new(peer)), &free(), DEADLINE)
            .await
            .unwrap();

        // Re-frame the message with a swapped-in body; the token now binds
        // a payload the receiver will not reproduce.
        let mut cursor = futures::io::Cursor::new(buffer);
        let mut message = Message::recv(&mut cursor, &free()).await.unwrap();
        message.body = Body::extend(Extend::new(PeerId::random()));

        let mut tampered = Vec::new();
        frame::write_frame(&mut tampered, &bincode::serialize(&message).unwrap())
            .await
            .unwrap();

        let mut cursor = futures::io::Cursor::new(tampered);
        let err = Message::recv(&mut cursor, &free()).await.unwrap_err();
        assert!(matches!(err, OnionError::PowInvalid(_)));
    }

    #[test]
    fn test_variant_requires_exactly_one() {
        assert!(Body::default().variant().is_err());

        let mut two = Body::settings(Settings::default());
        two.noise = Some(NoiseHello { public_key: vec![] });
        assert!(two.variant().is_err());
    }

    #[test]
    fn test_typed_accessors() {
        let peer = PeerId::random();
        assert_eq!(Extend::new(peer).peer_id().unwrap(), peer);

        let addr: Multiaddr = "/ip4/10.0.0.1/tcp/443".parse().unwrap();
        assert_eq!(External::new(&addr).address().unwrap(), addr);

        let bad = Extend {
            peer_id: vec![0xff; 4],
        };
        assert!(bad.peer_id().is_err());
    }
}
