//! Relay-side session state machine
//!
//! One task per inbound stream. The relay advertises its settings, then
//! accepts messages priced at that difficulty. Until a noise upgrade lands
//! the only acceptable message is `Noise`; afterwards a terminal message
//! turns the session into a byte pipe (`Extend`, `External`), a hidden
//! service host (`Bind`), a hidden service gateway (`Dial`), or answers
//! DHT queries in place (`HiddenDHT`).

use std::net::IpAddr;
use std::sync::Arc;

use libp2p::identity::PublicKey;
use libp2p::{Multiaddr, PeerId};
use tokio::time::timeout;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::{debug, info};

use onionp2p_network::NetworkHandle;

use crate::conduit::{boxed, BoxConduit};
use crate::error::{OnionError, Result};
use crate::hidden::HiddenServiceIndex;
use crate::message::{Bind, Body, HiddenDhtPeer, HiddenDhtResponse, Message, Settings, Variant};
use crate::mux::{Mode, MuxSession};
use crate::noise::NoiseUpgrader;
use crate::peers;
use crate::splice::splice;
use crate::{DEFAULT_DEADLINE, PROTOCOL_ID};

/// Shared pieces every session needs.
pub(crate) struct SessionContext {
    pub network: NetworkHandle,
    pub noise: NoiseUpgrader,
    pub hidden_services: HiddenServiceIndex,
    pub exit_node: bool,
}

/// One decoded, owned protocol step.
enum Step {
    Noise(Vec<u8>),
    Extend(PeerId),
    External(Multiaddr),
    Bind(Bind),
    Dial(cid::Cid),
    HiddenDht(cid::Cid),
}

/// Handle a single inbound session to completion.
pub(crate) async fn run_session(
    ctx: Arc<SessionContext>,
    remote: PeerId,
    stream: libp2p::Stream,
    settings: Settings,
) -> Result<()> {
    let mut conduit: BoxConduit = boxed(stream);
    let mut secured = false;

    // Advertise our settings first. The client has not spoken yet, so this
    // message is priced at the default difficulty of zero.
    timeout(
        DEFAULT_DEADLINE,
        Message::send(
            &mut conduit,
            Body::settings(settings),
            &Settings::default(),
            DEFAULT_DEADLINE,
        ),
    )
    .await??;

    loop {
        let message = timeout(DEFAULT_DEADLINE, Message::recv(&mut conduit, &settings)).await??;

        let step = match message.body.variant()? {
            Variant::Noise(hello) => Step::Noise(hello.public_key.clone()),
            Variant::Extend(extend) => Step::Extend(extend.peer_id()?),
            Variant::External(external) => Step::External(external.address()?),
            Variant::Bind(bind) => Step::Bind(bind.clone()),
            Variant::Dial(dial) => Step::Dial(dial.address()?),
            Variant::HiddenDht(query) => Step::HiddenDht(query.cid()?),
            Variant::Settings(_) | Variant::HiddenDhtResponse(_) => {
                return Err(OnionError::ProtocolViolation(
                    "variant not valid on a relay session".to_string(),
                ));
            }
        };

        match step {
            Step::Noise(public_key) => {
                if secured {
                    return Err(OnionError::ProtocolViolation(
                        "noise upgrade on an already secured session".to_string(),
                    ));
                }
                conduit = upgrade_to_noise(&ctx, conduit, &public_key).await?;
                secured = true;
                debug!("session with {remote} secured");
            }
            _ if !secured => return Err(OnionError::NotSecured),
            Step::Extend(next) => return handle_extend(&ctx, conduit, next).await,
            Step::External(addr) => return handle_external(&ctx, conduit, addr).await,
            Step::Bind(bind) => return handle_bind(&ctx, conduit, &bind).await,
            Step::Dial(address) => return handle_dial(&ctx, conduit, address).await,
            Step::HiddenDht(cid) => handle_hidden_dht(&ctx, &mut conduit, cid).await?,
        }
    }
}

/// Derive the counterparty's identity from the supplied ephemeral public
/// key and run the noise responder handshake over the current conduit.
async fn upgrade_to_noise(
    ctx: &SessionContext,
    conduit: BoxConduit,
    public_key: &[u8],
) -> Result<BoxConduit> {
    let public = PublicKey::try_decode_protobuf(public_key)
        .map_err(|e| OnionError::ProtocolViolation(format!("bad public key: {e}")))?;
    let expected = public.to_peer_id();

    let (_peer, secured) = timeout(
        DEFAULT_DEADLINE,
        ctx.noise.secure_inbound(conduit, Some(expected)),
    )
    .await??;
    Ok(secured)
}

/// Open a raw stream to the next hop and become a transparent byte pipe.
/// From here on everything is end-to-end ciphertext we cannot inspect.
async fn handle_extend(ctx: &SessionContext, conduit: BoxConduit, next: PeerId) -> Result<()> {
    debug!("extending toward {next}");
    let stream = timeout(DEFAULT_DEADLINE, ctx.network.open_stream(next, PROTOCOL_ID)).await??;

    splice(conduit, stream).await?;
    Ok(())
}

/// Dial a clearnet endpoint and splice. Only exit-mode relays do this.
async fn handle_external(ctx: &SessionContext, conduit: BoxConduit, addr: Multiaddr) -> Result<()> {
    if !ctx.exit_node {
        return Err(OnionError::ExitDisabled);
    }

    let (host, port) = multiaddr_target(&addr)?;
    debug!("external dial to {host}:{port}");

    let remote = timeout(
        DEFAULT_DEADLINE,
        tokio::net::TcpStream::connect((host.as_str(), port)),
    )
    .await?
    .map_err(|e| OnionError::Upstream(format!("external dial: {e}")))?;

    splice(conduit, remote.compat()).await?;
    Ok(())
}

/// Verify the service's ownership proof, publish the hidden address, and
/// host the bind session until the service goes away.
async fn handle_bind(ctx: &SessionContext, conduit: BoxConduit, bind: &Bind) -> Result<()> {
    let public = PublicKey::try_decode_protobuf(&bind.public_key)
        .map_err(|e| OnionError::ProtocolViolation(format!("bad public key: {e}")))?;

    let address = peers::hidden_address_from_public_key(&public);
    if !public.verify(&address.to_bytes(), &bind.signature) {
        return Err(OnionError::SignatureInvalid);
    }

    info!("hosting hidden service {address}");
    timeout(DEFAULT_DEADLINE, ctx.network.provide(address.to_bytes())).await??;

    // We open streams toward the service, one per dialer stream.
    let session = Arc::new(MuxSession::new(conduit, Mode::Client));
    let _registration = ctx.hidden_services.register(address, session.clone());

    // Hold the registration until the service side closes.
    session.closed().await;
    debug!("hidden service {address} unbound");
    Ok(())
}

/// Gateway a dialer onto a locally hosted hidden service: accept streams on
/// the dialer's session and mirror each onto the service's session.
async fn handle_dial(ctx: &SessionContext, conduit: BoxConduit, address: cid::Cid) -> Result<()> {
    let service = ctx
        .hidden_services
        .lookup(&address)
        .ok_or(OnionError::NotHosted)?;

    let dialer = MuxSession::new(conduit, Mode::Server);

    while let Some(inbound) = dialer.accept().await {
        match timeout(DEFAULT_DEADLINE, service.open_stream()).await {
            Ok(Ok(outbound)) => {
                tokio::spawn(async move {
                    let _ = splice(inbound, outbound).await;
                });
            }
            // Service session gone; nothing left to gateway onto.
            Ok(Err(e)) => {
                debug!("hidden service {address} unreachable: {e}");
                break;
            }
            Err(_) => break,
        }
    }
    Ok(())
}

/// Run the DHT query on the client's behalf and answer in place. The
/// session stays open for more queries.
async fn handle_hidden_dht(
    ctx: &SessionContext,
    conduit: &mut BoxConduit,
    cid: cid::Cid,
) -> Result<()> {
    let providers = timeout(DEFAULT_DEADLINE, ctx.network.find_providers(cid.to_bytes())).await??;

    let response = HiddenDhtResponse {
        peers: providers
            .iter()
            .map(|record| HiddenDhtPeer::new(record.peer_id, &record.addrs))
            .collect(),
    };

    timeout(
        DEFAULT_DEADLINE,
        Message::send(
            conduit,
            Body::hidden_dht_response(response),
            &Settings::default(),
            DEFAULT_DEADLINE,
        ),
    )
    .await?
}

/// Extract a dialable `host:port` from a TCP multiaddress.
fn multiaddr_target(addr: &Multiaddr) -> Result<(String, u16)> {
    use libp2p::multiaddr::Protocol;

    let mut host: Option<String> = None;
    let mut port: Option<u16> = None;

    for proto in addr.iter() {
        match proto {
            Protocol::Ip4(ip) => host = Some(IpAddr::from(ip).to_string()),
            Protocol::Ip6(ip) => host = Some(IpAddr::from(ip).to_string()),
            Protocol::Dns(name) | Protocol::Dns4(name) | Protocol::Dns6(name) => {
                host = Some(name.to_string())
            }
            Protocol::Tcp(p) => port = Some(p),
            _ => {}
        }
    }

    match (host, port) {
        (Some(host), Some(port)) => Ok((host, port)),
        _ => Err(OnionError::ProtocolViolation(format!(
            "not a dialable tcp multiaddr: {addr}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiaddr_target_ip4() {
        let addr: Multiaddr = "/ip4/93.184.216.34/tcp/80".parse().unwrap();
        assert_eq!(
            multiaddr_target(&addr).unwrap(),
            ("93.184.216.34".to_string(), 80)
        );
    }

    #[test]
    fn test_multiaddr_target_dns() {
        let addr: Multiaddr = "/dns4/example.com/tcp/443".parse().unwrap();
        assert_eq!(
            multiaddr_target(&addr).unwrap(),
            ("example.com".to_string(), 443)
        );
    }

    #[test]
    fn test_multiaddr_target_ip6() {
        let addr: Multiaddr = "/ip6/::1/tcp/8080".parse().unwrap();
        assert_eq!(multiaddr_target(&addr).unwrap(), ("::1".to_string(), 8080));
    }

    #[test]
    fn test_multiaddr_target_rejects_udp() {
        let addr: Multiaddr = "/ip4/127.0.0.1/udp/53".parse().unwrap();
        assert!(multiaddr_target(&addr).is_err());
    }
}
