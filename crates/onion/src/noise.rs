//! Noise channel layering
//!
//! Treats the substrate's noise transport as an upgrader from conduit to
//! conduit. Each circuit hop layers one of these inside the previous, so
//! relays past the first see only ciphertext.

use libp2p::core::upgrade::{InboundConnectionUpgrade, OutboundConnectionUpgrade};
use libp2p::core::UpgradeInfo;
use libp2p::identity::Keypair;
use libp2p::{noise, PeerId};

use crate::conduit::BoxConduit;
use crate::error::{OnionError, Result};

/// Upgrades conduits to authenticated-encrypted channels under a fixed
/// identity (long-lived for relays, hop-scoped ephemeral for clients).
#[derive(Clone)]
pub struct NoiseUpgrader {
    config: noise::Config,
}

impl NoiseUpgrader {
    pub fn new(keypair: &Keypair) -> Result<Self> {
        let config = noise::Config::new(keypair)
            .map_err(|e| OnionError::Upstream(format!("noise config: {e}")))?;
        Ok(Self { config })
    }

    /// Run the initiator handshake. The responder must authenticate as
    /// `expected`; anything else is a failed upgrade.
    pub async fn secure_outbound(&self, conduit: BoxConduit, expected: PeerId) -> Result<BoxConduit> {
        let config = self.config.clone();
        let info = config
            .protocol_info()
            .into_iter()
            .next()
            .expect("noise advertises one protocol");

        let (peer, io) = config
            .upgrade_outbound(conduit, info)
            .await
            .map_err(|e| OnionError::Upstream(format!("noise handshake: {e}")))?;

        if peer != expected {
            return Err(OnionError::Upstream(format!(
                "noise peer mismatch: expected {expected}, authenticated {peer}"
            )));
        }
        Ok(Box::new(io))
    }

    /// Run the responder handshake and report who authenticated. When
    /// `expected` is set, a mismatch fails the upgrade.
    pub async fn secure_inbound(
        &self,
        conduit: BoxConduit,
        expected: Option<PeerId>,
    ) -> Result<(PeerId, BoxConduit)> {
        let config = self.config.clone();
        let info = config
            .protocol_info()
            .into_iter()
            .next()
            .expect("noise advertises one protocol");

        let (peer, io) = config
            .upgrade_inbound(conduit, info)
            .await
            .map_err(|e| OnionError::Upstream(format!("noise handshake: {e}")))?;

        if let Some(expected) = expected {
            if peer != expected {
                return Err(OnionError::Upstream(format!(
                    "noise peer mismatch: expected {expected}, authenticated {peer}"
                )));
            }
        }
        Ok((peer, Box::new(io)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conduit::boxed;
    use tokio_util::compat::TokioAsyncReadCompatExt;

    async fn socket_pair() -> (BoxConduit, BoxConduit) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, (server, _)) =
            tokio::join!(tokio::net::TcpStream::connect(addr), async {
                listener.accept().await.unwrap()
            });
        (boxed(client.unwrap().compat()), boxed(server.compat()))
    }

    #[tokio::test]
    async fn test_handshake_authenticates_peers() {
        let client_key = Keypair::generate_ed25519();
        let server_key = Keypair::generate_ed25519();
        let client_peer = client_key.public().to_peer_id();
        let server_peer = server_key.public().to_peer_id();

        let initiator = NoiseUpgrader::new(&client_key).unwrap();
        let responder = NoiseUpgrader::new(&server_key).unwrap();

        let (client_io, server_io) = socket_pair().await;

        let (outcome, inbound) = tokio::join!(
            initiator.secure_outbound(client_io, server_peer),
            responder.secure_inbound(server_io, None),
        );

        let mut secured_client = outcome.unwrap();
        let (authenticated, mut secured_server) = inbound.unwrap();
        assert_eq!(authenticated, client_peer);

        use futures::io::{AsyncReadExt as _, AsyncWriteExt as _};
        secured_client.write_all(b"over the wire").await.unwrap();
        secured_client.flush().await.unwrap();
        let mut buf = [0u8; 13];
        secured_server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over the wire");
    }

    #[tokio::test]
    async fn test_outbound_rejects_wrong_peer() {
        let client_key = Keypair::generate_ed25519();
        let server_key = Keypair::generate_ed25519();
        let imposter = Keypair::generate_ed25519().public().to_peer_id();

        let initiator = NoiseUpgrader::new(&client_key).unwrap();
        let responder = NoiseUpgrader::new(&server_key).unwrap();

        let (client_io, server_io) = socket_pair().await;

        let (outcome, _) = tokio::join!(
            initiator.secure_outbound(client_io, imposter),
            responder.secure_inbound(server_io, None),
        );
        assert!(outcome.is_err());
    }
}
