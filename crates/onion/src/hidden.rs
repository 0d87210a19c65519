//! Hidden services
//!
//! A hidden service is addressed by the CID of its public key's peer ID.
//! Relays hosting a live bind keep a process-wide index from address to the
//! bind's mux session; dial handlers splice dialer streams onto it. On top
//! of each spliced stream the dialer and the service run a second noise
//! handshake no relay can decrypt.

use std::collections::HashMap;
use std::sync::Arc;

use cid::Cid;
use libp2p::identity::Keypair;
use parking_lot::RwLock;

use crate::conduit::{boxed, BoxConduit};
use crate::error::{OnionError, Result};
use crate::mux::MuxSession;
use crate::noise::NoiseUpgrader;
use crate::peers;

/// Process-wide map of locally hosted hidden services.
///
/// The writer for a key is the bind handler; entry lifetime is exactly the
/// lifetime of that handler, enforced by the scoped guard.
#[derive(Clone, Default)]
pub struct HiddenServiceIndex {
    inner: Arc<RwLock<HashMap<Cid, Arc<MuxSession>>>>,
}

impl HiddenServiceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, returning a guard that removes it on any exit path.
    pub fn register(&self, address: Cid, session: Arc<MuxSession>) -> HiddenServiceGuard {
        self.inner.write().insert(address, session);
        HiddenServiceGuard {
            index: self.clone(),
            address,
        }
    }

    pub fn lookup(&self, address: &Cid) -> Option<Arc<MuxSession>> {
        self.inner.read().get(address).cloned()
    }

    pub fn contains(&self, address: &Cid) -> bool {
        self.inner.read().contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// Scoped registration of a hidden service.
pub struct HiddenServiceGuard {
    index: HiddenServiceIndex,
    address: Cid,
}

impl Drop for HiddenServiceGuard {
    fn drop(&mut self) {
        self.index.inner.write().remove(&self.address);
    }
}

/// Client-side listener returned by a circuit bind.
///
/// Inbound streams arrive through the circuit; each one terminates in a
/// noise responder under the bound private key, so only callers who dialed
/// the right address end up talking to us.
pub struct HiddenListener {
    address: Cid,
    session: Arc<MuxSession>,
    noise: NoiseUpgrader,
}

impl HiddenListener {
    pub(crate) fn new(keypair: &Keypair, session: Arc<MuxSession>) -> Result<Self> {
        Ok(Self {
            address: peers::hidden_address_from_keypair(keypair),
            session,
            noise: NoiseUpgrader::new(keypair)?,
        })
    }

    pub fn address(&self) -> Cid {
        self.address
    }

    /// Accept the next end-to-end connection.
    pub async fn accept(&self) -> Result<BoxConduit> {
        let stream = self.session.accept().await.ok_or(OnionError::Canceled)?;
        let (_dialer, secured) = self.noise.secure_inbound(boxed(stream), None).await?;
        Ok(secured)
    }

    pub fn close(&self) {
        self.session.close();
    }
}

/// Client-side handle returned by a circuit dial.
pub struct HiddenConnection {
    address: Cid,
    session: Arc<MuxSession>,
}

impl HiddenConnection {
    pub(crate) fn new(address: Cid, session: Arc<MuxSession>) -> Self {
        Self { address, session }
    }

    pub fn address(&self) -> Cid {
        self.address
    }

    /// Open one end-to-end stream to the service, authenticated against
    /// the public key its address wraps. Each open uses a fresh ephemeral
    /// identity so the service learns nothing about the dialer.
    pub async fn open(&self) -> Result<BoxConduit> {
        let stream = self.session.open_stream().await?;

        let ephemeral = Keypair::generate_ed25519();
        let noise = NoiseUpgrader::new(&ephemeral)?;
        let expected = peers::peer_id_from_cid(&self.address)?;
        noise.secure_outbound(boxed(stream), expected).await
    }

    pub fn close(&self) {
        self.session.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::Mode;
    use tokio_util::compat::TokioAsyncReadCompatExt;

    fn dummy_session() -> Arc<MuxSession> {
        let (a, _b) = tokio::io::duplex(1024);
        Arc::new(MuxSession::new(boxed(a.compat()), Mode::Client))
    }

    #[tokio::test]
    async fn test_index_scoped_registration() {
        let index = HiddenServiceIndex::new();
        let address = peers::hidden_address_from_keypair(&Keypair::generate_ed25519());

        assert!(!index.contains(&address));
        {
            let _guard = index.register(address, dummy_session());
            assert!(index.contains(&address));
            assert!(index.lookup(&address).is_some());
            assert_eq!(index.len(), 1);
        }
        // Guard dropped: the entry must be gone.
        assert!(!index.contains(&address));
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_index_independent_keys() {
        let index = HiddenServiceIndex::new();
        let a = peers::hidden_address_from_keypair(&Keypair::generate_ed25519());
        let b = peers::hidden_address_from_keypair(&Keypair::generate_ed25519());

        let _guard_a = index.register(a, dummy_session());
        let _guard_b = index.register(b, dummy_session());
        assert_eq!(index.len(), 2);

        drop(_guard_a);
        assert!(!index.contains(&a));
        assert!(index.contains(&b));
    }
}
