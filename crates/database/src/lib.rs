//! Peer database
//!
//! Local cache of overlay peers, refreshed from the DHT on an interval.
//! The refresh rewrites the whole snapshot under a mutex; readers clone
//! the snapshot and work lock-free. Circuit candidates come out shuffled
//! so no relay position is predictable.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use libp2p::PeerId;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use onionp2p_onion::{Onion, PeerEntry};

/// Bound on how long `Database::new` waits for a first successful refresh.
const STARTUP_DEADLINE: Duration = Duration::from_secs(10 * 60);

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("no peers found")]
    NoPeers,

    #[error("no exit-capable peer available")]
    NoExitPeer,

    #[error("peer list never became available")]
    StartupTimeout,
}

/// Database configuration
pub struct DatabaseConfig {
    /// Overlay service used for peer discovery.
    pub onion: Arc<Onion>,
    /// Interval for pulling fresh peers from the DHT.
    pub refresh_interval: Duration,
    /// Peers never handed out as circuit candidates.
    pub blacklist: HashSet<PeerId>,
}

/// Constraints on a generated circuit candidate list.
#[derive(Debug, Clone, Default)]
pub struct CircuitSpec {
    /// Peers to skip, on top of the configured blacklist.
    pub ignore: HashSet<PeerId>,
    /// Number of relays in the circuit.
    pub length: usize,
    /// Require the tail to advertise exit capability.
    pub last_is_exit: bool,
}

struct Inner {
    onion: Arc<Onion>,
    blacklist: HashSet<PeerId>,
    peers: Mutex<Vec<PeerEntry>>,
    shutdown: CancellationToken,
}

/// Peers database for local caching of remote peers.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl Database {
    /// Build the database and block until the first refresh succeeds, so
    /// callers never observe an uninitialized snapshot.
    pub async fn new(cfg: DatabaseConfig) -> Result<Self, DatabaseError> {
        let inner = Arc::new(Inner {
            onion: cfg.onion,
            blacklist: cfg.blacklist,
            peers: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        });
        let db = Self { inner };

        let first = async {
            loop {
                if db.refresh().await {
                    return;
                }
                tokio::time::sleep(cfg.refresh_interval.min(Duration::from_secs(5))).await;
            }
        };
        tokio::time::timeout(STARTUP_DEADLINE, first)
            .await
            .map_err(|_| DatabaseError::StartupTimeout)?;

        tokio::spawn(refresh_worker(db.clone(), cfg.refresh_interval));
        Ok(db)
    }

    async fn refresh(&self) -> bool {
        debug!("refreshing peer list");
        let listed = match self.inner.onion.list_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                warn!("failed to refresh peer list: {e}");
                return false;
            }
        };

        let own = self.inner.onion.local_peer_id();
        let peers: Vec<PeerEntry> = listed
            .into_iter()
            .filter(|p| p.peer_id() != own && !self.inner.blacklist.contains(&p.peer_id()))
            .collect();

        info!("refreshed peer list: {} peers", peers.len());
        *self.inner.peers.lock() = peers;
        true
    }

    /// Shuffled clone of the current snapshot.
    pub fn all(&self) -> Vec<PeerEntry> {
        let mut peers = self.inner.peers.lock().clone();
        peers.shuffle(&mut rand::thread_rng());
        peers
    }

    /// Number of peers in the current snapshot.
    pub fn len(&self) -> usize {
        self.inner.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.peers.lock().is_empty()
    }

    /// Pick an ordered list of circuit candidates.
    ///
    /// When the spec wants an exit tail and the randomly chosen tail is
    /// not exit-capable, an exit peer is swapped into the tail position.
    pub fn circuit(&self, spec: &CircuitSpec) -> Result<Vec<PeerId>, DatabaseError> {
        let mut all = self.all();
        all.retain(|p| !spec.ignore.contains(&p.peer_id()));

        if all.is_empty() {
            return Err(DatabaseError::NoPeers);
        }

        let mut candidates: Vec<PeerId> = all
            .iter()
            .take(spec.length.min(all.len()).max(1))
            .map(|p| p.peer_id())
            .collect();

        if !spec.last_is_exit {
            return Ok(candidates);
        }

        let is_exit =
            |id: PeerId| all.iter().any(|p| p.peer_id() == id && p.is_exit());

        // An exit peer already picked moves to the tail; otherwise swap
        // one in from the remaining pool.
        let last = candidates.len() - 1;
        if let Some(pos) = candidates.iter().position(|id| is_exit(*id)) {
            candidates.swap(pos, last);
            return Ok(candidates);
        }

        let replacement = all
            .iter()
            .find(|p| p.is_exit() && !candidates.contains(&p.peer_id()))
            .ok_or(DatabaseError::NoExitPeer)?;
        candidates[last] = replacement.peer_id();
        Ok(candidates)
    }

    /// Stop the refresh worker.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }
}

async fn refresh_worker(db: Database, interval: Duration) {
    loop {
        tokio::select! {
            _ = db.inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        db.refresh().await;
    }
    debug!("peer refresh worker stopped");
}
