//! Overlay service lifecycle
//!
//! Wires the session state machine onto the host's inbound streams, keeps
//! the node advertised in the DHT, and prices each inbound session by the
//! number currently active.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use libp2p::PeerId;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use onionp2p_hashcash as hashcash;
use onionp2p_network::{IncomingStreams, NetworkHandle};

use crate::circuit::Circuit;
use crate::config::OnionConfig;
use crate::error::{OnionError, Result};
use crate::hidden::HiddenServiceIndex;
use crate::message::Settings;
use crate::noise::NoiseUpgrader;
use crate::peers::{self, PeerEntry};
use crate::session::{run_session, SessionContext};
use crate::DEFAULT_DEADLINE;

/// How often the routing table is polled while waiting for bootstrap.
const BOOTSTRAP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The overlay service of one node.
pub struct Onion {
    local_peer_id: PeerId,
    network: NetworkHandle,
    exit_node: bool,
    connections: Arc<AtomicI64>,
    hidden_services: HiddenServiceIndex,
    shutdown: CancellationToken,
}

impl Onion {
    /// Register the overlay on a running host.
    ///
    /// Unless hidden mode is set, a background task re-advertises the
    /// node's capability CIDs every TTL. With `bootstrap` set, this call
    /// does not return until the DHT routing table is non-empty.
    pub async fn new(cfg: OnionConfig) -> Result<Arc<Self>> {
        let noise = NoiseUpgrader::new(&cfg.keypair)?;
        let hidden_services = HiddenServiceIndex::new();
        let shutdown = CancellationToken::new();

        if cfg.bootstrap {
            wait_for_routing_table(&cfg.network).await?;
        }

        let session_ctx = Arc::new(SessionContext {
            network: cfg.network.clone(),
            noise,
            hidden_services: hidden_services.clone(),
            exit_node: cfg.exit_node,
        });

        let onion = Arc::new(Self {
            local_peer_id: cfg.network.local_peer_id(),
            network: cfg.network.clone(),
            exit_node: cfg.exit_node,
            connections: Arc::new(AtomicI64::new(0)),
            hidden_services,
            shutdown,
        });

        if !cfg.hidden_mode {
            tokio::spawn(advertise_loop(
                cfg.network.clone(),
                cfg.exit_node,
                cfg.ttl,
                onion.shutdown.clone(),
            ));
        }

        tokio::spawn(accept_loop(
            session_ctx,
            onion.connections.clone(),
            cfg.incoming,
            onion.shutdown.clone(),
        ));

        info!("overlay service registered for {}", onion.local_peer_id);
        Ok(onion)
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn is_exit_node(&self) -> bool {
        self.exit_node
    }

    pub fn network(&self) -> &NetworkHandle {
        &self.network
    }

    /// Number of inbound sessions currently running.
    pub fn active_connections(&self) -> i64 {
        self.connections.load(Ordering::SeqCst)
    }

    /// Locally hosted hidden services.
    pub fn hidden_services(&self) -> &HiddenServiceIndex {
        &self.hidden_services
    }

    /// The settings a session admitted right now would be handed.
    pub fn current_price(&self) -> u64 {
        hashcash::log_difficulty(self.active_connections() + 1)
    }

    /// Peers advertising overlay capability, with their claimed modes.
    pub async fn list_peers(&self) -> Result<Vec<PeerEntry>> {
        timeout(DEFAULT_DEADLINE, peers::list_peers(&self.network)).await?
    }

    /// Build a circuit through `peers`, in order.
    pub async fn circuit(self: &Arc<Self>, peers: &[PeerId]) -> Result<Circuit> {
        if peers.is_empty() {
            return Err(OnionError::ProtocolViolation(
                "no peers provided".to_string(),
            ));
        }

        let mut circuit = Circuit::new(self.clone());
        for id in peers {
            circuit.extend(*id).await?;
        }
        Ok(circuit)
    }

    /// Stop background tasks. In-flight sessions run to completion.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for Onion {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Decrements the active-session counter when dropped.
pub(crate) struct ConnectionGuard(Arc<AtomicI64>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn accept_loop(
    session_ctx: Arc<SessionContext>,
    connections: Arc<AtomicI64>,
    mut incoming: IncomingStreams,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = incoming.next() => accepted,
        };
        let Some((peer, stream)) = accepted else { break };

        // Admit the session: bump the counter and price the connection
        // off the new total. The guard undoes the bump on any exit path.
        let active = connections.fetch_add(1, Ordering::SeqCst) + 1;
        let settings = Settings {
            exit_node: session_ctx.exit_node,
            pow_difficulty: hashcash::log_difficulty(active),
        };
        let guard = ConnectionGuard(connections.clone());
        let ctx = session_ctx.clone();

        debug!(
            "inbound session from {peer} priced at {} bits",
            settings.pow_difficulty
        );
        tokio::spawn(async move {
            let _guard = guard;
            match run_session(ctx, peer, stream, settings).await {
                Ok(()) => {}
                Err(OnionError::Canceled) => debug!("session with {peer} canceled"),
                Err(e) => warn!("session with {peer} failed: {e}"),
            }
        });
    }
    debug!("stream acceptor stopped");
}

async fn advertise_loop(
    network: NetworkHandle,
    exit_node: bool,
    ttl: Duration,
    shutdown: CancellationToken,
) {
    loop {
        promote(&network, exit_node).await;
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(ttl) => {}
        }
    }
    debug!("advertise loop stopped");
}

/// Announce our capability CIDs. Failures are logged and retried next TTL
/// tick; a node that cannot reach the DHT right now may succeed later.
async fn promote(network: &NetworkHandle, exit_node: bool) {
    if let Err(e) = timeout(
        DEFAULT_DEADLINE,
        network.provide(peers::basic_cid().to_bytes()),
    )
    .await
    .map_err(OnionError::from)
    .and_then(|r| r.map_err(OnionError::from))
    {
        warn!("failed to provide basic cid: {e}");
        return;
    }

    if exit_node {
        if let Err(e) = timeout(
            DEFAULT_DEADLINE,
            network.provide(peers::exit_cid().to_bytes()),
        )
        .await
        .map_err(OnionError::from)
        .and_then(|r| r.map_err(OnionError::from))
        {
            warn!("failed to provide exit node cid: {e}");
        }
    }
}

async fn wait_for_routing_table(network: &NetworkHandle) -> Result<()> {
    debug!("waiting for bootstrap");
    if let Err(e) = network.bootstrap().await {
        debug!("initial bootstrap round failed: {e}");
    }

    let poll = async {
        loop {
            let size = network.routing_table_size().await?;
            if size > 0 {
                return Ok::<(), OnionError>(());
            }
            tokio::time::sleep(BOOTSTRAP_POLL_INTERVAL).await;
        }
    };

    timeout(DEFAULT_DEADLINE, poll).await??;
    debug!("bootstrap completed");
    Ok(())
}
