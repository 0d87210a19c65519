//! Swarm driver task
//!
//! Owns the libp2p swarm and services commands from [`NetworkHandle`]s over
//! an mpsc channel. Kademlia queries are tracked by `QueryId` until their
//! final progress step, at which point the waiting caller is answered.

use std::collections::{HashMap, HashSet};

use futures::StreamExt;
use libp2p::{
    identify, kad,
    kad::store::RecordStore,
    swarm::{dial_opts::DialOpts, SwarmEvent},
    Multiaddr, PeerId, Swarm,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::behaviour::{OnionBehaviour, OnionBehaviourEvent};
use crate::handle::PeerRecord;
use crate::NetworkError;

/// Commands a [`NetworkHandle`] can issue to the driver.
pub(crate) enum Command {
    Provide {
        key: Vec<u8>,
        reply: oneshot::Sender<Result<(), NetworkError>>,
    },
    FindProviders {
        key: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<PeerRecord>, NetworkError>>,
    },
    FindPeer {
        peer: PeerId,
        reply: oneshot::Sender<Result<Vec<Multiaddr>, NetworkError>>,
    },
    AddProvider {
        key: Vec<u8>,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
    },
    AddAddress {
        peer: PeerId,
        addr: Multiaddr,
    },
    Dial {
        peer: PeerId,
        reply: oneshot::Sender<Result<(), NetworkError>>,
    },
    Bootstrap {
        reply: oneshot::Sender<Result<(), NetworkError>>,
    },
    RoutingTableSize {
        reply: oneshot::Sender<usize>,
    },
    Listeners {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
}

/// A Kademlia query in flight, keyed by its `QueryId`.
enum PendingQuery {
    StartProviding(oneshot::Sender<Result<(), NetworkError>>),
    GetProviders {
        found: Vec<PeerId>,
        reply: oneshot::Sender<Result<Vec<PeerRecord>, NetworkError>>,
    },
    GetClosestPeers {
        target: PeerId,
        reply: oneshot::Sender<Result<Vec<Multiaddr>, NetworkError>>,
    },
    Bootstrap(oneshot::Sender<Result<(), NetworkError>>),
}

pub(crate) struct Driver {
    swarm: Swarm<OnionBehaviour>,
    cmd_rx: mpsc::Receiver<Command>,
    pending_queries: HashMap<kad::QueryId, PendingQuery>,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), NetworkError>>>>,
    /// Addresses learned from identify, Kademlia, and live connections
    address_book: HashMap<PeerId, HashSet<Multiaddr>>,
    listeners: Vec<Multiaddr>,
}

impl Driver {
    pub(crate) fn new(swarm: Swarm<OnionBehaviour>, cmd_rx: mpsc::Receiver<Command>) -> Self {
        Self {
            swarm,
            cmd_rx,
            pending_queries: HashMap::new(),
            pending_dials: HashMap::new(),
            address_book: HashMap::new(),
            listeners: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.on_swarm_event(event),
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    // All handles dropped; tear the swarm down with us.
                    None => break,
                },
            }
        }
        debug!("network driver stopped");
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Provide { key, reply } => {
                let key = kad::RecordKey::new(&key);
                match self.swarm.behaviour_mut().kademlia.start_providing(key) {
                    Ok(id) => {
                        self.pending_queries
                            .insert(id, PendingQuery::StartProviding(reply));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(NetworkError::Store(e.to_string())));
                    }
                }
            }
            Command::FindProviders { key, reply } => {
                let key = kad::RecordKey::new(&key);
                let id = self.swarm.behaviour_mut().kademlia.get_providers(key);
                self.pending_queries.insert(
                    id,
                    PendingQuery::GetProviders {
                        found: Vec::new(),
                        reply,
                    },
                );
            }
            Command::FindPeer { peer, reply } => {
                let id = self.swarm.behaviour_mut().kademlia.get_closest_peers(peer);
                self.pending_queries
                    .insert(id, PendingQuery::GetClosestPeers { target: peer, reply });
            }
            Command::AddProvider { key, peer, addrs } => {
                for addr in &addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer, addr.clone());
                    self.address_book.entry(peer).or_default().insert(addr.clone());
                }
                let record = kad::ProviderRecord {
                    key: kad::RecordKey::new(&key),
                    provider: peer,
                    expires: None,
                    addresses: addrs,
                };
                if let Err(e) = self.swarm.behaviour_mut().kademlia.store_mut().add_provider(record) {
                    warn!("failed to cache provider record: {e}");
                }
            }
            Command::AddAddress { peer, addr } => {
                self.swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(&peer, addr.clone());
                self.address_book.entry(peer).or_default().insert(addr);
            }
            Command::Dial { peer, reply } => {
                if self.swarm.is_connected(&peer) {
                    let _ = reply.send(Ok(()));
                    return;
                }
                match self.swarm.dial(DialOpts::peer_id(peer).build()) {
                    Ok(()) => self.pending_dials.entry(peer).or_default().push(reply),
                    Err(e) => {
                        let _ = reply.send(Err(NetworkError::Dial(e.to_string())));
                    }
                }
            }
            Command::Bootstrap { reply } => {
                match self.swarm.behaviour_mut().kademlia.bootstrap() {
                    Ok(id) => {
                        self.pending_queries.insert(id, PendingQuery::Bootstrap(reply));
                    }
                    Err(_) => {
                        let _ = reply.send(Err(NetworkError::NoKnownPeers));
                    }
                }
            }
            Command::RoutingTableSize { reply } => {
                let size: usize = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .kbuckets()
                    .map(|b| b.num_entries())
                    .sum();
                let _ = reply.send(size);
            }
            Command::Listeners { reply } => {
                let _ = reply.send(self.listeners.clone());
            }
        }
    }

    fn on_swarm_event(&mut self, event: SwarmEvent<OnionBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(OnionBehaviourEvent::Kademlia(e)) => self.on_kad_event(e),
            SwarmEvent::Behaviour(OnionBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                for addr in info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                    self.address_book.entry(peer_id).or_default().insert(addr);
                }
            }
            SwarmEvent::Behaviour(_) => {}
            SwarmEvent::NewListenAddr { address, .. } => {
                debug!("listening on {address}");
                self.listeners.push(address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                trace!("connected to {peer_id}");
                self.address_book
                    .entry(peer_id)
                    .or_default()
                    .insert(endpoint.get_remote_address().clone());
                if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                    for reply in waiters {
                        let _ = reply.send(Ok(()));
                    }
                }
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                    for reply in waiters {
                        let _ = reply.send(Err(NetworkError::Dial(error.to_string())));
                    }
                }
            }
            _ => {}
        }
    }

    fn on_kad_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::OutboundQueryProgressed {
                id, result, step, ..
            } => match result {
                kad::QueryResult::StartProviding(result) => {
                    if let Some(PendingQuery::StartProviding(reply)) = self.pending_queries.remove(&id)
                    {
                        let _ = reply.send(
                            result
                                .map(|_| ())
                                .map_err(|e| NetworkError::QueryFailed(e.to_string())),
                        );
                    }
                }
                kad::QueryResult::GetProviders(result) => {
                    match result {
                        Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) => {
                            if let Some(PendingQuery::GetProviders { found, .. }) =
                                self.pending_queries.get_mut(&id)
                            {
                                for p in providers {
                                    if !found.contains(&p) {
                                        found.push(p);
                                    }
                                }
                            }
                        }
                        Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => {}
                        Err(e) => {
                            debug!("get_providers query failed: {e}");
                        }
                    }
                    if step.last {
                        if let Some(PendingQuery::GetProviders { found, reply }) =
                            self.pending_queries.remove(&id)
                        {
                            let records = found
                                .into_iter()
                                .map(|peer_id| PeerRecord {
                                    peer_id,
                                    addrs: self.known_addrs(&peer_id),
                                })
                                .collect();
                            let _ = reply.send(Ok(records));
                        }
                    }
                }
                kad::QueryResult::GetClosestPeers(result) => {
                    if let Ok(kad::GetClosestPeersOk { peers, .. }) = &result {
                        for info in peers {
                            for addr in &info.addrs {
                                self.swarm
                                    .behaviour_mut()
                                    .kademlia
                                    .add_address(&info.peer_id, addr.clone());
                                self.address_book
                                    .entry(info.peer_id)
                                    .or_default()
                                    .insert(addr.clone());
                            }
                        }
                    }
                    if step.last {
                        if let Some(PendingQuery::GetClosestPeers { target, reply }) =
                            self.pending_queries.remove(&id)
                        {
                            let addrs = self.known_addrs(&target);
                            if addrs.is_empty() {
                                let _ = reply.send(Err(NetworkError::PeerNotFound(target)));
                            } else {
                                let _ = reply.send(Ok(addrs));
                            }
                        }
                    }
                }
                kad::QueryResult::Bootstrap(result) => {
                    if step.last {
                        if let Some(PendingQuery::Bootstrap(reply)) = self.pending_queries.remove(&id)
                        {
                            let _ = reply.send(
                                result
                                    .map(|_| ())
                                    .map_err(|e| NetworkError::QueryFailed(e.to_string())),
                            );
                        }
                    }
                }
                _ => {}
            },
            kad::Event::RoutingUpdated {
                peer, addresses, ..
            } => {
                let entry = self.address_book.entry(peer).or_default();
                for addr in addresses.iter() {
                    entry.insert(addr.clone());
                }
            }
            _ => {}
        }
    }

    fn known_addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        if peer == self.swarm.local_peer_id() {
            return self.listeners.clone();
        }
        self.address_book
            .get(peer)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}
